//! Typed wrapper over the wallet's command-line client.
//!
//! Every call runs `<cli> -datadir=<dir> <command> [args...]` through a
//! [`CommandRunner`] and interprets the textual reply. At most one call is in
//! flight at a time; `stop` is the only command that skips the lock.

pub mod amount;
pub mod reply;
pub mod validator;

use crate::config::SendConfig;
use crate::environment::Environment;
use crate::executor::{ChildProcess, CommandRunner, ExecError};
use crate::state::{NetworkAndBlockchainInfo, Transaction, TransactionKind, WalletBalance};
use reply::{classify, parse_error_reply, ReplyKind};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

pub type JsonObject = Map<String, Value>;

const UNENCRYPTED_WALLET_CODE: i64 = -15;
const WRONG_NETWORK_CODE: i64 = -1;
const UNLOCK_SECONDS: &str = "300";
const PUBLIC_TRANSACTION_LIMIT: &str = "100";

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("демон недоступен: {0}")]
    DaemonUnavailable(String),
    #[error("некорректный JSON в ответе кошелька: {source}; ответ: {raw}")]
    Malformed {
        raw: String,
        source: serde_json::Error,
    },
    #[error("неожиданная форма ответа кошелька (ожидался {expected}): {raw}")]
    UnexpectedShape { expected: &'static str, raw: String },
    #[error("ошибка от кошелька: {raw}")]
    Daemon { raw: String },
    #[error("неожиданный статус операции {op_id}: {raw}")]
    UnexpectedStatus { op_id: String, raw: String },
    #[error("сумма изменилась после форматирования: {requested} | {formatted}")]
    AmountMismatch { requested: String, formatted: String },
    #[error("некорректная сумма: {0}")]
    InvalidAmount(String),
    #[error("неожиданный ответ кошелька: {0}")]
    Unexpected(String),
    #[error("некорректные параметры: {0}")]
    InvalidRequest(String),
    #[error("кошелёк зашифрован: требуется пароль")]
    PassphraseRequired,
    #[error("установка не найдена: {0}")]
    Installation(String),
}

impl WalletError {
    /// Numeric daemon error code, when the failure carries one.
    pub fn daemon_code(&self) -> Option<i64> {
        match self {
            WalletError::Daemon { raw } => parse_error_reply(raw).map(|r| r.code),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, WalletError::DaemonUnavailable(_))
    }
}

pub struct CommandLineBridge {
    runner: Arc<dyn CommandRunner>,
    cli: PathBuf,
    daemon: PathBuf,
    data_dir: PathBuf,
    send: SendConfig,
    call_lock: Mutex<()>,
}

impl CommandLineBridge {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        cli: PathBuf,
        daemon: PathBuf,
        data_dir: PathBuf,
        send: SendConfig,
    ) -> Self {
        Self {
            runner,
            cli,
            daemon,
            data_dir,
            send,
            call_lock: Mutex::new(()),
        }
    }

    /// Finds the client and daemon binaries in the install directory, then on `PATH`.
    pub fn locate(
        env: &Environment,
        send: &SendConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, WalletError> {
        let cli = find_binary(&env.program_dir, &env.cli_file_name).ok_or_else(|| {
            WalletError::Installation(format!(
                "каталог {} должен содержать {} и {}: не найден {}",
                env.program_dir.display(),
                env.daemon_file_name,
                env.cli_file_name,
                env.cli_file_name
            ))
        })?;
        let daemon = find_binary(&env.program_dir, &env.daemon_file_name).ok_or_else(|| {
            WalletError::Installation(format!(
                "{} найден ({}), но не найден {}",
                env.cli_file_name,
                cli.display(),
                env.daemon_file_name
            ))
        })?;
        info!(cli = %cli.display(), daemon = %daemon.display(), "найдены исполняемые файлы кошелька");

        Ok(Self::new(
            runner,
            cli,
            daemon,
            env.dirs.data_dir.clone(),
            send.clone(),
        ))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.call_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command_line(&self, params: &[String]) -> Vec<String> {
        let mut args = Vec::with_capacity(params.len() + 2);
        args.push(self.cli.display().to_string());
        args.push(format!("-datadir={}", self.data_dir.display()));
        args.extend(params.iter().cloned());
        args
    }

    /// Runs the client; only an unreachable daemon is turned into an error.
    fn raw_unlocked(&self, params: &[String]) -> Result<String, WalletError> {
        if let Some(command) = params.first() {
            debug!(command = %command, "вызов клиента кошелька");
        }
        let output = self.runner.run(&self.command_line(params))?;
        if classify(&output) == ReplyKind::Unavailable {
            return Err(WalletError::DaemonUnavailable(output.trim().to_string()));
        }
        Ok(output)
    }

    fn text_unlocked(&self, params: &[String]) -> Result<String, WalletError> {
        let output = self.raw_unlocked(params)?;
        match classify(&output) {
            ReplyKind::Success => Ok(output),
            _ => Err(WalletError::Daemon {
                raw: output.trim().to_string(),
            }),
        }
    }

    fn json_unlocked(&self, params: &[String]) -> Result<Value, WalletError> {
        let output = self.text_unlocked(params)?;
        parse_json(&output)
    }

    fn object_unlocked(&self, params: &[String]) -> Result<JsonObject, WalletError> {
        match self.json_unlocked(params)? {
            Value::Object(map) => Ok(map),
            other => Err(WalletError::UnexpectedShape {
                expected: "object",
                raw: other.to_string(),
            }),
        }
    }

    fn array_unlocked(&self, params: &[String]) -> Result<Vec<Value>, WalletError> {
        match self.json_unlocked(params)? {
            Value::Array(items) => Ok(items),
            other => Err(WalletError::UnexpectedShape {
                expected: "array",
                raw: other.to_string(),
            }),
        }
    }

    fn text(&self, params: &[String]) -> Result<String, WalletError> {
        let _guard = self.lock();
        self.text_unlocked(params)
    }

    fn json(&self, params: &[String]) -> Result<Value, WalletError> {
        let _guard = self.lock();
        self.json_unlocked(params)
    }

    fn object(&self, params: &[String]) -> Result<JsonObject, WalletError> {
        let _guard = self.lock();
        self.object_unlocked(params)
    }

    fn array(&self, params: &[String]) -> Result<Vec<Value>, WalletError> {
        let _guard = self.lock();
        self.array_unlocked(params)
    }

    /// `getinfo`, or the daemon's error reshaped to `{code, message}`.
    pub fn daemon_runtime_info(&self) -> Result<JsonObject, WalletError> {
        let _guard = self.lock();
        let output = self.raw_unlocked(&[s("getinfo")])?;
        match classify(&output) {
            ReplyKind::Success => match parse_json(&output)? {
                Value::Object(map) => Ok(map),
                other => Err(WalletError::UnexpectedShape {
                    expected: "object",
                    raw: other.to_string(),
                }),
            },
            _ => {
                let reply = parse_error_reply(&output)
                    .ok_or_else(|| WalletError::Unexpected(output.trim().to_string()))?;
                let mut map = JsonObject::new();
                map.insert("code".to_string(), Value::from(reply.code));
                map.insert("message".to_string(), Value::from(reply.message));
                Ok(map)
            }
        }
    }

    pub fn wallet_balance(&self) -> Result<WalletBalance, WalletError> {
        let _guard = self.lock();
        let confirmed = self.object_unlocked(&[s("z_gettotalbalance")])?;
        let all = self.object_unlocked(&[s("z_gettotalbalance"), s("0")])?;

        Ok(WalletBalance {
            transparent: balance_field(&confirmed, "transparent")?,
            private: balance_field(&confirmed, "private")?,
            total: balance_field(&confirmed, "total")?,
            transparent_unconfirmed: balance_field(&all, "transparent")?,
            private_unconfirmed: balance_field(&all, "private")?,
            total_unconfirmed: balance_field(&all, "total")?,
        })
    }

    pub fn public_transactions(&self) -> Result<Vec<Transaction>, WalletError> {
        let items = self.array(&[
            s("listtransactions"),
            s(""),
            s(PUBLIC_TRANSACTION_LIMIT),
        ])?;
        items
            .iter()
            .map(|item| -> Result<Transaction, WalletError> {
                let obj = as_object(item)?;
                Ok(Transaction {
                    kind: TransactionKind::Public,
                    direction: str_field(obj, "category").unwrap_or("ERROR!").to_string(),
                    confirmations: obj.get("confirmations").and_then(Value::as_i64).unwrap_or(0),
                    amount: obj.get("amount").and_then(value_f64).unwrap_or(0.0),
                    time_unix: obj.get("time").and_then(Value::as_i64),
                    address: str_field(obj, "address").map(str::to_string),
                    txid: str_field(obj, "txid").unwrap_or_default().to_string(),
                })
            })
            .collect()
    }

    pub fn z_addresses(&self) -> Result<Vec<String>, WalletError> {
        let _guard = self.lock();
        self.z_addresses_unlocked()
    }

    fn z_addresses_unlocked(&self) -> Result<Vec<String>, WalletError> {
        let items = self.array_unlocked(&[s("z_listaddresses")])?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| WalletError::UnexpectedShape {
                        expected: "string",
                        raw: item.to_string(),
                    })
            })
            .collect()
    }

    /// Incoming private transactions for every Z address of the wallet.
    pub fn z_received_transactions(&self) -> Result<Vec<Transaction>, WalletError> {
        let _guard = self.lock();
        let mut received = Vec::new();

        for address in self.z_addresses_unlocked()? {
            let items = self.array_unlocked(&[
                s("z_listreceivedbyaddress"),
                s(&address),
                s("0"),
            ])?;
            for item in &items {
                let obj = as_object(item)?;
                let txid = str_field(obj, "txid").unwrap_or("ERROR!").to_string();
                let details = self.object_unlocked(&[s("gettransaction"), s(&txid)])?;
                received.push(Transaction {
                    kind: TransactionKind::Private,
                    direction: "receive".to_string(),
                    confirmations: details
                        .get("confirmations")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                    amount: obj.get("amount").and_then(value_f64).unwrap_or(0.0),
                    time_unix: details.get("time").and_then(Value::as_i64),
                    address: Some(address.clone()),
                    txid,
                });
            }
        }
        Ok(received)
    }

    /// T addresses holding unspent outputs (`listunspent` reports T addresses only).
    pub fn public_addresses_with_unspent(&self) -> Result<Vec<String>, WalletError> {
        let items = self.array(&[s("listunspent"), s("0")])?;
        Ok(collect_addresses(&items))
    }

    pub fn all_public_addresses(&self) -> Result<Vec<String>, WalletError> {
        let items = self.array(&[s("listreceivedbyaddress"), s("0"), s("true")])?;
        Ok(collect_addresses(&items))
    }

    /// `gettransaction` flattened to `a.b` / `a[0]` keys.
    pub fn transaction_details(&self, txid: &str) -> Result<BTreeMap<String, String>, WalletError> {
        let obj = self.object(&[s("gettransaction"), s(txid)])?;
        let mut flat = BTreeMap::new();
        for (name, value) in &obj {
            flatten_json(name, value, &mut flat);
        }
        Ok(flat)
    }

    pub fn raw_transaction(&self, txid: &str) -> Result<String, WalletError> {
        let obj = self.object(&[s("gettransaction"), s(txid)])?;
        serde_json::to_string_pretty(&obj).map_err(|source| WalletError::Malformed {
            raw: txid.to_string(),
            source,
        })
    }

    pub fn memo_field(&self, address: &str, txid: &str) -> Result<Option<String>, WalletError> {
        let items = self.array(&[s("z_listreceivedbyaddress"), s(address)])?;
        for item in &items {
            let obj = as_object(item)?;
            if str_field(obj, "txid") != Some(txid) {
                continue;
            }
            return match str_field(obj, "memo") {
                Some(hex) => amount::decode_memo(hex),
                None => Ok(None),
            };
        }
        Ok(None)
    }

    pub fn is_watch_only_or_invalid(&self, address: &str) -> Result<bool, WalletError> {
        let obj = match self.json(&[s("validateaddress"), s(address)])? {
            Value::Object(map) => map,
            other => {
                return Err(WalletError::UnexpectedShape {
                    expected: "object",
                    raw: other.to_string(),
                })
            }
        };
        let valid = obj.get("isvalid").and_then(Value::as_bool).unwrap_or(false);
        if !valid {
            return Ok(true);
        }
        Ok(obj.get("iswatchonly").and_then(Value::as_bool).unwrap_or(true))
    }

    /// Confirmed balance only.
    pub fn balance_for_address(&self, address: &str) -> Result<f64, WalletError> {
        let value = self.json(&[s("z_getbalance"), s(address)])?;
        expect_f64(&value)
    }

    pub fn unconfirmed_balance_for_address(&self, address: &str) -> Result<f64, WalletError> {
        let value = self.json(&[s("z_getbalance"), s(address), s("0")])?;
        expect_f64(&value)
    }

    pub fn new_address(&self, z: bool) -> Result<String, WalletError> {
        let command = if z { "z_getnewaddress" } else { "getnewaddress" };
        Ok(self.text(&[s(command)])?.trim().to_string())
    }

    /// Submits `z_sendmany` and returns the operation id.
    pub fn send_cash(
        &self,
        from: &str,
        to: &str,
        amount: &str,
        memo: &str,
        fee: &str,
    ) -> Result<String, WalletError> {
        let to_many = amount::build_to_many(to, amount, memo)?;
        let fee = if fee.trim().is_empty() {
            self.send.default_fee.clone()
        } else {
            amount::format_amount(amount::parse_fee(fee)?)
        };

        let params = [
            s("z_sendmany"),
            s(from),
            s(&to_many),
            self.send.min_confirmations.to_string(),
            fee.clone(),
        ];
        info!(from = %from, to = %to, amount = %amount, fee = %fee, "отправка средств");
        let op_id = self.text(&params)?.trim().to_string();
        info!(op_id = %op_id, "операция отправки создана");
        Ok(op_id)
    }

    fn operation_status(&self, op_id: &str) -> Result<(JsonObject, String), WalletError> {
        let ids = serde_json::to_string(&[op_id]).map_err(|source| WalletError::Malformed {
            raw: op_id.to_string(),
            source,
        })?;
        let items = self.array(&[s("z_getoperationstatus"), s(&ids)])?;
        let first = items.first().ok_or_else(|| WalletError::UnexpectedStatus {
            op_id: op_id.to_string(),
            raw: "[]".to_string(),
        })?;
        let obj = as_object(first)?.clone();
        let status = str_field(&obj, "status").unwrap_or("ERROR").to_lowercase();
        debug!(op_id = %op_id, status = %status, "статус операции");
        Ok((obj, status))
    }

    pub fn is_operation_complete(&self, op_id: &str) -> Result<bool, WalletError> {
        let (obj, status) = self.operation_status(op_id)?;
        match status.as_str() {
            "success" | "error" | "failed" => Ok(true),
            "executing" | "queued" => Ok(false),
            _ => Err(WalletError::UnexpectedStatus {
                op_id: op_id.to_string(),
                raw: Value::Object(obj).to_string(),
            }),
        }
    }

    pub fn is_operation_successful(&self, op_id: &str) -> Result<bool, WalletError> {
        let (obj, status) = self.operation_status(op_id)?;
        match status.as_str() {
            "success" => Ok(true),
            "error" | "failed" => Ok(false),
            _ => Err(WalletError::UnexpectedStatus {
                op_id: op_id.to_string(),
                raw: Value::Object(obj).to_string(),
            }),
        }
    }

    /// Only meaningful for operations that already failed.
    pub fn operation_error_message(&self, op_id: &str) -> Result<String, WalletError> {
        let (obj, _) = self.operation_status(op_id)?;
        Ok(obj
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("ERROR!")
            .to_string())
    }

    pub fn network_and_blockchain_info(&self) -> Result<NetworkAndBlockchainInfo, WalletError> {
        let _guard = self.lock();
        let connections = self.text_unlocked(&[s("getconnectioncount")])?;
        let connection_count = connections
            .trim()
            .parse::<u32>()
            .map_err(|_| WalletError::Unexpected(connections.trim().to_string()))?;

        let block_count = self.text_unlocked(&[s("getblockcount")])?;
        let block_hash = self.text_unlocked(&[s("getblockhash"), block_count.trim().to_string()])?;
        let block = self.object_unlocked(&[s("getblock"), s(block_hash.trim())])?;

        let last_block_unix = block.get("time").and_then(Value::as_i64).ok_or_else(|| {
            WalletError::UnexpectedShape {
                expected: "block time",
                raw: Value::Object(block.clone()).to_string(),
            }
        })?;

        Ok(NetworkAndBlockchainInfo {
            connection_count,
            last_block_unix,
        })
    }

    pub fn lock_wallet(&self) -> Result<(), WalletError> {
        expect_empty(self.text(&[s("walletlock")])?)
    }

    /// Unlocks for five minutes; callers are expected to lock again right after.
    pub fn unlock_wallet(&self, passphrase: &str) -> Result<(), WalletError> {
        expect_empty(self.text(&[
            s("walletpassphrase"),
            s(passphrase),
            s(UNLOCK_SECONDS),
        ])?)
    }

    /// Checks with `walletlock`: an unencrypted wallet answers with error -15.
    pub fn is_wallet_encrypted(&self) -> Result<bool, WalletError> {
        let output = {
            let _guard = self.lock();
            self.raw_unlocked(&[s("walletlock")])?
        };
        if output.trim().is_empty() {
            return Ok(true);
        }
        match parse_error_reply(&output) {
            Some(reply)
                if reply.code == UNENCRYPTED_WALLET_CODE
                    && reply.message.contains("unencrypted wallet") =>
            {
                Ok(false)
            }
            _ => Err(WalletError::Unexpected(output.trim().to_string())),
        }
    }

    pub fn encrypt_wallet(&self, passphrase: &str) -> Result<String, WalletError> {
        let result = self.text(&[s("encryptwallet"), s(passphrase)])?;
        info!("кошелёк зашифрован");
        Ok(result.trim().to_string())
    }

    pub fn backup_wallet(&self, file_name: &str) -> Result<(), WalletError> {
        info!(file = %file_name, "резервная копия кошелька");
        self.text(&[s("backupwallet"), s(file_name)])
            .map(|_| ())
    }

    pub fn export_wallet(&self, file_name: &str) -> Result<(), WalletError> {
        info!(file = %file_name, "экспорт ключей кошелька");
        self.text(&[s("z_exportwallet"), s(file_name)])
            .map(|_| ())
    }

    pub fn import_wallet(&self, file_name: &str) -> Result<(), WalletError> {
        info!(file = %file_name, "импорт ключей кошелька");
        self.text(&[s("z_importwallet"), s(file_name)])
            .map(|_| ())
    }

    pub fn t_private_key(&self, address: &str) -> Result<String, WalletError> {
        Ok(self
            .text(&[s("dumpprivkey"), s(address)])?
            .trim()
            .to_string())
    }

    pub fn z_private_key(&self, address: &str) -> Result<String, WalletError> {
        Ok(self
            .text(&[s("z_exportkey"), s(address)])?
            .trim()
            .to_string())
    }

    /// Tries the key as a Z key first and falls back to a T key.
    pub fn import_private_key(&self, key: &str) -> Result<(), WalletError> {
        let _guard = self.lock();
        let output = self.raw_unlocked(&[s("z_importkey"), s(key)])?;
        if output.trim().is_empty() {
            return Ok(());
        }
        match parse_error_reply(&output) {
            Some(reply)
                if reply.code == WRONG_NETWORK_CODE
                    && reply.message.contains("wrong network type") => {}
            _ => return Err(WalletError::Unexpected(output.trim().to_string())),
        }

        debug!("ключ не является Z-ключом, пробуем importprivkey");
        expect_empty(self.text_unlocked(&[s("importprivkey"), s(key)])?)
    }

    /// Asks the daemon to stop. Deliberately bypasses the call lock so that a
    /// stuck call cannot block shutdown.
    pub fn stop_daemon(&self) -> Result<String, WalletError> {
        let output = self.raw_unlocked(&[s("stop")])?;
        info!(reply = %output.trim(), "команда stop отправлена");
        Ok(output)
    }

    pub fn start_daemon(&self) -> Result<Box<dyn ChildProcess>, WalletError> {
        let data_dir = self.data_dir.display().to_string();
        let args = vec![
            self.daemon.display().to_string(),
            format!("-datadir={data_dir}"),
            format!("-exportdir={data_dir}"),
        ];
        let child = self.runner.spawn(&args)?;
        info!(pid = child.id(), "демон запущен");
        Ok(child)
    }
}

fn s(value: &str) -> String {
    value.to_string()
}

fn find_binary(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let local = dir.join(file_name);
    if local.is_file() {
        return Some(local);
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|p| p.join(file_name))
        .find(|candidate| candidate.is_file())
}

fn parse_json(output: &str) -> Result<Value, WalletError> {
    serde_json::from_str(output.trim()).map_err(|source| WalletError::Malformed {
        raw: output.trim().to_string(),
        source,
    })
}

fn as_object(value: &Value) -> Result<&JsonObject, WalletError> {
    value.as_object().ok_or_else(|| WalletError::UnexpectedShape {
        expected: "object",
        raw: value.to_string(),
    })
}

fn str_field<'a>(obj: &'a JsonObject, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Numbers come back either as JSON numbers or as decimal strings.
fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn expect_f64(value: &Value) -> Result<f64, WalletError> {
    value_f64(value).ok_or_else(|| WalletError::UnexpectedShape {
        expected: "number",
        raw: value.to_string(),
    })
}

fn balance_field(obj: &JsonObject, key: &'static str) -> Result<f64, WalletError> {
    obj.get(key)
        .and_then(value_f64)
        .ok_or_else(|| WalletError::UnexpectedShape {
            expected: key,
            raw: Value::Object(obj.clone()).to_string(),
        })
}

fn expect_empty(output: String) -> Result<(), WalletError> {
    if output.trim().is_empty() {
        Ok(())
    } else {
        Err(WalletError::Unexpected(output.trim().to_string()))
    }
}

fn collect_addresses(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            item.get("address")
                .and_then(Value::as_str)
                .unwrap_or("ERROR!")
                .to_string()
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn flatten_json(name: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                flatten_json(&format!("{name}.{key}"), inner, out);
            }
        }
        Value::Array(items) => {
            for (i, inner) in items.iter().enumerate() {
                flatten_json(&format!("{name}[{i}]"), inner, out);
            }
        }
        other => {
            out.insert(name.to_string(), other.to_string());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{command, scripted};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn command_line_carries_datadir_and_params() {
        let (bridge, runner) = scripted(|_| "\"zs1new\"".to_string());
        bridge.new_address(true).unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            vec!["/opt/hush/hush-cli", "-datadir=/data/hush", "z_getnewaddress"]
        );
    }

    #[test]
    fn connection_refused_maps_to_unavailable() {
        let (bridge, _) = scripted(|_| "error: couldn't connect to server: unknown (code -1)".into());
        let err = bridge.wallet_balance().unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn runtime_info_reshapes_loading_error() {
        let (bridge, _) = scripted(|_| "error code: -28\nerror message:\nLoading block index...".into());
        let info = bridge.daemon_runtime_info().unwrap();
        assert_eq!(info.get("code").and_then(Value::as_i64), Some(-28));
        assert_eq!(
            info.get("message").and_then(Value::as_str),
            Some("Loading block index...")
        );
    }

    #[test]
    fn balances_are_read_from_string_fields() {
        let (bridge, _) = scripted(|args| match command(args).as_slice() {
            ["z_gettotalbalance"] => {
                r#"{"transparent":"1.50","private":"2.25","total":"3.75"}"#.into()
            }
            ["z_gettotalbalance", "0"] => {
                r#"{"transparent":"1.60","private":"2.25","total":"3.85"}"#.into()
            }
            other => panic!("неожиданная команда {other:?}"),
        });
        let balance = bridge.wallet_balance().unwrap();
        assert_eq!(balance.transparent, 1.5);
        assert_eq!(balance.total, 3.75);
        assert_eq!(balance.transparent_unconfirmed, 1.6);
        assert_eq!(balance.total_unconfirmed, 3.85);
    }

    #[test]
    fn missing_balance_field_is_unexpected_shape() {
        let (bridge, _) = scripted(|_| r#"{"transparent":"1.0"}"#.into());
        assert!(matches!(
            bridge.wallet_balance(),
            Err(WalletError::UnexpectedShape { .. })
        ));
    }

    #[test]
    fn error_reply_carries_daemon_code() {
        let (bridge, _) = scripted(|_| {
            "error: {\"code\":-5,\"message\":\"Invalid Hush address\"}".into()
        });
        let err = bridge.balance_for_address("t1bad").unwrap_err();
        assert_eq!(err.daemon_code(), Some(-5));
    }

    #[test]
    fn non_json_reply_is_malformed() {
        let (bridge, _) = scripted(|_| "surprise".into());
        assert!(matches!(
            bridge.z_addresses(),
            Err(WalletError::Malformed { .. })
        ));
    }

    #[test]
    fn unencrypted_wallet_is_detected() {
        let (bridge, _) = scripted(|_| {
            "error: {\"code\":-15,\"message\":\"Error: running with an unencrypted wallet, but walletlock was called.\"}".into()
        });
        assert!(!bridge.is_wallet_encrypted().unwrap());

        let (bridge, _) = scripted(|_| String::new());
        assert!(bridge.is_wallet_encrypted().unwrap());

        let (bridge, _) = scripted(|_| "error code: -4\nerror message:\nboom".into());
        assert!(matches!(
            bridge.is_wallet_encrypted(),
            Err(WalletError::Unexpected(_))
        ));
    }

    #[test]
    fn import_falls_back_to_transparent_key() {
        let (bridge, runner) = scripted(|args| match command(args).first().copied() {
            Some("z_importkey") => {
                "error code: -1\nerror message:\nInvalid spending key: wrong network type".into()
            }
            Some("importprivkey") => String::new(),
            other => panic!("неожиданная команда {other:?}"),
        });
        bridge.import_private_key("Kx...").unwrap();
        assert_eq!(runner.count("z_importkey"), 1);
        assert_eq!(runner.count("importprivkey"), 1);
    }

    #[test]
    fn import_with_other_error_does_not_fall_back() {
        let (bridge, runner) = scripted(|_| "error: {\"code\":-4,\"message\":\"boom\"}".into());
        assert!(bridge.import_private_key("secret").is_err());
        assert_eq!(runner.count("importprivkey"), 0);
    }

    #[test]
    fn operation_status_is_interpreted() {
        let (bridge, _) = scripted(|args| {
            let cmd = command(args);
            assert_eq!(cmd[0], "z_getoperationstatus");
            if cmd[1].contains("opid-done") {
                r#"[{"id":"opid-done","status":"success"}]"#.into()
            } else if cmd[1].contains("opid-run") {
                r#"[{"id":"opid-run","status":"executing"}]"#.into()
            } else if cmd[1].contains("opid-fail") {
                r#"[{"id":"opid-fail","status":"failed","error":{"code":-6,"message":"Insufficient funds"}}]"#.into()
            } else {
                r#"[{"id":"opid-odd","status":"cancelled"}]"#.into()
            }
        });
        assert!(bridge.is_operation_complete("opid-done").unwrap());
        assert!(!bridge.is_operation_complete("opid-run").unwrap());
        assert!(bridge.is_operation_complete("opid-fail").unwrap());
        assert!(!bridge.is_operation_successful("opid-fail").unwrap());
        assert_eq!(
            bridge.operation_error_message("opid-fail").unwrap(),
            "Insufficient funds"
        );
        assert!(matches!(
            bridge.is_operation_complete("opid-odd"),
            Err(WalletError::UnexpectedStatus { .. })
        ));
    }

    #[test]
    fn send_cash_builds_sendmany_arguments() {
        let (bridge, runner) = scripted(|_| "opid-1234\n".into());
        let op = bridge
            .send_cash("zs1from", "t1to", "2", "hello", "")
            .unwrap();
        assert_eq!(op, "opid-1234");

        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            command(&calls[0]),
            vec![
                "z_sendmany",
                "zs1from",
                r#"[{"address":"t1to","amount":2.00,"memo":"68656c6c6f"}]"#,
                "1",
                "0.0001",
            ]
        );
    }

    #[test]
    fn invalid_amount_never_reaches_the_client() {
        let (bridge, runner) = scripted(|_| "opid".into());
        assert!(matches!(
            bridge.send_cash("zs1from", "t1to", "-3", "", ""),
            Err(WalletError::InvalidAmount(_))
        ));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn network_info_walks_to_last_block() {
        let (bridge, _) = scripted(|args| match command(args).as_slice() {
            ["getconnectioncount"] => "8\n".into(),
            ["getblockcount"] => "123456\n".into(),
            ["getblockhash", "123456"] => "00000abc\n".into(),
            ["getblock", "00000abc"] => r#"{"hash":"00000abc","time":1700000000}"#.into(),
            other => panic!("неожиданная команда {other:?}"),
        });
        let info = bridge.network_and_blockchain_info().unwrap();
        assert_eq!(info.connection_count, 8);
        assert_eq!(info.last_block_unix, 1_700_000_000);
    }

    #[test]
    fn block_without_time_is_an_error() {
        let (bridge, _) = scripted(|args| match command(args).as_slice() {
            ["getconnectioncount"] => "8\n".into(),
            ["getblockcount"] => "10\n".into(),
            ["getblockhash", "10"] => "00000abc\n".into(),
            ["getblock", "00000abc"] => r#"{"hash":"00000abc","height":10}"#.into(),
            other => panic!("неожиданная команда {other:?}"),
        });
        assert!(matches!(
            bridge.network_and_blockchain_info(),
            Err(WalletError::UnexpectedShape { expected: "block time", .. })
        ));
    }

    #[test]
    fn string_arguments_reach_the_client_verbatim() {
        let (bridge, runner) = scripted(|args| match command(args).first().copied() {
            Some("z_sendmany") => "opid-7\n".into(),
            _ => String::new(),
        });
        bridge
            .send_cash("zs1from", "t1to", "1", "say \"hi\"", "")
            .unwrap();
        bridge.backup_wallet("my \"old\" wallet").unwrap();

        let calls = runner.calls.lock().unwrap();
        let send = command(&calls[0]);
        let to_many: Value = serde_json::from_str(send[2]).unwrap();
        assert_eq!(to_many[0]["address"], "t1to");
        assert_eq!(to_many[0]["memo"], "7361792022686922");
        assert_eq!(command(&calls[1]), vec!["backupwallet", "my \"old\" wallet"]);
        for arg in calls.iter().flatten() {
            assert!(!arg.starts_with('"'), "аргумент обёрнут в кавычки: {arg}");
        }
    }

    #[test]
    fn concurrent_calls_never_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (bridge, runner) = {
            let (in_flight, peak) = (in_flight.clone(), peak.clone());
            scripted(move |_| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                r#"{"version":1}"#.to_string()
            })
        };

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let bridge = bridge.clone();
                thread::spawn(move || bridge.daemon_runtime_info().map(|_| ()))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap().unwrap();
        }

        assert_eq!(runner.count("getinfo"), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn z_received_transactions_fetch_details_once_per_tx() {
        let (bridge, runner) = scripted(|args| match command(args).as_slice() {
            ["z_listaddresses"] => r#"["zs1a"]"#.into(),
            ["z_listreceivedbyaddress", "zs1a", "0"] => {
                r#"[{"txid":"tx1","amount":1.25,"memo":"f600"}]"#.into()
            }
            ["gettransaction", "tx1"] => r#"{"confirmations":3,"time":1600000000}"#.into(),
            other => panic!("неожиданная команда {other:?}"),
        });
        let txs = bridge.z_received_transactions().unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::Private);
        assert_eq!(txs[0].confirmations, 3);
        assert_eq!(txs[0].time_unix, Some(1_600_000_000));
        assert_eq!(txs[0].address.as_deref(), Some("zs1a"));
        assert_eq!(runner.count("gettransaction"), 1);
    }

    #[test]
    fn memo_is_looked_up_by_txid() {
        let (bridge, _) = scripted(|_| {
            r#"[{"txid":"other","memo":"6e6f"},{"txid":"tx9","memo":"686900"}]"#.into()
        });
        assert_eq!(bridge.memo_field("zs1a", "tx9").unwrap().as_deref(), Some("hi"));
        assert_eq!(bridge.memo_field("zs1a", "missing").unwrap(), None);
    }

    #[test]
    fn watch_only_defaults_to_true_when_field_missing() {
        let (bridge, _) = scripted(|_| r#"{"isvalid":true}"#.into());
        assert!(bridge.is_watch_only_or_invalid("t1x").unwrap());

        let (bridge, _) = scripted(|_| r#"{"isvalid":true,"iswatchonly":false}"#.into());
        assert!(!bridge.is_watch_only_or_invalid("t1x").unwrap());

        let (bridge, _) = scripted(|_| r#"{"isvalid":false}"#.into());
        assert!(bridge.is_watch_only_or_invalid("t1x").unwrap());
    }

    #[test]
    fn transaction_details_are_flattened() {
        let (bridge, _) = scripted(|_| {
            r#"{"txid":"tx1","details":[{"amount":1.5,"category":"receive"}],"walletconflicts":[]}"#
                .into()
        });
        let flat = bridge.transaction_details("tx1").unwrap();
        assert_eq!(flat.get("txid").map(String::as_str), Some("\"tx1\""));
        assert_eq!(flat.get("details[0].amount").map(String::as_str), Some("1.5"));
        assert_eq!(
            flat.get("details[0].category").map(String::as_str),
            Some("\"receive\"")
        );
    }

    #[test]
    fn unlock_with_unexpected_reply_is_an_error() {
        let (bridge, _) = scripted(|_| "something odd".into());
        assert!(matches!(
            bridge.unlock_wallet("pass"),
            Err(WalletError::Unexpected(_))
        ));
    }

    #[test]
    fn start_daemon_spawns_with_datadir_and_exportdir() {
        let (bridge, runner) = scripted(|_| String::new());
        let child = bridge.start_daemon().unwrap();
        assert_eq!(child.id(), 4242);
        let spawned = runner.spawned.lock().unwrap();
        assert_eq!(
            spawned[0],
            vec![
                "/opt/hush/hushd",
                "-datadir=/data/hush",
                "-exportdir=/data/hush"
            ]
        );
    }
}
