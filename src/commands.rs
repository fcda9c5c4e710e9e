//! One-shot subcommands: talk to an already running daemon, print JSON, exit.

use crate::bridge::validator::AddressValidator;
use crate::bridge::{CommandLineBridge, WalletError};
use crate::daemon_info::DaemonInfoProvider;
use crate::environment::Environment;
use crate::wallet::{self, SendRequest};
use clap::Subcommand;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start (or attach to) the daemon, gather wallet data and serve HTTP.
    Run {
        /// Keep waiting for a slow daemon without asking.
        #[arg(long)]
        wait_forever: bool,
    },
    Status,
    Balance,
    Addresses {
        /// Only addresses that can fund a payment.
        #[arg(long)]
        positive: bool,
    },
    Transactions,
    NewAddress {
        #[arg(long)]
        z: bool,
    },
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: String,
        #[arg(long, default_value = "")]
        memo: String,
        /// Empty means the configured default fee.
        #[arg(long, default_value = "")]
        fee: String,
    },
    Tx {
        txid: String,
        /// Pretty-printed daemon JSON instead of flattened fields.
        #[arg(long)]
        raw: bool,
    },
    Memo {
        address: String,
        txid: String,
    },
    ExportKey {
        address: String,
    },
    ImportKey {
        key: String,
    },
    Backup {
        file: String,
    },
    ExportWallet {
        file: String,
    },
    ImportWallet {
        file: String,
    },
    Encrypt,
    SystemInfo,
}

pub struct OneShot {
    pub bridge: Arc<CommandLineBridge>,
    pub daemon_info: Box<dyn DaemonInfoProvider>,
    pub env: Environment,
    pub passphrase: Option<String>,
    pub send_poll: Duration,
}

impl OneShot {
    pub fn execute(&self, command: &Command) -> Result<Value, WalletError> {
        let bridge = &self.bridge;
        let passphrase = self.passphrase.as_deref();
        match command {
            Command::Run { .. } => Err(WalletError::InvalidRequest(
                "run не является разовой командой".to_string(),
            )),
            Command::Status => self.status(),
            Command::Balance => to_json(&bridge.wallet_balance()?),
            Command::Addresses { positive } => {
                let validator = AddressValidator::new(bridge.clone());
                let rows = wallet::address_balances(bridge, &validator)?;
                if *positive {
                    to_json(&wallet::positive_balances(&rows))
                } else {
                    to_json(&rows)
                }
            }
            Command::Transactions => to_json(&wallet::transactions(bridge)?),
            Command::NewAddress { z } => {
                let address = wallet::create_address(bridge, *z, passphrase)?;
                Ok(json!({ "address": address }))
            }
            Command::Send {
                from,
                to,
                amount,
                memo,
                fee,
            } => {
                let request = SendRequest {
                    from: from.clone(),
                    to: to.clone(),
                    amount: amount.clone(),
                    memo: memo.clone(),
                    fee: fee.clone(),
                };
                to_json(&wallet::send(bridge, &request, passphrase, self.send_poll)?)
            }
            Command::Tx { txid, raw: true } => {
                let text = bridge.raw_transaction(txid)?;
                serde_json::from_str(&text).map_err(|source| WalletError::Malformed {
                    raw: text,
                    source,
                })
            }
            Command::Tx { txid, raw: false } => to_json(&bridge.transaction_details(txid)?),
            Command::Memo { address, txid } => {
                Ok(json!({ "memo": bridge.memo_field(address, txid)? }))
            }
            Command::ExportKey { address } => {
                let key = wallet::with_unlocked_wallet(bridge, passphrase, || {
                    if is_shielded(address) {
                        bridge.z_private_key(address)
                    } else {
                        bridge.t_private_key(address)
                    }
                })?;
                Ok(json!({ "address": address, "key": key }))
            }
            Command::ImportKey { key } => {
                wallet::with_unlocked_wallet(bridge, passphrase, || {
                    bridge.import_private_key(key)
                })?;
                Ok(json!({ "imported": true }))
            }
            Command::Backup { file } => {
                bridge.backup_wallet(file)?;
                Ok(json!({ "file": file }))
            }
            Command::ExportWallet { file } => {
                wallet::with_unlocked_wallet(bridge, passphrase, || bridge.export_wallet(file))?;
                Ok(json!({ "file": file }))
            }
            Command::ImportWallet { file } => {
                wallet::with_unlocked_wallet(bridge, passphrase, || bridge.import_wallet(file))?;
                Ok(json!({ "file": file }))
            }
            Command::Encrypt => self.encrypt(),
            Command::SystemInfo => Ok(json!({
                "system": self.env.system_info(),
                "os": format!("{:?}", self.env.os),
                "program_dir": self.env.program_dir.display().to_string(),
                "data_dir": self.env.dirs.data_dir.display().to_string(),
                "settings_dir": self.env.dirs.settings_dir.display().to_string(),
                "params_dir": self.env.dirs.params_dir.display().to_string(),
            })),
        }
    }

    fn status(&self) -> Result<Value, WalletError> {
        let daemon = self.daemon_info.daemon_info()?;
        let network = match self.bridge.network_and_blockchain_info() {
            Ok(network) => Some(network),
            Err(err) if err.is_unavailable() => None,
            Err(err) => return Err(err),
        };
        Ok(json!({ "daemon": daemon, "network": network }))
    }

    fn encrypt(&self) -> Result<Value, WalletError> {
        let passphrase = self
            .passphrase
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(WalletError::PassphraseRequired)?;
        if self.bridge.is_wallet_encrypted()? {
            return Err(WalletError::InvalidRequest(
                "кошелёк уже зашифрован".to_string(),
            ));
        }
        let reply = self.bridge.encrypt_wallet(passphrase)?;
        info!("после шифрования демон нужно запустить заново");
        Ok(json!({ "encrypted": true, "reply": reply }))
    }
}

fn is_shielded(address: &str) -> bool {
    address.starts_with('z')
}

fn to_json(value: &impl Serialize) -> Result<Value, WalletError> {
    serde_json::to_value(value).map_err(|err| WalletError::Unexpected(err.to_string()))
}
