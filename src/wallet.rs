use crate::bridge::validator::AddressValidator;
use crate::bridge::{amount, CommandLineBridge, WalletError};
use crate::state::{AddressBalance, AddressKind, Transaction};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const MIN_ADDRESS_LEN: usize = 21;
const MAX_ADDRESS_LEN: usize = 512;

/// Balances of every usable wallet address, sorted by address.
///
/// Watch-only and invalid T addresses are left out.
pub fn address_balances(
    bridge: &CommandLineBridge,
    validator: &AddressValidator,
) -> Result<Vec<AddressBalance>, WalletError> {
    let mut t_addresses: BTreeSet<String> = bridge.all_public_addresses()?.into_iter().collect();
    t_addresses.extend(bridge.public_addresses_with_unspent()?);
    let z_addresses = bridge.z_addresses()?;

    let mut rows = Vec::with_capacity(t_addresses.len() + z_addresses.len());
    for address in t_addresses {
        if validator.is_watch_only_or_invalid(&address)? {
            validator.warn_excluded(&address);
            continue;
        }
        rows.push(address_row(bridge, address, AddressKind::Transparent)?);
    }
    for address in z_addresses {
        rows.push(address_row(bridge, address, AddressKind::Shielded)?);
    }

    rows.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(rows)
}

fn address_row(
    bridge: &CommandLineBridge,
    address: String,
    kind: AddressKind,
) -> Result<AddressBalance, WalletError> {
    let confirmed = bridge.balance_for_address(&address)?;
    let unconfirmed = bridge.unconfirmed_balance_for_address(&address)?;
    Ok(AddressBalance {
        is_confirmed: confirmed == unconfirmed,
        address,
        kind,
        confirmed,
        unconfirmed,
    })
}

/// Addresses that can fund a payment.
pub fn positive_balances(rows: &[AddressBalance]) -> Vec<AddressBalance> {
    rows.iter()
        .filter(|row| row.confirmed > 0.0)
        .cloned()
        .collect()
}

/// Public and private transactions merged, newest first.
pub fn transactions(bridge: &CommandLineBridge) -> Result<Vec<Transaction>, WalletError> {
    let mut all = bridge.public_transactions()?;
    all.extend(bridge.z_received_transactions()?);
    sort_newest_first(&mut all);
    Ok(all)
}

fn sort_newest_first(rows: &mut [Transaction]) {
    rows.sort_by_key(|tx| std::cmp::Reverse(tx.time_unix.unwrap_or(0)));
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    pub amount: String,
    pub memo: String,
    pub fee: String,
}

impl SendRequest {
    pub fn validate(&self) -> Result<(), WalletError> {
        check_address("адрес отправителя", &self.from)?;
        check_address("адрес получателя", &self.to)?;
        amount::parse_amount(&self.amount)?;
        if !self.fee.trim().is_empty() {
            amount::parse_fee(&self.fee)?;
        }
        Ok(())
    }
}

fn check_address(label: &str, address: &str) -> Result<(), WalletError> {
    let len = address.trim().len();
    if len == 0 {
        return Err(WalletError::InvalidRequest(format!("{label} не указан")));
    }
    if len < MIN_ADDRESS_LEN {
        return Err(WalletError::InvalidRequest(format!("{label} слишком короткий")));
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(WalletError::InvalidRequest(format!("{label} слишком длинный")));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "message", rename_all = "snake_case")]
pub enum SendOutcome {
    Success,
    Failed(String),
}

/// Polls an asynchronous send operation until the daemon reports a final state.
pub struct SendTracker<'a> {
    bridge: &'a CommandLineBridge,
    poll: Duration,
}

impl<'a> SendTracker<'a> {
    pub fn new(bridge: &'a CommandLineBridge, poll: Duration) -> Self {
        Self { bridge, poll }
    }

    pub fn wait(&self, op_id: &str) -> Result<SendOutcome, WalletError> {
        let started = Instant::now();
        loop {
            thread::sleep(self.poll);
            if self.bridge.is_operation_complete(op_id)? {
                break;
            }
            info!(
                op_id = %op_id,
                elapsed_secs = started.elapsed().as_secs(),
                "операция отправки выполняется"
            );
        }

        if self.bridge.is_operation_successful(op_id)? {
            Ok(SendOutcome::Success)
        } else {
            let message = self.bridge.operation_error_message(op_id)?;
            Ok(SendOutcome::Failed(message))
        }
    }
}

/// Validates, unlocks if needed, submits and waits for the outcome.
pub fn send(
    bridge: &CommandLineBridge,
    request: &SendRequest,
    passphrase: Option<&str>,
    poll: Duration,
) -> Result<SendOutcome, WalletError> {
    request.validate()?;
    with_unlocked_wallet(bridge, passphrase, || {
        let op_id = bridge.send_cash(
            &request.from,
            &request.to,
            &request.amount,
            &request.memo,
            &request.fee,
        )?;
        SendTracker::new(bridge, poll).wait(&op_id)
    })
}

/// New T or Z address; Z keys need an unlocked wallet.
pub fn create_address(
    bridge: &CommandLineBridge,
    z: bool,
    passphrase: Option<&str>,
) -> Result<String, WalletError> {
    if z {
        with_unlocked_wallet(bridge, passphrase, || bridge.new_address(true))
    } else {
        bridge.new_address(false)
    }
}

/// Runs `f` with the wallet unlocked when it is encrypted, and locks it again
/// afterwards even if `f` failed.
pub fn with_unlocked_wallet<R>(
    bridge: &CommandLineBridge,
    passphrase: Option<&str>,
    f: impl FnOnce() -> Result<R, WalletError>,
) -> Result<R, WalletError> {
    if !bridge.is_wallet_encrypted()? {
        return f();
    }
    let passphrase = passphrase.ok_or(WalletError::PassphraseRequired)?;
    bridge.unlock_wallet(passphrase)?;

    let result = f();
    match (result, bridge.lock_wallet()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(lock_err)) => Err(lock_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(lock_err)) => {
            warn!(error = %lock_err, "не удалось снова заблокировать кошелёк");
            Err(err)
        }
    }
}

/// Soft rule: no automatic table refresh within `hold` of an interactive one.
/// A timestamp check only; both refreshes may still overlap.
#[derive(Debug)]
pub struct RefreshThrottle {
    hold: Duration,
    last_interactive: Mutex<Option<Instant>>,
}

impl RefreshThrottle {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            last_interactive: Mutex::new(None),
        }
    }

    pub fn mark_interactive(&self) {
        *self
            .last_interactive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    pub fn allow_automatic(&self) -> bool {
        match *self
            .last_interactive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(at) => at.elapsed() >= self.hold,
            None => true,
        }
    }
}

/// Rows currently shown to clients, replaced only when they actually change.
#[derive(Debug)]
pub struct DisplayedTable<T> {
    rows: RwLock<Option<Vec<T>>>,
}

impl<T> Default for DisplayedTable<T> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(None),
        }
    }
}

impl<T: Clone + PartialEq> DisplayedTable<T> {
    /// Returns true when the table content changed.
    pub fn replace_if_changed(&self, rows: Vec<T>) -> bool {
        let mut current = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() == Some(&rows) {
            return false;
        }
        *current = Some(rows);
        true
    }

    pub fn rows(&self) -> Option<Vec<T>> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
