use crate::bridge::validator::AddressValidator;
use crate::bridge::{CommandLineBridge, WalletError};
use crate::config::Config;
use crate::daemon_info::DaemonInfoProvider;
use crate::gatherer::Gatherer;
use crate::reporter::{ErrorReporter, StatusErrorReporter};
use crate::wallet::{self, DisplayedTable, RefreshThrottle};
use serde::Serialize;
use std::io;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Running,
    NotRunning,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonInfo {
    pub status: DaemonStatus,
    pub resident_memory_mb: f64,
    pub virtual_memory_mb: f64,
    pub cpu_percent: f64,
}

impl DaemonInfo {
    pub fn not_running() -> Self {
        Self::with_status(DaemonStatus::NotRunning)
    }

    pub fn unknown() -> Self {
        Self::with_status(DaemonStatus::Unknown)
    }

    fn with_status(status: DaemonStatus) -> Self {
        Self {
            status,
            resident_memory_mb: 0.0,
            virtual_memory_mb: 0.0,
            cpu_percent: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WalletBalance {
    pub transparent: f64,
    pub private: f64,
    pub total: f64,
    pub transparent_unconfirmed: f64,
    pub private_unconfirmed: f64,
    pub total_unconfirmed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkAndBlockchainInfo {
    pub connection_count: u32,
    pub last_block_unix: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub direction: String,
    pub confirmations: i64,
    pub amount: f64,
    pub time_unix: Option<i64>,
    pub address: Option<String>,
    pub txid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Transparent,
    Shielded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressBalance {
    pub address: String,
    pub kind: AddressKind,
    pub confirmed: f64,
    pub unconfirmed: f64,
    /// No pending transaction touches the address.
    pub is_confirmed: bool,
}

impl AddressBalance {
    /// Balance to show: the expected value while a transaction is pending.
    pub fn display_balance(&self) -> f64 {
        if self.is_confirmed {
            self.confirmed
        } else {
            self.unconfirmed
        }
    }
}

/// Everything the background machinery produces once the daemon is up.
pub struct WalletState {
    pub bridge: Arc<CommandLineBridge>,
    pub validator: Arc<AddressValidator>,
    pub daemon: Gatherer<DaemonInfo>,
    pub balance: Gatherer<WalletBalance>,
    pub transactions: Gatherer<Vec<Transaction>>,
    pub network: Gatherer<NetworkAndBlockchainInfo>,
    pub addresses: Gatherer<Vec<AddressBalance>>,
    pub transaction_table: DisplayedTable<Transaction>,
    pub address_table: DisplayedTable<AddressBalance>,
    pub refresh: RefreshThrottle,
    reporter: Arc<dyn ErrorReporter>,
}

impl WalletState {
    pub fn start(
        bridge: Arc<CommandLineBridge>,
        daemon_info: Box<dyn DaemonInfoProvider>,
        reporter: Arc<dyn ErrorReporter>,
        cfg: &Config,
    ) -> io::Result<Self> {
        let intervals = &cfg.gatherers;
        let validator = Arc::new(AddressValidator::new(bridge.clone()));

        let daemon = Gatherer::spawn(
            "daemon",
            intervals.daemon_interval(),
            true,
            reporter.clone(),
            move || Ok(daemon_info.daemon_info()?),
        )?;

        let b = bridge.clone();
        let balance = Gatherer::spawn(
            "balance",
            intervals.balance_interval(),
            true,
            reporter.clone(),
            move || b.wallet_balance(),
        )?;

        let b = bridge.clone();
        let transactions = Gatherer::spawn(
            "transactions",
            intervals.transactions_interval(),
            false,
            reporter.clone(),
            move || wallet::transactions(&b),
        )?;

        let b = bridge.clone();
        let network = Gatherer::spawn(
            "network",
            intervals.network_interval(),
            true,
            reporter.clone(),
            move || b.network_and_blockchain_info(),
        )?;

        let (b, v) = (bridge.clone(), validator.clone());
        let addresses = Gatherer::spawn(
            "addresses",
            intervals.addresses_interval(),
            false,
            reporter.clone(),
            move || wallet::address_balances(&b, &v),
        )?;

        info!("сборщики данных кошелька запущены");
        Ok(Self {
            bridge,
            validator,
            daemon,
            balance,
            transactions,
            network,
            addresses,
            transaction_table: DisplayedTable::default(),
            address_table: DisplayedTable::default(),
            refresh: RefreshThrottle::new(Duration::from_secs(cfg.refresh.interactive_hold_secs)),
            reporter,
        })
    }

    /// First fill of the displayed tables, done synchronously.
    pub fn load_initial_tables(&self) {
        match wallet::transactions(&self.bridge) {
            Ok(rows) => {
                self.transaction_table.replace_if_changed(rows);
            }
            Err(err) => self.reporter.report(&err, false),
        }
        if let Err(err) = self.refresh_addresses_interactive() {
            self.reporter.report(&err, false);
        }
    }

    /// Copies the gatherers' latest data into the displayed tables. Address
    /// rows are left alone shortly after an interactive refresh.
    pub fn refresh_displayed_automatic(&self) {
        if let Some(rows) = self.transactions.latest() {
            if self.transaction_table.replace_if_changed(rows) {
                debug!("таблица транзакций обновлена");
            }
        }
        if !self.refresh.allow_automatic() {
            return;
        }
        if let Some(rows) = self.addresses.latest() {
            if self.address_table.replace_if_changed(rows) {
                debug!("таблица адресов обновлена автоматически");
            }
        }
    }

    /// Fetches address balances right now, bypassing the gatherer.
    pub fn refresh_addresses_interactive(&self) -> Result<usize, WalletError> {
        self.refresh.mark_interactive();
        let rows = wallet::address_balances(&self.bridge, &self.validator)?;
        let count = rows.len();
        if self.address_table.replace_if_changed(rows) {
            debug!("таблица адресов обновлена по запросу");
        }
        Ok(count)
    }

    fn gatherer_names(&self) -> [&str; 5] {
        [
            self.daemon.name(),
            self.balance.name(),
            self.transactions.name(),
            self.network.name(),
            self.addresses.name(),
        ]
    }

    /// Gatherer name with its cumulative error count.
    pub fn gatherer_errors(&self) -> Vec<(String, u64)> {
        let counts = [
            self.daemon.error_count(),
            self.balance.error_count(),
            self.transactions.error_count(),
            self.network.error_count(),
            self.addresses.error_count(),
        ];
        self.gatherer_names()
            .iter()
            .zip(counts)
            .map(|(name, count)| (name.to_string(), count))
            .collect()
    }

    /// Gatherer name with the unix time of its last successful fetch.
    pub fn gatherer_last_success(&self) -> Vec<(String, i64)> {
        let times = [
            self.daemon.last_success_unix(),
            self.balance.last_success_unix(),
            self.transactions.last_success_unix(),
            self.network.last_success_unix(),
            self.addresses.last_success_unix(),
        ];
        self.gatherer_names()
            .iter()
            .zip(times)
            .map(|(name, at)| (name.to_string(), at))
            .collect()
    }

    pub fn suspend_all(&self) {
        self.daemon.suspend();
        self.balance.suspend();
        self.transactions.suspend();
        self.network.suspend();
        self.addresses.suspend();
    }

    pub fn join_all(&self) {
        self.daemon.join();
        self.balance.join();
        self.transactions.join();
        self.network.join();
        self.addresses.join();
    }
}

/// Shared view for the HTTP surface; the wallet part appears once startup is done.
pub struct StatusBoard {
    pub started_at_unix: i64,
    startup_text: RwLock<String>,
    wallet: OnceLock<Arc<WalletState>>,
    pub reporter: Arc<StatusErrorReporter>,
}

impl StatusBoard {
    pub fn new(reporter: Arc<StatusErrorReporter>) -> Self {
        Self {
            started_at_unix: now_unix(),
            startup_text: RwLock::new("Запуск...".to_string()),
            wallet: OnceLock::new(),
            reporter,
        }
    }

    pub fn set_startup_text(&self, text: &str) {
        *self
            .startup_text
            .write()
            .unwrap_or_else(PoisonError::into_inner) = text.to_string();
    }

    pub fn startup_text(&self) -> String {
        self.startup_text
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns false if a wallet was already attached.
    pub fn attach_wallet(&self, wallet: Arc<WalletState>) -> bool {
        self.wallet.set(wallet).is_ok()
    }

    pub fn wallet(&self) -> Option<&Arc<WalletState>> {
        self.wallet.get()
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
