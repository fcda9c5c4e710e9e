use crate::state::{now_unix, DaemonStatus, StatusBoard};
use prometheus::core::Collector;
use prometheus::{opts, Counter, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub walletd_daemon_running: Gauge,
    pub walletd_daemon_cpu_percent: Gauge,
    pub walletd_daemon_resident_memory_mb: Gauge,
    pub walletd_daemon_virtual_memory_mb: Gauge,
    pub walletd_balance: GaugeVec,
    pub walletd_balance_unconfirmed: GaugeVec,
    pub walletd_connection_count: Gauge,
    pub walletd_last_block_timestamp_seconds: Gauge,
    pub walletd_address_count: Gauge,
    pub walletd_transaction_count: Gauge,
    pub walletd_gatherer_errors: GaugeVec,
    pub walletd_gatherer_last_success_timestamp_seconds: GaugeVec,
    pub walletd_wallet_ready: Gauge,
    pub walletd_uptime_seconds: Gauge,
    pub walletd_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let walletd_daemon_running = Gauge::with_opts(opts!(
            "walletd_daemon_running",
            "1 if the wallet daemon process is running"
        ))?;
        let walletd_daemon_cpu_percent = Gauge::with_opts(opts!(
            "walletd_daemon_cpu_percent",
            "CPU usage of the wallet daemon in percent"
        ))?;
        let walletd_daemon_resident_memory_mb = Gauge::with_opts(opts!(
            "walletd_daemon_resident_memory_mb",
            "Resident memory of the wallet daemon in MB"
        ))?;
        let walletd_daemon_virtual_memory_mb = Gauge::with_opts(opts!(
            "walletd_daemon_virtual_memory_mb",
            "Virtual memory of the wallet daemon in MB"
        ))?;
        let walletd_balance = GaugeVec::new(
            opts!("walletd_balance", "Confirmed wallet balance by pool"),
            &["pool"],
        )?;
        let walletd_balance_unconfirmed = GaugeVec::new(
            opts!(
                "walletd_balance_unconfirmed",
                "Wallet balance including pending transactions by pool"
            ),
            &["pool"],
        )?;
        let walletd_connection_count = Gauge::with_opts(opts!(
            "walletd_connection_count",
            "Number of peers the daemon is connected to"
        ))?;
        let walletd_last_block_timestamp_seconds = Gauge::with_opts(opts!(
            "walletd_last_block_timestamp_seconds",
            "Unix timestamp of the best block"
        ))?;
        let walletd_address_count = Gauge::with_opts(opts!(
            "walletd_address_count",
            "Number of rows in the displayed address table"
        ))?;
        let walletd_transaction_count = Gauge::with_opts(opts!(
            "walletd_transaction_count",
            "Number of rows in the displayed transaction table"
        ))?;
        let walletd_gatherer_errors = GaugeVec::new(
            opts!(
                "walletd_gatherer_errors",
                "Failed fetches since start by gatherer"
            ),
            &["gatherer"],
        )?;
        let walletd_gatherer_last_success_timestamp_seconds = GaugeVec::new(
            opts!(
                "walletd_gatherer_last_success_timestamp_seconds",
                "Unix timestamp of the last successful fetch by gatherer"
            ),
            &["gatherer"],
        )?;
        let walletd_wallet_ready = Gauge::with_opts(opts!(
            "walletd_wallet_ready",
            "1 once the daemon is up and the gatherers are running"
        ))?;
        let walletd_uptime_seconds =
            Gauge::with_opts(opts!("walletd_uptime_seconds", "Process uptime in seconds"))?;
        let walletd_scrape_count_total = Counter::with_opts(opts!(
            "walletd_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &walletd_daemon_running)?;
        register(&registry, &walletd_daemon_cpu_percent)?;
        register(&registry, &walletd_daemon_resident_memory_mb)?;
        register(&registry, &walletd_daemon_virtual_memory_mb)?;
        register(&registry, &walletd_balance)?;
        register(&registry, &walletd_balance_unconfirmed)?;
        register(&registry, &walletd_connection_count)?;
        register(&registry, &walletd_last_block_timestamp_seconds)?;
        register(&registry, &walletd_address_count)?;
        register(&registry, &walletd_transaction_count)?;
        register(&registry, &walletd_gatherer_errors)?;
        register(&registry, &walletd_gatherer_last_success_timestamp_seconds)?;
        register(&registry, &walletd_wallet_ready)?;
        register(&registry, &walletd_uptime_seconds)?;
        register(&registry, &walletd_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            walletd_daemon_running,
            walletd_daemon_cpu_percent,
            walletd_daemon_resident_memory_mb,
            walletd_daemon_virtual_memory_mb,
            walletd_balance,
            walletd_balance_unconfirmed,
            walletd_connection_count,
            walletd_last_block_timestamp_seconds,
            walletd_address_count,
            walletd_transaction_count,
            walletd_gatherer_errors,
            walletd_gatherer_last_success_timestamp_seconds,
            walletd_wallet_ready,
            walletd_uptime_seconds,
            walletd_scrape_count_total,
        }))
    }

    pub fn update_from_state(&self, board: &StatusBoard) {
        let uptime = (now_unix() - board.started_at_unix).max(0);
        self.walletd_uptime_seconds.set(uptime as f64);

        let Some(wallet) = board.wallet() else {
            self.walletd_wallet_ready.set(0.0);
            return;
        };
        self.walletd_wallet_ready.set(1.0);

        if let Some(info) = wallet.daemon.latest() {
            let running = if info.status == DaemonStatus::Running {
                1.0
            } else {
                0.0
            };
            self.walletd_daemon_running.set(running);
            self.walletd_daemon_cpu_percent.set(info.cpu_percent);
            self.walletd_daemon_resident_memory_mb
                .set(info.resident_memory_mb);
            self.walletd_daemon_virtual_memory_mb
                .set(info.virtual_memory_mb);
        }

        if let Some(balance) = wallet.balance.latest() {
            for (pool, confirmed, unconfirmed) in [
                ("transparent", balance.transparent, balance.transparent_unconfirmed),
                ("private", balance.private, balance.private_unconfirmed),
                ("total", balance.total, balance.total_unconfirmed),
            ] {
                self.walletd_balance.with_label_values(&[pool]).set(confirmed);
                self.walletd_balance_unconfirmed
                    .with_label_values(&[pool])
                    .set(unconfirmed);
            }
        }

        if let Some(network) = wallet.network.latest() {
            self.walletd_connection_count
                .set(f64::from(network.connection_count));
            self.walletd_last_block_timestamp_seconds
                .set(network.last_block_unix as f64);
        }

        if let Some(rows) = wallet.address_table.rows() {
            self.walletd_address_count.set(rows.len() as f64);
        }
        if let Some(rows) = wallet.transaction_table.rows() {
            self.walletd_transaction_count.set(rows.len() as f64);
        }

        for (name, errors) in wallet.gatherer_errors() {
            self.walletd_gatherer_errors
                .with_label_values(&[name.as_str()])
                .set(errors as f64);
        }
        for (name, at) in wallet.gatherer_last_success() {
            self.walletd_gatherer_last_success_timestamp_seconds
                .with_label_values(&[name.as_str()])
                .set(at as f64);
        }
    }

    pub fn inc_scrape_count(&self) {
        self.walletd_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
