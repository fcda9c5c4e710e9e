use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub install_dir: String,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub settings_dir: Option<String>,
    #[serde(default = "default_daemon_basename")]
    pub daemon_basename: String,
    #[serde(default = "default_cli_basename")]
    pub cli_basename: String,
    #[serde(default)]
    pub gatherers: GatherersConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub errors: ErrorsConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub send: SendConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatherersConfig {
    #[serde(default = "default_daemon_interval_ms")]
    pub daemon_interval_ms: u64,
    #[serde(default = "default_balance_interval_ms")]
    pub balance_interval_ms: u64,
    #[serde(default = "default_transactions_interval_ms")]
    pub transactions_interval_ms: u64,
    #[serde(default = "default_network_interval_ms")]
    pub network_interval_ms: u64,
    #[serde(default = "default_addresses_interval_ms")]
    pub addresses_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StartupConfig {
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,
    #[serde(default = "default_attempt_limit")]
    pub attempt_limit: u32,
    #[serde(default = "default_loading_code")]
    pub loading_code: i64,
    #[serde(default = "default_stale_block_secs")]
    pub stale_block_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_wait_step_ms")]
    pub wait_step_ms: u64,
    #[serde(default = "default_escalate_after_secs")]
    pub escalate_after_secs: u64,
    #[serde(default = "default_give_up_after_secs")]
    pub give_up_after_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorsConfig {
    #[serde(default = "default_report_cooldown_secs")]
    pub report_cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshConfig {
    #[serde(default = "default_interactive_hold_secs")]
    pub interactive_hold_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SendConfig {
    #[serde(default = "default_fee")]
    pub default_fee: String,
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            install_dir: String::new(),
            data_dir: None,
            settings_dir: None,
            daemon_basename: default_daemon_basename(),
            cli_basename: default_cli_basename(),
            gatherers: GatherersConfig::default(),
            startup: StartupConfig::default(),
            shutdown: ShutdownConfig::default(),
            errors: ErrorsConfig::default(),
            refresh: RefreshConfig::default(),
            send: SendConfig::default(),
        }
    }
}

impl Default for GatherersConfig {
    fn default() -> Self {
        Self {
            daemon_interval_ms: default_daemon_interval_ms(),
            balance_interval_ms: default_balance_interval_ms(),
            transactions_interval_ms: default_transactions_interval_ms(),
            network_interval_ms: default_network_interval_ms(),
            addresses_interval_ms: default_addresses_interval_ms(),
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            poll_period_ms: default_poll_period_ms(),
            attempt_limit: default_attempt_limit(),
            loading_code: default_loading_code(),
            stale_block_secs: default_stale_block_secs(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            wait_step_ms: default_wait_step_ms(),
            escalate_after_secs: default_escalate_after_secs(),
            give_up_after_secs: default_give_up_after_secs(),
        }
    }
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            report_cooldown_secs: default_report_cooldown_secs(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interactive_hold_secs: default_interactive_hold_secs(),
        }
    }
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            default_fee: default_fee(),
            min_confirmations: default_min_confirmations(),
            status_poll_ms: default_status_poll_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        Self::from_yaml(&text, &path_display)
    }

    /// Like [`Config::load_from_file`], but a missing file yields the built-in defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::load_from_file(path) {
            Err(ConfigError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
            other => other,
        }
    }

    fn from_yaml(text: &str, path_display: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path_display.to_string(),
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.daemon_basename.trim().is_empty() || self.cli_basename.trim().is_empty() {
            return Err(ConfigError::Validation(
                "daemon_basename и cli_basename не должны быть пустыми".to_string(),
            ));
        }

        validate_gatherers(&self.gatherers)?;
        validate_startup(&self.startup)?;
        validate_shutdown(&self.shutdown)?;

        if self.errors.report_cooldown_secs < 1 {
            return Err(ConfigError::Validation(
                "errors.report_cooldown_secs должно быть >= 1".to_string(),
            ));
        }
        if self.send.min_confirmations < 1 {
            return Err(ConfigError::Validation(
                "send.min_confirmations должно быть >= 1".to_string(),
            ));
        }
        if self.send.status_poll_ms == 0 {
            return Err(ConfigError::Validation(
                "send.status_poll_ms должен быть > 0".to_string(),
            ));
        }
        match self.send.default_fee.trim().parse::<f64>() {
            Ok(fee) if fee.is_finite() && fee >= 0.0 => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "send.default_fee '{}' должно быть неотрицательным числом",
                    self.send.default_fee
                )))
            }
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl GatherersConfig {
    pub fn daemon_interval(&self) -> Duration {
        Duration::from_millis(self.daemon_interval_ms)
    }

    pub fn balance_interval(&self) -> Duration {
        Duration::from_millis(self.balance_interval_ms)
    }

    pub fn transactions_interval(&self) -> Duration {
        Duration::from_millis(self.transactions_interval_ms)
    }

    pub fn network_interval(&self) -> Duration {
        Duration::from_millis(self.network_interval_ms)
    }

    pub fn addresses_interval(&self) -> Duration {
        Duration::from_millis(self.addresses_interval_ms)
    }
}

fn validate_gatherers(cfg: &GatherersConfig) -> Result<(), ConfigError> {
    let intervals = [
        ("daemon_interval_ms", cfg.daemon_interval_ms),
        ("balance_interval_ms", cfg.balance_interval_ms),
        ("transactions_interval_ms", cfg.transactions_interval_ms),
        ("network_interval_ms", cfg.network_interval_ms),
        ("addresses_interval_ms", cfg.addresses_interval_ms),
    ];
    for (name, value) in intervals {
        if value < 100 {
            return Err(ConfigError::Validation(format!(
                "gatherers.{name} должно быть >= 100"
            )));
        }
    }
    Ok(())
}

fn validate_startup(cfg: &StartupConfig) -> Result<(), ConfigError> {
    if cfg.poll_period_ms == 0 {
        return Err(ConfigError::Validation(
            "startup.poll_period_ms должен быть > 0".to_string(),
        ));
    }
    if cfg.attempt_limit < 1 {
        return Err(ConfigError::Validation(
            "startup.attempt_limit должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_shutdown(cfg: &ShutdownConfig) -> Result<(), ConfigError> {
    if cfg.wait_step_ms == 0 {
        return Err(ConfigError::Validation(
            "shutdown.wait_step_ms должен быть > 0".to_string(),
        ));
    }
    if cfg.give_up_after_secs < cfg.escalate_after_secs {
        return Err(ConfigError::Validation(
            "shutdown.give_up_after_secs должно быть >= shutdown.escalate_after_secs".to_string(),
        ));
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:9110".to_string()
}

fn default_daemon_basename() -> String {
    "hushd".to_string()
}

fn default_cli_basename() -> String {
    "hush-cli".to_string()
}

const fn default_daemon_interval_ms() -> u64 {
    2000
}

const fn default_balance_interval_ms() -> u64 {
    8000
}

const fn default_transactions_interval_ms() -> u64 {
    25000
}

const fn default_network_interval_ms() -> u64 {
    10000
}

const fn default_addresses_interval_ms() -> u64 {
    25000
}

const fn default_poll_period_ms() -> u64 {
    500
}

const fn default_attempt_limit() -> u32 {
    30
}

const fn default_loading_code() -> i64 {
    -28
}

const fn default_stale_block_secs() -> u64 {
    20 * 60
}

const fn default_wait_step_ms() -> u64 {
    3000
}

const fn default_escalate_after_secs() -> u64 {
    10
}

const fn default_give_up_after_secs() -> u64 {
    60
}

const fn default_report_cooldown_secs() -> u64 {
    45
}

const fn default_interactive_hold_secs() -> u64 {
    60
}

fn default_fee() -> String {
    "0.0001".to_string()
}

const fn default_min_confirmations() -> u32 {
    1
}

const fn default_status_poll_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_yaml_parses_and_validates() {
        let cfg = Config::from_yaml(Config::example_yaml(), "config.yaml.example")
            .expect("пример конфигурации должен быть валидным");
        assert_eq!(cfg.daemon_basename, "hushd");
        assert_eq!(cfg.startup.loading_code, -28);
        assert_eq!(cfg.send.default_fee, "0.0001");
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = Config::from_yaml("{}", "inline").expect("пустой YAML допустим");
        assert_eq!(cfg.gatherers.daemon_interval_ms, 2000);
        assert_eq!(cfg.gatherers.balance_interval_ms, 8000);
        assert_eq!(cfg.gatherers.transactions_interval_ms, 25000);
        assert_eq!(cfg.gatherers.network_interval_ms, 10000);
        assert_eq!(cfg.gatherers.addresses_interval_ms, 25000);
        assert_eq!(cfg.startup.attempt_limit, 30);
        assert_eq!(cfg.shutdown.give_up_after_secs, 60);
        assert_eq!(cfg.errors.report_cooldown_secs, 45);
        assert_eq!(cfg.refresh.interactive_hold_secs, 60);
    }

    #[test]
    fn invalid_listen_is_rejected() {
        let cfg = Config {
            listen: "not-an-address".to_string(),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn negative_fee_is_rejected() {
        let mut cfg = Config::default();
        cfg.send.default_fee = "-1".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn give_up_before_escalation_is_rejected() {
        let mut cfg = Config::default();
        cfg.shutdown.escalate_after_secs = 30;
        cfg.shutdown.give_up_after_secs = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load_or_default("/nonexistent/walletd/config.yaml")
            .expect("отсутствующий файл заменяется значениями по умолчанию");
        assert_eq!(cfg.listen, "127.0.0.1:9110");
    }
}
