//! Brings the daemon up before the wallet is used and takes it down on exit.

use crate::bridge::{CommandLineBridge, WalletError};
use crate::config::{ShutdownConfig, StartupConfig};
use crate::executor::ChildProcess;
use crate::state::{now_unix, DaemonInfo, DaemonStatus};
use serde_json::Value;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

const WAITING_TEXT: &str = "Waiting for daemon to start...";
const EXIT_POLL: Duration = Duration::from_millis(100);
const PROVING_KEY_FILE: &str = "sprout-proving.key";
const PROVING_KEY_SIZE: u64 = 910_173_851;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("запуск демона прерван: ожидание отменено")]
    Aborted,
    #[error("ключ доказательства {} непригоден: {reason}", .path.display())]
    ProvingKey { path: PathBuf, reason: String },
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error("ошибка ввода-вывода при запуске: {0}")]
    Io(#[from] io::Error),
}

/// Asked once each time the startup attempt limit runs out.
pub trait StartupPrompt {
    fn continue_waiting(&mut self) -> bool;
}

/// y/N question on the terminal.
pub struct StdinPrompt;

impl StartupPrompt for StdinPrompt {
    fn continue_waiting(&mut self) -> bool {
        let mut stderr = io::stderr();
        let _ = write!(
            stderr,
            "Демон не запустился за отведённое время. Продолжить ожидание? [y/N] "
        );
        let _ = stderr.flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(
            answer.trim().to_lowercase().as_str(),
            "y" | "yes" | "д" | "да"
        )
    }
}

/// Always gives the same answer; for unattended runs.
pub struct FixedPrompt(pub bool);

impl StartupPrompt for FixedPrompt {
    fn continue_waiting(&mut self) -> bool {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct StartupPolicy {
    pub poll_period: Duration,
    pub attempt_limit: u32,
    pub loading_code: i64,
    pub stale_block: Duration,
}

impl From<&StartupConfig> for StartupPolicy {
    fn from(cfg: &StartupConfig) -> Self {
        Self {
            poll_period: Duration::from_millis(cfg.poll_period_ms),
            attempt_limit: cfg.attempt_limit,
            loading_code: cfg.loading_code,
            stale_block: Duration::from_secs(cfg.stale_block_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownPolicy {
    pub wait_step: Duration,
    pub escalate_after: Duration,
    pub give_up_after: Duration,
}

impl From<&ShutdownConfig> for ShutdownPolicy {
    fn from(cfg: &ShutdownConfig) -> Self {
        Self {
            wait_step: Duration::from_millis(cfg.wait_step_ms),
            escalate_after: Duration::from_secs(cfg.escalate_after_secs),
            give_up_after: Duration::from_secs(cfg.give_up_after_secs),
        }
    }
}

pub enum StartupOutcome {
    /// Someone else runs the daemon; we will not stop it.
    AlreadyRunning,
    Started(DaemonGuard),
}

pub struct StartupSupervisor {
    bridge: Arc<CommandLineBridge>,
    startup: StartupPolicy,
    shutdown: ShutdownPolicy,
    params_dir: Option<PathBuf>,
}

impl StartupSupervisor {
    pub fn new(
        bridge: Arc<CommandLineBridge>,
        startup: StartupPolicy,
        shutdown: ShutdownPolicy,
    ) -> Self {
        Self {
            bridge,
            startup,
            shutdown,
            params_dir: None,
        }
    }

    /// Checks the proving key in `dir` before starting a daemon.
    pub fn with_params_dir(mut self, dir: PathBuf) -> Self {
        self.params_dir = Some(dir);
        self
    }

    /// Whether the daemon looks absent, still loading, or far behind the chain.
    pub fn needs_startup_wait(&self, info: &DaemonInfo) -> Result<bool, WalletError> {
        if info.status != DaemonStatus::Running {
            return Ok(true);
        }
        match self.bridge.network_and_blockchain_info() {
            Ok(net) => {
                let age = now_unix().saturating_sub(net.last_block_unix);
                let stale = age > self.startup.stale_block.as_secs() as i64;
                if stale {
                    info!(last_block_unix = net.last_block_unix, "блокчейн отстаёт, демон ещё синхронизируется");
                }
                Ok(stale)
            }
            Err(err) if err.daemon_code() == Some(self.startup.loading_code) => {
                info!("демон запущен, но ещё загружается");
                Ok(true)
            }
            Err(err) if err.is_unavailable() => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// Blocks until the daemon answers `getinfo` normally, starting it if nobody runs it.
    pub fn wait_for_startup(
        &self,
        prompt: &mut dyn StartupPrompt,
        progress: &mut dyn FnMut(&str),
    ) -> Result<StartupOutcome, StartupError> {
        info!("проверка, запущен ли демон");
        match self.bridge.daemon_runtime_info() {
            Ok(reply) => match self.loading_message(&reply) {
                Some(message) => {
                    info!("демон уже запущен и загружается");
                    progress(&message);
                    self.poll_until_ready(prompt, progress)?;
                    Ok(StartupOutcome::AlreadyRunning)
                }
                None => {
                    info!("демон уже запущен");
                    Ok(StartupOutcome::AlreadyRunning)
                }
            },
            Err(err) if err.is_unavailable() => {
                info!("демон будет запущен");
                if let Some(dir) = &self.params_dir {
                    check_proving_key(dir)?;
                }
                let child = self.bridge.start_daemon()?;
                self.poll_until_ready(prompt, progress)?;
                info!(pid = child.id(), "демон готов");
                Ok(StartupOutcome::Started(DaemonGuard::new(
                    self.bridge.clone(),
                    child,
                    self.shutdown.clone(),
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn poll_until_ready(
        &self,
        prompt: &mut dyn StartupPrompt,
        progress: &mut dyn FnMut(&str),
    ) -> Result<(), StartupError> {
        let limit = self.startup.attempt_limit;
        progress(WAITING_TEXT);

        let mut iteration: u32 = 1;
        loop {
            thread::sleep(self.startup.poll_period);
            iteration += 1;

            let reply = match self.bridge.daemon_runtime_info() {
                Ok(reply) => reply,
                Err(err) if err.is_unavailable() => {
                    let remaining = i64::from(limit) - i64::from(iteration);
                    progress(&format!("{WAITING_TEXT} ({remaining})"));
                    if iteration > limit {
                        if !prompt.continue_waiting() {
                            warn!("ожидание запуска демона отменено");
                            return Err(StartupError::Aborted);
                        }
                        iteration = 1;
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match self.loading_message(&reply) {
                Some(message) => progress(&message),
                None => return Ok(()),
            }
        }
    }

    fn loading_message(&self, reply: &serde_json::Map<String, Value>) -> Option<String> {
        let code = reply.get("code").and_then(Value::as_i64)?;
        if code != self.startup.loading_code {
            return None;
        }
        Some(
            reply
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )
    }
}

/// Owns a daemon we started; stops it on [`DaemonGuard::shutdown`] or drop.
pub struct DaemonGuard {
    bridge: Arc<CommandLineBridge>,
    child: Option<Box<dyn ChildProcess>>,
    policy: ShutdownPolicy,
}

impl DaemonGuard {
    pub fn new(
        bridge: Arc<CommandLineBridge>,
        child: Box<dyn ChildProcess>,
        policy: ShutdownPolicy,
    ) -> Self {
        Self {
            bridge,
            child: Some(child),
            policy,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Polite stop, escalating to an OS terminate request; never kills forcibly.
    pub fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();

        match child.has_exited() {
            Ok(true) => {
                info!(pid, "процесс демона уже завершён");
                return;
            }
            Ok(false) => {}
            Err(err) => warn!(pid, error = %err, "не удалось проверить состояние демона"),
        }

        info!(pid, "остановка демона");
        self.send_stop();

        let started = Instant::now();
        loop {
            if wait_for_exit(child.as_mut(), self.policy.wait_step) {
                break;
            }
            let elapsed = started.elapsed();
            info!(pid, elapsed_secs = elapsed.as_secs(), "ожидание завершения демона");

            if elapsed > self.policy.escalate_after {
                self.send_stop();
                if let Err(err) = child.terminate() {
                    warn!(pid, error = %err, "не удалось отправить сигнал завершения");
                }
            }
            if elapsed > self.policy.give_up_after {
                break;
            }
        }

        if matches!(child.has_exited(), Ok(true)) {
            info!(pid, "демон остановлен");
        } else {
            warn!(pid, "демон всё ещё работает, хотя его пытались остановить; принудительно не завершаем");
        }
    }

    fn send_stop(&self) {
        if let Err(err) = self.bridge.stop_daemon() {
            warn!(error = %err, "команда stop не выполнена");
        }
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wait_for_exit(child: &mut dyn ChildProcess, step: Duration) -> bool {
    let deadline = Instant::now() + step;
    loop {
        if matches!(child.has_exited(), Ok(true)) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(EXIT_POLL.min(deadline - now));
    }
}

/// The daemon refuses to start without the Sprout proving key of the release size.
pub fn check_proving_key(params_dir: &Path) -> Result<(), StartupError> {
    let path = params_dir.join(PROVING_KEY_FILE);
    let size = fs::metadata(&path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len());
    match size {
        Some(PROVING_KEY_SIZE) => {
            info!(path = %path.display(), "ключ доказательства на месте");
            Ok(())
        }
        Some(size) => Err(StartupError::ProvingKey {
            path,
            reason: format!("размер {size} байт, ожидалось {PROVING_KEY_SIZE}"),
        }),
        None => Err(StartupError::ProvingKey {
            path,
            reason: "файл не найден".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::{command, scripted};
    use crate::executor::testing::FnRunner;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPrompt {
        answers: Vec<bool>,
        asked: usize,
    }

    impl StartupPrompt for CountingPrompt {
        fn continue_waiting(&mut self) -> bool {
            let answer = self.answers.get(self.asked).copied().unwrap_or(false);
            self.asked += 1;
            answer
        }
    }

    fn fast_startup(limit: u32) -> StartupPolicy {
        StartupPolicy {
            poll_period: Duration::from_millis(1),
            attempt_limit: limit,
            loading_code: -28,
            stale_block: Duration::from_secs(1200),
        }
    }

    fn fast_shutdown() -> ShutdownPolicy {
        ShutdownPolicy {
            wait_step: Duration::from_millis(5),
            escalate_after: Duration::from_millis(20),
            give_up_after: Duration::from_millis(60),
        }
    }

    const UNAVAILABLE: &str = "error: couldn't connect to server: unknown (code -1)";
    const LOADING: &str = "error code: -28\nerror message:\nLoading block index...";
    const READY: &str = r#"{"version":2001050,"blocks":100}"#;

    /// getinfo replies in order; the last one repeats.
    fn sequenced(replies: Vec<&'static str>) -> (Arc<CommandLineBridge>, Arc<FnRunner>) {
        let next = Arc::new(AtomicUsize::new(0));
        scripted(move |args| match command(args).first().copied() {
            Some("getinfo") => {
                let i = next.fetch_add(1, Ordering::SeqCst).min(replies.len() - 1);
                replies[i].to_string()
            }
            _ => String::new(),
        })
    }

    #[test]
    fn running_daemon_is_left_alone() {
        let (bridge, runner) = sequenced(vec![READY]);
        let supervisor = StartupSupervisor::new(bridge, fast_startup(30), fast_shutdown());
        let outcome = supervisor
            .wait_for_startup(&mut FixedPrompt(false), &mut |_| {})
            .unwrap();
        assert!(matches!(outcome, StartupOutcome::AlreadyRunning));
        assert!(runner.spawned.lock().unwrap().is_empty());
    }

    #[test]
    fn absent_daemon_is_started_and_polled_through_loading() {
        let (bridge, runner) = sequenced(vec![UNAVAILABLE, UNAVAILABLE, LOADING, READY]);
        let supervisor = StartupSupervisor::new(bridge, fast_startup(30), fast_shutdown());
        let mut texts = Vec::new();
        let outcome = supervisor
            .wait_for_startup(&mut FixedPrompt(false), &mut |t| texts.push(t.to_string()))
            .unwrap();

        let StartupOutcome::Started(guard) = outcome else {
            panic!("демон должен был быть запущен");
        };
        assert_eq!(guard.pid(), Some(4242));
        assert_eq!(runner.spawned.lock().unwrap().len(), 1);
        assert_eq!(texts[0], WAITING_TEXT);
        assert!(texts.iter().any(|t| t == "Waiting for daemon to start... (28)"));
        assert!(texts.iter().any(|t| t == "Loading block index..."));

        runner.child_exited.store(true, Ordering::SeqCst);
        drop(guard);
        assert_eq!(runner.count("stop"), 0);
    }

    #[test]
    fn loading_daemon_is_waited_for_without_spawning() {
        let (bridge, runner) = sequenced(vec![LOADING, LOADING, READY]);
        let supervisor = StartupSupervisor::new(bridge, fast_startup(30), fast_shutdown());
        let mut texts = Vec::new();
        let outcome = supervisor
            .wait_for_startup(&mut FixedPrompt(false), &mut |t| texts.push(t.to_string()))
            .unwrap();
        assert!(matches!(outcome, StartupOutcome::AlreadyRunning));
        assert!(runner.spawned.lock().unwrap().is_empty());
        assert_eq!(texts[0], "Loading block index...");
    }

    #[test]
    fn prompt_is_asked_once_per_exhausted_limit() {
        let (bridge, runner) = sequenced(vec![UNAVAILABLE]);
        let supervisor = StartupSupervisor::new(bridge, fast_startup(3), fast_shutdown());
        let mut prompt = CountingPrompt {
            answers: vec![true, false],
            asked: 0,
        };
        let result = supervisor.wait_for_startup(&mut prompt, &mut |_| {});

        assert!(matches!(result, Err(StartupError::Aborted)));
        assert_eq!(prompt.asked, 2);
        // first check + 3 polls + 3 polls
        assert_eq!(runner.count("getinfo"), 7);
        // aborted startup leaves the spawned daemon alone
        assert_eq!(runner.count("stop"), 0);
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("walletd-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_proving_key_blocks_daemon_start() {
        let dir = scratch_dir("no-key");
        let (bridge, runner) = sequenced(vec![UNAVAILABLE, READY]);
        let supervisor = StartupSupervisor::new(bridge, fast_startup(30), fast_shutdown())
            .with_params_dir(dir.clone());

        let result = supervisor.wait_for_startup(&mut FixedPrompt(true), &mut |_| {});
        assert!(matches!(result, Err(StartupError::ProvingKey { .. })));
        assert!(runner.spawned.lock().unwrap().is_empty());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn proving_key_must_have_release_size() {
        let dir = scratch_dir("key-size");
        let key = fs::File::create(dir.join(PROVING_KEY_FILE)).unwrap();
        key.set_len(1024).unwrap();
        assert!(matches!(
            check_proving_key(&dir),
            Err(StartupError::ProvingKey { .. })
        ));

        key.set_len(PROVING_KEY_SIZE).unwrap();
        check_proving_key(&dir).unwrap();

        let (bridge, runner) = sequenced(vec![UNAVAILABLE, READY]);
        let supervisor = StartupSupervisor::new(bridge, fast_startup(30), fast_shutdown())
            .with_params_dir(dir.clone());
        let outcome = supervisor
            .wait_for_startup(&mut FixedPrompt(false), &mut |_| {})
            .unwrap();
        let StartupOutcome::Started(guard) = outcome else {
            panic!("демон должен был быть запущен");
        };
        assert_eq!(runner.spawned.lock().unwrap().len(), 1);
        runner.child_exited.store(true, Ordering::SeqCst);
        drop(guard);

        drop(key);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn other_daemon_errors_abort_startup() {
        let (bridge, _) = sequenced(vec!["error: not json at all"]);
        let supervisor = StartupSupervisor::new(bridge, fast_startup(3), fast_shutdown());
        let result = supervisor.wait_for_startup(&mut FixedPrompt(true), &mut |_| {});
        assert!(matches!(result, Err(StartupError::Wallet(_))));
    }

    #[test]
    fn stale_chain_needs_wait() {
        let old = now_unix() - 3600;
        let (bridge, _) = scripted(move |args| match command(args).as_slice() {
            ["getconnectioncount"] => "4".into(),
            ["getblockcount"] => "10".into(),
            ["getblockhash", "10"] => "abc".into(),
            ["getblock", "abc"] => format!(r#"{{"time":{old}}}"#),
            other => panic!("неожиданная команда {other:?}"),
        });
        let supervisor = StartupSupervisor::new(bridge, fast_startup(30), fast_shutdown());
        let running = DaemonInfo {
            status: DaemonStatus::Running,
            ..DaemonInfo::unknown()
        };
        assert!(supervisor.needs_startup_wait(&running).unwrap());
        assert!(supervisor.needs_startup_wait(&DaemonInfo::not_running()).unwrap());
    }

    #[test]
    fn fresh_chain_needs_no_wait_and_loading_does() {
        let now = now_unix();
        let (bridge, _) = scripted(move |args| match command(args).as_slice() {
            ["getconnectioncount"] => "4".into(),
            ["getblockcount"] => "10".into(),
            ["getblockhash", "10"] => "abc".into(),
            ["getblock", "abc"] => format!(r#"{{"time":{now}}}"#),
            other => panic!("неожиданная команда {other:?}"),
        });
        let supervisor = StartupSupervisor::new(bridge, fast_startup(30), fast_shutdown());
        let running = DaemonInfo {
            status: DaemonStatus::Running,
            ..DaemonInfo::unknown()
        };
        assert!(!supervisor.needs_startup_wait(&running).unwrap());

        let (bridge, _) = scripted(|_| LOADING.to_string());
        let supervisor = StartupSupervisor::new(bridge, fast_startup(30), fast_shutdown());
        assert!(supervisor.needs_startup_wait(&running).unwrap());
    }

    #[test]
    fn shutdown_escalates_then_gives_up_without_kill() {
        let (bridge, runner) = scripted(|_| String::new());
        let child = bridge.start_daemon().unwrap();
        let mut guard = DaemonGuard::new(bridge, child, fast_shutdown());

        guard.shutdown();
        assert!(runner.count("stop") >= 2);
        assert!(runner.terminations.load(Ordering::SeqCst) >= 1);
        assert_eq!(guard.pid(), None);

        guard.shutdown();
        let stops = runner.count("stop");
        drop(guard);
        assert_eq!(runner.count("stop"), stops);
    }

    #[test]
    fn shutdown_returns_once_daemon_exits() {
        let (bridge, runner) = scripted(|_| String::new());
        let child = bridge.start_daemon().unwrap();
        let policy = ShutdownPolicy {
            wait_step: Duration::from_millis(50),
            escalate_after: Duration::from_secs(30),
            give_up_after: Duration::from_secs(60),
        };
        let mut guard = DaemonGuard::new(bridge, child, policy);

        let exited = runner.child_exited.clone();
        let flipper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            exited.store(true, Ordering::SeqCst);
        });
        guard.shutdown();
        flipper.join().unwrap();

        assert_eq!(runner.count("stop"), 1);
        assert_eq!(runner.terminations.load(Ordering::SeqCst), 0);
    }
}
