mod bridge;
mod commands;
mod config;
mod daemon_info;
mod environment;
mod executor;
mod gatherer;
mod http;
mod metrics;
mod reporter;
mod state;
mod supervisor;
mod wallet;

use axum::serve;
use bridge::CommandLineBridge;
use clap::Parser;
use commands::{Command, OneShot};
use config::Config;
use environment::Environment;
use executor::{CommandRunner, ProcessExecutor};
use metrics::Metrics;
use reporter::{ErrorReporter, StatusErrorReporter};
use state::{DaemonInfo, StatusBoard, WalletState};
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{
    DaemonGuard, FixedPrompt, StartupError, StartupOutcome, StartupPrompt, StartupSupervisor,
    StdinPrompt,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DISPLAY_REFRESH: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "walletd")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Needed for Z addresses, sends and key export on an encrypted wallet.
    #[arg(long, env = "WALLETD_PASSPHRASE", hide_env_values = true, global = true)]
    passphrase: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_or_default(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let env = match Environment::from_config(&cfg) {
        Ok(env) => env,
        Err(err) => {
            error!(error = %err, "не удалось определить окружение");
            std::process::exit(1);
        }
    };

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessExecutor);
    let bridge = match CommandLineBridge::locate(&env, &cfg.send, runner.clone()) {
        Ok(bridge) => Arc::new(bridge),
        Err(err) => {
            error!(error = %err, "установка кошелька не найдена");
            std::process::exit(1);
        }
    };

    match cli.command {
        None | Some(Command::Run { wait_forever: false }) => {
            run_wallet(cfg, env, runner, bridge, false).await
        }
        Some(Command::Run { wait_forever: true }) => run_wallet(cfg, env, runner, bridge, true).await,
        Some(command) => run_one_shot(cfg, env, runner, bridge, cli.passphrase, command).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_one_shot(
    cfg: Config,
    env: Environment,
    runner: Arc<dyn CommandRunner>,
    bridge: Arc<CommandLineBridge>,
    passphrase: Option<String>,
    command: Command,
) {
    let reporter = StatusErrorReporter::new(cfg.errors.report_cooldown_secs);
    let shot = OneShot {
        daemon_info: daemon_info::provider_for(env.os, runner, &env.daemon_file_name),
        bridge,
        env,
        passphrase,
        send_poll: Duration::from_millis(cfg.send.status_poll_ms),
    };

    let result = tokio::task::spawn_blocking(move || shot.execute(&command)).await;
    match result {
        Ok(Ok(value)) => match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                error!(error = %err, "не удалось вывести результат");
                std::process::exit(1);
            }
        },
        Ok(Err(err)) => {
            reporter.report(&err, false);
            std::process::exit(1);
        }
        Err(err) => {
            error!(error = %err, "команда завершилась аварийно");
            std::process::exit(1);
        }
    }
}

async fn run_wallet(
    cfg: Config,
    env: Environment,
    runner: Arc<dyn CommandRunner>,
    bridge: Arc<CommandLineBridge>,
    wait_forever: bool,
) {
    info!(
        listen = %cfg.listen,
        data_dir = %bridge.data_dir().display(),
        "запуск walletd"
    );

    let reporter = Arc::new(StatusErrorReporter::new(cfg.errors.report_cooldown_secs));
    let board = Arc::new(StatusBoard::new(reporter));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let metrics = metrics.clone();
        let board = board.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, board);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let startup = {
        let board = board.clone();
        tokio::task::spawn_blocking(move || {
            start_wallet(&cfg, &env, runner, bridge, &board, wait_forever)
        })
    };

    let started = tokio::select! {
        joined = startup => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("получен Ctrl+C во время запуска демона, выход без остановки демона");
            let _ = shutdown_tx.send(true);
            let _ = http_task.await;
            std::process::exit(130);
        }
    };
    let (guard, wallet) = match started {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => {
            error!(error = %err, "кошелёк не запущен");
            let _ = shutdown_tx.send(true);
            let _ = http_task.await;
            std::process::exit(1);
        }
        Err(err) => {
            error!(error = %err, "задача запуска завершилась аварийно");
            let _ = shutdown_tx.send(true);
            let _ = http_task.await;
            std::process::exit(1);
        }
    };

    let refresh_task = {
        let wallet = wallet.clone();
        let metrics = metrics.clone();
        let board = board.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISPLAY_REFRESH);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки цикла обновления таблиц");
                        break;
                    }
                    _ = ticker.tick() => {
                        wallet.refresh_displayed_automatic();
                        metrics.update_from_state(&board);
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");
    let _ = shutdown_tx.send(true);
    let _ = refresh_task.await;

    wallet.suspend_all();
    let stopped = tokio::task::spawn_blocking(move || {
        wallet.join_all();
        if let Some(mut guard) = guard {
            info!(pid = ?guard.pid(), "остановка демона, запущенного walletd");
            guard.shutdown();
        }
    })
    .await;
    if let Err(err) = stopped {
        error!(error = %err, "остановка демона завершилась аварийно");
    }
    let _ = http_task.await;
}

/// Blocking part of `run`: bring the daemon up, then start the gatherers.
fn start_wallet(
    cfg: &Config,
    env: &Environment,
    runner: Arc<dyn CommandRunner>,
    bridge: Arc<CommandLineBridge>,
    board: &StatusBoard,
    wait_forever: bool,
) -> Result<(Option<DaemonGuard>, Arc<WalletState>), StartupError> {
    let provider = daemon_info::provider_for(env.os, runner, &env.daemon_file_name);
    let info = provider.daemon_info().unwrap_or_else(|err| {
        warn!(error = %err, "не удалось получить состояние процесса демона");
        DaemonInfo::unknown()
    });

    let supervisor = StartupSupervisor::new(
        bridge.clone(),
        (&cfg.startup).into(),
        (&cfg.shutdown).into(),
    )
    .with_params_dir(env.dirs.params_dir.clone());
    let mut prompt: Box<dyn StartupPrompt> = if wait_forever {
        Box::new(FixedPrompt(true))
    } else if std::io::stdin().is_terminal() {
        Box::new(StdinPrompt)
    } else {
        Box::new(FixedPrompt(false))
    };
    let mut progress = |text: &str| {
        board.set_startup_text(text);
        info!(status = %text, "ожидание демона");
    };

    let guard = if supervisor.needs_startup_wait(&info)? {
        match supervisor.wait_for_startup(prompt.as_mut(), &mut progress)? {
            StartupOutcome::AlreadyRunning => None,
            StartupOutcome::Started(guard) => Some(guard),
        }
    } else {
        info!("демон уже запущен и синхронизирован");
        None
    };
    board.set_startup_text("Демон готов");

    let wallet = Arc::new(WalletState::start(
        bridge,
        provider,
        board.reporter.clone(),
        cfg,
    )?);
    wallet.load_initial_tables();
    board.attach_wallet(wallet.clone());
    Ok((guard, wallet))
}
