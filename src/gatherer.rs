use crate::bridge::WalletError;
use crate::reporter::ErrorReporter;
use crate::state::now_unix;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const WAIT_STEP: Duration = Duration::from_millis(300);

struct Shared<T> {
    latest: RwLock<Option<T>>,
    suspended: AtomicBool,
    errors: AtomicU64,
    last_success_unix: AtomicI64,
}

/// Background thread that refreshes one snapshot of wallet data on a fixed period.
///
/// A failed fetch keeps the previous snapshot; readers never see a partial value.
pub struct Gatherer<T> {
    name: String,
    shared: Arc<Shared<T>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> Gatherer<T> {
    pub fn spawn<F>(
        name: &str,
        interval: Duration,
        first_immediately: bool,
        reporter: Arc<dyn ErrorReporter>,
        fetch: F,
    ) -> io::Result<Self>
    where
        F: FnMut() -> Result<T, WalletError> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            latest: RwLock::new(None),
            suspended: AtomicBool::new(false),
            errors: AtomicU64::new(0),
            last_success_unix: AtomicI64::new(0),
        });

        let worker = GatherLoop {
            name: name.to_string(),
            interval,
            first_immediately,
            reporter,
            shared: shared.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("gatherer-{name}"))
            .spawn(move || worker.run(fetch))?;

        Ok(Self {
            name: name.to_string(),
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn latest(&self) -> Option<T> {
        self.shared
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T> Gatherer<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::SeqCst);
    }

    pub fn error_count(&self) -> u64 {
        self.shared.errors.load(Ordering::Relaxed)
    }

    /// Unix time of the last successful fetch, 0 if none yet.
    pub fn last_success_unix(&self) -> i64 {
        self.shared.last_success_unix.load(Ordering::Relaxed)
    }

    /// Waits for the thread to exit; call [`Gatherer::suspend`] first.
    pub fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                debug!(gatherer = %self.name, "поток сборщика завершился паникой");
            }
        }
    }
}

struct GatherLoop<T> {
    name: String,
    interval: Duration,
    first_immediately: bool,
    reporter: Arc<dyn ErrorReporter>,
    shared: Arc<Shared<T>>,
}

impl<T> GatherLoop<T> {
    fn run<F>(self, mut fetch: F)
    where
        F: FnMut() -> Result<T, WalletError>,
    {
        if self.first_immediately && !self.suspended() {
            self.gather(&mut fetch);
        }

        loop {
            let started = Instant::now();
            while started.elapsed() < self.interval && !self.suspended() {
                thread::sleep(WAIT_STEP.min(self.interval));
            }
            if self.suspended() {
                break;
            }
            self.gather(&mut fetch);
        }
        debug!(gatherer = %self.name, "сборщик остановлен");
    }

    fn suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::SeqCst)
    }

    fn gather<F>(&self, fetch: &mut F)
    where
        F: FnMut() -> Result<T, WalletError>,
    {
        let started = Instant::now();
        let result = fetch();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                *self
                    .shared
                    .latest
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(value);
                self.shared
                    .last_success_unix
                    .store(now_unix(), Ordering::Relaxed);
                debug!(gatherer = %self.name, elapsed_ms, "данные собраны");
            }
            Err(err) => {
                self.shared.errors.fetch_add(1, Ordering::Relaxed);
                if self.suspended() {
                    debug!(gatherer = %self.name, error = %err, "ошибка проигнорирована: сборщик приостановлен");
                } else {
                    debug!(gatherer = %self.name, elapsed_ms, "сбор данных не удался");
                    self.reporter.report(&err, true);
                }
            }
        }
    }
}
