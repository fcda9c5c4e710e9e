use crate::bridge::WalletError;
use crate::state::now_unix;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error};

pub trait ErrorReporter: Send + Sync {
    /// `automatic` is true for errors raised by background refreshes.
    fn report(&self, err: &WalletError, automatic: bool);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportedError {
    pub message: String,
    pub at_unix: i64,
    pub automatic: bool,
}

#[derive(Debug, Default)]
struct ReporterInner {
    last_automatic_unix: Option<i64>,
    last_error: Option<ReportedError>,
}

/// Logs errors and keeps the last one for the status API. Background errors
/// are shown at most once per cooldown; interactive ones always pass.
#[derive(Debug)]
pub struct StatusErrorReporter {
    cooldown_secs: i64,
    inner: Mutex<ReporterInner>,
}

impl StatusErrorReporter {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            cooldown_secs: i64::try_from(cooldown_secs).unwrap_or(i64::MAX),
            inner: Mutex::new(ReporterInner::default()),
        }
    }

    pub fn last_error(&self) -> Option<ReportedError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }

    /// Returns whether the error was surfaced.
    fn report_at(&self, err: &WalletError, automatic: bool, now_unix: i64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if automatic {
            if let Some(last) = inner.last_automatic_unix {
                if now_unix - last < self.cooldown_secs {
                    debug!(error = %err, "ошибка фонового обновления подавлена");
                    return false;
                }
            }
            inner.last_automatic_unix = Some(now_unix);
        }

        error!(error = %err, automatic, "ошибка обновления состояния кошелька");
        inner.last_error = Some(ReportedError {
            message: err.to_string(),
            at_unix: now_unix,
            automatic,
        });
        true
    }
}

impl ErrorReporter for StatusErrorReporter {
    fn report(&self, err: &WalletError, automatic: bool) {
        self.report_at(err, automatic, now_unix());
    }
}
