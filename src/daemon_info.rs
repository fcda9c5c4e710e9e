//! Daemon liveness and resource usage scraped from the OS process listing.
//!
//! Both adapters read fixed token positions of `ps auxwww` / `tasklist` output.
//! This is best-effort and breaks whenever those tools change their layout;
//! a stable status API from the daemon would be the real fix.

use crate::environment::OsKind;
use crate::executor::{CommandRunner, ExecError};
use crate::state::{DaemonInfo, DaemonStatus};
use std::sync::Arc;

pub trait DaemonInfoProvider: Send + Sync {
    fn daemon_info(&self) -> Result<DaemonInfo, ExecError>;
}

pub fn provider_for(
    os: OsKind,
    runner: Arc<dyn CommandRunner>,
    daemon_file_name: &str,
) -> Box<dyn DaemonInfoProvider> {
    match os {
        OsKind::Windows => Box::new(TasklistDaemonInfoProvider {
            runner,
            daemon_file_name: daemon_file_name.to_string(),
        }),
        _ => Box::new(PsDaemonInfoProvider {
            runner,
            daemon_file_name: daemon_file_name.to_string(),
        }),
    }
}

pub struct PsDaemonInfoProvider {
    runner: Arc<dyn CommandRunner>,
    daemon_file_name: String,
}

impl DaemonInfoProvider for PsDaemonInfoProvider {
    fn daemon_info(&self) -> Result<DaemonInfo, ExecError> {
        let listing = self
            .runner
            .run(&["ps".to_string(), "auxwww".to_string()])?;
        Ok(parse_ps_listing(&listing, &self.daemon_file_name))
    }
}

pub struct TasklistDaemonInfoProvider {
    runner: Arc<dyn CommandRunner>,
    daemon_file_name: String,
}

impl DaemonInfoProvider for TasklistDaemonInfoProvider {
    fn daemon_info(&self) -> Result<DaemonInfo, ExecError> {
        let listing = self.runner.run(&["tasklist".to_string()])?;
        Ok(parse_tasklist_listing(&listing, &self.daemon_file_name))
    }
}

// USER PID %CPU %MEM VSZ RSS TTY STAT START TIME COMMAND
const PS_COLUMNS: usize = 11;

pub fn parse_ps_listing(listing: &str, daemon_file_name: &str) -> DaemonInfo {
    let suffix = format!("/{daemon_file_name}");
    let mut saw_rows = false;

    for line in listing.lines() {
        let cols: Vec<&str> = line.split_whitespace().take(PS_COLUMNS).collect();
        if cols.len() < PS_COLUMNS {
            continue;
        }
        saw_rows = true;

        let command = cols[10];
        if command == daemon_file_name || command.ends_with(&suffix) {
            return DaemonInfo {
                status: DaemonStatus::Running,
                cpu_percent: column_f64(cols[2]),
                virtual_memory_mb: column_f64(cols[4]) / 1000.0,
                resident_memory_mb: column_f64(cols[5]) / 1000.0,
            };
        }
    }

    if saw_rows {
        DaemonInfo::not_running()
    } else {
        DaemonInfo::unknown()
    }
}

// Image Name  PID  Session Name  Session#  Mem Usage
pub fn parse_tasklist_listing(listing: &str, daemon_file_name: &str) -> DaemonInfo {
    let bare_name = daemon_file_name
        .strip_suffix(".exe")
        .unwrap_or(daemon_file_name);
    let mut saw_rows = false;

    for line in listing.lines() {
        let tokens: Vec<&str> = line
            .split_whitespace()
            .take(8)
            .map(|t| t.trim_matches('"'))
            .collect();
        if tokens.len() < 5 {
            continue;
        }
        saw_rows = true;

        if tokens[0] != daemon_file_name && tokens[0] != bare_name {
            continue;
        }
        let digits: String = tokens[4..]
            .iter()
            .flat_map(|t| t.chars())
            .filter(char::is_ascii_digit)
            .collect();
        let resident_memory_mb = digits.parse::<f64>().map(|k| k / 1000.0).unwrap_or(0.0);
        return DaemonInfo {
            status: DaemonStatus::Running,
            cpu_percent: 0.0,
            virtual_memory_mb: 0.0,
            resident_memory_mb,
        };
    }

    if saw_rows {
        DaemonInfo::not_running()
    } else {
        DaemonInfo::unknown()
    }
}

fn column_f64(token: &str) -> f64 {
    token.parse::<f64>().unwrap_or(0.0)
}
