use crate::config::Config;
use serde::Serialize;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::{System, SystemExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OsKind {
    Windows,
    Mac,
    Unix,
    Unknown,
}

impl OsKind {
    pub fn detect() -> Self {
        Self::from_os_name(env::consts::OS)
    }

    pub fn from_os_name(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("windows") {
            return OsKind::Windows;
        }
        if name.contains("darwin") || name.contains("mac os") || name.contains("macos") {
            return OsKind::Mac;
        }
        let unix_markers = [
            "linux", "unix", "aix", "sunos", "solaris", "illumos", "android", "bsd", "dragonfly",
        ];
        if unix_markers.iter().any(|m| name.contains(m)) {
            return OsKind::Unix;
        }
        OsKind::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDirs {
    pub data_dir: PathBuf,
    pub settings_dir: PathBuf,
    pub params_dir: PathBuf,
}

impl PlatformDirs {
    /// Default directories for `os`; `lookup` resolves environment variables.
    pub fn for_os(os: OsKind, lookup: impl Fn(&str) -> Option<PathBuf>) -> Self {
        let home = lookup("HOME")
            .or_else(|| lookup("USERPROFILE"))
            .unwrap_or_else(|| PathBuf::from("."));
        match os {
            OsKind::Windows => {
                let appdata = lookup("APPDATA").unwrap_or_else(|| home.join("AppData/Roaming"));
                let local = lookup("LOCALAPPDATA").unwrap_or_else(|| home.join("AppData/Local"));
                Self {
                    data_dir: appdata.join("Hush"),
                    settings_dir: local.join("walletd"),
                    params_dir: appdata.join("ZcashParams"),
                }
            }
            OsKind::Mac => {
                let support = home.join("Library/Application Support");
                Self {
                    data_dir: support.join("Hush"),
                    settings_dir: support.join("walletd"),
                    params_dir: support.join("ZcashParams"),
                }
            }
            OsKind::Unix | OsKind::Unknown => Self {
                data_dir: home.join(".hush"),
                settings_dir: home.join(".walletd"),
                params_dir: home.join(".zcash-params"),
            },
        }
    }
}

/// Everything that depends on the host platform, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Environment {
    pub os: OsKind,
    pub daemon_file_name: String,
    pub cli_file_name: String,
    pub program_dir: PathBuf,
    pub dirs: PlatformDirs,
}

impl Environment {
    pub fn from_config(cfg: &Config) -> io::Result<Self> {
        let os = OsKind::detect();
        let program_dir = if cfg.install_dir.trim().is_empty() {
            let exe = env::current_exe()?;
            exe.parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            PathBuf::from(cfg.install_dir.trim())
        };

        let mut dirs = PlatformDirs::for_os(os, |key| env::var_os(key).map(PathBuf::from));
        if let Some(dir) = cfg.data_dir.as_deref().filter(|d| !d.trim().is_empty()) {
            dirs.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = cfg.settings_dir.as_deref().filter(|d| !d.trim().is_empty()) {
            dirs.settings_dir = PathBuf::from(dir);
        }

        Ok(Self {
            os,
            daemon_file_name: executable_name(os, &cfg.daemon_basename),
            cli_file_name: executable_name(os, &cfg.cli_basename),
            program_dir,
            dirs,
        })
    }

    pub fn system_info(&self) -> String {
        let system = System::new();
        let name = system
            .name()
            .unwrap_or_else(|| env::consts::OS.to_string());
        let version = system.os_version().unwrap_or_default();
        let kernel = system.kernel_version().unwrap_or_default();
        match self.os {
            OsKind::Windows => format!("{name} {version}").trim().to_string(),
            _ => format!("{name} {version}; kernel {kernel}"),
        }
    }
}

pub fn executable_name(os: OsKind, basename: &str) -> String {
    if os == OsKind::Windows {
        format!("{basename}.exe")
    } else {
        basename.to_string()
    }
}
