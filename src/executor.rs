use std::io::{BufReader, ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("пустая командная строка")]
    EmptyCommand,
    #[error("не удалось запустить {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("ошибка ожидания завершения {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

/// Handle to a long-running child started via [`CommandRunner::spawn`].
pub trait ChildProcess: Send {
    fn id(&self) -> u32;
    fn has_exited(&mut self) -> Result<bool, ExecError>;
    /// Asks the OS to terminate the process politely (SIGTERM / taskkill without /F).
    fn terminate(&mut self) -> Result<(), ExecError>;
}

pub trait CommandRunner: Send + Sync {
    /// Runs `args[0]` with the remaining arguments and returns stdout and stderr merged.
    fn run(&self, args: &[String]) -> Result<String, ExecError>;
    fn spawn(&self, args: &[String]) -> Result<Box<dyn ChildProcess>, ExecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl CommandRunner for ProcessExecutor {
    fn run(&self, args: &[String]) -> Result<String, ExecError> {
        let (program, rest) = args.split_first().ok_or(ExecError::EmptyCommand)?;
        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        let combined = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let sink = combined.clone();
            readers.push(thread::spawn(move || drain(stdout, &sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = combined.clone();
            readers.push(thread::spawn(move || drain(stderr, &sink)));
        }

        let status = child.wait().map_err(|source| ExecError::Wait {
            program: program.clone(),
            source,
        })?;
        for reader in readers {
            let _ = reader.join();
        }
        debug!(program = %program, status = %status, "процесс завершён");

        let bytes = std::mem::take(&mut *combined.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn spawn(&self, args: &[String]) -> Result<Box<dyn ChildProcess>, ExecError> {
        let (program, rest) = args.split_first().ok_or(ExecError::EmptyCommand)?;
        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;
        debug!(program = %program, pid = child.id(), "дочерний процесс запущен");
        Ok(Box::new(child))
    }
}

fn drain(stream: impl Read, sink: &Mutex<Vec<u8>>) {
    let mut reader = BufReader::new(stream);
    let mut chunk = [0_u8; 4096];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(error = %err, "ошибка чтения вывода процесса");
                break;
            }
        }
    }
}

impl ChildProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn has_exited(&mut self) -> Result<bool, ExecError> {
        self.try_wait()
            .map(|status| status.is_some())
            .map_err(|source| ExecError::Wait {
                program: format!("pid {}", Child::id(self)),
                source,
            })
    }

    fn terminate(&mut self) -> Result<(), ExecError> {
        let pid = Child::id(self).to_string();
        let args: Vec<String> = if cfg!(windows) {
            vec!["taskkill".into(), "/PID".into(), pid]
        } else {
            vec!["kill".into(), "-TERM".into(), pid]
        };
        ProcessExecutor.run(&args).map(|_| ())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        let err = ProcessExecutor.run(&[]).unwrap_err();
        assert!(matches!(err, ExecError::EmptyCommand));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = ProcessExecutor
            .run(&["/nonexistent/walletd-test-binary".to_string()])
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn stdout_and_stderr_are_merged() {
        let args: Vec<String> = ["sh", "-c", "echo to-out; echo to-err 1>&2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = ProcessExecutor.run(&args).expect("sh должен запускаться");
        assert!(output.contains("to-out"));
        assert!(output.contains("to-err"));
    }

    #[cfg(unix)]
    #[test]
    fn spawned_child_reports_exit() {
        let args: Vec<String> = ["sh", "-c", "exit 0"].iter().map(|s| s.to_string()).collect();
        let mut child = ProcessExecutor.spawn(&args).expect("запуск sh");
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !child.has_exited().unwrap() {
            assert!(std::time::Instant::now() < deadline, "процесс не завершился");
            thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}
