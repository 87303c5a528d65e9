//! Logging setup
//!
//! CLI commands log to stderr at `warn`. The daemon logs to stderr in the
//! foreground and otherwise to a size-rotated file under `$XDG_DATA_HOME/mosw`.
//! `RUST_LOG` always overrides the configured level.

use color_eyre::eyre::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Daemon log file name inside the data directory
pub const LOG_FILE_NAME: &str = "daemon.log";
/// Rotate the daemon log once it reaches this size
pub const MAX_LOG_SIZE: u64 = 1_000_000;

/// Path of the daemon log file
///
/// # Errors
/// Returns an error if the data directory cannot be determined.
pub fn get_log_file_path() -> Result<PathBuf> {
    Ok(crate::config::get_data_dir()?.join(LOG_FILE_NAME))
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Logging for one-shot CLI commands
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_writer(io::stderr)
        .try_init();
}

/// Logging for the daemon
///
/// The returned guard flushes the background writer on drop and must be kept
/// alive for the daemon's lifetime.
///
/// # Errors
/// Returns an error if the log directory cannot be determined.
pub fn init_daemon(directive: &str, foreground: bool) -> Result<Option<WorkerGuard>> {
    if foreground {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter(directive))
            .with_writer(io::stderr)
            .try_init();
        return Ok(None);
    }

    let log = SizeRotatingLog::new(get_log_file_path()?, MAX_LOG_SIZE);
    let (writer, guard) = tracing_appender::non_blocking(log);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(directive))
        .with_writer(writer)
        .with_ansi(false)
        .try_init();

    Ok(Some(guard))
}

/// Log file that moves itself to `<name>.old` once it grows past a limit
///
/// Only one backup is kept. The file is reopened if something deletes it
/// while the daemon runs, and is created with mode 0o600 on Unix.
///
/// Runs on the `tracing_appender` worker thread, so it needs no locking.
pub struct SizeRotatingLog {
    path: PathBuf,
    backup: PathBuf,
    limit: u64,
    open: Option<OpenLog>,
}

struct OpenLog {
    file: File,
    /// Bytes in the file, counted as lines are written
    size: u64,
}

impl SizeRotatingLog {
    pub fn new(path: impl Into<PathBuf>, limit: u64) -> Self {
        let path = path.into();
        let mut backup = path.clone().into_os_string();
        backup.push(".old");

        Self {
            path,
            backup: PathBuf::from(backup),
            limit,
            open: None,
        }
    }

    fn open_file(path: &Path, truncate: bool) -> io::Result<File> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        #[cfg(unix)]
        options.mode(0o600);

        options.open(path)
    }

    /// The open log, reopened if it was closed or deleted externally
    fn current(&mut self) -> io::Result<&mut OpenLog> {
        if self.open.is_some() && !self.path.exists() {
            self.open = None;
        }

        if self.open.is_none() {
            let file = Self::open_file(&self.path, false)?;
            let size = file.metadata()?.len();
            self.open = Some(OpenLog { file, size });
        }

        self.open
            .as_mut()
            .ok_or_else(|| io::Error::other("log file unavailable"))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.open = None;
        fs::rename(&self.path, &self.backup)?;
        let file = Self::open_file(&self.path, true)?;
        self.open = Some(OpenLog { file, size: 0 });
        Ok(())
    }
}

impl Write for SizeRotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let full = self.current()?.size >= self.limit;
        if full && let Err(e) = self.rotate() {
            // Keep logging into the oversized file rather than losing lines
            eprintln!("mosw: log rotation failed: {e}");
        }

        let log = self.current()?;
        log.file.write_all(buf)?;
        log.size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.open.as_mut() {
            Some(log) => log.file.flush(),
            None => Ok(()),
        }
    }
}
