//! Log setup for the daemon.
//!
//! Records go to stderr, and optionally to a size-rotated log file as well, in
//! the form `[YYYY-mm-dd HH:MM:SS] PID:<pid> === <target> === <LEVEL> === <msg>`.
//! `RUST_LOG` overrides the default `info` filter.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_LOG_BACKUPS: u32 = 5;

/// Where the log file lives and how far it may grow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFileSettings {
    pub path: PathBuf,
    /// Size at which the file is rotated to `<path>.1`.
    pub max_bytes: u64,
    /// Rotated files kept (`<path>.1` .. `<path>.N`). Zero truncates instead.
    pub backups: u32,
}

impl LogFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: DEFAULT_LOG_MAX_BYTES,
            backups: DEFAULT_LOG_BACKUPS,
        }
    }
}

/// Append-mode log file rotated by size.
struct RotatingFile {
    settings: LogFileSettings,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(settings: LogFileSettings) -> io::Result<Self> {
        let file = open_append(&settings.path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            settings,
            file,
            written,
        })
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        let mut name = self.settings.path.clone().into_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.settings.backups > 0 {
            for index in (1..self.settings.backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            fs::rename(&self.settings.path, self.backup_path(1))?;
            self.file = open_append(&self.settings.path)?;
        } else {
            self.file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.settings.path)?;
        }
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let limit = self.settings.max_bytes;
        if limit > 0 && self.written > 0 && self.written + buf.len() as u64 > limit {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Copies every write to stderr and to the log file.
struct TeeWriter {
    file: RotatingFile,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

pub fn init_logging(log_file: Option<LogFileSettings>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{}",
            format_line(
                &chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                record.target(),
                record.level(),
                record.args()
            )
        )
    });

    if let Some(settings) = log_file {
        let path = settings.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }
        let file = RotatingFile::open(settings)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
    }

    builder
        .try_init()
        .map_err(|e| anyhow!("logger already initialised: {}", e))
}

fn format_line(
    timestamp: &str,
    target: &str,
    level: log::Level,
    message: &std::fmt::Arguments<'_>,
) -> String {
    format!(
        "[{}] PID:{} === {} === {} === {}",
        timestamp,
        std::process::id(),
        target,
        level,
        message
    )
}
