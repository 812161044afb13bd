//! Run logging: console events plus append-only log files
//!
//! A [`RunLogger`] is built once per invocation and handed to every
//! component. Each message becomes a `tracing` event (colored console
//! output) and a timestamped line in every attached sink. Sink writes are
//! best-effort and never fail the caller.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::Level;

/// Destination for log lines
pub trait LogSink: Send + Sync {
    /// Append one line; errors are swallowed
    fn write_line(&self, line: &str);
}

/// Append-only log file
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    /// Open (creating parents) a log file in append mode
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// In-memory sink for tests and for capturing short outputs
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every line written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Whether any line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Child process output echoed to the agent's stdout
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn write_line(&self, line: &str) {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        let _ = writeln!(handle, "{}", line);
    }
}

/// Fan-out to several sinks
pub struct TeeSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

impl LogSink for TeeSink {
    fn write_line(&self, line: &str) {
        for sink in &self.sinks {
            sink.write_line(line);
        }
    }
}

/// Per-run logger shared by all components
#[derive(Clone, Default)]
pub struct RunLogger {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl RunLogger {
    /// Logger with console output only
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach another sink
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn info(&self, message: &str) {
        tracing::info!("{}", message);
        self.record(Level::INFO, message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!("{}", message);
        self.record(Level::WARN, message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!("{}", message);
        self.record(Level::ERROR, message);
    }

    /// Write a line to the sinks verbatim, without a console event
    pub fn write_raw(&self, line: &str) {
        for sink in &self.sinks {
            sink.write_line(line);
        }
    }

    fn record(&self, level: Level, message: &str) {
        if self.sinks.is_empty() {
            return;
        }
        let line = format!("{} [{}] {}", log_timestamp(), level, message);
        self.write_raw(&line);
    }
}

/// Timestamp prefix for log lines
pub fn log_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Install the console subscriber (colored, timestamped, `RUST_LOG` aware)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
}
