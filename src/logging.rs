use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{Mutex, PoisonError},
};

use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Stdout carries protocol frames, so diagnostics go to stderr.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

/// Sink for endpoint lifecycle events.
pub trait EventLog: Send + Sync {
    fn log(&self, event: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn log(&self, event: &str) {
        info!(event = %event, "endpoint event");
    }
}

/// Appends one timestamped line per event to a file.
#[derive(Debug)]
pub struct FileEventLog {
    file: Mutex<File>,
}

impl FileEventLog {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventLog for FileEventLog {
    fn log(&self, event: &str) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(file, "{timestamp} {event}") {
            warn!(error = %err, event = %event, "failed to append event log");
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<String>>,
}

impl MemoryEventLog {
    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventLog for MemoryEventLog {
    fn log(&self, event: &str) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.to_string());
    }
}
