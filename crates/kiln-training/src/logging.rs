//! Process-wide tracing setup.
//!
//! One subscriber with two layers: the console, and a [`LogSink`] that stays silent until
//! a training folder attaches `output.log` to it.

use crate::error::{TrainingError, TrainingResult};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const DEV_MODE_VAR: &str = "KILN_IS_DEV";

/// Attachable file destination for the file layer.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start appending to `path`, replacing any previous file.
    pub fn attach(&self, path: &Path) -> TrainingResult<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut guard = self
            .file
            .lock()
            .map_err(|_| TrainingError::backend("log sink lock poisoned"))?;
        *guard = Some(file);
        Ok(())
    }

    pub fn detach(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(mut file) = guard.take() {
                let _ = file.flush();
            }
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.file.lock().is_ok_and(|g| g.is_some())
    }
}

pub struct LogSinkWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for LogSinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let Ok(mut guard) = self.file.lock() else {
            return Ok(buf.len());
        };
        if let Some(file) = guard.as_mut() {
            file.write_all(buf)?;
            file.flush()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.lock() {
            Ok(mut guard) => guard.as_mut().map_or(Ok(()), File::flush),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogSinkWriter { file: self.file.clone() }
    }
}

/// Whether `KILN_IS_DEV` asks for developer logging.
#[must_use]
pub fn dev_mode_from_env() -> bool {
    std::env::var(DEV_MODE_VAR).is_ok_and(|v| matches!(v.trim(), "1" | "true" | "yes"))
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set. Dev mode forces `debug` and shows targets.
pub fn init(level: &str, dev_mode: bool, sink: LogSink) -> TrainingResult<()> {
    let default_level = if dev_mode { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| TrainingError::config(format!("invalid log level {default_level:?}: {e}")))?;

    let console = tracing_subscriber::fmt::layer()
        .with_target(dev_mode)
        .with_writer(std::io::stdout);
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(dev_mode)
        .with_writer(sink);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| TrainingError::Other(anyhow::anyhow!("failed to install tracing subscriber: {e}")))
}
