//! Append-only summary event stream (`events.kiln.jsonl`).
//!
//! One JSON object per line:
//!
//! ```json
//! {"wall_time":1718000000.5,"step":0,"kind":"scalar","tag":"training/total_loss","value":0.93}
//! {"wall_time":1718000003.1,"step":9,"kind":"image","tag":"residuals","height":8,"width":8,"channels":3,"encoded":"..."}
//! ```
//!
//! Image pixels are clamped to `[0, 1]`, scaled to bytes and base64-encoded.

use crate::error::{TrainingError, TrainingResult};
use crate::tensor::Tensor;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryValue {
    Scalar { tag: String, value: f64 },
    Image { tag: String, height: usize, width: usize, channels: usize, encoded: String },
}

impl SummaryValue {
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Scalar { tag, .. } | Self::Image { tag, .. } => tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub wall_time: f64,
    pub step: u64,
    #[serde(flatten)]
    pub value: SummaryValue,
}

pub struct SummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

fn summary_error(e: impl std::fmt::Display) -> TrainingError {
    TrainingError::SummaryWrite(e.to_string())
}

impl SummaryWriter {
    /// Open the event stream at `path`, appending to an existing one.
    pub fn create(path: &Path) -> TrainingResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { path: path.to_path_buf(), writer: BufWriter::new(file) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, step: u64, value: SummaryValue) -> TrainingResult<()> {
        #[allow(clippy::cast_precision_loss)]
        let wall_time = Utc::now().timestamp_millis() as f64 / 1000.0;
        let event = SummaryEvent { wall_time, step, value };
        let line = serde_json::to_string(&event).map_err(summary_error)?;
        writeln!(self.writer, "{line}").map_err(summary_error)
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> TrainingResult<()> {
        self.write_event(step, SummaryValue::Scalar { tag: tag.to_string(), value })
    }

    pub fn add_scalars<'a, I>(&mut self, values: I, step: u64) -> TrainingResult<()>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        for (tag, value) in values {
            self.add_scalar(tag, value, step)?;
        }
        Ok(())
    }

    /// Record a `[1, H, W, C]` image.
    pub fn add_image(&mut self, tag: &str, image: &Tensor, step: u64) -> TrainingResult<()> {
        let &[1, height, width, channels] = image.shape() else {
            return Err(summary_error(format!(
                "image {tag} must have shape [1, H, W, C], got {:?}",
                image.shape()
            )));
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bytes: Vec<u8> =
            image.data().iter().map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8).collect();
        let encoded = STANDARD.encode(bytes);
        self.write_event(step, SummaryValue::Image { tag: tag.to_string(), height, width, channels, encoded })
    }

    pub fn flush(&mut self) -> TrainingResult<()> {
        self.writer.flush().map_err(summary_error)
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Read back every event of a stream, skipping a torn trailing line.
pub fn read_events(path: &Path) -> TrainingResult<Vec<SummaryEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(event) => events.push(event),
            Err(e) if e.is_eof() => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(events)
}
