use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::Result;

/// Append-only destination for scalar training curves.
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;

    fn add_scalars(&mut self, tag: &str, values: &[(&str, f64)], step: usize) -> Result<()>;
}

/// Emits every event as a debug log line.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        debug!(tag, step, value, "scalar");
        Ok(())
    }

    fn add_scalars(&mut self, tag: &str, values: &[(&str, f64)], step: usize) -> Result<()> {
        debug!(tag, step, values = ?values, "scalars");
        Ok(())
    }
}

#[derive(Serialize)]
struct Event<'a> {
    tag: &'a str,
    step: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<BTreeMap<&'a str, f64>>,
    wall_time: f64,
}

/// Writes one JSON object per event to `<dir>/events.jsonl`.
pub struct JsonlSink {
    path: PathBuf,
    file: File,
}

impl JsonlSink {
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Writing metrics to {:?}", path);
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, event: &Event<'_>) -> Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.file, "{}", line)?;
        Ok(())
    }
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl MetricsSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.write(&Event {
            tag,
            step,
            value: Some(value),
            values: None,
            wall_time: wall_time(),
        })
    }

    fn add_scalars(&mut self, tag: &str, values: &[(&str, f64)], step: usize) -> Result<()> {
        self.write(&Event {
            tag,
            step,
            value: None,
            values: Some(values.iter().copied().collect()),
            wall_time: wall_time(),
        })
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricsSink for FanoutSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.sinks
            .iter_mut()
            .try_for_each(|sink| sink.add_scalar(tag, value, step))
    }

    fn add_scalars(&mut self, tag: &str, values: &[(&str, f64)], step: usize) -> Result<()> {
        self.sinks
            .iter_mut()
            .try_for_each(|sink| sink.add_scalars(tag, values, step))
    }
}
