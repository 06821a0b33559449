use log::{debug, error, warn};
use serde_json;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Cannot create history directory {path}: {source}")]
    Directory { path: String, source: std::io::Error },
    #[error("Cannot write history file {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("Cannot serialize history entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only consumer of per-tick samples.
pub trait HistorySink: Send + Sync {
    fn record_sample(&self, timestamp: i64, fields: &HashMap<String, f64>);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistoryKind {
    Energy,
    Voltage,
}

impl HistoryKind {
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            HistoryKind::Energy => &["power", "energy"],
            HistoryKind::Voltage => &["voltage_l1", "voltage_l2", "voltage_l3"],
        }
    }

    fn name(&self) -> &'static str {
        match self {
            HistoryKind::Energy => "energy",
            HistoryKind::Voltage => "voltage",
        }
    }
}

#[derive(Default)]
struct Window {
    start: Option<i64>,
    samples: u32,
    sums: BTreeMap<&'static str, f64>,
}

/// Averages samples over a fixed window and appends one JSON line per window.
pub struct HistoryStore {
    kind: HistoryKind,
    file: PathBuf,
    window: i64,
    current: Mutex<Window>,
}

pub fn safe_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if safe.is_empty() { "powermeter".to_string() } else { safe }
}

impl HistoryStore {
    pub fn new(kind: HistoryKind, dir: &Path, meter_name: &str, window: Duration) -> Result<Self, HistoryError> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| HistoryError::Directory {
                path: dir.display().to_string(),
                source: e,
            })?;
            warn!("Created missing history directory {}", dir.display());
        }

        let file = dir.join(format!("history_{}_{}.jsonl", kind.name(), safe_name(meter_name)));
        debug!("{} history in {} (window {:?})", kind.name(), file.display(), window);

        Ok(HistoryStore {
            kind,
            file,
            window: window.as_secs().max(1) as i64,
            current: Mutex::new(Window::default()),
        })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    fn sanitize(&self, field: &str, value: f64) -> f64 {
        if !value.is_finite() {
            return 0.0;
        }
        if field == "power" && value < 0.0 {
            return 0.0;
        }
        value
    }

    fn add(&self, timestamp: i64, fields: &HashMap<String, f64>) -> Result<(), HistoryError> {
        let mut window = match self.current.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(start) = window.start {
            if timestamp - start >= self.window {
                self.flush(&window)?;
                *window = Window::default();
            }
        }

        window.start.get_or_insert(timestamp);
        window.samples += 1;
        for &field in self.kind.fields() {
            let value = self.sanitize(field, fields.get(field).copied().unwrap_or(f64::NAN));
            *window.sums.entry(field).or_insert(0.0) += value;
        }
        Ok(())
    }

    fn flush(&self, window: &Window) -> Result<(), HistoryError> {
        let start = match window.start {
            Some(s) if window.samples > 0 => s,
            _ => return Ok(()),
        };

        let mut entry = serde_json::Map::new();
        entry.insert("time".to_string(), start.into());
        for (field, sum) in &window.sums {
            entry.insert(field.to_string(), serde_json::json!(sum / window.samples as f64));
        }
        let line = serde_json::to_string(&entry)?;

        let write_err = |e| HistoryError::Write { path: self.file.display().to_string(), source: e };
        let mut file = OpenOptions::new().create(true).append(true).open(&self.file).map_err(write_err)?;
        writeln!(file, "{}", line).map_err(write_err)?;
        debug!("History entry written: {}", line);
        Ok(())
    }

    /// Writes the partially filled window, used on shutdown.
    pub fn flush_pending(&self) -> Result<(), HistoryError> {
        let mut window = match self.current.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.flush(&window)?;
        *window = Window::default();
        Ok(())
    }
}

impl HistorySink for HistoryStore {
    fn record_sample(&self, timestamp: i64, fields: &HashMap<String, f64>) {
        if let Err(e) = self.add(timestamp, fields) {
            error!("Unable to record {} history: {}", self.kind.name(), e);
        }
    }
}
