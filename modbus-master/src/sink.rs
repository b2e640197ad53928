//! Poll results and their persistence.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Decoded values of one polling cycle, keyed by register address.
///
/// Iteration follows insertion order (group order, then schema order).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    entries: Vec<(u32, String)>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value; an existing address keeps its position and gets the new
    /// value, which returns the old one.
    pub fn insert(&mut self, address: u32, value: String) -> Option<String> {
        match self.entries.iter_mut().find(|(a, _)| *a == address) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((address, value));
                None
            }
        }
    }

    pub fn get(&self, address: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.entries
            .iter()
            .map(|(address, value)| (*address, value.as_str()))
    }

    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|(address, _)| *address)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, value)| value.as_str())
    }
}

impl Extend<(u32, String)> for ResultSet {
    fn extend<I: IntoIterator<Item = (u32, String)>>(&mut self, iter: I) {
        for (address, value) in iter {
            self.insert(address, value);
        }
    }
}

/// Errors while persisting a result set.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Sink task failed: {0}")]
    Task(String),
}

/// Receives the result set of every completed cycle.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, results: &ResultSet) -> Result<(), SinkError>;
}

/// Appends results to a CSV file per local calendar day.
///
/// Columns are fixed when the sink is built, one per value address the
/// settings declare. A file gets a `Timestamp;<address>;...` header when it is
/// created or when its last header lists other columns; every save adds one
/// `HH:MM:SS;<value>;...` row with an empty cell for each value the cycle did
/// not read.
#[derive(Debug, Clone)]
pub struct CsvResultSink {
    output_dir: PathBuf,
    columns: Arc<[u32]>,
    // File whose last header matches `columns`.
    current: Arc<Mutex<Option<PathBuf>>>,
}

impl CsvResultSink {
    pub fn new(output_dir: impl Into<PathBuf>, columns: impl Into<Vec<u32>>) -> Self {
        let columns: Vec<u32> = columns.into();
        Self {
            output_dir: output_dir.into(),
            columns: columns.into(),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// File that results saved at `now` go to.
    pub fn file_for(&self, now: &DateTime<Local>) -> PathBuf {
        self.output_dir
            .join(format!("{}.csv", now.format("%Y-%m-%d")))
    }

    /// Append one row for `results` as of `now`.
    pub fn append(&self, results: &ResultSet, now: &DateTime<Local>) -> Result<PathBuf, SinkError> {
        let path = self.file_for(now);
        let header = self.header();

        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let write_header = current.as_deref() != Some(path.as_path())
            && last_header(&path)?.as_deref() != Some(header.as_slice());

        for address in results.addresses() {
            if !self.columns.contains(&address) {
                warn!(address, "Value has no CSV column, dropped");
            }
        }

        let row = std::iter::once(now.format("%H:%M:%S").to_string()).chain(
            self.columns
                .iter()
                .map(|&address| results.get(address).unwrap_or_default().to_string()),
        );

        append_row(&path, write_header.then_some(&header), row)?;
        *current = Some(path.clone());

        Ok(path)
    }

    fn header(&self) -> Vec<String> {
        std::iter::once("Timestamp".to_string())
            .chain(self.columns.iter().map(|address| address.to_string()))
            .collect()
    }
}

/// Last header record in an existing result file.
fn last_header(path: &Path) -> Result<Option<Vec<String>>, SinkError> {
    if !path.exists() {
        return Ok(None);
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut header = None;
    for record in reader.records() {
        let record = record?;
        if record.get(0) == Some("Timestamp") {
            header = Some(record.iter().map(str::to_string).collect());
        }
    }

    Ok(header)
}

fn append_row(
    path: &Path,
    header: Option<&Vec<String>>,
    row: impl Iterator<Item = String>,
) -> Result<(), SinkError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .terminator(csv::Terminator::CRLF)
        .from_writer(file);

    if let Some(header) = header {
        writer.write_record(header)?;
    }

    writer.write_record(row)?;
    writer.flush()?;

    Ok(())
}

#[async_trait]
impl ResultSink for CsvResultSink {
    async fn save(&self, results: &ResultSet) -> Result<(), SinkError> {
        let sink = self.clone();
        let results = results.clone();

        let path = tokio::task::spawn_blocking(move || sink.append(&results, &Local::now()))
            .await
            .map_err(|e| SinkError::Task(e.to_string()))??;

        debug!(file = %path.display(), "Results saved");
        Ok(())
    }
}
