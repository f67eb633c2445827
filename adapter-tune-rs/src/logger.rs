//! Step-indexed CSV metrics.
//!
//! Every run gets a fresh `version_<n>` directory under `<root>/<name>`. Rows
//! are appended to `metrics.csv` as they arrive; the file is only rewritten
//! when a metric appears that the header does not cover yet.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File written inside the version directory.
pub const METRICS_FILE: &str = "metrics.csv";

/// Appends metric rows keyed by step to `metrics.csv`.
#[derive(Debug)]
pub struct StepCsvLogger {
    log_dir: PathBuf,
    columns: BTreeSet<String>,
    pending: Vec<(usize, BTreeMap<String, f64>)>,
    writer: Option<csv::Writer<File>>,
}

impl StepCsvLogger {
    /// Create the next `version_<n>` directory under `root/name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed or created.
    pub fn new<P: AsRef<Path>>(root: P, name: &str) -> Result<Self> {
        let base = root.as_ref().join(name);
        std::fs::create_dir_all(&base)?;

        let mut next = 0;
        for entry in std::fs::read_dir(&base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let version = file_name
                .to_str()
                .and_then(|n| n.strip_prefix("version_"))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(version) = version {
                next = next.max(version + 1);
            }
        }

        let log_dir = base.join(format!("version_{next}"));
        std::fs::create_dir_all(&log_dir)?;
        tracing::debug!("Logging metrics to {}", log_dir.display());
        Ok(Self {
            log_dir,
            columns: BTreeSet::new(),
            pending: Vec::new(),
            writer: None,
        })
    }

    /// Directory of this run.
    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Full path of `metrics.csv`.
    #[must_use]
    pub fn metrics_path(&self) -> PathBuf {
        self.log_dir.join(METRICS_FILE)
    }

    /// Rows recorded but not yet written.
    #[must_use]
    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    /// Record `metrics` at `step` and write it out.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: usize) -> Result<()> {
        let new_column = metrics.keys().any(|key| !self.columns.contains(key));
        self.pending.push((step, metrics.clone()));
        if new_column || self.writer.is_none() {
            self.columns.extend(metrics.keys().cloned());
            self.rewrite()?;
        }
        self.flush()
    }

    /// Append pending rows under the current header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn flush(&mut self) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        for (step, metrics) in self.pending.drain(..) {
            let mut record = vec![step.to_string()];
            record.extend(
                self.columns
                    .iter()
                    .map(|col| metrics.get(col).map(f64::to_string).unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn header(&self) -> Vec<String> {
        std::iter::once("step".to_string())
            .chain(self.columns.iter().cloned())
            .collect()
    }

    /// Re-emit the rows already on disk under the widened header, then reopen
    /// the file for appending.
    fn rewrite(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        let path = self.metrics_path();

        let mut written: Vec<HashMap<String, String>> = Vec::new();
        if path.is_file() {
            let mut reader = csv::Reader::from_path(&path)?;
            let old_header = reader.headers()?.clone();
            for record in reader.records() {
                let record = record?;
                written.push(
                    old_header
                        .iter()
                        .zip(record.iter())
                        .map(|(col, value)| (col.to_string(), value.to_string()))
                        .collect(),
                );
            }
        }

        let header = self.header();
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(&header)?;
        for row in &written {
            writer.write_record(header.iter().map(|col| row.get(col).map_or("", String::as_str)))?;
        }
        writer.flush()?;
        drop(writer);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.writer = Some(csv::WriterBuilder::new().has_headers(false).from_writer(file));
        Ok(())
    }
}
