//! Content sinks: where EXPORT jobs write content rows to.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use idsync_types::{ContentRow, Job};

use crate::error::JobError;
use crate::jobs::source::SourceRecord;

/// Receives the rows of one export.
pub trait SinkWriter: Send {
    fn write(&mut self, row: &ContentRow) -> Result<(), JobError>;

    /// Make the export visible. Returns the number of rows written.
    fn finish(self: Box<Self>) -> Result<u64, JobError>;
}

pub trait ContentSink: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, job: &Job) -> Result<Box<dyn SinkWriter>, JobError>;
}

/// Writes one [`SourceRecord`] per line to the file named by the job's
/// `export_path` property, so an export can be imported again.
///
/// Output goes to a sibling `.tmp` file that replaces the target on finish;
/// an unfinished export leaves the target untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesSink;

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<JsonLinesWriter, JobError> {
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                JobError::Sink(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let file = File::create(&staging)
            .map_err(|e| JobError::Sink(format!("cannot create {}: {e}", staging.display())))?;
        Ok(JsonLinesWriter {
            target: path.to_path_buf(),
            staging,
            out: Some(BufWriter::new(file)),
            written: 0,
        })
    }
}

impl ContentSink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn open(&self, job: &Job) -> Result<Box<dyn SinkWriter>, JobError> {
        let path = job
            .property("export_path")
            .ok_or_else(|| JobError::Invalid("export_path property is required".to_string()))?;
        Ok(Box::new(Self::create(Path::new(path))?))
    }
}

pub struct JsonLinesWriter {
    target: PathBuf,
    staging: PathBuf,
    out: Option<BufWriter<File>>,
    written: u64,
}

impl SinkWriter for JsonLinesWriter {
    fn write(&mut self, row: &ContentRow) -> Result<(), JobError> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| JobError::Sink("writer already finished".to_string()))?;
        serde_json::to_writer(&mut *out, &SourceRecord::from(row))
            .map_err(|e| JobError::Sink(e.to_string()))?;
        out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<u64, JobError> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        fs::rename(&self.staging, &self.target)?;
        Ok(self.written)
    }
}

impl Drop for JsonLinesWriter {
    fn drop(&mut self) {
        // Still open means finish was never reached
        if self.out.take().is_some() {
            if let Err(e) = fs::remove_file(&self.staging) {
                warn!(path = %self.staging.display(), error = %e, "Failed to remove partial export");
            }
        }
    }
}
