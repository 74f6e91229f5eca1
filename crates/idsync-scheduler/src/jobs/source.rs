//! Content sources: where IMPORT jobs read external records from.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use idsync_types::{Attributes, ContentRow, Job, Validity};

use crate::error::JobError;

/// One external record for a content kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            valid_from: None,
            valid_to: None,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn with_validity(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = from;
        self.valid_to = to;
        self
    }

    pub fn validity(&self) -> Validity {
        Validity::new(self.valid_from, self.valid_to)
    }
}

impl From<&ContentRow> for SourceRecord {
    fn from(row: &ContentRow) -> Self {
        Self {
            id: row.id.clone(),
            valid_from: row.validity.from,
            valid_to: row.validity.to,
            attributes: row.attributes.clone(),
        }
    }
}

/// Stream of records produced by a source.
pub type SourceRecords = Box<dyn Iterator<Item = Result<SourceRecord, JobError>> + Send>;

/// Yields external records for the content kind a job targets.
pub trait ContentSource: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, job: &Job) -> Result<SourceRecords, JobError>;
}

/// Reads one JSON record per line from the file named by the job's
/// `source_path` property. Blank lines are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesSource;

impl JsonLinesSource {
    pub fn read(path: &Path) -> Result<SourceRecords, JobError> {
        let file = File::open(path)
            .map_err(|e| JobError::Source(format!("cannot open {}: {e}", path.display())))?;
        let records = BufReader::new(file)
            .lines()
            .enumerate()
            .filter_map(|(index, line)| parse_line(index + 1, line).transpose());
        Ok(Box::new(records))
    }
}

fn parse_line(
    number: usize,
    line: std::io::Result<String>,
) -> Result<Option<SourceRecord>, JobError> {
    let line = line?;
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&line)
        .map(Some)
        .map_err(|e| JobError::Source(format!("line {number}: {e}")))
}

impl ContentSource for JsonLinesSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn open(&self, job: &Job) -> Result<SourceRecords, JobError> {
        let path = job
            .property("source_path")
            .ok_or_else(|| JobError::Invalid("source_path property is required".to_string()))?;
        Self::read(Path::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_read_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, r#"{{"id": "u1", "attributes": {{"login": "ada"}}}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"id": "u2", "valid_to": "2024-01-01T00:00:00Z", "attributes": {{"login": "bob"}}}}"#
        )
        .unwrap();

        let records: Vec<_> = JsonLinesSource::read(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "u1");
        assert_eq!(records[0].attributes["login"], "ada");
        assert!(records[1].validity().to.is_some());
    }

    #[test]
    fn test_malformed_line_is_a_source_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"id\": \"u1\"}\nnot json\n").unwrap();

        let results: Vec<_> = JsonLinesSource::read(&path).unwrap().collect();
        assert!(results[0].is_ok());
        match &results[1] {
            Err(JobError::Source(msg)) => assert!(msg.starts_with("line 2")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            JsonLinesSource::read(&dir.path().join("absent.jsonl")),
            Err(JobError::Source(_))
        ));
    }
}
