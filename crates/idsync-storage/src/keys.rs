//! Key encoding and decoding for storage layer.
//!
//! Formats:
//! - rows: `row:{kind}:{id}` (content, working and archive tables)
//! - jobs: `job:{id:020}`
//! - queue: `queue:{schedule_ms:013}:{id:020}`
//! - schedule index: `plan:{schedule_ms:013}:{jobdef}`
//!
//! Zero-padded numbers keep lexicographic order equal to numeric order, so a
//! forward scan over the queue yields jobs by `(schedule_time, id)`.

use chrono::{DateTime, Utc};
use idsync_types::JobId;

use crate::error::StorageError;

fn key_str(bytes: &[u8]) -> Result<&str, StorageError> {
    std::str::from_utf8(bytes).map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))
}

/// Milliseconds since epoch, clamped at zero so padding stays fixed-width.
pub fn schedule_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis().max(0)
}

/// Key for a content, working or archived row
/// Format: row:{kind}:{id}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKey {
    pub kind: String,
    pub id: String,
}

impl RowKey {
    pub fn new(kind: &str, id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Encode key to bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("row:{}:{}", self.kind, self.id).into_bytes()
    }

    /// Decode key from bytes. Ids may themselves contain ':'.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = key_str(bytes)?;
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("row"), Some(kind), Some(id)) if !kind.is_empty() => Ok(Self::new(kind, id)),
            _ => Err(StorageError::Key(format!("Invalid row key format: {}", s))),
        }
    }

    /// Prefix shared by every row of a kind
    pub fn kind_prefix(kind: &str) -> Vec<u8> {
        format!("row:{}:", kind).into_bytes()
    }
}

/// Key for job rows
/// Format: job:{id:020}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobKey {
    pub id: JobId,
}

impl JobKey {
    pub fn new(id: JobId) -> Self {
        Self { id }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("job:{:020}", self.id.0).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = key_str(bytes)?;
        let id = s
            .strip_prefix("job:")
            .ok_or_else(|| StorageError::Key(format!("Invalid job key format: {}", s)))?
            .parse::<u64>()
            .map_err(|e| StorageError::Key(format!("Invalid job id: {}", e)))?;
        Ok(Self::new(JobId(id)))
    }
}

/// Key for the active job queue
/// Format: queue:{schedule_ms:013}:{id:020}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueKey {
    pub schedule_ms: i64,
    pub id: JobId,
}

impl QueueKey {
    pub fn new(schedule_time: DateTime<Utc>, id: JobId) -> Self {
        Self {
            schedule_ms: schedule_ms(schedule_time),
            id,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("queue:{:013}:{:020}", self.schedule_ms, self.id.0).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = key_str(bytes)?;
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 || parts[0] != "queue" {
            return Err(StorageError::Key(format!("Invalid queue key format: {}", s)));
        }
        let schedule_ms: i64 = parts[1]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid timestamp: {}", e)))?;
        let id: u64 = parts[2]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid job id: {}", e)))?;
        Ok(Self {
            schedule_ms,
            id: JobId(id),
        })
    }
}

/// Key for the planned-job index
/// Format: plan:{schedule_ms:013}:{jobdef}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleKey {
    pub jobdef_id: String,
    pub schedule_ms: i64,
}

impl ScheduleKey {
    pub fn new(jobdef_id: &str, schedule_time: DateTime<Utc>) -> Self {
        Self {
            jobdef_id: jobdef_id.to_string(),
            schedule_ms: schedule_ms(schedule_time),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("plan:{:013}:{}", self.schedule_ms, self.jobdef_id).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_row_key_allows_colons_in_id() {
        let key = RowKey::new("USER", "ldap:cn=alice");
        let decoded = RowKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(decoded, key);
        assert!(key.to_bytes().starts_with(&RowKey::kind_prefix("USER")));
        assert!(!key.to_bytes().starts_with(&RowKey::kind_prefix("US")));
    }

    #[test]
    fn test_row_key_rejects_foreign_prefix() {
        assert!(RowKey::from_bytes(b"job:00000000000000000001").is_err());
        assert!(RowKey::from_bytes(b"row::x").is_err());
    }

    #[test]
    fn test_queue_keys_sort_by_time_then_id() {
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 1).unwrap();

        let a = QueueKey::new(t1, JobId(20)).to_bytes();
        let b = QueueKey::new(t2, JobId(3)).to_bytes();
        let c = QueueKey::new(t1, JobId(100)).to_bytes();
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);

        let decoded = QueueKey::from_bytes(&c).unwrap();
        assert_eq!(decoded.id, JobId(100));
        assert_eq!(decoded.schedule_ms, t1.timestamp_millis());
    }

    #[test]
    fn test_pre_epoch_schedule_is_clamped() {
        let before = Utc.with_ymd_and_hms(1960, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(QueueKey::new(before, JobId(1)).schedule_ms, 0);
    }

    #[test]
    fn test_job_key_roundtrip() {
        let key = JobKey::new(JobId(42));
        assert_eq!(key.to_bytes(), b"job:00000000000000000042".to_vec());
        assert_eq!(JobKey::from_bytes(&key.to_bytes()).unwrap(), key);
    }
}
