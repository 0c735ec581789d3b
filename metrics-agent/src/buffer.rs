//! Persistent FIFO buffer for batches that could not be delivered
//!
//! - Storage: one JSON array of `BufferRecord`, rewritten atomically (temp file + fsync + rename)
//! - Order: records only leave from the front, and only after the caller confirmed delivery
//! - Retention: count cap and optional age cap, oldest evicted first

use chrono::Utc;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{BufferRecord, MetricBatch};

/// How much the buffer may hold before it starts dropping the oldest records
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub max_records: usize,
    pub max_age: Option<Duration>,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_records: 1000,
            max_age: None,
        }
    }
}

pub struct PersistentBuffer {
    path: PathBuf,
    records: VecDeque<BufferRecord>,
    retention: Retention,
}

impl PersistentBuffer {
    /// Open (or create) the buffer file and load committed records
    pub fn open(path: impl Into<PathBuf>, retention: Retention) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
        }

        let records = Self::load(&path)?;
        let mut buffer = Self {
            path,
            records,
            retention,
        };

        let evicted = buffer.apply_retention();
        if !evicted.is_empty() {
            buffer.persist()?;
            warn!(
                "Dropped {} buffered batches from {} to stay within retention",
                evicted.len(),
                buffer.path.display()
            );
        }
        if !buffer.records.is_empty() {
            info!(
                "Loaded {} buffered batches from {}",
                buffer.records.len(),
                buffer.path.display()
            );
        }
        Ok(buffer)
    }

    fn load(path: &Path) -> Result<VecDeque<BufferRecord>, StorageError> {
        if !path.exists() {
            return Ok(VecDeque::new());
        }

        let content = fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
        if content.trim().is_empty() {
            return Ok(VecDeque::new());
        }

        match serde_json::from_str::<Vec<BufferRecord>>(&content) {
            Ok(records) => Ok(records.into()),
            Err(e) => {
                let aside = quarantine(path)?;
                error!(
                    "Buffer file {} is corrupt ({}), moved it to {} and starting empty",
                    path.display(),
                    e,
                    aside.display()
                );
                Ok(VecDeque::new())
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a batch; committed to disk before returning
    pub fn enqueue(&mut self, batch: MetricBatch) -> Result<Uuid, StorageError> {
        let record = BufferRecord::new(batch);
        let id = record.id;
        self.records.push_back(record);
        let evicted = self.apply_retention();

        if let Err(e) = self.persist() {
            // keep memory consistent with disk: undo the append and the evictions
            self.records.retain(|r| r.id != id);
            for record in evicted.into_iter().rev() {
                self.records.push_front(record);
            }
            return Err(e);
        }
        for dropped in &evicted {
            warn!(
                "Dropped buffered batch {} ({} entries, enqueued {}) to stay within retention",
                dropped.id,
                dropped.batch.len(),
                dropped.enqueued_at
            );
        }
        debug!("Buffered batch {} ({} pending)", id, self.records.len());
        Ok(id)
    }

    pub fn peek_front(&self) -> Option<BufferRecord> {
        self.records.front().cloned()
    }

    /// Front record plus the following ones sharing its source, at most `limit`
    pub fn peek_front_run(&self, limit: usize) -> Vec<BufferRecord> {
        let Some(front) = self.records.front() else {
            return Vec::new();
        };
        self.records
            .iter()
            .take(limit.max(1))
            .take_while(|r| r.batch.source() == front.batch.source())
            .cloned()
            .collect()
    }

    /// Remove the front record unconditionally
    pub fn pop_front(&mut self) -> Result<Option<BufferRecord>, StorageError> {
        let Some(record) = self.records.pop_front() else {
            return Ok(None);
        };
        if let Err(e) = self.persist() {
            self.records.push_front(record);
            return Err(e);
        }
        Ok(Some(record))
    }

    /// Remove the front record only if it is still `id`.
    ///
    /// Retention may have evicted it while it was being re-sent.
    pub fn pop_front_if(&mut self, id: Uuid) -> Result<bool, StorageError> {
        self.pop_front_n_if(&[id]).map(|n| n == 1)
    }

    /// Remove the leading records whose ids match `ids` in order; returns how many went
    pub fn pop_front_n_if(&mut self, ids: &[Uuid]) -> Result<usize, StorageError> {
        let mut removed = Vec::new();
        for id in ids {
            match self.records.front() {
                Some(front) if front.id == *id => {
                    if let Some(record) = self.records.pop_front() {
                        removed.push(record);
                    }
                }
                _ => break,
            }
        }
        if removed.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.persist() {
            for record in removed.into_iter().rev() {
                self.records.push_front(record);
            }
            return Err(e);
        }
        Ok(removed.len())
    }

    /// Count one more failed re-send for the given records
    pub fn record_failed_attempt(&mut self, ids: &[Uuid]) -> Result<(), StorageError> {
        let mut touched = false;
        for record in self.records.iter_mut().filter(|r| ids.contains(&r.id)) {
            record.attempt_count = record.attempt_count.saturating_add(1);
            touched = true;
        }
        if touched {
            self.persist()?;
        }
        Ok(())
    }

    /// Evict by age, then by count; returns the dropped records oldest first
    fn apply_retention(&mut self) -> Vec<BufferRecord> {
        let mut evicted = Vec::new();

        if let Some(max_age) = self.retention.max_age {
            if let Ok(max_age) = chrono::Duration::from_std(max_age) {
                let cutoff = Utc::now() - max_age;
                while self.records.front().is_some_and(|front| front.enqueued_at < cutoff) {
                    evicted.extend(self.records.pop_front());
                }
            }
        }

        while self.records.len() > self.retention.max_records {
            evicted.extend(self.records.pop_front());
        }

        evicted
    }

    fn persist(&self) -> Result<(), StorageError> {
        let json = serde_json::to_vec(&self.records)?;
        write_atomic(&self.path, &json)
    }
}

/// Whole-file rewrite through a synced sibling temp file; readers see the old or the new content
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let tmp = tmp_path(path);

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StorageError::io(path, e)
    })
}

/// Moves an unreadable state file out of the way and returns where it went
pub(crate) fn quarantine(path: &Path) -> Result<PathBuf, StorageError> {
    let aside = corrupt_path(path);
    fs::rename(path, &aside).map_err(|e| StorageError::io(path, e))?;
    Ok(aside)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricEntry, Source};

    fn source(name: &str) -> Source {
        Source {
            name: name.into(),
            description: None,
            ip_address: None,
        }
    }

    fn batch(tag: &str) -> MetricBatch {
        MetricBatch::new(source("host"), vec![MetricEntry::new(tag, 1.0)])
    }

    fn first_name(record: &BufferRecord) -> &str {
        &record.batch.entries()[0].name
    }

    #[test]
    fn test_fifo_order_and_pop() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = PersistentBuffer::open(dir.path().join("buf.json"), Retention::default()).unwrap();
        assert!(buffer.is_empty());

        buffer.enqueue(batch("one")).unwrap();
        buffer.enqueue(batch("two")).unwrap();
        buffer.enqueue(batch("three")).unwrap();

        assert_eq!(first_name(&buffer.peek_front().unwrap()), "one");
        assert_eq!(first_name(&buffer.pop_front().unwrap().unwrap()), "one");
        assert_eq!(first_name(&buffer.pop_front().unwrap().unwrap()), "two");
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.json");
        {
            let mut buffer = PersistentBuffer::open(&path, Retention::default()).unwrap();
            buffer.enqueue(batch("a")).unwrap();
            buffer.enqueue(batch("b")).unwrap();
            // dropped without any flush: simulated crash
        }

        let reopened = PersistentBuffer::open(&path, Retention::default()).unwrap();
        let names: Vec<String> = reopened
            .peek_front_run(10)
            .iter()
            .map(|r| first_name(r).to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_file_is_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.json");
        let mut buffer = PersistentBuffer::open(&path, Retention::default()).unwrap();
        buffer.enqueue(batch("x")).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let array = raw.as_array().unwrap();
        assert_eq!(array.len(), 1);
        assert_eq!(array[0]["attempt_count"], 0);
        assert!(array[0]["enqueued_at"].is_string());
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_count_cap_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let retention = Retention {
            max_records: 2,
            max_age: None,
        };
        let mut buffer = PersistentBuffer::open(dir.path().join("buf.json"), retention).unwrap();
        buffer.enqueue(batch("1")).unwrap();
        buffer.enqueue(batch("2")).unwrap();
        buffer.enqueue(batch("3")).unwrap();

        assert_eq!(buffer.len(), 2);
        assert_eq!(first_name(&buffer.peek_front().unwrap()), "2");
    }

    #[test]
    fn test_failed_enqueue_keeps_evicted_records() {
        let dir = tempfile::tempdir().unwrap();
        let buffer_dir = dir.path().join("buffer");
        std::fs::create_dir(&buffer_dir).unwrap();
        let retention = Retention {
            max_records: 2,
            max_age: None,
        };
        let mut buffer = PersistentBuffer::open(buffer_dir.join("buf.json"), retention).unwrap();
        buffer.enqueue(batch("a")).unwrap();
        buffer.enqueue(batch("b")).unwrap();

        std::fs::remove_dir_all(&buffer_dir).unwrap();
        assert!(buffer.enqueue(batch("c")).is_err());

        let names: Vec<String> = buffer
            .peek_front_run(10)
            .iter()
            .map(|r| first_name(r).to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_age_cap_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.json");
        let mut stale = BufferRecord::new(batch("stale"));
        stale.enqueued_at = Utc::now() - chrono::Duration::hours(2);
        let fresh = BufferRecord::new(batch("fresh"));
        fs::write(&path, serde_json::to_string(&vec![stale, fresh]).unwrap()).unwrap();

        let retention = Retention {
            max_records: 10,
            max_age: Some(Duration::from_secs(3600)),
        };
        let buffer = PersistentBuffer::open(&path, retention).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(first_name(&buffer.peek_front().unwrap()), "fresh");
    }

    #[test]
    fn test_pop_front_if_checks_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = PersistentBuffer::open(dir.path().join("buf.json"), Retention::default()).unwrap();
        let first = buffer.enqueue(batch("a")).unwrap();
        let second = buffer.enqueue(batch("b")).unwrap();

        assert!(!buffer.pop_front_if(second).unwrap());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.pop_front_n_if(&[first, second]).unwrap(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_run_stops_at_source_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = PersistentBuffer::open(dir.path().join("buf.json"), Retention::default()).unwrap();
        buffer.enqueue(batch("a")).unwrap();
        buffer.enqueue(batch("b")).unwrap();
        buffer
            .enqueue(MetricBatch::new(source("renamed"), vec![MetricEntry::new("c", 1.0)]))
            .unwrap();

        assert_eq!(buffer.peek_front_run(10).len(), 2);
        assert_eq!(buffer.peek_front_run(1).len(), 1);
    }

    #[test]
    fn test_failed_attempts_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.json");
        let mut buffer = PersistentBuffer::open(&path, Retention::default()).unwrap();
        let id = buffer.enqueue(batch("a")).unwrap();
        buffer.record_failed_attempt(&[id]).unwrap();
        buffer.record_failed_attempt(&[id]).unwrap();

        let reopened = PersistentBuffer::open(&path, Retention::default()).unwrap();
        assert_eq!(reopened.peek_front().unwrap().attempt_count, 2);
    }

    #[test]
    fn test_corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.json");
        fs::write(&path, "{not json").unwrap();

        let buffer = PersistentBuffer::open(&path, Retention::default()).unwrap();
        assert!(buffer.is_empty());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(leftovers.len(), 1);
    }
}
