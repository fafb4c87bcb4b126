//! Append-only storage for match records.
//!
//! The JSON Lines store keeps one record per line in `results.jsonl`. Each
//! append writes a whole line and syncs it before returning, so a reader sees
//! a prefix of the log and never a half-written record. A failed append is
//! rolled back to the previous length. Only the writer repairs a torn tail;
//! readers ([`read_records`]) never modify the file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::StorageError;
use crate::tournament::MatchRecord;

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The record was written at this position.
    Appended { sequence: u64 },
    /// A record with the same identifier already exists; nothing was written.
    Duplicate,
}

/// Durable, append-only log of match records keyed by match identifier.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Appends a record unless its identifier is already stored.
    async fn append(&self, record: MatchRecord) -> Result<AppendOutcome, StorageError>;

    /// All records in append order.
    async fn read_all(&self) -> Result<Vec<MatchRecord>, StorageError>;

    /// Looks up a record by identifier.
    async fn get(&self, id: &str) -> Result<Option<MatchRecord>, StorageError> {
        Ok(self.read_all().await?.into_iter().find(|r| r.id == id))
    }
}

#[derive(Debug, Default)]
struct LogState {
    ids: HashSet<String>,
    next_sequence: u64,
}

/// JSON Lines result store.
pub struct JsonlResultStore {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl JsonlResultStore {
    /// Opens (or creates) the log at `path` for appending and loads the
    /// stored identifiers.
    ///
    /// A trailing line without a newline is a torn write from an interrupted
    /// run; it is cut off so the next append starts on a clean line. Only one
    /// writer may have the log open; use [`read_records`] to inspect a log
    /// that a run may still be appending to.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    StorageError::DirectoryCreationFailed(format!(
                        "Failed to create directory {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }

        let mut state = LogState::default();
        if path.exists() {
            let contents = fs::read(&path).await?;
            let complete = complete_lines(&contents)?;
            if complete.len() < contents.len() {
                warn!(
                    path = %path.display(),
                    torn_bytes = contents.len() - complete.len(),
                    "Discarding incomplete trailing record"
                );
                let file = OpenOptions::new().write(true).open(&path).await?;
                file.set_len(complete.len() as u64).await?;
                file.sync_all().await?;
            }

            for record in parse_lines(complete)? {
                state.next_sequence = state.next_sequence.max(record.sequence + 1);
                state.ids.insert(record.id);
            }
            debug!(path = %path.display(), records = state.ids.len(), "Opened result log");
        }

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of distinct records in the log.
    pub async fn len(&self) -> usize {
        self.state.lock().await.ids.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ResultStore for JsonlResultStore {
    async fn append(&self, mut record: MatchRecord) -> Result<AppendOutcome, StorageError> {
        let mut state = self.state.lock().await;
        if state.ids.contains(&record.id) {
            debug!(id = %record.id, "Record already stored");
            return Ok(AppendOutcome::Duplicate);
        }

        let sequence = state.next_sequence;
        record.sequence = sequence;
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let committed_len = file.metadata().await?.len();
        let written: std::io::Result<()> = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            warn!(id = %record.id, error = %err, "Append failed, rolling back");
            if let Err(rollback) = file.set_len(committed_len).await {
                error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "Could not roll back failed append"
                );
            }
            return Err(err.into());
        }

        state.next_sequence += 1;
        state.ids.insert(record.id);
        Ok(AppendOutcome::Appended { sequence })
    }

    async fn read_all(&self) -> Result<Vec<MatchRecord>, StorageError> {
        read_records(&self.path).await
    }
}

/// Reads the complete records of a log without opening it for writing.
///
/// A trailing line without its newline is an append in progress (or a torn
/// one) and is skipped, not truncated. A missing file holds no records.
pub async fn read_records(path: &Path) -> Result<Vec<MatchRecord>, StorageError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read(path).await?;
    parse_lines(complete_lines(&contents)?)
}

/// The part of the log up to and including its last newline.
fn complete_lines(contents: &[u8]) -> Result<&str, StorageError> {
    let complete_len = contents.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    std::str::from_utf8(&contents[..complete_len]).map_err(|e| {
        let valid = &contents[..e.valid_up_to()];
        StorageError::CorruptedRecord {
            line: valid.iter().filter(|b| **b == b'\n').count() + 1,
            reason: e.to_string(),
        }
    })
}

fn parse_lines(contents: &str) -> Result<Vec<MatchRecord>, StorageError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| StorageError::CorruptedRecord {
                line: i + 1,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// In-memory result store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    records: Mutex<Vec<MatchRecord>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `records`, as if resumed.
    pub fn with_records(records: Vec<MatchRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn append(&self, mut record: MatchRecord) -> Result<AppendOutcome, StorageError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.id == record.id) {
            return Ok(AppendOutcome::Duplicate);
        }
        let sequence = records.len() as u64;
        record.sequence = sequence;
        records.push(record);
        Ok(AppendOutcome::Appended { sequence })
    }

    async fn read_all(&self) -> Result<Vec<MatchRecord>, StorageError> {
        Ok(self.records.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Topic, Transcript, TranscriptStatus};
    use crate::tournament::{record_uuid, MatchOutcome};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(id: &str) -> MatchRecord {
        MatchRecord {
            id: id.to_string(),
            record_uuid: record_uuid(id),
            sequence: 0,
            topic: Topic::new("t", "p"),
            participants: vec!["a".into(), "b".into()],
            bracket_round: 0,
            attempt: 1,
            transcript: Transcript {
                match_id: id.to_string(),
                topic: Topic::new("t", "p"),
                participants: vec!["a".into(), "b".into()],
                planned_rounds: 1,
                rounds_completed: 1,
                speaking_orders: vec![],
                turns: vec![],
                status: TranscriptStatus::Complete,
                abort: None,
            },
            votes: vec![],
            verdict: None,
            outcome: MatchOutcome::Tie,
            agent_metrics: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = JsonlResultStore::open(temp_dir.path().join("out/results.jsonl"))
            .await
            .expect("open");

        for i in 0..3 {
            let outcome = store.append(record(&format!("t:a-vs-b:r{}", i))).await.expect("append");
            assert_eq!(outcome, AppendOutcome::Appended { sequence: i });
        }

        let records = store.read_all().await.expect("read");
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].id, "t:a-vs-b:r2");
        assert_eq!(records[2].sequence, 2);

        // Idempotent reads.
        assert_eq!(store.read_all().await.expect("read again"), records);
    }

    #[tokio::test]
    async fn test_duplicates_are_not_written() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("results.jsonl");
        let store = JsonlResultStore::open(&path).await.expect("open");

        store.append(record("x")).await.expect("append");
        assert_eq!(store.append(record("x")).await.expect("append"), AppendOutcome::Duplicate);
        assert_eq!(store.read_all().await.expect("read").len(), 1);

        // Reopening loads the identifiers, so dedup survives restarts.
        let reopened = JsonlResultStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.len().await, 1);
        assert_eq!(reopened.append(record("x")).await.expect("append"), AppendOutcome::Duplicate);
        assert_eq!(
            reopened.append(record("y")).await.expect("append"),
            AppendOutcome::Appended { sequence: 1 }
        );
        assert!(reopened.get("y").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_discarded() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("results.jsonl");
        let mut contents = serde_json::to_string(&record("ok")).expect("serialize");
        contents.push('\n');
        contents.push_str("{\"id\":\"half");
        std::fs::write(&path, &contents).expect("write");

        let store = JsonlResultStore::open(&path).await.expect("open");
        assert_eq!(store.read_all().await.expect("read").len(), 1);

        store.append(record("next")).await.expect("append");
        let records = store.read_all().await.expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, "next");
    }

    #[tokio::test]
    async fn test_reader_leaves_torn_tail_in_place() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("results.jsonl");
        assert!(read_records(&path).await.expect("missing log").is_empty());

        let mut contents = serde_json::to_string(&record("ok")).expect("serialize");
        contents.push('\n');
        contents.push_str("{\"id\":\"in-progress");
        std::fs::write(&path, &contents).expect("write");

        let records = read_records(&path).await.expect("read");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "ok");
        let on_disk = std::fs::metadata(&path).expect("metadata").len();
        assert_eq!(on_disk, contents.len() as u64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reads_during_appends_see_a_prefix() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("results.jsonl");
        let store = Arc::new(JsonlResultStore::open(&path).await.expect("open"));
        let ids: Vec<String> = (0..40).map(|i| format!("t:a-vs-b:r{}", i)).collect();

        let writer = {
            let store = store.clone();
            let ids = ids.clone();
            tokio::spawn(async move {
                for id in ids {
                    store.append(record(&id)).await.expect("append");
                }
            })
        };

        loop {
            let finished = writer.is_finished();
            for records in [
                read_records(&path).await.expect("read log"),
                store.read_all().await.expect("read store"),
            ] {
                let seen: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
                let expected: Vec<&str> = ids[..seen.len()].iter().map(String::as_str).collect();
                assert_eq!(seen, expected);
            }
            if finished {
                break;
            }
            tokio::task::yield_now().await;
        }
        writer.await.expect("writer");

        assert_eq!(read_records(&path).await.expect("final read").len(), ids.len());
        let reopened = JsonlResultStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.len().await, ids.len());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_append_is_not_remembered() {
        let device = Path::new("/dev/full");
        if !device.exists() {
            return;
        }
        // Every write to /dev/full fails with ENOSPC.
        let store = JsonlResultStore {
            path: device.to_path_buf(),
            state: Mutex::new(LogState::default()),
        };

        let first = store.append(record("x")).await;
        assert!(matches!(first, Err(StorageError::Io(_))));
        let retry = store.append(record("x")).await;
        assert!(matches!(retry, Err(StorageError::Io(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupted_line_is_reported() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("results.jsonl");
        std::fs::write(&path, "not json\n").expect("write");

        let result = JsonlResultStore::open(&path).await;
        assert!(matches!(result, Err(StorageError::CorruptedRecord { line: 1, .. })));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryResultStore::new();
        store.append(record("a")).await.expect("append");
        assert_eq!(store.append(record("a")).await.expect("append"), AppendOutcome::Duplicate);
        assert_eq!(store.read_all().await.expect("read").len(), 1);
        assert!(store.get("missing").await.expect("get").is_none());
    }
}
