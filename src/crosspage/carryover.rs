use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::core::errors::{CarryoverError, CarryoverResult};
use crate::utils::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarryoverStatus {
    Pending,
    Consumed,
}

/// One persisted handoff record (one JSON object per line on disk)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarryoverEntry {
    pub pair_id: String,
    pub bottom_text: String,
    pub from_page: String,
    pub to_page: String,
    pub created_at: f64,
    pub status: CarryoverStatus,
}

/// What a replay of the carryover file found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub lines_read: usize,
    pub corrupt_lines: usize,
    pub consumed_markers: usize,
    pub recovered: usize,
}

/// Page-to-page handoff of the bottom half of a split translation.
///
/// Entries live in memory until consumed; `flush()` appends pending entries
/// (and markers for entries consumed since the last flush) to a JSON Lines
/// file which `open()` replays after a crash.
///
/// Single-writer/single-reader per pair id: pages must be processed in order.
#[derive(Clone)]
pub struct CarryoverStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
    recovery: RecoveryReport,
    metrics: Option<Metrics>,
}

#[derive(Default)]
struct StoreState {
    pending: HashMap<String, CarryoverEntry>,
    consumed_since_flush: Vec<CarryoverEntry>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl CarryoverStore {
    /// Store without a backing file; `flush()` is a no-op
    pub fn in_memory(metrics: Option<Metrics>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: None,
                state: Mutex::new(StoreState::default()),
                recovery: RecoveryReport::default(),
                metrics,
            }),
        }
    }

    /// Open a file-backed store, replaying any existing records.
    ///
    /// Malformed lines are skipped with a warning and never abort loading.
    pub async fn open(path: impl AsRef<Path>, metrics: Option<Metrics>) -> CarryoverResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(CarryoverError::DirectoryCreationFailed)?;
            }
        }

        let (pending, recovery) = if path.exists() {
            let data = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| CarryoverError::LoadFailed {
                    path: path.display().to_string(),
                    source,
                })?;
            replay(&data)
        } else {
            (HashMap::new(), RecoveryReport::default())
        };

        if recovery.lines_read > 0 {
            info!(
                "Carryover replay from {}: {} pending recovered, {} consumed markers, {} corrupt lines skipped",
                path.display(),
                recovery.recovered,
                recovery.consumed_markers,
                recovery.corrupt_lines
            );
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                path: Some(path),
                state: Mutex::new(StoreState {
                    pending,
                    consumed_since_flush: Vec::new(),
                }),
                recovery,
                metrics,
            }),
        })
    }

    /// Create or overwrite the pending entry for `pair_id`
    pub fn put(&self, pair_id: &str, bottom_text: &str, from_page: &str, to_page: &str) {
        let entry = CarryoverEntry {
            pair_id: pair_id.to_string(),
            bottom_text: bottom_text.to_string(),
            from_page: from_page.to_string(),
            to_page: to_page.to_string(),
            created_at: now_secs(),
            status: CarryoverStatus::Pending,
        };
        debug!("Carryover put {} ({} -> {})", pair_id, from_page, to_page);
        self.inner.state.lock().pending.insert(entry.pair_id.clone(), entry);

        if let Some(ref m) = self.inner.metrics {
            m.record_carryover_put();
        }
    }

    /// Read-only lookup
    pub fn get(&self, pair_id: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .pending
            .get(pair_id)
            .map(|e| e.bottom_text.clone())
    }

    /// Remove and return the entry's text; a second call returns `None`
    pub fn consume(&self, pair_id: &str) -> Option<String> {
        let mut state = self.inner.state.lock();
        let mut entry = state.pending.remove(pair_id)?;
        let text = entry.bottom_text.clone();
        entry.status = CarryoverStatus::Consumed;
        entry.created_at = now_secs();
        state.consumed_since_flush.push(entry);
        drop(state);

        debug!("Carryover consumed {}", pair_id);
        if let Some(ref m) = self.inner.metrics {
            m.record_carryover_consume();
        }
        Some(text)
    }

    /// Append consumed markers, then every pending entry, to the backing file.
    ///
    /// Safe to call repeatedly; pending entries are rewritten each time and
    /// replay treats duplicates as an idempotent put.
    pub async fn flush(&self) -> CarryoverResult<usize> {
        let Some(path) = self.inner.path.as_ref() else {
            return Ok(0);
        };

        let (markers, pending) = {
            let mut state = self.inner.state.lock();
            let markers = std::mem::take(&mut state.consumed_since_flush);
            let mut pending: Vec<CarryoverEntry> = state.pending.values().cloned().collect();
            pending.sort_by(|a, b| {
                a.created_at
                    .total_cmp(&b.created_at)
                    .then_with(|| a.pair_id.cmp(&b.pair_id))
            });
            (markers, pending)
        };

        if markers.is_empty() && pending.is_empty() {
            return Ok(0);
        }

        let mut buf = String::new();
        for entry in markers.iter().chain(pending.iter()) {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }

        let written = markers.len() + pending.len();
        match append_and_sync(path, buf.as_bytes()).await {
            Ok(()) => {
                debug!("Flushed {} carryover records to {}", written, path.display());
                Ok(written)
            }
            Err(source) => {
                // Keep the markers so the next flush retries them
                let mut state = self.inner.state.lock();
                let newer = std::mem::replace(&mut state.consumed_since_flush, markers);
                state.consumed_since_flush.extend(newer);
                drop(state);

                warn!("Carryover flush to {} failed: {}", path.display(), source);
                if let Some(ref m) = self.inner.metrics {
                    m.record_carryover_flush_failure();
                }
                Err(CarryoverError::WriteFailed {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending pair ids, sorted
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.recovery
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }
}

async fn append_and_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Apply records in file order: pending inserts, consumed removes
fn replay(data: &str) -> (HashMap<String, CarryoverEntry>, RecoveryReport) {
    let mut pending = HashMap::new();
    let mut report = RecoveryReport::default();

    for (line_no, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        report.lines_read += 1;

        match serde_json::from_str::<CarryoverEntry>(line) {
            Ok(entry) => match entry.status {
                CarryoverStatus::Pending => {
                    pending.insert(entry.pair_id.clone(), entry);
                }
                CarryoverStatus::Consumed => {
                    report.consumed_markers += 1;
                    pending.remove(&entry.pair_id);
                }
            },
            Err(e) => {
                report.corrupt_lines += 1;
                warn!("Skipping corrupt carryover record on line {}: {}", line_no + 1, e);
            }
        }
    }

    report.recovered = pending.len();
    (pending, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_at_most_once() {
        let store = CarryoverStore::in_memory(None);
        store.put("cp_1", "그래서 말인데", "p001", "p002");

        assert_eq!(store.get("cp_1").as_deref(), Some("그래서 말인데"));
        assert_eq!(store.get("cp_1").as_deref(), Some("그래서 말인데"));
        assert_eq!(store.consume("cp_1").as_deref(), Some("그래서 말인데"));
        assert_eq!(store.consume("cp_1"), None);
        assert_eq!(store.get("cp_1"), None);
    }

    #[test]
    fn test_put_overwrites() {
        let store = CarryoverStore::in_memory(None);
        store.put("cp_1", "old", "p001", "p002");
        store.put("cp_1", "new", "p001", "p002");
        assert_eq!(store.len(), 1);
        assert_eq!(store.consume("cp_1").as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_flush_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("carryover.jsonl");

        let store = CarryoverStore::open(&path, None).await.unwrap();
        store.put("cp_a", "tail a", "p001", "p002");
        store.put("cp_b", "tail b", "p002", "p003");
        assert_eq!(store.flush().await.unwrap(), 2);

        // Simulated crash: reopen from disk
        let reopened = CarryoverStore::open(&path, None).await.unwrap();
        assert_eq!(reopened.pending_ids(), vec!["cp_a".to_string(), "cp_b".to_string()]);
        assert_eq!(reopened.recovery_report().recovered, 2);
    }

    #[tokio::test]
    async fn test_consumed_entries_not_resurrected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carryover.jsonl");

        let store = CarryoverStore::open(&path, None).await.unwrap();
        store.put("cp_a", "tail a", "p001", "p002");
        store.flush().await.unwrap();
        assert!(store.consume("cp_a").is_some());
        store.put("cp_b", "tail b", "p002", "p003");
        store.flush().await.unwrap();
        // Repeated flush duplicates pending records harmlessly
        store.flush().await.unwrap();

        let reopened = CarryoverStore::open(&path, None).await.unwrap();
        assert_eq!(reopened.pending_ids(), vec!["cp_b".to_string()]);
        assert_eq!(reopened.consume("cp_a"), None);
    }

    #[tokio::test]
    async fn test_corrupt_line_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carryover.jsonl");
        let valid = CarryoverEntry {
            pair_id: "cp_ok".to_string(),
            bottom_text: "남은 부분".to_string(),
            from_page: "p001".to_string(),
            to_page: "p002".to_string(),
            created_at: 1.0,
            status: CarryoverStatus::Pending,
        };
        let contents = format!("{{\"pair_id\": \"cp_bad\", \"bottom\n{}\n", serde_json::to_string(&valid).unwrap());
        tokio::fs::write(&path, contents).await.unwrap();

        let store = CarryoverStore::open(&path, None).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("cp_ok").as_deref(), Some("남은 부분"));
        assert_eq!(store.recovery_report().corrupt_lines, 1);
    }

    #[tokio::test]
    async fn test_flush_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("gone");
        let path = sub.join("carryover.jsonl");

        let store = CarryoverStore::open(&path, None).await.unwrap();
        tokio::fs::remove_dir_all(&sub).await.unwrap();
        store.put("cp_a", "tail", "p001", "p002");

        let result = store.flush().await;
        assert!(matches!(result, Err(CarryoverError::WriteFailed { .. })));
        // Entry survives in memory for the next page
        assert_eq!(store.get("cp_a").as_deref(), Some("tail"));
    }

    #[tokio::test]
    async fn test_in_memory_flush_is_noop() {
        let store = CarryoverStore::in_memory(None);
        store.put("cp_a", "tail", "p001", "p002");
        assert_eq!(store.flush().await.unwrap(), 0);
        assert!(store.path().is_none());
    }
}
