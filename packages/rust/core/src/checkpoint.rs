//! Resumable progress watermark.
//!
//! Workers finish records out of order. The persisted index only ever moves
//! to the end of the contiguous run of completed indices, so resuming from
//! `last_processed_index + 1` never skips a record that was still in flight.
//! Completions past a gap wait in `pending` until the gap closes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use recordflow_shared::Result;
use recordflow_shared::store::{read_json, write_json_atomic};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CheckpointFile {
    last_processed_index: i64,
}

/// Read the persisted watermark. Missing or unreadable files mean "nothing
/// processed yet" (`-1`).
pub fn load_checkpoint(path: &Path) -> i64 {
    match read_json::<CheckpointFile>(path) {
        Ok(Some(state)) => state.last_processed_index.max(-1),
        Ok(None) => -1,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable checkpoint, starting from the beginning");
            -1
        }
    }
}

#[derive(Debug)]
struct Watermark {
    last: i64,
    pending: BTreeSet<i64>,
}

/// Shared checkpoint; every worker reports completions here.
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    state: Mutex<Watermark>,
}

impl Checkpoint {
    /// Start tracking after `last_processed` (use `-1` for a fresh run).
    pub fn new(path: impl Into<PathBuf>, last_processed: i64) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(Watermark {
                last: last_processed,
                pending: BTreeSet::new(),
            }),
        }
    }

    /// Mark `index` finished. Persists when the watermark advances.
    pub fn complete(&self, index: i64) -> Result<()> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;
        if index <= state.last {
            return Ok(());
        }
        state.pending.insert(index);

        let before = state.last;
        while state.pending.remove(&(state.last + 1)) {
            state.last += 1;
        }
        if state.last == before {
            return Ok(());
        }
        write_json_atomic(
            &self.path,
            &CheckpointFile {
                last_processed_index: state.last,
            },
        )
    }

    /// Persist the current watermark unconditionally.
    pub fn save(&self) -> Result<()> {
        let last = self.last_processed();
        write_json_atomic(
            &self.path,
            &CheckpointFile {
                last_processed_index: last,
            },
        )
    }

    pub fn last_processed(&self) -> i64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).last
    }

    /// Completions still waiting behind an unfinished index.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("rf-checkpoint-{}", Uuid::now_v7()))
            .join("processing_state.json")
    }

    #[test]
    fn missing_and_corrupt_files_start_fresh() {
        let path = temp_path();
        assert_eq!(load_checkpoint(&path), -1);

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(load_checkpoint(&path), -1);

        Checkpoint::new(&path, 41).save().unwrap();
        assert_eq!(load_checkpoint(&path), 41);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn out_of_order_completion_never_skips_in_flight_records() {
        let path = temp_path();
        let checkpoint = Checkpoint::new(&path, -1);

        checkpoint.complete(2).unwrap();
        checkpoint.complete(1).unwrap();
        assert_eq!(checkpoint.last_processed(), -1);
        assert_eq!(load_checkpoint(&path), -1);
        assert_eq!(checkpoint.pending(), 2);

        checkpoint.complete(0).unwrap();
        assert_eq!(checkpoint.last_processed(), 2);
        assert_eq!(load_checkpoint(&path), 2);
        assert_eq!(checkpoint.pending(), 0);

        checkpoint.complete(4).unwrap();
        assert_eq!(load_checkpoint(&path), 2);
        checkpoint.complete(3).unwrap();
        assert_eq!(load_checkpoint(&path), 4);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn watermark_is_monotonic() {
        let path = temp_path();
        let checkpoint = Checkpoint::new(&path, 9);
        checkpoint.complete(5).unwrap();
        assert_eq!(checkpoint.last_processed(), 9);
        checkpoint.complete(10).unwrap();
        assert_eq!(load_checkpoint(&path), 10);
        checkpoint.complete(10).unwrap();
        assert_eq!(checkpoint.last_processed(), 10);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn concurrent_completion_reaches_the_end() {
        let path = temp_path();
        let checkpoint = std::sync::Arc::new(Checkpoint::new(&path, -1));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let checkpoint = std::sync::Arc::clone(&checkpoint);
                std::thread::spawn(move || {
                    for i in (0..100).rev().filter(|i| i % 4 == t) {
                        checkpoint.complete(i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(checkpoint.last_processed(), 99);
        assert_eq!(load_checkpoint(&path), 99);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
