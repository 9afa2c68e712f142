//! Append-only NDJSON sinks shared by all workers.
//!
//! Each line is serialized before the lock is taken; the critical section is
//! a single write plus flush, so lines from different workers never interleave.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use recordflow_shared::{Record, RecordFlowError, Result, RetryEntry, Stage};
use serde::Serialize;

/// One NDJSON file opened for appending.
#[derive(Debug)]
pub struct JsonlWriter {
    path: PathBuf,
    file: Mutex<File>,
    written: AtomicUsize,
}

impl JsonlWriter {
    /// Open `path`, creating parent directories. `truncate` starts the file
    /// empty; otherwise new lines are appended to what is there.
    pub fn open(path: impl Into<PathBuf>, truncate: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| RecordFlowError::io(parent, e))?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options
            .open(&path)
            .map_err(|e| RecordFlowError::io(&path, e))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            written: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written through this handle.
    pub fn written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    pub fn append<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value).map_err(|e| {
            RecordFlowError::Storage(format!("serialize line for {}: {e}", self.path.display()))
        })?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(&line)
            .and_then(|()| file.flush())
            .map_err(|e| RecordFlowError::io(&self.path, e))?;
        drop(file);

        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Finished records.
#[derive(Debug)]
pub struct OutputWriter(JsonlWriter);

impl OutputWriter {
    pub fn open(path: impl Into<PathBuf>, truncate: bool) -> Result<Self> {
        JsonlWriter::open(path, truncate).map(Self)
    }

    pub fn write(&self, record: &Record) -> Result<()> {
        self.0.append(record)
    }

    pub fn written(&self) -> usize {
        self.0.written()
    }
}

/// Records that failed a stage, kept exactly as they were read.
#[derive(Debug)]
pub struct RetryLedger(JsonlWriter);

impl RetryLedger {
    pub fn open(path: impl Into<PathBuf>, truncate: bool) -> Result<Self> {
        JsonlWriter::open(path, truncate).map(Self)
    }

    pub fn record(&self, original: &Record, stage: Stage, error: impl ToString) -> Result<()> {
        self.0.append(&RetryEntry {
            original_record: original.clone(),
            failing_stage: stage,
            error_message: error.to_string(),
        })
    }

    /// Entries written during this run.
    pub fn written(&self) -> usize {
        self.0.written()
    }
}
