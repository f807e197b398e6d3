use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::AppResult;

const JOURNAL_STEM: &str = "sync-journal";
const MIN_QUEUE_LIMIT: usize = 64;
const QUEUED_BATCHES: usize = 8;

/// While the journal cannot be written, events stay queued up to a fixed
/// limit; past it the oldest are dropped and counted.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    queue: Arc<Mutex<VecDeque<TelemetryEvent>>>,
    dropped: Arc<AtomicU64>,
    journal_path: Option<PathBuf>,
    batch_size: usize,
    queue_limit: usize,
    max_file_bytes: u64,
    max_file_count: usize,
    #[cfg(test)]
    fault_injector: Option<Arc<TestFaultInjector>>,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(dir: P, config: &AppConfig) -> AppResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let journal_path = dir.join(format!("{JOURNAL_STEM}.jsonl"));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;

        let batch_size = config.telemetry_batch_size.max(1);
        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled)),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            dropped: Arc::new(AtomicU64::new(0)),
            journal_path: Some(journal_path),
            batch_size,
            queue_limit: batch_size.saturating_mul(QUEUED_BATCHES).max(MIN_QUEUE_LIMIT),
            max_file_bytes: config.telemetry_buffer_max_bytes,
            max_file_count: config.telemetry_buffer_max_files.max(1),
            #[cfg(test)]
            fault_injector: None,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            dropped: Arc::new(AtomicU64::new(0)),
            journal_path: None,
            batch_size: 1,
            queue_limit: MIN_QUEUE_LIMIT,
            max_file_bytes: 0,
            max_file_count: 1,
            #[cfg(test)]
            fault_injector: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        match (&config.telemetry_dir, config.telemetry_enabled) {
            (Some(dir), true) => Self::new(dir, config),
            _ => Ok(Self::disabled()),
        }
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut queue = self.queue.lock();
        queue.push_back(TelemetryEvent::new(name.into(), payload));
        let excess = queue.len().saturating_sub(self.queue_limit);
        if excess > 0 {
            queue.drain(..excess);
            self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
        }
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.journal_path.is_some() && self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn persist_locked(&self, queue: &mut VecDeque<TelemetryEvent>) -> AppResult<()> {
        let Some(path) = self.journal_path.as_deref() else {
            queue.clear();
            return Ok(());
        };
        if queue.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::new();
        for event in queue.iter() {
            serde_json::to_writer(&mut encoded, event)?;
            encoded.push(b'\n');
        }

        self.rotate_if_needed(path, encoded.len() as u64)?;

        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .map(|hooks| hooks.take_disk_full())
            .unwrap_or(false)
        {
            return Err(crate::errors::AppError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "simulated disk full",
            )));
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&encoded)?;
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, path: &Path, incoming_bytes: u64) -> AppResult<()> {
        let current = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if current == 0 || current + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count <= 1 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            return Ok(());
        }

        let oldest = rotated_path(path, self.max_file_count - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for generation in (1..self.max_file_count - 1).rev() {
            let from = rotated_path(path, generation);
            if from.exists() {
                fs::rename(&from, rotated_path(path, generation + 1))?;
            }
        }
        fs::rename(path, rotated_path(path, 1))?;
        Ok(())
    }
}

fn rotated_path(path: &Path, generation: usize) -> PathBuf {
    path.with_file_name(format!("{JOURNAL_STEM}.{generation}.jsonl"))
}

#[cfg(test)]
#[derive(Default)]
pub struct TestFaultInjector {
    disk_full_writes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl TestFaultInjector {
    pub fn fail_next_disk_full(&self, writes: usize) {
        self.disk_full_writes.store(writes, Ordering::SeqCst);
    }

    fn take_disk_full(&self) -> bool {
        self.disk_full_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
impl TelemetryClient {
    pub fn enable_test_hooks(&mut self) -> Arc<TestFaultInjector> {
        let hooks = Arc::new(TestFaultInjector::default());
        self.fault_injector = Some(hooks.clone());
        hooks
    }
}

#[derive(Debug, Serialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl TelemetryEvent {
    fn new(name: String, payload: serde_json::Value) -> Self {
        Self {
            name,
            timestamp: Utc::now(),
            payload,
        }
    }
}
