use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cache_tiers::CacheTierManager;
use crate::error_signature::resource_exhaustion_signature;

/// Summary of one completed emergency cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmergencyReport {
    pub reason: String,
    pub entries_flushed: usize,
    pub media_files_removed: usize,
    pub media_bytes_removed: u64,
    pub media_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmergencyOutcome {
    Completed(EmergencyReport),
    /// Another invocation was already running; this one did nothing.
    AlreadyRunning,
}

/// Full-flush recovery path shared by the resource monitor, the ingestion
/// queue error handler and the process panic hook.
///
/// Concurrent or nested invocations short-circuit on the in-progress guard.
#[derive(Debug)]
pub struct EmergencyCleanup {
    cache: Arc<CacheTierManager>,
    media_dirs: Vec<PathBuf>,
    in_progress: AtomicBool,
    completed_runs: AtomicU64,
    skipped_runs: AtomicU64,
}

struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EmergencyCleanup {
    pub fn new(cache: Arc<CacheTierManager>, media_dirs: Vec<PathBuf>) -> Self {
        Self {
            cache,
            media_dirs,
            in_progress: AtomicBool::new(false),
            completed_runs: AtomicU64::new(0),
            skipped_runs: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::Relaxed)
    }

    pub fn skipped_runs(&self) -> u64 {
        self.skipped_runs.load(Ordering::Relaxed)
    }

    /// Flushes every cache tier and purges on-disk media.
    pub fn trigger(&self, reason: &str) -> EmergencyOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped_runs.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(reason, "emergency cleanup already in progress");
            return EmergencyOutcome::AlreadyRunning;
        }
        let _guard = InProgressGuard(&self.in_progress);

        tracing::warn!(reason, "emergency cleanup started");
        let mut report = EmergencyReport {
            reason: reason.to_string(),
            entries_flushed: self.cache.flush_all(),
            ..EmergencyReport::default()
        };
        self.cache.shrink_to_fit();

        for dir in &self.media_dirs {
            match purge_media_dir(dir) {
                Ok((files, bytes, failures)) => {
                    report.media_files_removed += files;
                    report.media_bytes_removed = report.media_bytes_removed.saturating_add(bytes);
                    report.media_failures += failures;
                }
                Err(error) => {
                    report.media_failures += 1;
                    tracing::error!(dir = %dir.display(), %error, "emergency media purge failed");
                }
            }
        }

        self.completed_runs.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            reason,
            entries_flushed = report.entries_flushed,
            media_files_removed = report.media_files_removed,
            media_bytes_removed = report.media_bytes_removed,
            "emergency cleanup finished"
        );
        EmergencyOutcome::Completed(report)
    }

    /// Runs cleanup when `error` carries a resource-exhaustion signature.
    ///
    /// Returns the outcome when a signature matched, `None` otherwise.
    pub fn handle_error(&self, error: &dyn Display) -> Option<EmergencyOutcome> {
        let text = error.to_string();
        let signature = resource_exhaustion_signature(&text)?;
        Some(self.trigger(&format!("error_signature:{signature}")))
    }
}

/// Removes every regular file below `dir`, keeping the directory tree.
fn purge_media_dir(dir: &Path) -> Result<(usize, u64, usize)> {
    if !dir.exists() {
        return Ok((0, 0, 0));
    }
    let mut files = 0_usize;
    let mut bytes = 0_u64;
    let mut failures = 0_usize;
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if file_type.is_dir() {
            match purge_media_dir(&path) {
                Ok((nested_files, nested_bytes, nested_failures)) => {
                    files += nested_files;
                    bytes = bytes.saturating_add(nested_bytes);
                    failures += nested_failures;
                }
                Err(error) => {
                    failures += 1;
                    tracing::warn!(path = %path.display(), %error, "media purge skipped directory");
                }
            }
            continue;
        }
        let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                files += 1;
                bytes = bytes.saturating_add(size);
            }
            Err(error) => {
                failures += 1;
                tracing::warn!(path = %path.display(), %error, "media purge failed to remove file");
            }
        }
    }
    Ok((files, bytes, failures))
}
