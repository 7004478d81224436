// src/job.rs
//
// FileJob: validates configuration once, owns the chunk plan and outcome
// table for its lifetime, runs the worker pool, and seals the remote
// object after every chunk is acknowledged.

use crate::chunk::{Chunk, plan_chunks};
use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_PUT_TIMEOUT_SECS, DEFAULT_SLOT_REFRESH_CAP,
    DEFAULT_SLOT_TIMEOUT_SECS,
};
use crate::coordinator::UploadCoordinator;
use crate::engine::{PoolConfig, UploadPool};
use crate::error::{Result, UploadError};
use crate::progress::ProgressTracker;
use crate::reader::ChunkReader;
use crate::resume::{ResumePersist, ResumeState, ResumeStore, file_mtime};
use crate::retry::{RetryConfig, with_retry};
use crate::transport::ChunkTransport;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Remote object identity this job populates
    pub object_id: String,
    pub chunk_size: u64,
    pub compress: bool,
    /// 0 means available parallelism
    pub workers: usize,
    pub retry: RetryConfig,
    pub slot_refresh_cap: u32,
    pub slot_timeout: Duration,
    pub put_timeout: Duration,
    /// Overall deadline; elapsing it aborts all workers
    pub deadline: Option<Duration>,
}

impl JobConfig {
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            compress: false,
            workers: 0,
            retry: RetryConfig::default(),
            slot_refresh_cap: DEFAULT_SLOT_REFRESH_CAP,
            slot_timeout: Duration::from_secs(DEFAULT_SLOT_TIMEOUT_SECS),
            put_timeout: Duration::from_secs(DEFAULT_PUT_TIMEOUT_SECS),
            deadline: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.object_id.is_empty() {
            return Err(UploadError::configuration("object_id must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(UploadError::configuration("max_attempts must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(UploadError::configuration(
                "retry jitter must be within 0.0..=1.0",
            ));
        }
        // Chunk size bounds are enforced by the planner
        Ok(())
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            compress: self.compress,
            retry: self.retry.clone(),
            slot_refresh_cap: self.slot_refresh_cap,
            slot_timeout: self.slot_timeout,
            put_timeout: self.put_timeout,
        }
    }
}

/// Outcome of a completed job
#[derive(Debug, Clone)]
pub struct JobReport {
    pub object_id: String,
    /// Source bytes acknowledged; equals the file size on success
    pub bytes_acked: u64,
    pub total_bytes: u64,
    pub chunk_count: usize,
    /// Chunks uploaded by this run
    pub uploaded_chunks: usize,
    /// Chunks already acked by a previous run and skipped here
    pub skipped_chunks: usize,
    /// Bytes that travelled the wire this run (post-compression)
    pub wire_bytes: u64,
    pub elapsed: Duration,
}

pub struct FileJob {
    cfg: JobConfig,
    reader: ChunkReader,
    chunks: Vec<Chunk>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    resume_store: Option<ResumeStore>,
}

impl FileJob {
    /// Plan a fresh upload of `path`
    pub fn new(path: impl AsRef<Path>, cfg: JobConfig) -> Result<Self> {
        cfg.validate()?;
        let reader = ChunkReader::open(path)?;
        let chunks = plan_chunks(reader.len(), cfg.chunk_size)?;
        let tracker = Arc::new(ProgressTracker::new(&chunks));
        Ok(Self {
            cfg,
            reader,
            chunks,
            tracker,
            cancel: CancellationToken::new(),
            resume_store: None,
        })
    }

    /// Plan an upload of `path`, resuming from persisted state when a
    /// valid one exists for this (file, object) identity. Outcomes are
    /// re-persisted after every acknowledged chunk.
    pub fn with_resume(path: impl AsRef<Path>, cfg: JobConfig, store: ResumeStore) -> Result<Self> {
        cfg.validate()?;
        let reader = ChunkReader::open(path)?;
        let chunks = plan_chunks(reader.len(), cfg.chunk_size)?;

        let saved = store.load(reader.path(), &cfg.object_id)?;
        let tracker = match saved {
            // Identical planning inputs are required for the saved table to
            // describe the same chunks
            Some(state) if state.chunk_size == cfg.chunk_size && state.compress == cfg.compress => {
                ProgressTracker::restore(&chunks, &state.outcomes)?
            }
            Some(_) => {
                tracing::info!("resume state used different job parameters, starting over");
                ProgressTracker::new(&chunks)
            }
            None => ProgressTracker::new(&chunks),
        };

        let base = ResumeState::new(
            &cfg.object_id,
            reader.path(),
            reader.len(),
            file_mtime(reader.path())?,
            cfg.chunk_size,
            cfg.compress,
        );
        let tracker =
            Arc::new(tracker.with_persistence(ResumePersist::new(store.clone(), base)));

        Ok(Self {
            cfg,
            reader,
            chunks,
            tracker,
            cancel: CancellationToken::new(),
            resume_store: Some(store),
        })
    }

    /// Token that aborts the job when cancelled: in-flight attempts are
    /// abandoned, acked chunks stay acked for a later resume.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Upload every outstanding chunk, then close the remote object.
    pub async fn run(
        &self,
        coordinator: Arc<dyn UploadCoordinator>,
        transport: Arc<dyn ChunkTransport>,
    ) -> Result<JobReport> {
        let started = Instant::now();

        let outstanding: Vec<Chunk> = {
            let pending = self.tracker.outstanding();
            self.chunks
                .iter()
                .filter(|c| pending.contains(&c.index))
                .copied()
                .collect()
        };
        let skipped_chunks = self.chunks.len() - outstanding.len();
        tracing::info!(
            object_id = %self.cfg.object_id,
            total_chunks = self.chunks.len(),
            outstanding = outstanding.len(),
            skipped = skipped_chunks,
            total_bytes = self.tracker.total_bytes(),
            "starting file job"
        );

        let pool = UploadPool::new(self.cfg.pool_config());
        let run = pool.run(
            outstanding,
            self.reader.clone(),
            Arc::clone(&coordinator),
            transport,
            Arc::clone(&self.tracker),
            self.cancel.child_token(),
        );

        let stats = match self.cfg.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, run).await {
                Ok(result) => result?,
                Err(_) => {
                    self.cancel.cancel();
                    return Err(UploadError::DeadlineExceeded);
                }
            },
            None => run.await?,
        };

        // Close gate: a precondition, not a race. The pool returning Ok
        // with unacked chunks would be an ordering bug.
        if !self.tracker.all_acked() {
            return Err(UploadError::IncompleteUpload {
                outstanding: self.tracker.outstanding().len(),
            });
        }
        with_retry(&self.cfg.retry, "close", || {
            coordinator.acknowledge_completion()
        })
        .await?;

        if let Some(store) = &self.resume_store {
            store.remove(self.reader.path(), &self.cfg.object_id)?;
        }

        let report = JobReport {
            object_id: self.cfg.object_id.clone(),
            bytes_acked: self.tracker.bytes_acked(),
            total_bytes: self.tracker.total_bytes(),
            chunk_count: self.chunks.len(),
            uploaded_chunks: stats.uploaded_chunks,
            skipped_chunks,
            wire_bytes: stats.wire_bytes,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            object_id = %report.object_id,
            bytes = report.bytes_acked,
            chunks = report.chunk_count,
            uploaded = report.uploaded_chunks,
            skipped = report.skipped_chunks,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "file job complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(JobConfig::new("obj-1").validate().is_ok());

        let mut cfg = JobConfig::new("");
        assert!(cfg.validate().is_err());

        cfg = JobConfig::new("obj-1");
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());

        cfg = JobConfig::new("obj-1");
        cfg.retry.jitter = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_chunk_size_fails_before_any_network_activity() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut f, b"data").unwrap();

        let mut cfg = JobConfig::new("obj-1");
        cfg.chunk_size = 0;
        assert!(matches!(
            FileJob::new(f.path(), cfg),
            Err(UploadError::Configuration { .. })
        ));
    }

    #[test]
    fn empty_file_is_rejected() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            FileJob::new(f.path(), JobConfig::new("obj-1")),
            Err(UploadError::Configuration { .. })
        ));
    }
}
