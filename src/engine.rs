// src/engine.rs
//
// The transport worker pool: a bounded set of concurrent workers, each
// driving one chunk at a time through process → slot request → PUT, with
// exponential backoff between attempts and a capped fresh-slot loop on
// expiry. Chunks may complete in any order; index order is only the
// dispatch tie-break so scheduling and resume logs stay deterministic.

use crate::chunk::Chunk;
use crate::constants::{
    DEFAULT_PUT_TIMEOUT_SECS, DEFAULT_SLOT_REFRESH_CAP, DEFAULT_SLOT_TIMEOUT_SECS,
    default_worker_count,
};
use crate::coordinator::{SlotRequest, UploadCoordinator};
use crate::error::{Result, UploadError};
use crate::processor::process_chunk;
use crate::progress::ProgressTracker;
use crate::reader::ChunkReader;
use crate::retry::RetryConfig;
use crate::transport::ChunkTransport;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent workers; 0 means available parallelism
    pub workers: usize,
    pub compress: bool,
    pub retry: RetryConfig,
    /// Fresh-slot requests allowed within one attempt before the expiry
    /// is treated as an ordinary retryable failure
    pub slot_refresh_cap: u32,
    pub slot_timeout: Duration,
    pub put_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            compress: false,
            retry: RetryConfig::default(),
            slot_refresh_cap: DEFAULT_SLOT_REFRESH_CAP,
            slot_timeout: Duration::from_secs(DEFAULT_SLOT_TIMEOUT_SECS),
            put_timeout: Duration::from_secs(DEFAULT_PUT_TIMEOUT_SECS),
        }
    }
}

/// What the pool moved, for reporting
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub uploaded_chunks: usize,
    /// Bytes that actually travelled the wire (post-compression)
    pub wire_bytes: u64,
    pub elapsed: Duration,
}

pub struct UploadPool {
    cfg: PoolConfig,
}

impl UploadPool {
    pub fn new(mut cfg: PoolConfig) -> Self {
        if cfg.workers == 0 {
            cfg.workers = default_worker_count();
        }
        Self { cfg }
    }

    /// Drive every chunk in `work` to `Acked` or fail the pool.
    ///
    /// The first fatal chunk error cancels the remaining work; in-flight
    /// attempts are abandoned as failed-retryable, already-acked chunks
    /// stay acked for a later resume.
    pub async fn run(
        &self,
        mut work: Vec<Chunk>,
        reader: ChunkReader,
        coordinator: Arc<dyn UploadCoordinator>,
        transport: Arc<dyn ChunkTransport>,
        tracker: Arc<ProgressTracker>,
        cancel: CancellationToken,
    ) -> Result<PoolStats> {
        let started = Instant::now();
        work.sort_by_key(|c| c.index);

        tracing::info!(
            chunks = work.len(),
            workers = self.cfg.workers,
            compress = self.cfg.compress,
            "starting upload pool"
        );

        let cfg = self.cfg.clone();
        let mut results = stream::iter(work.into_iter().map(|chunk| {
            let cfg = cfg.clone();
            let reader = reader.clone();
            let coordinator = Arc::clone(&coordinator);
            let transport = Arc::clone(&transport);
            let tracker = Arc::clone(&tracker);
            let cancel = cancel.clone();
            async move {
                upload_chunk(cfg, chunk, reader, coordinator, transport, tracker, cancel).await
            }
        }))
        .buffer_unordered(self.cfg.workers);

        let mut first_error: Option<UploadError> = None;
        let mut uploaded_chunks = 0usize;
        let mut wire_bytes = 0u64;
        while let Some(outcome) = results.next().await {
            match outcome {
                Ok(wire_len) => {
                    uploaded_chunks += 1;
                    wire_bytes += wire_len;
                }
                Err(err) => {
                    if first_error.is_none() {
                        // Stop handing out new work; drain what is in flight
                        cancel.cancel();
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        Ok(PoolStats {
            uploaded_chunks,
            wire_bytes,
            elapsed: started.elapsed(),
        })
    }
}

/// Drive one chunk to `Acked`, retrying retryable failures with backoff up
/// to the attempt cap. Returns the wire length on success.
async fn upload_chunk(
    cfg: PoolConfig,
    chunk: Chunk,
    reader: ChunkReader,
    coordinator: Arc<dyn UploadCoordinator>,
    transport: Arc<dyn ChunkTransport>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
) -> Result<u64> {
    let index = chunk.index;
    loop {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        tracker.begin_attempt(index)?;
        let attempt = tracker.attempts(index);

        // Biased so an attempt that completed in the same poll as the
        // cancellation still records its result.
        let outcome = tokio::select! {
            biased;
            res = attempt_once(&cfg, chunk, &reader, &*coordinator, &*transport, &tracker) => res,
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
        };

        match outcome {
            Ok(wire_len) => {
                tracker.mark_acked(index)?;
                tracing::debug!(chunk = index, attempt, wire_len, "chunk acked");
                return Ok(wire_len);
            }
            Err(UploadError::Cancelled) => {
                // An abandoned attempt is a failed, retryable attempt, not
                // corruption: reset to Pending for a later resume.
                tracker.mark_retry(index, &UploadError::Cancelled)?;
                return Err(UploadError::Cancelled);
            }
            Err(err) if !err.is_retryable() => {
                tracker.mark_failed(index, &err)?;
                tracing::error!(chunk = index, attempt, error = %err, "chunk failed permanently");
                return Err(err);
            }
            Err(err) => {
                if attempt >= cfg.retry.max_attempts {
                    tracker.mark_failed(index, &err)?;
                    tracing::error!(
                        chunk = index,
                        attempts = attempt,
                        error = %err,
                        "chunk exhausted its attempt budget"
                    );
                    return Err(UploadError::AttemptsExhausted {
                        index,
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                tracker.mark_retry(index, &err)?;
                let delay = cfg.retry.delay_for(attempt);
                tracing::warn!(
                    chunk = index,
                    attempt,
                    max_attempts = cfg.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "chunk attempt failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// One attempt: process the chunk, negotiate a slot, PUT. Slot expiry
/// (local or reported by the PUT) refreshes the slot up to the cap without
/// consuming the attempt budget; a stale slot is never reused.
async fn attempt_once(
    cfg: &PoolConfig,
    chunk: Chunk,
    reader: &ChunkReader,
    coordinator: &dyn UploadCoordinator,
    transport: &dyn ChunkTransport,
    tracker: &ProgressTracker,
) -> Result<u64> {
    let index = chunk.index;

    let payload = process_chunk(reader, chunk, cfg.compress).await?;
    tracker.mark_compressed(index, payload.wire_len(), &payload.checksum)?;

    let request = SlotRequest {
        index,
        size: payload.wire_len(),
        md5: payload.checksum.clone(),
        compressed: payload.compressed,
    };

    let mut refreshes = 0u32;
    loop {
        let slot = tokio::time::timeout(cfg.slot_timeout, coordinator.request_slot(&request))
            .await
            .map_err(|_| {
                UploadError::transport(format!("slot request for chunk {} timed out", index))
            })??;

        if slot.is_expired() {
            refreshes += 1;
            if refreshes > cfg.slot_refresh_cap {
                return Err(UploadError::SlotExpired { index });
            }
            tracing::debug!(chunk = index, "slot already expired, requesting a fresh one");
            continue;
        }

        tracker.mark_slot_requested(index)?;
        tracker.mark_uploading(index)?;

        let put = transport.put_chunk(index, &slot, payload.bytes.clone());
        match tokio::time::timeout(cfg.put_timeout, put).await {
            Err(_) => {
                return Err(UploadError::transport(format!(
                    "chunk {} PUT timed out",
                    index
                )));
            }
            Ok(Ok(())) => return Ok(payload.wire_len()),
            Ok(Err(UploadError::SlotExpired { .. })) => {
                refreshes += 1;
                if refreshes > cfg.slot_refresh_cap {
                    return Err(UploadError::SlotExpired { index });
                }
                tracing::debug!(chunk = index, "slot expired mid-attempt, requesting a fresh one");
            }
            Ok(Err(err)) => return Err(err),
        }
    }
}
