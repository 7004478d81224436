// src/progress.rs
//
// Per-chunk outcome table and aggregate progress. The tracker is the one
// place chunk state changes; workers hold a shared handle and every update
// goes through the table's lock, so two workers can never record
// conflicting outcomes for the same chunk index.

use crate::chunk::Chunk;
use crate::error::{Result, UploadError};
use crate::resume::ResumePersist;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Chunk attempt state machine. Transitions are strictly forward within an
/// attempt, except `Uploading → SlotRequested` (fresh slot after expiry)
/// and `Failed → Pending` (retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Compressed,
    SlotRequested,
    Uploading,
    Acked,
    Failed,
}

impl ChunkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkStatus::Acked | ChunkStatus::Failed)
    }
}

/// Pure transition predicate, testable without any tracker.
pub fn transition_allowed(from: ChunkStatus, to: ChunkStatus) -> bool {
    use ChunkStatus::*;
    matches!(
        (from, to),
        (Pending, InFlight)
            | (InFlight, Compressed)
            | (Compressed, SlotRequested)
            | (SlotRequested, Uploading)
            | (Uploading, SlotRequested)
            | (Uploading, Acked)
            | (InFlight | Compressed | SlotRequested | Uploading, Failed)
            | (Failed, Pending)
    )
}

/// Mutable per-chunk record owned by the tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkOutcome {
    pub status: ChunkStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Wire length of the payload that was (or will be) transmitted
    pub payload_len: Option<u64>,
    /// MD5 hex of the transmitted bytes
    pub checksum: Option<String>,
}

impl Default for ChunkOutcome {
    fn default() -> Self {
        Self {
            status: ChunkStatus::Pending,
            attempts: 0,
            last_error: None,
            payload_len: None,
            checksum: None,
        }
    }
}

/// Aggregated view for reporting
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub total_bytes: u64,
    pub bytes_acked: u64,
    pub chunks_total: usize,
    pub chunks_acked: usize,
    pub outcomes: Vec<ChunkOutcome>,
}

pub struct ProgressTracker {
    chunks: Vec<Chunk>,
    total_bytes: u64,
    bytes_acked: AtomicU64,
    outcomes: Mutex<Vec<ChunkOutcome>>,
    persist: Option<ResumePersist>,
}

impl ProgressTracker {
    pub fn new(chunks: &[Chunk]) -> Self {
        Self {
            chunks: chunks.to_vec(),
            total_bytes: chunks.iter().map(|c| c.len).sum(),
            bytes_acked: AtomicU64::new(0),
            outcomes: Mutex::new(vec![ChunkOutcome::default(); chunks.len()]),
            persist: None,
        }
    }

    /// Rebuild a tracker from persisted outcomes. Acked chunks keep their
    /// record and count toward acknowledged bytes; every other state is
    /// reset to a fresh `Pending` and retried from scratch.
    pub fn restore(chunks: &[Chunk], saved: &[ChunkOutcome]) -> Result<Self> {
        if saved.len() != chunks.len() {
            return Err(UploadError::resume(format!(
                "saved outcome table has {} entries, plan has {} chunks",
                saved.len(),
                chunks.len()
            )));
        }
        let tracker = Self::new(chunks);
        {
            let mut outcomes = tracker.outcomes.lock().unwrap();
            for (i, prior) in saved.iter().enumerate() {
                if prior.status == ChunkStatus::Acked {
                    outcomes[i] = prior.clone();
                    tracker
                        .bytes_acked
                        .fetch_add(chunks[i].len, Ordering::Relaxed);
                }
            }
        }
        Ok(tracker)
    }

    /// Attach incremental resume persistence; the table is written out
    /// after every acknowledgment.
    pub fn with_persistence(mut self, persist: ResumePersist) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked.load(Ordering::Relaxed)
    }

    pub fn all_acked(&self) -> bool {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .all(|o| o.status == ChunkStatus::Acked)
    }

    pub fn is_acked(&self, index: u32) -> bool {
        self.outcomes.lock().unwrap()[index as usize].status == ChunkStatus::Acked
    }

    pub fn attempts(&self, index: u32) -> u32 {
        self.outcomes.lock().unwrap()[index as usize].attempts
    }

    /// Chunk indexes not yet acknowledged, in index order (the resume set)
    pub fn outstanding(&self) -> Vec<u32> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, o)| o.status != ChunkStatus::Acked)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let outcomes = self.outcomes.lock().unwrap().clone();
        ProgressSnapshot {
            total_bytes: self.total_bytes,
            bytes_acked: self.bytes_acked(),
            chunks_total: self.chunks.len(),
            chunks_acked: outcomes
                .iter()
                .filter(|o| o.status == ChunkStatus::Acked)
                .count(),
            outcomes,
        }
    }

    fn apply(
        &self,
        index: u32,
        to: ChunkStatus,
        update: impl FnOnce(&mut ChunkOutcome),
    ) -> Result<()> {
        let mut outcomes = self.outcomes.lock().unwrap();
        let outcome = outcomes
            .get_mut(index as usize)
            .ok_or_else(|| UploadError::configuration(format!("unknown chunk index {}", index)))?;
        if !transition_allowed(outcome.status, to) {
            return Err(UploadError::configuration(format!(
                "conflicting outcome for chunk {}: {:?} -> {:?}",
                index, outcome.status, to
            )));
        }
        outcome.status = to;
        update(outcome);
        Ok(())
    }

    pub fn begin_attempt(&self, index: u32) -> Result<()> {
        self.apply(index, ChunkStatus::InFlight, |o| o.attempts += 1)
    }

    pub fn mark_compressed(&self, index: u32, payload_len: u64, checksum: &str) -> Result<()> {
        self.apply(index, ChunkStatus::Compressed, |o| {
            o.payload_len = Some(payload_len);
            o.checksum = Some(checksum.to_string());
        })
    }

    pub fn mark_slot_requested(&self, index: u32) -> Result<()> {
        self.apply(index, ChunkStatus::SlotRequested, |_| {})
    }

    pub fn mark_uploading(&self, index: u32) -> Result<()> {
        self.apply(index, ChunkStatus::Uploading, |_| {})
    }

    pub fn mark_acked(&self, index: u32) -> Result<()> {
        self.apply(index, ChunkStatus::Acked, |o| o.last_error = None)?;
        self.bytes_acked
            .fetch_add(self.chunks[index as usize].len, Ordering::Relaxed);
        self.persist_table();
        Ok(())
    }

    /// Record a failed attempt that will be retried: `Failed`, then back to
    /// `Pending` so the chunk is eligible again.
    pub fn mark_retry(&self, index: u32, error: &impl std::fmt::Display) -> Result<()> {
        self.apply(index, ChunkStatus::Failed, |o| {
            o.last_error = Some(error.to_string())
        })?;
        self.apply(index, ChunkStatus::Pending, |_| {})
    }

    pub fn mark_failed(&self, index: u32, error: &impl std::fmt::Display) -> Result<()> {
        self.apply(index, ChunkStatus::Failed, |o| {
            o.last_error = Some(error.to_string())
        })?;
        self.persist_table();
        Ok(())
    }

    fn persist_table(&self) {
        if let Some(persist) = &self.persist {
            let outcomes = self.outcomes.lock().unwrap().clone();
            if let Err(err) = persist.save_outcomes(&outcomes) {
                // Persistence trouble must not fail the upload itself
                tracing::warn!(error = %err, "failed to write resume state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks_of(lens: &[u64]) -> Vec<Chunk> {
        let mut offset = 0u64;
        lens.iter()
            .enumerate()
            .map(|(i, &len)| {
                let c = Chunk {
                    index: i as u32,
                    offset,
                    len,
                };
                offset += len;
                c
            })
            .collect()
    }

    fn drive_to_acked(t: &ProgressTracker, index: u32) {
        t.begin_attempt(index).unwrap();
        t.mark_compressed(index, 10, "00").unwrap();
        t.mark_slot_requested(index).unwrap();
        t.mark_uploading(index).unwrap();
        t.mark_acked(index).unwrap();
    }

    #[test]
    fn forward_transitions_only() {
        use ChunkStatus::*;
        assert!(transition_allowed(Pending, InFlight));
        assert!(transition_allowed(Uploading, Acked));
        assert!(transition_allowed(Uploading, SlotRequested));
        assert!(transition_allowed(Failed, Pending));
        assert!(!transition_allowed(Acked, Pending));
        assert!(!transition_allowed(Acked, Failed));
        assert!(!transition_allowed(Pending, Acked));
        assert!(!transition_allowed(Compressed, InFlight));
    }

    #[test]
    fn bytes_aggregate_to_file_size() {
        let chunks = chunks_of(&[100, 100, 50]);
        let t = ProgressTracker::new(&chunks);
        assert_eq!(t.total_bytes(), 250);
        assert_eq!(t.bytes_acked(), 0);

        drive_to_acked(&t, 0);
        drive_to_acked(&t, 2);
        assert_eq!(t.bytes_acked(), 150);
        assert!(!t.all_acked());
        assert_eq!(t.outstanding(), vec![1]);

        drive_to_acked(&t, 1);
        assert_eq!(t.bytes_acked(), 250);
        assert!(t.all_acked());
    }

    #[test]
    fn double_ack_is_a_conflict() {
        let chunks = chunks_of(&[10]);
        let t = ProgressTracker::new(&chunks);
        drive_to_acked(&t, 0);
        assert!(t.begin_attempt(0).is_err());
    }

    #[test]
    fn retry_resets_to_pending_and_counts_attempts() {
        let chunks = chunks_of(&[10]);
        let t = ProgressTracker::new(&chunks);
        t.begin_attempt(0).unwrap();
        t.mark_retry(0, &"503 from service").unwrap();
        t.begin_attempt(0).unwrap();
        assert_eq!(t.attempts(0), 2);
    }

    #[test]
    fn restore_keeps_acked_and_resets_the_rest() {
        let chunks = chunks_of(&[100, 100, 50]);
        let t = ProgressTracker::new(&chunks);
        drive_to_acked(&t, 0);
        t.begin_attempt(1).unwrap();
        t.mark_failed(1, &"rejected").unwrap();

        let saved = t.snapshot().outcomes;
        let restored = ProgressTracker::restore(&chunks, &saved).unwrap();
        assert_eq!(restored.bytes_acked(), 100);
        assert!(restored.is_acked(0));
        assert_eq!(restored.outstanding(), vec![1, 2]);
        assert_eq!(restored.attempts(1), 0);
    }

    #[test]
    fn restore_rejects_mismatched_table() {
        let chunks = chunks_of(&[100, 100]);
        let saved = vec![ChunkOutcome::default()];
        assert!(ProgressTracker::restore(&chunks, &saved).is_err());
    }
}
