// src/resume.rs
//
// Persisted resume state: one JSON file per (local file, remote object)
// pair, rewritten after every acknowledged chunk. On restart, acked chunks
// are skipped; chunk granularity is the unit of idempotence, so nothing
// finer is recorded.

use crate::constants::RESUME_FORMAT_VERSION;
use crate::error::{Result, UploadError};
use crate::progress::ChunkOutcome;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub format_version: u32,
    /// Remote object identity the job is populating
    pub object_id: String,
    pub local_path: PathBuf,
    /// Size of the local file when the job started
    pub local_size: u64,
    /// Modification time (Unix seconds) when the job started
    pub local_mtime: u64,
    pub chunk_size: u64,
    pub compress: bool,
    /// RFC3339 start timestamp
    pub started_at: String,
    pub outcomes: Vec<ChunkOutcome>,
}

impl ResumeState {
    pub fn new(
        object_id: impl Into<String>,
        local_path: impl Into<PathBuf>,
        local_size: u64,
        local_mtime: u64,
        chunk_size: u64,
        compress: bool,
    ) -> Self {
        Self {
            format_version: RESUME_FORMAT_VERSION,
            object_id: object_id.into(),
            local_path: local_path.into(),
            local_size,
            local_mtime,
            chunk_size,
            compress,
            started_at: chrono::Utc::now().to_rfc3339(),
            outcomes: Vec::new(),
        }
    }
}

/// Modification time of a file as Unix seconds
pub fn file_mtime(path: &Path) -> Result<u64> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| UploadError::io(format!("stat {}", path.display()), e))?;
    let mtime = metadata
        .modified()
        .map_err(|e| UploadError::io("reading mtime", e))?;
    Ok(mtime
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0))
}

/// Directory of resume state files
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| UploadError::io(format!("creating {}", dir.display()), e))?;
        Ok(Self { dir })
    }

    /// Stable digest of the job identity. Keys must survive toolchain
    /// upgrades or saved state gets orphaned, so no std hasher here.
    fn state_key(local_path: &Path, object_id: &str) -> String {
        use md5::{Digest, Md5};

        let mut hasher = Md5::new();
        hasher.update(local_path.as_os_str().as_encoded_bytes());
        hasher.update([0u8]);
        hasher.update(object_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn state_path(&self, local_path: &Path, object_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", Self::state_key(local_path, object_id)))
    }

    pub fn save(&self, state: &ResumeState) -> Result<()> {
        let path = self.state_path(&state.local_path, &state.object_id);
        let json = serde_json::to_string(state)
            .map_err(|e| UploadError::resume(format!("serializing resume state: {}", e)))?;
        // Write-then-rename so an interrupted write never leaves a torn file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| UploadError::io("writing resume state", e))?;
        std::fs::rename(&tmp, &path).map_err(|e| UploadError::io("renaming resume state", e))?;
        tracing::debug!(path = %path.display(), "saved resume state");
        Ok(())
    }

    /// Load the state for a job identity, discarding it as stale when the
    /// local file no longer matches what the state recorded.
    pub fn load(&self, local_path: &Path, object_id: &str) -> Result<Option<ResumeState>> {
        let path = self.state_path(local_path, object_id);
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path)
            .map_err(|e| UploadError::io("reading resume state", e))?;
        let state: ResumeState = serde_json::from_str(&json)
            .map_err(|e| UploadError::resume(format!("parsing resume state: {}", e)))?;

        if !self.is_current(&state, local_path)? {
            tracing::info!(path = %path.display(), "resume state is stale, removing");
            self.remove(local_path, object_id)?;
            return Ok(None);
        }

        tracing::info!(
            object_id = %state.object_id,
            acked = state
                .outcomes
                .iter()
                .filter(|o| o.status == crate::progress::ChunkStatus::Acked)
                .count(),
            total = state.outcomes.len(),
            "found valid resume state"
        );
        Ok(Some(state))
    }

    fn is_current(&self, state: &ResumeState, local_path: &Path) -> Result<bool> {
        if state.format_version != RESUME_FORMAT_VERSION {
            return Ok(false);
        }
        let metadata = match std::fs::metadata(local_path) {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };
        if metadata.len() != state.local_size {
            return Ok(false);
        }
        // 1 second tolerance for filesystems with coarse mtime
        let mtime = file_mtime(local_path)?;
        if mtime.abs_diff(state.local_mtime) > 1 {
            return Ok(false);
        }
        Ok(true)
    }

    pub fn remove(&self, local_path: &Path, object_id: &str) -> Result<()> {
        let path = self.state_path(local_path, object_id);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| UploadError::io("removing resume state", e))?;
            tracing::debug!(path = %path.display(), "removed resume state");
        }
        Ok(())
    }
}

/// Hook handed to the progress tracker for incremental persistence
#[derive(Debug, Clone)]
pub struct ResumePersist {
    store: ResumeStore,
    base: ResumeState,
}

impl ResumePersist {
    pub fn new(store: ResumeStore, base: ResumeState) -> Self {
        Self { store, base }
    }

    pub fn save_outcomes(&self, outcomes: &[ChunkOutcome]) -> Result<()> {
        let mut state = self.base.clone();
        state.outcomes = outcomes.to_vec();
        self.store.save(&state)
    }
}
