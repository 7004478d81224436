// src/constants.rs
//
// Centralized constants for chunklift to avoid hardcoded values throughout the codebase

/// Default target chunk size (16 MB)
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Largest chunk size the remote store accepts (5 GB)
pub const MAX_CHUNK_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of chunks per remote object imposed by the service
pub const MAX_CHUNK_COUNT: u64 = 10_000;

/// Default maximum attempts per chunk (first try included)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for exponential backoff (milliseconds)
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;

/// Default backoff cap (milliseconds)
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Default jitter factor applied to backoff delays (0.0 to 1.0)
pub const DEFAULT_RETRY_JITTER: f64 = 0.25;

/// Cap on fresh-slot requests within a single chunk attempt.
/// Guards against a service that keeps issuing already-expired slots.
pub const DEFAULT_SLOT_REFRESH_CAP: u32 = 3;

/// Default timeout for one slot-request API call (seconds)
pub const DEFAULT_SLOT_TIMEOUT_SECS: u64 = 30;

/// Default timeout for one chunk PUT (seconds)
pub const DEFAULT_PUT_TIMEOUT_SECS: u64 = 300;

/// Default interval between host re-resolutions (seconds)
pub const DEFAULT_RESOLVE_REFRESH_SECS: u64 = 300;

/// Default cooldown before a failed address is eligible again (seconds)
pub const DEFAULT_ADDR_COOLDOWN_SECS: u64 = 60;

/// zstd level used for chunk payloads. Level 1 keeps CPU cost low
/// relative to network latency.
pub const CHUNK_COMPRESSION_LEVEL: i32 = 1;

/// HTTP status the service uses to signal an expired upload slot
pub const SLOT_EXPIRED_STATUS: u16 = 403;

/// Response header some deployments echo with the byte count they stored.
/// When present it is compared against the declared payload length.
pub const LENGTH_ECHO_HEADER: &str = "x-content-length-received";

/// Resume state format version
pub const RESUME_FORMAT_VERSION: u32 = 1;

/// Default number of transport workers when the caller passes 0
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
