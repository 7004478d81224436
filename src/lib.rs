// src/lib.rs
//
// Crate root — module list plus the public re-exports callers need to run
// an upload: plan a FileJob, hand it a coordinator and a transport, await
// the report.

pub mod chunk;
pub mod constants;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod job;
pub mod processor;
pub mod progress;
pub mod reader;
pub mod resolver;
pub mod resume;
pub mod retry;
pub mod transport;

pub use chunk::{Chunk, plan_chunks};
pub use coordinator::{HttpCoordinator, SlotRequest, UploadCoordinator, UploadSlot};
pub use engine::{PoolConfig, PoolStats, UploadPool};
pub use error::{Result, UploadError};
pub use job::{FileJob, JobConfig, JobReport};
pub use processor::{ChunkPayload, prepare_payload, process_chunk};
pub use progress::{ChunkOutcome, ChunkStatus, ProgressSnapshot, ProgressTracker};
pub use reader::ChunkReader;
pub use resolver::HostResolver;
pub use resume::{ResumeState, ResumeStore};
pub use retry::{RetryConfig, with_retry};
pub use transport::{ChunkTransport, RotatingTransport, TransportConfig};
