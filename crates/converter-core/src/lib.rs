//! Converter Core - rawdata stream to columnar dataset conversion engine
//!
//! This library turns ordered, resumable streams of multi-part rawdata
//! messages into versioned Parquet datasets with:
//!
//! - Hierarchical job configuration with inheritance
//! - Resumable start positions (FIRST, LAST, explicit ulid)
//! - Count-or-time windowed conversion with fail-stop pausing
//! - A concurrency-capped job scheduler with pause/resume/stop control

pub mod config;
pub mod convert;
pub mod crypto;
pub mod debug;
pub mod error;
pub mod health;
pub mod job;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod pipeline;
pub mod position;
pub mod runtime;
pub mod scheduler;
pub mod source;
pub mod storage;

// Re-export commonly used types
pub use config::{Config, ConfigResolver, EffectiveJobConfig, JobConfigFragment};
pub use error::{ConfigError, JobError, PositionError, SchedulerError, SourceError, StorageError};
pub use error::{Error, Result};
pub use job::{ConverterJob, ExecutionSummary, JobContext};
pub use message::RawdataMessage;
pub use runtime::{JobRuntime, JobState};
pub use scheduler::JobScheduler;
