//! Error types for the converter core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Configuration and capacity errors propagate to callers of `resolve` and
//! `schedule`. Pipeline errors are caught at the pipeline boundary and turn
//! into a job pause.

use thiserror::Error;
use ulid::Ulid;

/// Result type alias for converter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the converter.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Start position could not be determined
    #[error("Position error: {0}")]
    Position(#[from] PositionError),

    /// Job lifecycle error
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// Scheduler admission or lookup error
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Rawdata source error
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Dataset storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Local debug storage error
    #[error("Debug storage error: {0}")]
    DebugSink(#[from] DebugSinkError),

    /// Converter error
    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// Decryption error
    #[error("Decryption error: {0}")]
    Decrypt(#[from] DecryptError),

    /// Metrics registration or export error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// True for errors caused by invalid configuration (never by runtime I/O).
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Position(PositionError::InvalidPosition { .. }))
    }
}

/// Configuration resolution and validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A parent reference could not be followed
    #[error("Cyclic or missing parent '{parent}' referenced from '{config}'")]
    CyclicOrMissingParent { config: String, parent: String },

    /// One or more required properties are absent
    #[error("Missing properties in {config} converter job config: {properties:?}")]
    MissingRequiredProperty {
        config: String,
        properties: Vec<String>,
    },

    /// The referenced rawdata source is not registered
    #[error("Missing rawdata-source definition for {0}")]
    UnknownSourceReference(String),

    /// No fragment registered under the name
    #[error("Unknown converter job config '{0}'")]
    UnknownJobConfig(String),

    /// A property is present but has an illegal value
    #[error("Invalid value for {property}: {message}")]
    InvalidValue { property: String, message: String },

    /// Malformed configuration file or payload
    #[error("{0}")]
    Malformed(String),
}

/// Errors resolving the initial stream position.
#[derive(Error, Debug)]
pub enum PositionError {
    /// The position symbol is neither FIRST, LAST nor a ulid
    #[error("Invalid initial position '{value}': expected 'FIRST', 'LAST' or a valid ulid")]
    InvalidPosition { value: String },

    /// Looking up the last converted record failed
    #[error("Unable to determine last position at {location}: {message}")]
    LastPositionNotFound { location: String, message: String },
}

/// Job lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// Transition not allowed from the current state
    #[error("Job {job_id}: cannot {transition} while {state}")]
    IllegalStateTransition {
        job_id: Ulid,
        transition: &'static str,
        state: crate::runtime::JobState,
    },

    /// The job's pipeline task has exited
    #[error("Job {job_id}: pipeline is not running")]
    PipelineNotRunning { job_id: Ulid },
}

/// Scheduler errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Admission would exceed the concurrency cap
    #[error("Capacity exceeded: at most {max} concurrent jobs allowed")]
    CapacityExceeded { max: usize },

    /// No job registered under the id
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A job with the same id is still active
    #[error("Job {0} is already scheduled")]
    JobExists(Ulid),
}

/// Rawdata source errors.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source has been closed and yields no more messages
    #[error("Rawdata source closed")]
    Closed,

    /// Unknown topic
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// A message could not be decoded
    #[error("Message parse error: {0}")]
    MessageParse(String),

    /// Generic source failure
    #[error("{0}")]
    Other(String),
}

/// Dataset storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Unsupported or malformed storage root
    #[error("Invalid storage location: {0}")]
    InvalidLocation(String),

    /// Parquet encoding failed
    #[error("Parquet write error: {0}")]
    ParquetWrite(String),

    /// Parquet decoding failed
    #[error("Parquet read error: {0}")]
    ParquetRead(String),

    /// Records did not match the target schema
    #[error("Record encoding error: {0}")]
    RecordEncoding(String),

    /// Object store failure
    #[error("Object store error: {0}")]
    ObjectStore(String),
}

/// Local debug storage errors.
#[derive(Error, Debug)]
pub enum DebugSinkError {
    /// Misconfigured debug storage
    #[error("Invalid debug storage configuration: {0}")]
    InvalidConfig(String),

    /// Writing a debug file failed
    #[error("Error writing {path}: {message}")]
    WriteFailed { path: String, message: String },
}

/// Errors raised by a converter.
#[derive(Error, Debug)]
pub enum ConversionError {
    /// Converter could not be created or initialized
    #[error("Converter init failed: {0}")]
    Init(String),

    /// A message could not be converted at all
    #[error("Failed to convert message {ulid}: {message}")]
    Convert { ulid: Ulid, message: String },
}

/// Decryption errors.
#[derive(Error, Debug)]
pub enum DecryptError {
    /// Decryptor could not be constructed
    #[error("Decryptor setup failed: {0}")]
    Setup(String),

    /// A message entry could not be decrypted
    #[error("Failed to decrypt message with ulid={ulid}: {message}")]
    Failed { ulid: Ulid, message: String },
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(ConfigError::Malformed(err.to_string()))
    }
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        StorageError::ObjectStore(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::JobState;

    #[test]
    fn test_error_display() {
        let err = Error::Config(ConfigError::UnknownSourceReference("blah".into()));
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing rawdata-source definition for blah"
        );

        let err = ConfigError::MissingRequiredProperty {
            config: "someJobConfig".into(),
            properties: vec!["rawdata_source.name".into()],
        };
        assert!(err
            .to_string()
            .starts_with("Missing properties in someJobConfig converter job config:"));
    }

    #[test]
    fn test_illegal_transition_names_state() {
        let id = Ulid::new();
        let err = JobError::IllegalStateTransition {
            job_id: id,
            transition: "pause",
            state: JobState::New,
        };
        assert_eq!(err.to_string(), format!("Job {}: cannot pause while NEW", id));
    }

    #[test]
    fn test_error_classification() {
        let err: Error = ConfigError::Malformed("bad".into()).into();
        assert!(err.is_config_error());

        let err: Error = StorageError::ParquetWrite("disk full".into()).into();
        assert!(!err.is_config_error());

        let err: Error = PositionError::InvalidPosition { value: "x".into() }.into();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_capacity_error_display() {
        let err = SchedulerError::CapacityExceeded { max: 1 };
        assert_eq!(
            err.to_string(),
            "Capacity exceeded: at most 1 concurrent jobs allowed"
        );
    }
}
