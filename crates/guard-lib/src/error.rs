//! Error taxonomy for the classification-to-enforcement pipeline

use crate::models::{Direction, OffenderKey};
use thiserror::Error;

/// A flow record or table that could not be turned into features
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PreprocessError {
    #[error("missing required column '{0}'")]
    MissingColumn(String),

    #[error("record {row} has {found} fields, schema expects {expected}")]
    ShortRecord {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("record {row}: malformed {column}: '{value}'")]
    Malformed {
        row: usize,
        column: String,
        value: String,
    },
}

/// Failure to read or write an opaque model blob
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid model name '{0}'")]
    InvalidName(String),

    #[error("model '{0}' not found")]
    NotFound(String),

    #[error("storage I/O error for '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// A model artifact that cannot be trusted
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("model blob is not a valid artifact: {0}")]
    Format(String),

    #[error("unsupported model format '{found}'")]
    UnknownFormat { found: String },

    #[error("unsupported model format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("model expects {found} features, pipeline produces {expected}")]
    WidthMismatch { expected: usize, found: usize },

    #[error("artifact declares {declared} features but the model holds {weights} weights")]
    InconsistentWidth { declared: usize, weights: usize },

    #[error("model checksum mismatch: recorded {recorded}, computed {computed}")]
    ChecksumMismatch { recorded: String, computed: String },

    #[error("model holds non-finite parameters")]
    NonFinite,
}

/// Training could not produce a model
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelTrainError {
    #[error("no training samples")]
    Empty,

    #[error("{features} feature vectors but {labels} labels")]
    LengthMismatch { features: usize, labels: usize },

    #[error("feature vector {index} has width {found}, expected {expected}")]
    InconsistentWidth {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("labels contain a single class; need both benign and attack samples")]
    SingleClass,

    #[error("{0} samples are too few for a held-out split")]
    TooFewSamples(usize),

    #[error("training diverged (non-finite parameters)")]
    Diverged,
}

/// Scoring refused
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClassifyError {
    #[error("classifier is uninitialized: no model loaded")]
    Uninitialized,

    #[error("feature vector has width {found}, model expects {expected}")]
    WidthMismatch { expected: usize, found: usize },
}

/// A firewall backend could not apply or remove a rule
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("firewall enforcement is not supported on {platform}")]
    Unsupported { platform: String },

    #[error("firewall backend {backend} is unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("backend {backend} does not support {direction} rules")]
    UnsupportedDirection {
        backend: String,
        direction: Direction,
    },

    #[error("{command} exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("firewall I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tracker state disagreeing with what the firewall holds
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrackerInvariantError {
    #[error("rule installed for {0} without a tracked ban")]
    OrphanedRule(OffenderKey),

    #[error("tracked ban for {0} has no installed rule")]
    MissingRule(OffenderKey),

    #[error("ban requested for already banned {0}")]
    DoubleBan(OffenderKey),
}

/// Batch-level pipeline failure
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error("scoring worker failed: {0}")]
    Worker(String),
}

/// Enforcement queue rejected an action
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnforceError {
    #[error("enforcement worker has shut down")]
    Closed,
}
