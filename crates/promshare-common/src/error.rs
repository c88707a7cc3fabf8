use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromshareError {
    #[error("descriptor conflict: {0}")]
    DescriptorConflict(String),
    #[error("label mismatch for {metric}: expected {expected} values, got {actual}")]
    LabelMismatch {
        metric: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("metric not found: {0}")]
    MetricNotFound(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("aggregation contention on {key} after {attempts} attempts")]
    AggregationContention { key: String, attempts: u32 },
    #[error("corrupt record {key}: {reason}")]
    CorruptRecord { key: String, reason: String },
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PromshareError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DescriptorConflict(_) => "DescriptorConflict",
            Self::LabelMismatch { .. } => "LabelMismatch",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::MetricNotFound(_) => "MetricNotFound",
            Self::StorageUnavailable(_) => "StorageUnavailable",
            Self::AggregationContention { .. } => "AggregationContention",
            Self::CorruptRecord { .. } => "CorruptRecord",
            Self::InternalError(_) => "InternalError",
            Self::Io(_) => "StorageUnavailable",
        }
    }

    /// Whether the caller may retry the whole mutation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AggregationContention { .. })
    }
}

pub type Result<T> = std::result::Result<T, PromshareError>;
