use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the archive, the search strategies and the illumination loop.
#[derive(Error, Debug)]
pub enum Error {
    /// An elite was requested before any cell was occupied.
    #[error("feature map has no occupied cells")]
    EmptyArchive,

    /// A parameter or feature vector does not have the configured length.
    #[error("{what} has length {actual}, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The evaluator produced output that is missing or malformed.
    #[error("evaluator protocol error: {0}")]
    EvaluatorProtocol(String),

    /// An individual was handed back to an algorithm or archive without fitness and features.
    #[error("individual has not been evaluated")]
    NotEvaluated,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Returned by [`Generator`](crate::illumination::Generator) implementations
    /// that cannot produce an artifact. Always ends the run.
    #[error("generator failed: {0}")]
    Generator(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error only spoils the individual being processed.
    ///
    /// Everything else is a configuration or environment failure that ends the run.
    pub fn is_per_individual(&self) -> bool {
        matches!(self, Error::EvaluatorProtocol(_))
    }
}
