//! Error types for melodicnet.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unparseable or invalid MIDI / note data. Skippable during batch
    /// corpus loading; fatal for the single file or output it concerns.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Vocabulary/model mismatch or a damaged mapping file. Fatal to load.
    #[error("corrupt mapping: {0}")]
    CorruptMapping(String),

    /// No usable training data after filtering. Raised before any fit.
    #[error("empty corpus: {0}")]
    EmptyCorpus(String),

    /// Invalid generation/training parameter, rejected before any model work.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Model config directory problem (missing weights, bad layout).
    #[error("config: {0}")]
    Config(String),

    /// Generation manager error (shutdown, worker panic).
    #[error("manager: {0}")]
    Manager(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<midly::Error> for Error {
    fn from(error: midly::Error) -> Self {
        // Parse failures are malformed input, not generic I/O.
        Error::MalformedInput(format!("midi parse: {error}"))
    }
}
