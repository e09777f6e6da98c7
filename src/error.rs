use thiserror::Error;

/// Errors raised by the training engine.
///
/// Shape and configuration errors are fatal and never retried. `Interrupted`
/// is raised when the user asked the run to stop; the run controller turns it
/// into a best-effort save.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("{metric}: shape mismatch, target {expected:?} vs prediction {got:?}")]
    ShapeMismatch {
        metric: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("{metric}: expected {expected} prediction tensor(s), got {got}")]
    InvalidPredictions {
        metric: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error("interrupted by user")]
    Interrupted,

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ForecastError>;
