//! Crate-wide error type and result alias.

use thiserror::Error;

/// Errors raised by the tracking engine.
///
/// Recoverable conditions (detection gaps, weak correlation, seam
/// no-continuations) are handled in place and logged; they never appear here.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incompatible option combination. Raised during option
    /// validation, before any tracking begins.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A parallel worker failed for one time interval. Sibling intervals are
    /// unaffected and their output is retained for diagnosis. The bounds are
    /// the first and last timestep of the failed interval.
    #[error("interval worker failed for times [{start}, {end}]: {message}")]
    IntervalWorker {
        start: u64,
        end: u64,
        message: String,
    },

    /// Interval outputs could not be reconciled into one run.
    #[error("stitch error: {0}")]
    Stitch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
