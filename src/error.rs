//! Error types for phonolab.
//!
//! One enum covers both halves of the core: annotation-store invariant
//! violations (`Range`, `Overlap`, `NotFound`, `StaleHandle`) and analysis
//! failures (`Parameter`, `Cancelled`). All errors are reported synchronously
//! to the caller of the operation that detected them; none are swallowed.
//!
//! Per-frame "no reliable estimate" results (unvoiced pitch frames, missing
//! formant slots) are *not* errors: they are `None` samples in a
//! [`Track`](crate::track::Track).

use thiserror::Error;

/// Result type alias using phonolab's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the annotation store, the analysis algorithms,
/// or the track cache.
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading an audio file, wrapping the `hound` WAV reader.
    #[error("Failed to read audio file: {0}")]
    AudioRead(#[from] hound::Error),

    /// General I/O error not specific to WAV reading.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A time or value falls outside its valid domain.
    ///
    /// Raised for event boundaries outside `[0, duration]`, inverted
    /// boundaries (`start > end`), and analysis ranges outside the sound.
    #[error("Out of range: {0}")]
    Range(String),

    /// An annotation edit would make two events on one layer overlap.
    ///
    /// Touching endpoints are permitted; strict interior overlap is not.
    #[error("Events would overlap: {0}")]
    Overlap(String),

    /// The entity is not a current member of the addressed collection,
    /// e.g. removing an event through the wrong layer.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The handle refers to an event that has been removed.
    ///
    /// Once detached, an event is no longer addressable; every operation on
    /// its handle fails with this error.
    #[error("Stale event handle")]
    StaleHandle,

    /// Invalid analysis configuration.
    ///
    /// Raised before any frame is processed: partial results are never
    /// produced for an invalid parameter set.
    ///
    /// Examples: `minimum_pitch >= maximum_pitch`, a non-positive LPC order,
    /// a pitch ceiling above the Nyquist frequency.
    #[error("Invalid parameter: {0}")]
    Parameter(String),

    /// The analysis request was cancelled before completion.
    ///
    /// Cooperative: algorithms check between frames, so a closed session
    /// never blocks progress elsewhere.
    #[error("Analysis cancelled")]
    Cancelled,

    /// A shared computation failed for a caller that was waiting on it.
    ///
    /// The caller that ran the computation keeps the original error; other
    /// callers attached to the same cache entry receive this.
    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),
}
