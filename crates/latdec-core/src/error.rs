use thiserror::Error;

/// Fatal decoding failures.
///
/// Numeric anomalies (slightly negative backward slack, empty frontier) are
/// not represented here; they are clamped or reported through empty results,
/// with a once-per-utterance warning.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// API lifecycle misuse, e.g. advancing after finalization.
    #[error("decoder misuse: {0}")]
    ContractViolation(&'static str),

    /// The recognition graph (or attached LM-diff FST) is malformed.
    #[error("graph error: {0}")]
    Graph(String),

    /// A configuration value is outside its legal range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
