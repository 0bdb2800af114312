use thiserror::Error;

/// Failure of a single backend call. Scoped to the request that issued it.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode backend response: {0}")]
    Decode(String),

    #[error("backend returned no completion choices")]
    EmptyResult,
}

/// Returned by a delta sink to end a stream early. Not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("consumer stopped the stream")]
pub struct Stop;
