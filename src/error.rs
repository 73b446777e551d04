use thiserror::Error;

/// Errors surfaced by the verification pipeline.
///
/// Only `InvalidRequest` ever reaches the caller of the engine; the
/// network-flavored variants are signals between tiers and are swallowed
/// by the fallback chain.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("invalid verification request: {0}")]
    InvalidRequest(String),

    #[error("external verification timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("network error during external verification: {0}")]
    Network(String),

    #[error("malformed verifier response: {0}")]
    MalformedResponse(#[from] ParseError),
}

/// Failures while extracting a structured verdict from free text.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no JSON object found in response text")]
    NoObject,

    #[error("missing or invalid field: {0}")]
    InvalidField(&'static str),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of a deduplicated unit of work. The original error is flattened
/// to a string so every waiter on the shared future can receive a copy.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("deduplicated request failed: {0}")]
    Upstream(String),
}
