use thiserror::Error;

/// Reasons a raw vote is refused by the normalizer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("malformed vote from {source_id}: {reason}")]
    MalformedVote { source_id: String, reason: String },

    #[error("source {source_id} sent a {got} vote but is declared as {expected}")]
    SchemaMismatch {
        source_id: String,
        expected: &'static str,
        got: &'static str,
    },
}

impl NormalizeError {
    pub fn malformed(source_id: &str, reason: impl Into<String>) -> Self {
        NormalizeError::MalformedVote {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures while collecting a vote from one source.
/// All of them are recovered locally: the source is treated as absent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("source {source_id} timed out after {timeout_ms}ms")]
    SourceTimeout { source_id: String, timeout_ms: u64 },

    #[error("source {source_id} unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },

    #[error(transparent)]
    Malformed(#[from] NormalizeError),
}
