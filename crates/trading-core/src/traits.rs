use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{RawVote, SignalError};

/// One external model producing a raw opinion per instrument
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Stable identifier used for weights and schemas
    fn source_id(&self) -> &str;

    async fn get_vote(&self, instrument: &str, as_of: DateTime<Utc>) -> Result<RawVote, SignalError>;
}
