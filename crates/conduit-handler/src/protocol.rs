//! Wire messages of the handler intake.
//!
//! `POST {address}/api/v1/subintents` carries a SubIntent as JSON with the
//! sub-intent id in the [`IDEMPOTENCY_KEY_HEADER`] header and is answered
//! with an [`Acceptance`](conduit_core::Acceptance).
//! `DELETE {address}/api/v1/subintents/{id}` is answered with a [`WithdrawAck`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the sub-intent id on every delivery attempt.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Answer to a withdrawal notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawAck {
    pub sub_intent_id: Uuid,

    /// False if the notice was a repeat and changed nothing.
    pub withdrawn: bool,
}

/// Parse an idempotency key header value.
pub fn parse_idempotency_key(value: &str) -> Option<Uuid> {
    Uuid::parse_str(value.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key() {
        let id = Uuid::new_v4();
        assert_eq!(parse_idempotency_key(&format!(" {} ", id)), Some(id));
        assert_eq!(parse_idempotency_key("not-a-uuid"), None);
    }
}
