//! Records kept by the twin store.

use chrono::{DateTime, Utc};
use conduit_core::{IntentId, ReportEnvelope, SubIntent};
use serde::{Deserialize, Serialize};

/// Something persisted in the twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TwinRecord {
    /// A sub-intent a leaf handler accepted and is realizing.
    SubIntent {
        sub_intent: SubIntent,
        /// Identity of the handler that persisted it.
        handler: String,
    },
    /// A report forwarded by the aggregator.
    Report(ReportEnvelope),
}

impl TwinRecord {
    /// Deduplication key. Appending a record whose key is already stored is a no-op.
    pub fn key(&self) -> String {
        match self {
            TwinRecord::SubIntent { sub_intent, .. } => format!("subintent:{}", sub_intent.id),
            TwinRecord::Report(envelope) => format!(
                "report:{}:{}",
                envelope.report.sub_intent_id, envelope.report.sequence
            ),
        }
    }

    /// The intent this record belongs to.
    pub fn intent_id(&self) -> &IntentId {
        match self {
            TwinRecord::SubIntent { sub_intent, .. } => &sub_intent.parent_id,
            TwinRecord::Report(envelope) => &envelope.intent_id,
        }
    }
}

/// A stored record with its store-assigned version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinEntry {
    /// Deduplication key, see [`TwinRecord::key`].
    pub key: String,

    /// Version number (monotonically increasing across the store).
    pub version: u64,

    /// When the record was stored.
    pub stored_at: DateTime<Utc>,

    pub record: TwinRecord,
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// Newly stored at this version.
    Stored(u64),
    /// Already present; nothing changed.
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{LifecycleState, OwnerId, Report};
    use uuid::Uuid;

    #[test]
    fn test_report_key_is_sub_intent_and_sequence() {
        let sub = Uuid::new_v4();
        let record = TwinRecord::Report(ReportEnvelope {
            intent_id: IntentId::new("I1"),
            intent_version: 1,
            owner: OwnerId::default(),
            report: Report::state(sub, 7, LifecycleState::Received),
            received_at: Utc::now(),
        });
        assert_eq!(record.key(), format!("report:{}:7", sub));
        assert_eq!(record.intent_id().as_str(), "I1");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["record"], "report");
    }
}
