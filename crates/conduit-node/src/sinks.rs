//! Report sinks: the intent owner and the twin store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{ConduitError, OwnerId, ReportEnvelope};
use conduit_twin::{Appended, TwinRecord, TwinStore};

/// Destination of accepted reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Deliver one envelope. Must tolerate redelivery of the same report.
    async fn deliver(&self, envelope: &ReportEnvelope) -> Result<(), ConduitError>;
}

/// Posts envelopes to the owner's report intake.
pub struct OwnerSink {
    http_client: reqwest::Client,
    owners: HashMap<OwnerId, String>,
    default_url: Option<String>,
}

impl OwnerSink {
    pub fn new(
        owners: HashMap<OwnerId, String>,
        default_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ConduitError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConduitError::Config(e.to_string()))?;
        Ok(Self {
            http_client,
            owners,
            default_url,
        })
    }

    fn url_for(&self, owner: &OwnerId) -> Option<&str> {
        self.owners
            .get(owner)
            .or(self.default_url.as_ref())
            .map(String::as_str)
    }
}

#[async_trait]
impl ReportSink for OwnerSink {
    fn name(&self) -> &'static str {
        "owner"
    }

    async fn deliver(&self, envelope: &ReportEnvelope) -> Result<(), ConduitError> {
        let Some(url) = self.url_for(&envelope.owner) else {
            tracing::info!(
                owner = %envelope.owner,
                intent_id = %envelope.intent_id,
                sub_intent_id = %envelope.report.sub_intent_id,
                seq = envelope.report.sequence,
                "no intake configured for owner, report logged only"
            );
            return Ok(());
        };

        let response = self
            .http_client
            .post(url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| ConduitError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ConduitError::Api { status, message });
        }
        Ok(())
    }
}

/// Appends envelopes to the twin store.
pub struct TwinSink {
    twin: Arc<dyn TwinStore>,
}

impl TwinSink {
    pub fn new(twin: Arc<dyn TwinStore>) -> Self {
        Self { twin }
    }
}

#[async_trait]
impl ReportSink for TwinSink {
    fn name(&self) -> &'static str {
        "twin"
    }

    async fn deliver(&self, envelope: &ReportEnvelope) -> Result<(), ConduitError> {
        match self.twin.append(TwinRecord::Report(envelope.clone())).await? {
            Appended::Stored(version) => {
                tracing::trace!(version, sub_intent_id = %envelope.report.sub_intent_id, "report stored");
            }
            Appended::Duplicate => {
                tracing::debug!(
                    sub_intent_id = %envelope.report.sub_intent_id,
                    seq = envelope.report.sequence,
                    "report already in twin store"
                );
            }
        }
        Ok(())
    }
}
