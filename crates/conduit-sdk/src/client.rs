//! Conduit client implementation.

use conduit_core::{
    ConduitError, DeliveryStatus, ExpectationKind, HandlerEndpoint, Intent, IntentId,
    LifecycleState, OwnerId, Priority, Report, Result, TargetId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream::IntentStream;

/// Client for interacting with a Conduit node.
#[derive(Clone)]
pub struct ConduitClient {
    /// Base URL of the Conduit node.
    base_url: String,

    /// HTTP client.
    http_client: reqwest::Client,
}

/// Response from submitting an intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: IntentId,
    pub version: u32,
    pub content_hash: String,
    pub sub_intents: Vec<SubIntentResponse>,
}

/// One sub-intent as reported by the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubIntentResponse {
    pub id: Uuid,
    pub kind: ExpectationKind,
    pub target: TargetId,
    pub endpoint: String,
    #[serde(default)]
    pub delivery: Option<DeliveryStatus>,
    #[serde(default)]
    pub state: Option<LifecycleState>,
    #[serde(default)]
    pub last_sequence: Option<u64>,
}

/// Response with intent details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResponse {
    pub id: IntentId,
    pub version: u32,
    pub owner: OwnerId,
    pub priority: Priority,
    /// Aggregated state: `received`, `compliant`, `degraded`, `finalizing` or `withdrawn`.
    pub state: String,
    pub withdrawn: bool,
    pub accepted_at: String,
    pub content_hash: String,
    pub sub_intents: Vec<SubIntentResponse>,
}

/// Answer to a report submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAck {
    /// `queued` or `dropped`.
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ReportAck {
    pub fn is_queued(&self) -> bool {
        self.status == "queued"
    }
}

async fn api_error(response: reqwest::Response) -> ConduitError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    ConduitError::Api { status, message }
}

fn connection(e: reqwest::Error) -> ConduitError {
    ConduitError::Connection(e.to_string())
}

fn serialization(e: reqwest::Error) -> ConduitError {
    ConduitError::Serialization(e.to_string())
}

impl ConduitClient {
    /// Connect to a Conduit node.
    pub async fn connect(url: &str) -> Result<Self> {
        let base_url = url.trim_end_matches('/').to_string();
        let http_client = reqwest::Client::new();

        // Verify connection with health check
        let health_url = format!("{}/health", base_url);
        http_client
            .get(&health_url)
            .send()
            .await
            .map_err(connection)?
            .error_for_status()
            .map_err(connection)?;

        Ok(Self {
            base_url,
            http_client,
        })
    }

    /// Submit a raw graph payload.
    pub async fn submit(&self, payload: &str) -> Result<SubmitResponse> {
        let url = format!("{}/api/v1/intent", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(connection)?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        response.json().await.map_err(serialization)
    }

    /// Submit an intent built in code.
    pub async fn submit_intent(&self, intent: &Intent) -> Result<SubmitResponse> {
        self.submit(&intent.to_graph().to_string()).await
    }

    /// Get the aggregated state of an intent.
    pub async fn get_intent(&self, id: &IntentId) -> Result<IntentResponse> {
        let url = format!("{}/api/v1/intent/{}", self.base_url, id);

        let response = self.http_client.get(&url).send().await.map_err(connection)?;

        if response.status().as_u16() == 404 {
            return Err(ConduitError::NotFound {
                resource_type: "Intent".to_string(),
                id: id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        response.json().await.map_err(serialization)
    }

    /// List every current intent.
    pub async fn list_intents(&self) -> Result<Vec<IntentResponse>> {
        let url = format!("{}/api/v1/intents", self.base_url);

        let response = self.http_client.get(&url).send().await.map_err(connection)?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        response.json().await.map_err(serialization)
    }

    /// Withdraw an intent.
    pub async fn withdraw(&self, id: &IntentId) -> Result<()> {
        let url = format!("{}/api/v1/intent/{}", self.base_url, id);

        let response = self
            .http_client
            .delete(&url)
            .send()
            .await
            .map_err(connection)?;

        match response.status().as_u16() {
            404 => Err(ConduitError::NotFound {
                resource_type: "Intent".to_string(),
                id: id.to_string(),
            }),
            _ if response.status().is_success() => Ok(()),
            _ => Err(api_error(response).await),
        }
    }

    /// Send a handler report.
    pub async fn report(&self, report: &Report) -> Result<ReportAck> {
        let url = format!("{}/api/v1/reports", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(report)
            .send()
            .await
            .map_err(connection)?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        response.json().await.map_err(serialization)
    }

    /// Register a handler endpoint in the node's twin store.
    pub async fn register_endpoint(&self, endpoint: &HandlerEndpoint) -> Result<()> {
        let url = format!("{}/api/v1/endpoints/{}", self.base_url, endpoint.target);

        let response = self
            .http_client
            .put(&url)
            .json(endpoint)
            .send()
            .await
            .map_err(connection)?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    /// Twin records stored for an intent.
    pub async fn twin_records(&self, id: &IntentId) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/api/v1/twin/{}", self.base_url, id);

        let response = self.http_client.get(&url).send().await.map_err(connection)?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        response.json().await.map_err(serialization)
    }

    /// Stream aggregated state changes of an intent.
    pub async fn stream(&self, id: &IntentId) -> Result<IntentStream> {
        let ws_url = format!(
            "{}/ws/intent/{}",
            self.base_url
                .replace("http://", "ws://")
                .replace("https://", "wss://"),
            id
        );
        IntentStream::connect(&ws_url, id.clone()).await
    }
}
