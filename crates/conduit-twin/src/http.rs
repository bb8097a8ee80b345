//! HTTP client for a remote twin store.

use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{HandlerEndpoint, IntentId, TargetId, TwinError};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::record::{Appended, TwinEntry, TwinRecord};
use crate::store::TwinStore;

/// Twin store reached over HTTP.
#[derive(Clone)]
pub struct HttpTwinStore {
    /// Base URL of the twin service.
    base_url: String,

    /// HTTP client.
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct AppendResponse {
    version: u64,
}

impl HttpTwinStore {
    /// Create a client for the twin at `url`. Every request is bounded by `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, TwinError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TwinError::Unreachable(e.to_string()))?;

        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn unreachable(e: reqwest::Error) -> TwinError {
    TwinError::Unreachable(e.to_string())
}

async fn refused(response: reqwest::Response) -> TwinError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    TwinError::Refused { status, message }
}

#[async_trait]
impl TwinStore for HttpTwinStore {
    async fn lookup_target(
        &self,
        target: &TargetId,
    ) -> Result<Option<HandlerEndpoint>, TwinError> {
        let url = format!("{}/targets/{}", self.base_url, target);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(unreachable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| TwinError::Serialization(e.to_string())),
            _ => Err(refused(response).await),
        }
    }

    async fn register_endpoint(&self, endpoint: HandlerEndpoint) -> Result<(), TwinError> {
        let url = format!("{}/targets/{}", self.base_url, endpoint.target);

        let response = self
            .http_client
            .put(&url)
            .json(&endpoint)
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            return Err(refused(response).await);
        }
        Ok(())
    }

    async fn append(&self, record: TwinRecord) -> Result<Appended, TwinError> {
        let url = format!("{}/records", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(&record)
            .send()
            .await
            .map_err(unreachable)?;

        match response.status() {
            StatusCode::CONFLICT => Ok(Appended::Duplicate),
            status if status.is_success() => {
                let body: AppendResponse = response
                    .json()
                    .await
                    .map_err(|e| TwinError::Serialization(e.to_string()))?;
                Ok(Appended::Stored(body.version))
            }
            _ => Err(refused(response).await),
        }
    }

    async fn records_for(&self, intent_id: &IntentId) -> Result<Vec<TwinEntry>, TwinError> {
        let url = format!("{}/intents/{}/records", self.base_url, intent_id);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(unreachable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| TwinError::Serialization(e.to_string())),
            _ => Err(refused(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conduit_core::{Capability, LifecycleState, OwnerId, Report, ReportEnvelope};
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpTwinStore {
        HttpTwinStore::new(&server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_distinguishes_unknown_from_unavailable() {
        let server = MockServer::start().await;
        let endpoint = HandlerEndpoint::new("EC21", "http://ec21:3000", Capability::Workload);

        Mock::given(method("GET"))
            .and(path("/targets/EC21"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&endpoint))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/targets/EC99"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/targets/EC50"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let twin = client(&server);
        assert_eq!(
            twin.lookup_target(&TargetId::new("EC21")).await.unwrap(),
            Some(endpoint)
        );
        assert_eq!(twin.lookup_target(&TargetId::new("EC99")).await.unwrap(), None);

        let err = twin.lookup_target(&TargetId::new("EC50")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, TwinError::Refused { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_append_conflict_is_duplicate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/records"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let record = TwinRecord::Report(ReportEnvelope {
            intent_id: IntentId::new("I1"),
            intent_version: 1,
            owner: OwnerId::default(),
            report: Report::state(Uuid::new_v4(), 1, LifecycleState::Received),
            received_at: Utc::now(),
        });
        assert_eq!(client(&server).append(record).await.unwrap(), Appended::Duplicate);
    }

    #[tokio::test]
    async fn test_append_stored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/records"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"version": 12})))
            .expect(1)
            .mount(&server)
            .await;

        let record = TwinRecord::Report(ReportEnvelope {
            intent_id: IntentId::new("I1"),
            intent_version: 1,
            owner: OwnerId::default(),
            report: Report::observation(Uuid::new_v4(), 3, "co1", 18.0),
            received_at: Utc::now(),
        });
        assert_eq!(client(&server).append(record).await.unwrap(), Appended::Stored(12));
    }

    #[tokio::test]
    async fn test_unreachable_twin_is_transient() {
        let twin = HttpTwinStore::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = twin.records_for(&IntentId::new("I1")).await.unwrap_err();
        assert!(err.is_transient());
    }
}
