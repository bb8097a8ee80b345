//! HTTP delivery of sub-intents to handler endpoints.

use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{Acceptance, DeliveryError, HandlerEndpoint, SubIntent};
use conduit_handler::IDEMPOTENCY_KEY_HEADER;
use conduit_router::HandlerTransport;
use reqwest::StatusCode;
use uuid::Uuid;

/// [`HandlerTransport`] over the handler HTTP intake.
#[derive(Clone, Default)]
pub struct HttpHandlerTransport {
    http_client: reqwest::Client,
}

impl HttpHandlerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every request by `timeout`, on top of the dispatcher's own timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, DeliveryError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self { http_client })
    }
}

fn transport_error(e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout { after_ms: 0 }
    } else {
        DeliveryError::Transport(e.to_string())
    }
}

#[async_trait]
impl HandlerTransport for HttpHandlerTransport {
    async fn deliver(
        &self,
        endpoint: &HandlerEndpoint,
        sub_intent: &SubIntent,
    ) -> Result<Acceptance, DeliveryError> {
        let response = self
            .http_client
            .post(endpoint.accept_url())
            .header(IDEMPOTENCY_KEY_HEADER, sub_intent.id.to_string())
            .json(sub_intent)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Acceptance>()
            .await
            .map_err(|e| DeliveryError::Transport(format!("malformed acceptance: {}", e)))
    }

    async fn withdraw(
        &self,
        endpoint: &HandlerEndpoint,
        sub_intent_id: Uuid,
    ) -> Result<(), DeliveryError> {
        let response = self
            .http_client
            .delete(endpoint.withdraw_url(sub_intent_id))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        // The handler may have forgotten a sub-intent it never accepted.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{Capability, Expectation, ExpectationKind, Intent, TargetId};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sub_intent() -> SubIntent {
        let intent = Intent::builder()
            .id("I1")
            .expectation(Expectation::workload("de1", "EC21"))
            .build()
            .unwrap();
        SubIntent::project(
            &intent,
            1,
            &ExpectationKind::WorkloadDeployment,
            &TargetId::new("EC21"),
        )
    }

    #[tokio::test]
    async fn test_delivery_carries_idempotency_key() {
        let server = MockServer::start().await;
        let sub = sub_intent();
        Mock::given(method("POST"))
            .and(path("/api/v1/subintents"))
            .and(header(IDEMPOTENCY_KEY_HEADER, sub.id.to_string().as_str()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "accepted"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = HandlerEndpoint::new("EC21", server.uri(), Capability::Workload);
        let answer = HttpHandlerTransport::new().deliver(&endpoint, &sub).await.unwrap();
        assert!(answer.is_accepted());
    }

    #[tokio::test]
    async fn test_rejection_and_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/subintents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"status": "rejected", "reason": "quota exceeded"}),
            ))
            .mount(&server)
            .await;

        let endpoint = HandlerEndpoint::new("EC21", server.uri(), Capability::Workload);
        let transport = HttpHandlerTransport::new();
        let answer = transport.deliver(&endpoint, &sub_intent()).await.unwrap();
        assert_eq!(answer, Acceptance::Rejected { reason: "quota exceeded".into() });

        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&failing)
            .await;
        let endpoint = HandlerEndpoint::new("EC21", failing.uri(), Capability::Workload);
        let err = transport.deliver(&endpoint, &sub_intent()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_withdraw() {
        let server = MockServer::start().await;
        let sub = sub_intent();
        Mock::given(method("DELETE"))
            .and(path(format!("/api/v1/subintents/{}", sub.id)))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = HandlerEndpoint::new("EC21", server.uri(), Capability::Workload);
        HttpHandlerTransport::new().withdraw(&endpoint, sub.id).await.unwrap();
    }
}
