//! HTTP report emission towards a node's report intake.

use async_trait::async_trait;
use conduit_core::{ConduitError, Report};
use conduit_handler::ReportEmitter;

/// [`ReportEmitter`] posting to `{node}/api/v1/reports`.
#[derive(Clone)]
pub struct HttpReportEmitter {
    url: String,
    http_client: reqwest::Client,
}

impl HttpReportEmitter {
    /// Emit to the node at `node_url`.
    pub fn new(node_url: &str) -> Self {
        Self {
            url: format!("{}/api/v1/reports", node_url.trim_end_matches('/')),
            http_client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ReportEmitter for HttpReportEmitter {
    async fn emit(&self, report: Report) -> Result<(), ConduitError> {
        let response = self
            .http_client
            .post(&self.url)
            .json(&report)
            .send()
            .await
            .map_err(|e| ConduitError::Connection(e.to_string()))?;

        // The intake answers 202 even for dropped reports; drops are not retried.
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ConduitError::Api { status, message });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::LifecycleState;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_emit_posts_report() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/reports"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let emitter = HttpReportEmitter::new(&format!("{}/", server.uri()));
        emitter
            .emit(Report::state(Uuid::new_v4(), 1, LifecycleState::Compliant))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_emit_failure_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = HttpReportEmitter::new(&server.uri())
            .emit(Report::state(Uuid::new_v4(), 1, LifecycleState::Received))
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
