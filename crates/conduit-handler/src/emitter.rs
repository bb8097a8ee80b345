//! Report emission.

use async_trait::async_trait;
use conduit_core::{ConduitError, Report};
use tokio::sync::mpsc;

/// Sends handler reports towards the aggregator.
#[async_trait]
pub trait ReportEmitter: Send + Sync {
    /// Emit one report. `Err` means it may be retried.
    async fn emit(&self, report: Report) -> Result<(), ConduitError>;
}

/// In-process emitter backed by a bounded channel.
#[derive(Clone)]
pub struct ChannelEmitter {
    tx: mpsc::Sender<Report>,
}

impl ChannelEmitter {
    /// Create an emitter and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Report>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReportEmitter for ChannelEmitter {
    async fn emit(&self, report: Report) -> Result<(), ConduitError> {
        self.tx
            .send(report)
            .await
            .map_err(|_| ConduitError::Connection("report channel closed".to_string()))
    }
}
