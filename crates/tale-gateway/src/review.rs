//! Human-review queue for the gateway. Review storage lives elsewhere; here items are only
//! logged so operators can pick them up from the log stream.

use async_trait::async_trait;
use tale_core::{ReviewQueue, ReviewRequest};
use tracing::info;

#[derive(Debug, Default, Clone)]
pub struct LoggingReviewQueue;

#[async_trait]
impl ReviewQueue for LoggingReviewQueue {
    async fn enqueue(&self, request: ReviewRequest) -> Result<(), String> {
        let payload = serde_json::to_string(&request.item).map_err(|e| e.to_string())?;
        info!(
            target: "tale::verify",
            kind = ?request.item.kind,
            confidence = request.confidence,
            reason = %request.reason,
            item = %payload,
            "queued for human review"
        );
        Ok(())
    }
}
