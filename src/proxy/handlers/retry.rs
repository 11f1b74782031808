use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::proxy::handlers::errors::ErrorKind;
use crate::proxy::tracking::{RecordPatch, RequestStatus, UsageTracker};

// Executes the delay before the next attempt and records the retry in
// the lifecycle tracker. The sleep is a plain suspension point: client
// disconnect drops the request future and the sleep with it.
pub async fn apply_retry_delay(
    tracker: &Arc<UsageTracker>,
    request_id: u64,
    endpoint_name: &str,
    group_name: &str,
    kind: ErrorKind,
    delay: Duration,
    attempt: u32,
    max_attempts: u32,
) {
    tracker
        .record_request_update(
            request_id,
            RecordPatch {
                status: Some(RequestStatus::Retry),
                endpoint_name: Some(endpoint_name.to_string()),
                group_name: Some(group_name.to_string()),
                retry_count: Some(attempt),
                http_status: Some(0),
                ..Default::default()
            },
        )
        .await;

    if delay.is_zero() {
        info!(
            "[Retry] [req-{}] Retrying immediately ({}), attempt {}/{}",
            request_id,
            kind.as_str(),
            attempt + 1,
            max_attempts
        );
        return;
    }

    info!(
        "[Retry] [req-{}] Waiting {:?} before retry ({}), attempt {}/{}",
        request_id,
        delay,
        kind.as_str(),
        attempt + 1,
        max_attempts
    );
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackingConfig;

    #[tokio::test]
    async fn retry_is_recorded_with_attempt_count() {
        let (tracker, _rx) = UsageTracker::new(TrackingConfig::default());
        let id = tracker.record_request_start("POST", "/v1/messages").await;

        apply_retry_delay(
            &tracker,
            id,
            "ep-a",
            "g1",
            ErrorKind::Network,
            Duration::ZERO,
            1,
            3,
        )
        .await;

        let record = tracker.get_record(id).await.expect("record");
        assert_eq!(record.status, RequestStatus::Retry);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.endpoint_name, "ep-a");
    }
}
