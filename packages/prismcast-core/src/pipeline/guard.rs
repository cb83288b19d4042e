//! Ingestion guard stage.
//!
//! Serializes generations against in-flight ingestions: a run waits until
//! every ingestion job touching the proxy's stream or EPG sources has
//! reached a terminal state, failing after a configurable timeout.

use std::sync::Arc;
use std::time::Duration;

use super::model::IngestionTracker;
use super::StageError;

/// Waits for ingestion quiescence over the given sources.
pub async fn await_ingestions(
    tracker: &Arc<dyn IngestionTracker>,
    source_ids: &[String],
    timeout: Duration,
) -> Result<(), StageError> {
    match tokio::time::timeout(timeout, tracker.await_idle(source_ids)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(StageError::GuardTimeout(e)),
        Err(_) => Err(StageError::GuardTimeout(format!(
            "ingestions over {} sources still running after {:?}",
            source_ids.len(),
            timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SlowTracker;

    #[async_trait]
    impl IngestionTracker for SlowTracker {
        async fn await_idle(&self, _source_ids: &[String]) -> Result<(), String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn guard_times_out() {
        let tracker: Arc<dyn IngestionTracker> = Arc::new(SlowTracker);
        let result = await_ingestions(
            &tracker,
            &["s1".to_string()],
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(StageError::GuardTimeout(_))));
    }

    #[tokio::test]
    async fn idle_tracker_passes_immediately() {
        let tracker: Arc<dyn IngestionTracker> =
            Arc::new(crate::pipeline::model::NoopIngestionTracker);
        assert!(
            await_ingestions(&tracker, &[], Duration::from_secs(1))
                .await
                .is_ok()
        );
    }
}
