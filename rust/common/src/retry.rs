use std::{future::Future, time::Duration};

use crate::client::is_conflict;

/// Attempts made by [`retry_on_conflict`] before the conflict is handed to the caller.
pub const CONFLICT_RETRY_STEPS: u32 = 5;
const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Runs a read-modify-write `operation` again while the API server rejects it
/// with `409 Conflict`.
///
/// Each attempt must re-read the object so it carries a fresh `resourceVersion`.
pub async fn retry_on_conflict<T, F, Fut>(mut operation: F) -> kube::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = kube::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(error) if is_conflict(&error) && attempt < CONFLICT_RETRY_STEPS => {
                tracing::debug!(attempt, "update conflicted, retrying");
                attempt += 1;
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::client::api_error;

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let calls = &AtomicU32::new(0);
        let result = retry_on_conflict(|| async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(api_error(409, "Conflict", "stale"))
            } else {
                Ok("updated")
            }
        })
        .await;

        assert_eq!(result.ok(), Some("updated"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = &AtomicU32::new(0);
        let result: kube::Result<()> = retry_on_conflict(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(api_error(409, "Conflict", "stale"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), CONFLICT_RETRY_STEPS);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: kube::Result<()> = retry_on_conflict(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(api_error(404, "NotFound", "gone"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
