//! Awaiting long-running operations
//!
//! Mutating calls may return an operation handle instead of completing
//! synchronously. [`wait_for_operation`] polls such an operation at a fixed
//! interval until it reaches a final state, translating failure payloads into
//! `Error::Operation`. [`with_deadline`] bounds any call by a deadline and the
//! caller's cancellation token.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use lattice_common::{Error, Result};

use crate::api::{Operation, STATUS_CANCELLED, STATUS_FAILURE, STATUS_SUCCESS};
use crate::transport::{LxcApi, OperationHandle};

/// Interval between operation and address polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run `fut` until it completes, `timeout` elapses or `cancel` fires
///
/// Produces `Error::Timeout` or `Error::Cancelled` naming `operation`.
pub async fn with_deadline<T, F>(
    cancel: &CancellationToken,
    operation: &str,
    timeout: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation)),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(operation, timeout)),
        },
    }
}

/// Sleep for one poll interval, or fail if `cancel` fires first
pub async fn poll_tick(cancel: &CancellationToken, operation: &str) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation)),
        _ = tokio::time::sleep(POLL_INTERVAL) => Ok(()),
    }
}

/// Wait for the operation behind `handle` to finish
///
/// Returns the final operation, or `None` when the call completed
/// synchronously. Failed and cancelled operations become
/// `Error::Operation { kind, .. }` carrying the server's failure message.
pub async fn wait_for_operation(
    api: &dyn LxcApi,
    cancel: &CancellationToken,
    kind: &str,
    handle: OperationHandle,
) -> Result<Option<Operation>> {
    let mut op = match handle {
        OperationHandle::Completed => return Ok(None),
        OperationHandle::Pending(op) => op,
    };

    loop {
        match op.status_code {
            STATUS_SUCCESS => {
                debug!(operation = kind, id = %op.id, "Operation completed");
                return Ok(Some(op));
            }
            STATUS_FAILURE | STATUS_CANCELLED => {
                return Err(Error::operation(kind, op.status.clone(), op.err.clone()));
            }
            _ => {
                trace!(operation = kind, id = %op.id, status = %op.status, "Waiting for operation");
                poll_tick(cancel, kind).await?;
                op = api.get_operation(&op.id).await?;
            }
        }
    }
}

/// Find a pending create operation for instance `name`
pub async fn find_instance_create_operation(
    api: &dyn LxcApi,
    name: &str,
) -> Result<Option<Operation>> {
    let resource = format!("/1.0/instances/{}", name);
    let operations = api.list_operations().await?;
    Ok(operations.into_iter().find(|op| {
        op.class == "task"
            && !op.is_final()
            && op.description == "Creating instance"
            && op
                .resources
                .get("instances")
                .is_some_and(|r| r.iter().any(|path| path == &resource))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::STATUS_RUNNING;
    use crate::transport::MockLxcApi;
    use std::collections::BTreeMap;

    fn op(id: &str, status_code: i64) -> Operation {
        Operation {
            id: id.to_string(),
            class: "task".to_string(),
            status_code,
            status: match status_code {
                STATUS_SUCCESS => "Success",
                STATUS_FAILURE => "Failure",
                _ => "Running",
            }
            .to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_completed_handle_needs_no_polling() {
        let api = MockLxcApi::new();
        let result = wait_for_operation(
            &api,
            &CancellationToken::new(),
            "StartInstance",
            OperationHandle::Completed,
        )
        .await
        .expect("sync completion");
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_success() {
        let mut api = MockLxcApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_get_operation()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| Ok(op(id, STATUS_RUNNING)));
        api.expect_get_operation()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| Ok(op(id, STATUS_SUCCESS)));

        let result = wait_for_operation(
            &api,
            &CancellationToken::new(),
            "CreateInstance",
            OperationHandle::Pending(op("op-1", STATUS_RUNNING)),
        )
        .await
        .expect("operation should succeed");
        assert_eq!(result.map(|o| o.id), Some("op-1".to_string()));
    }

    #[tokio::test]
    async fn test_failure_names_operation_kind() {
        let api = MockLxcApi::new();
        let mut failed = op("op-2", STATUS_FAILURE);
        failed.err = "Failed getting image".to_string();

        let err = wait_for_operation(
            &api,
            &CancellationToken::new(),
            "CreateInstance",
            OperationHandle::Pending(failed),
        )
        .await
        .expect_err("failed operation");
        assert!(matches!(err, Error::Operation { ref kind, .. } if kind == "CreateInstance"));
        assert!(err.to_string().contains("Failed getting image"));
        assert!(err.is_retryable());
    }

    /// A timed out wait is transient, never terminal
    #[tokio::test(start_paused = true)]
    async fn test_deadline_produces_retryable_timeout() {
        let mut api = MockLxcApi::new();
        api.expect_get_operation()
            .returning(|id| Ok(op(id, STATUS_RUNNING)));

        let cancel = CancellationToken::new();
        let err = with_deadline(&cancel, "StopInstance", Duration::from_secs(10), async {
            wait_for_operation(
                &api,
                &cancel,
                "StopInstance",
                OperationHandle::Pending(op("op-3", STATUS_RUNNING)),
            )
            .await
        })
        .await
        .expect_err("operation never finishes");
        assert!(err.is_timeout());
        assert!(!err.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_propagates_unchanged() {
        let mut api = MockLxcApi::new();
        api.expect_get_operation()
            .returning(|id| Ok(op(id, STATUS_RUNNING)));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            canceller.cancel();
        });

        let err = wait_for_operation(
            &api,
            &cancel,
            "DeleteInstance",
            OperationHandle::Pending(op("op-4", STATUS_RUNNING)),
        )
        .await
        .expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_find_instance_create_operation() {
        let mut api = MockLxcApi::new();
        api.expect_list_operations().returning(|| {
            let mut other = op("other", STATUS_RUNNING);
            other.description = "Creating instance".to_string();
            other.resources =
                BTreeMap::from([("instances".to_string(), vec!["/1.0/instances/node-2".to_string()])]);

            let mut done = op("done", STATUS_SUCCESS);
            done.description = "Creating instance".to_string();
            done.resources =
                BTreeMap::from([("instances".to_string(), vec!["/1.0/instances/node-1".to_string()])]);

            let mut pending = op("pending", STATUS_RUNNING);
            pending.description = "Creating instance".to_string();
            pending.resources =
                BTreeMap::from([("instances".to_string(), vec!["/1.0/instances/node-1".to_string()])]);

            Ok(vec![other, done, pending])
        });

        let found = find_instance_create_operation(&api, "node-1")
            .await
            .expect("list should succeed");
        assert_eq!(found.map(|o| o.id), Some("pending".to_string()));
    }
}
