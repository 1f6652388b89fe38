//! Task poller.
//!
//! The outstanding task reference lives on the resource status. Polling it
//! reduces the provider's task state to four outcomes and keeps the
//! reference consistent with them: a task that succeeded or vanished is
//! forgotten, a failed task is kept until the retry gate releases it.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::remote::{RemoteApi, RemoteError, RemoteTaskState};
use crate::resource::VmStatus;

/// Outcome of polling the outstanding task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    /// No task is outstanding, or the provider no longer knows it.
    Absent,
    /// Queued or running.
    Running,
    /// Finished successfully; the reference has been cleared.
    Succeeded,
    /// Finished with an error; the reference is retained.
    Failed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("task {task_id} is in unexpected state {state:?}")]
    UnexpectedState { task_id: String, state: String },
}

/// Poll the task referenced by `status.task_ref`.
pub async fn poll_task<R: RemoteApi + ?Sized>(
    api: &R,
    status: &mut VmStatus,
) -> Result<TaskPoll, TaskError> {
    let Some(task_id) = status.task_ref.clone() else {
        return Ok(TaskPoll::Absent);
    };

    let Some(task) = api.get_task(&task_id).await? else {
        debug!(task_id = %task_id, "Task no longer known to provider");
        status.task_ref = None;
        return Ok(TaskPoll::Absent);
    };

    match task.state {
        RemoteTaskState::Queued | RemoteTaskState::Running => Ok(TaskPoll::Running),
        RemoteTaskState::Success => {
            debug!(task_id = %task_id, "Task succeeded");
            status.task_ref = None;
            Ok(TaskPoll::Succeeded)
        }
        RemoteTaskState::Error => {
            let reason = task
                .error
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("task {task_id} failed"));
            warn!(task_id = %task_id, reason = %reason, "Task failed");
            Ok(TaskPoll::Failed { reason })
        }
        RemoteTaskState::Other(state) => Err(TaskError::UnexpectedState { task_id, state }),
    }
}

/// Poll `task_id` until it leaves the queued/running states.
///
/// Used as a background wait; the caller re-examines the resource afterwards
/// and reads the terminal state itself.
pub async fn wait_for_task<R: RemoteApi + ?Sized>(
    api: &R,
    task_id: &str,
    interval: Duration,
) -> Result<(), RemoteError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match api.get_task(task_id).await? {
            Some(task)
                if matches!(task.state, RemoteTaskState::Queued | RemoteTaskState::Running) => {}
            _ => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CloneSpec, MockProvider, Operation, OperationKind, TaskMode};

    fn clone_op() -> Operation {
        Operation::Clone(Box::new(CloneSpec {
            name: "web-0".to_string(),
            folder: "/dc1/vm".to_string(),
            template: "tmpl".to_string(),
            bios_uuid: "uuid-1".to_string(),
            num_cpus: 1,
            memory_mib: 1024,
            devices: vec![],
            bootstrap: None,
        }))
    }

    #[tokio::test]
    async fn test_empty_reference_is_absent() {
        let provider = MockProvider::new();
        provider.set_transport_down(true);
        let mut status = VmStatus::default();

        // No remote call is made, so the broken transport is never hit.
        assert_eq!(poll_task(&provider, &mut status).await.unwrap(), TaskPoll::Absent);
    }

    #[tokio::test]
    async fn test_missing_task_clears_reference() {
        let provider = MockProvider::new();
        let mut status = VmStatus {
            task_ref: Some("t404".to_string()),
            ..Default::default()
        };
        assert_eq!(poll_task(&provider, &mut status).await.unwrap(), TaskPoll::Absent);
        assert!(status.task_ref.is_none());
    }

    #[tokio::test]
    async fn test_running_then_succeeded() {
        let provider = MockProvider::new();
        provider.set_task_mode(TaskMode::Manual);
        let task = provider.submit(clone_op()).await.unwrap();
        let mut status = VmStatus {
            task_ref: Some(task.clone()),
            ..Default::default()
        };

        assert_eq!(poll_task(&provider, &mut status).await.unwrap(), TaskPoll::Running);
        assert_eq!(status.task_ref.as_deref(), Some(task.as_str()));

        provider.complete_task(&task);
        assert_eq!(
            poll_task(&provider, &mut status).await.unwrap(),
            TaskPoll::Succeeded
        );
        assert!(status.task_ref.is_none());
    }

    #[tokio::test]
    async fn test_failed_keeps_reference() {
        let provider = MockProvider::new();
        provider.fail_next(OperationKind::Clone, "quota exceeded");
        let task = provider.submit(clone_op()).await.unwrap();
        let mut status = VmStatus {
            task_ref: Some(task.clone()),
            ..Default::default()
        };

        assert_eq!(
            poll_task(&provider, &mut status).await.unwrap(),
            TaskPoll::Failed {
                reason: "quota exceeded".to_string()
            }
        );
        assert_eq!(status.task_ref, Some(task));
    }

    #[tokio::test]
    async fn test_unknown_state_is_invariant_violation() {
        let provider = MockProvider::new();
        provider.set_task_mode(TaskMode::Manual);
        let task = provider.submit(clone_op()).await.unwrap();
        provider.set_task_state(&task, RemoteTaskState::Other("paused".to_string()));
        let mut status = VmStatus {
            task_ref: Some(task),
            ..Default::default()
        };

        let err = poll_task(&provider, &mut status).await.unwrap_err();
        assert!(matches!(err, TaskError::UnexpectedState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_task_returns_on_completion() {
        let provider = std::sync::Arc::new(MockProvider::new());
        provider.set_task_mode(TaskMode::Manual);
        let task = provider.submit(clone_op()).await.unwrap();

        let waiter = tokio::spawn({
            let provider = std::sync::Arc::clone(&provider);
            let task = task.clone();
            async move { wait_for_task(provider.as_ref(), &task, Duration::from_secs(5)).await }
        });

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!waiter.is_finished());

        provider.complete_task(&task);
        waiter.await.unwrap().unwrap();
    }
}
