//! Lifecycle reconciler.
//!
//! One pass reads the resource, resolves the remote VM, takes at most one
//! step towards the desired state, and persists the status. Long-running
//! work never blocks a pass: remote operations are submitted as tasks and
//! tracked through `status.task_ref`, and everything the pass would have to
//! wait for is handed to the [`CompletionNotifier`], which requeues the
//! resource when it finishes.
//!
//! ```text
//! NotFound -> Creating -> Updating -> PoweringOn -> AwaitingNetwork -> Ready
//!      any -> PoweringOff -> Destroying -> Gone
//! ```
//!
//! # Invariants
//!
//! - A resource never has more than one outstanding task.
//! - A failed task is not retried before the backoff window has elapsed.
//! - A pass against an unchanged, ready VM changes nothing.

mod provision;
mod teardown;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use vmctl_id::{PassId, VmId};
use vmctl_reconcile::{Action, BackoffGate, Clock, Severity};

use crate::capability::{CapabilityError, InfraScope};
use crate::identity::{self, IdentityError, ResolvedVm};
use crate::notifier::{CompletionNotifier, WaitConcern, WaitKey};
use crate::remote::{Operation, RemoteApi, RemoteError, Session, VmRef};
use crate::resource::conditions::*;
use crate::resource::{ManagedVm, VmStatus};
use crate::session::SessionCache;
use crate::store::{ObjectStore, StoreError};
use crate::task::{poll_task, wait_for_task, TaskError, TaskPoll};
use crate::watch::{watch_until, CompletionPredicate, WatchEvent};

/// Default time a guest gets to shut itself down.
pub const DEFAULT_SOFT_POWER_OFF_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Minimum delay between a failed task and its resubmission.
    pub retry_backoff: Duration,

    /// Delay before re-examining a resource with a task in flight.
    pub task_poll_interval: Duration,

    /// Default guest shutdown timeout, overridable per VM.
    pub soft_power_off_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry_backoff: vmctl_reconcile::DEFAULT_RETRY_BACKOFF,
            task_poll_interval: vmctl_reconcile::DEFAULT_TASK_POLL_INTERVAL,
            soft_power_off_timeout: DEFAULT_SOFT_POWER_OFF_TIMEOUT,
        }
    }
}

/// Errors that end a pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// The remote side is in a state this engine must not act on.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl ReconcileError {
    /// Invariant violations are hard errors; everything else is retried.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Invariant(_))
    }
}

/// Working state of a single pass.
struct Pass<'a> {
    vm: &'a ManagedVm,
    status: VmStatus,
    session: Arc<dyn Session>,
    now: DateTime<Utc>,
}

/// Drives managed VMs towards their spec.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    sessions: Arc<SessionCache>,
    notifier: CompletionNotifier,
    scope: Arc<dyn InfraScope>,
    clock: Arc<dyn Clock>,
    gate: BackoffGate,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        sessions: Arc<SessionCache>,
        notifier: CompletionNotifier,
        scope: Arc<dyn InfraScope>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            notifier,
            scope,
            clock,
            gate: BackoffGate::new(config.retry_backoff),
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one pass for `id`.
    ///
    /// Transient remote failures are absorbed into a requeue. Invariant
    /// violations are recorded on the status and returned.
    #[instrument(skip(self), fields(vm_id = %id, pass_id = %PassId::new()))]
    pub async fn reconcile(&self, id: VmId) -> Result<Action, ReconcileError> {
        let Some(vm) = self.store.get(id).await? else {
            debug!("Resource no longer exists");
            return Ok(Action::Done);
        };

        let session = match self.sessions.get_or_create(&vm.spec.server).await {
            Ok(session) => session,
            Err(e) => return Ok(self.absorb(&vm, e).await),
        };

        let mut pass = Pass {
            vm: &vm,
            status: vm.status.clone(),
            session,
            now: self.clock.now(),
        };

        let result = if vm.is_deleting() {
            self.teardown(&mut pass).await
        } else {
            self.provision(&mut pass).await
        };

        let status = pass.status;
        if status != vm.status {
            debug!(phase = %status.phase, "Persisting status");
            self.persist_status(&vm, status).await?;
        }

        match result {
            Ok(action) => Ok(action),
            Err(ReconcileError::Remote(e)) => Ok(self.absorb(&vm, e).await),
            Err(ReconcileError::Capability(e)) => {
                warn!(error = %e, "Capability lookup failed, retrying");
                Ok(Action::requeue(self.config.task_poll_interval))
            }
            Err(e) => Err(e),
        }
    }

    async fn absorb(&self, vm: &ManagedVm, e: RemoteError) -> Action {
        if e.is_auth() {
            self.sessions.invalidate(&vm.spec.server).await;
        }
        warn!(error = %e, "Remote call failed, retrying");
        Action::requeue(self.config.task_poll_interval)
    }

    async fn persist_status(&self, vm: &ManagedVm, status: VmStatus) -> Result<(), ReconcileError> {
        match self
            .store
            .patch_status(vm.id, vm.resource_version, status.clone())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                // Only the owner writes concurrently, and it never touches status.
                let Some(current) = self.store.get(vm.id).await? else {
                    return Ok(());
                };
                self.store
                    .patch_status(vm.id, current.resource_version, status)
                    .await?;
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -------------------------------------------------------------------------
    // Shared steps
    // -------------------------------------------------------------------------

    /// Handle the outstanding task before anything else.
    ///
    /// Returns an action when the pass must stop here.
    async fn guard_task(&self, pass: &mut Pass<'_>) -> Result<Option<Action>, ReconcileError> {
        let poll = match poll_task(pass.session.as_ref(), &mut pass.status).await {
            Ok(poll) => poll,
            Err(TaskError::Remote(e)) => return Err(e.into()),
            Err(TaskError::UnexpectedState { task_id, state }) => {
                let message = format!("task {task_id} reported unknown state {state:?}");
                pass.status.conditions.mark_false(
                    TASK_SUCCEEDED,
                    REASON_UNEXPECTED_TASK_STATE,
                    Severity::Error,
                    message.clone(),
                    pass.now,
                );
                return Err(ReconcileError::Invariant(message));
            }
        };

        match poll {
            TaskPoll::Running => {
                if let Some(task_id) = pass.status.task_ref.clone() {
                    debug!(task_id = %task_id, "Task in flight");
                    self.await_task(pass, task_id);
                }
                Ok(Some(Action::requeue(self.config.task_poll_interval)))
            }
            TaskPoll::Succeeded => {
                pass.status.conditions.mark_true(TASK_SUCCEEDED, pass.now);
                Ok(None)
            }
            TaskPoll::Failed { reason } => {
                pass.status.conditions.mark_false(
                    TASK_SUCCEEDED,
                    REASON_TASK_FAILED,
                    Severity::Warning,
                    reason,
                    pass.now,
                );
                let decision = self.gate.evaluate(&mut pass.status.retry_after, pass.now);
                if decision.is_blocked() {
                    info!(retry_after = ?decision.must_wait_until(), "Retry held back");
                    return Ok(Some(Action::requeue(decision.remaining(pass.now))));
                }
                info!("Backoff elapsed, retrying");
                pass.status.task_ref = None;
                Ok(None)
            }
            TaskPoll::Absent => match self.gate.check(&mut pass.status.retry_after, pass.now) {
                Some(decision) if decision.is_blocked() => {
                    Ok(Some(Action::requeue(decision.remaining(pass.now))))
                }
                _ => Ok(None),
            },
        }
    }

    /// Resolve the remote VM, recording identity problems as conditions.
    async fn resolve(&self, pass: &mut Pass<'_>) -> Result<Option<ResolvedVm>, ReconcileError> {
        match identity::resolve(pass.session.as_ref(), pass.vm).await {
            Ok(Some(resolved)) => {
                pass.status
                    .conditions
                    .mark_true(IDENTITY_VERIFIED, pass.now);
                Ok(Some(resolved))
            }
            Ok(None) => Ok(None),
            Err(IdentityError::Remote(e)) => Err(e.into()),
            Err(e @ IdentityError::Mismatch { .. }) => {
                let message = e.to_string();
                pass.status.conditions.mark_false(
                    IDENTITY_VERIFIED,
                    REASON_IDENTITY_MISMATCH,
                    Severity::Error,
                    message.clone(),
                    pass.now,
                );
                Err(ReconcileError::Invariant(message))
            }
        }
    }

    /// Submit `op` and record its task reference.
    async fn submit(&self, pass: &mut Pass<'_>, op: Operation) -> Result<Action, ReconcileError> {
        if let Some(existing) = &pass.status.task_ref {
            return Err(ReconcileError::Invariant(format!(
                "task {existing} is still outstanding"
            )));
        }

        let kind = op.kind();
        let task_id = pass.session.submit(op).await?;
        info!(task_id = %task_id, operation = %kind, "Submitted task");

        pass.status.task_ref = Some(task_id.clone());
        self.await_task(pass, task_id);
        Ok(Action::requeue(self.config.task_poll_interval))
    }

    /// Requeue the resource once `task_id` leaves the running states.
    fn await_task(&self, pass: &Pass<'_>, task_id: String) {
        let session = Arc::clone(&pass.session);
        let interval = self.config.task_poll_interval;
        let key = WaitKey::new(pass.vm.id, WaitConcern::Task(task_id.clone()));
        self.notifier.notify_on_completion(key, move |_| async move {
            wait_for_task(session.as_ref(), &task_id, interval).await
        });
    }

    /// Watch `vm_ref` until `predicate` holds, requeueing on each new address.
    fn launch_watch<P>(&self, pass: &Pass<'_>, vm_ref: &VmRef, concern: WaitConcern, predicate: P)
    where
        P: CompletionPredicate + 'static,
    {
        let session = Arc::clone(&pass.session);
        let vm_ref = vm_ref.clone();
        let id = pass.vm.id;
        self.notifier
            .notify_on_completion(WaitKey::new(id, concern), move |progress| async move {
                watch_until(session.as_ref(), &vm_ref, &predicate, |event| {
                    debug!(vm_id = %id, event = ?event, "Watch progress");
                    if matches!(event, WatchEvent::AddressDiscovered { .. }) {
                        progress.report();
                    }
                })
                .await
                .map(|_| ())
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_is_not_transient() {
        assert!(!ReconcileError::Invariant("x".to_string()).is_transient());
        assert!(ReconcileError::Remote(RemoteError::Unauthenticated).is_transient());
    }

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.retry_backoff, Duration::from_secs(60));
        assert_eq!(config.soft_power_off_timeout, Duration::from_secs(300));
    }
}
