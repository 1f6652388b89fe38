//! Resource actor - runs reconcile passes for a single managed VM.
//!
//! There is exactly one actor per live resource, and it processes one
//! message at a time, so two passes for the same VM never overlap. Its
//! mailbox holds a single message: a trigger that arrives while a pass is
//! already queued is dropped, since the queued pass will see the same state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use vmctl_id::VmId;
use vmctl_reconcile::Action;

use super::framework::{Actor, ActorContext, ActorError};
use crate::notifier::RequeueSink;
use crate::reconciler::Reconciler;

/// Mailbox size that coalesces redundant triggers.
pub const RESOURCE_MAILBOX_SIZE: usize = 1;

/// Why a pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A background wait completed, a timer fired, or the owner changed the
    /// resource.
    Requeue,
    /// Periodic resync.
    Resync,
}

#[derive(Debug)]
pub enum ResourceMessage {
    Reconcile(Trigger),
}

/// Actor owning reconcile passes for one VM.
pub struct ResourceActor {
    id: VmId,
    name: String,
    reconciler: Arc<Reconciler>,
    sink: Arc<dyn RequeueSink>,
    timer: Option<JoinHandle<()>>,
}

impl ResourceActor {
    pub fn new(id: VmId, reconciler: Arc<Reconciler>, sink: Arc<dyn RequeueSink>) -> Self {
        Self {
            id,
            name: id.to_string(),
            reconciler,
            sink,
            timer: None,
        }
    }

    /// Replace any pending timer with one that fires after `delay`.
    fn schedule(&mut self, delay: Duration) {
        self.cancel_timer();
        let id = self.id;
        let sink = Arc::clone(&self.sink);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.requeue(id);
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[async_trait]
impl Actor for ResourceActor {
    type Message = ResourceMessage;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &mut self,
        msg: ResourceMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        let ResourceMessage::Reconcile(trigger) = msg;
        debug!(vm_id = %self.id, trigger = ?trigger, "Reconcile requested");

        match self.reconciler.reconcile(self.id).await {
            Ok(Action::Done) => {
                debug!(vm_id = %self.id, "Resource finished");
                Ok(false)
            }
            Ok(Action::Requeue(delay)) => {
                self.schedule(delay);
                Ok(true)
            }
            Ok(Action::AwaitChange) => {
                self.cancel_timer();
                Ok(true)
            }
            Err(e) if e.is_transient() => {
                warn!(vm_id = %self.id, error = %e, "Reconcile failed");
                self.schedule(self.reconciler.config().retry_backoff);
                Err(ActorError::Transient(e.to_string()))
            }
            Err(e) => {
                error!(vm_id = %self.id, error = %e, "Reconcile hit an invariant violation");
                Err(ActorError::Permanent(e.to_string()))
            }
        }
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        self.cancel_timer();
    }

    async fn on_undelivered(&mut self, msg: ResourceMessage, _ctx: &mut ActorContext) {
        debug!(vm_id = %self.id, msg = ?msg, "Requeueing trigger received while stopping");
        self.sink.requeue(self.id);
    }
}
