//! Work queue that routes requeue signals to per-resource actors.
//!
//! Requeues arrive on one channel from three places: background waits (via
//! the completion dispatcher), actor timers, and owners that changed a
//! resource. Each is forwarded to the resource's actor, spawning one when
//! none is alive. A periodic resync lists the store and triggers every
//! resource, which also recovers in-flight work after a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use vmctl_id::VmId;

use crate::actors::{
    ActorError, ActorHandle, ResourceActor, ResourceMessage, Supervisor, Trigger,
    RESOURCE_MAILBOX_SIZE,
};
use crate::notifier::RequeueSink;
use crate::reconciler::Reconciler;
use crate::store::ObjectStore;

/// Routes work to resource actors.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn ObjectStore>,
    supervisor: Supervisor,
    actors: HashMap<VmId, ActorHandle<ResourceMessage>>,
    requeue_tx: mpsc::UnboundedSender<VmId>,
    requeue_rx: mpsc::UnboundedReceiver<VmId>,
    resync_interval: Duration,
}

impl Controller {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn ObjectStore>,
        resync_interval: Duration,
    ) -> Self {
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        Self {
            reconciler,
            store,
            supervisor: Supervisor::new(),
            actors: HashMap::new(),
            requeue_tx,
            requeue_rx,
            resync_interval,
        }
    }

    /// Sink that requeues resources on this controller.
    ///
    /// Owners call it after writing a resource; the completion dispatcher
    /// uses it for finished waits.
    pub fn requeue_sink(&self) -> Arc<dyn RequeueSink> {
        Arc::new(self.requeue_tx.clone())
    }

    /// Number of live resource actors.
    pub fn active_count(&self) -> usize {
        self.supervisor.running_count()
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            resync_interval_secs = self.resync_interval.as_secs(),
            "Starting controller"
        );

        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(id) = self.requeue_rx.recv() => {
                    self.dispatch(id, Trigger::Requeue);
                }
                _ = resync.tick() => {
                    self.resync().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller shutting down");
                        break;
                    }
                }
            }
        }

        self.supervisor.stop_all().await;
    }

    /// Trigger a pass for every stored resource.
    async fn resync(&mut self) {
        let reaped = self.supervisor.reap();
        self.actors.retain(|_, handle| !handle.is_closed());

        let resources = match self.store.list().await {
            Ok(resources) => resources,
            Err(e) => {
                error!(error = %e, "Resync failed to list resources");
                return;
            }
        };

        debug!(count = resources.len(), reaped, "Resync");
        for vm in resources {
            self.dispatch(vm.id, Trigger::Resync);
        }
    }

    fn dispatch(&mut self, id: VmId, trigger: Trigger) {
        if let Some(handle) = self.actors.get(&id) {
            match handle.try_send(ResourceMessage::Reconcile(trigger)) {
                Ok(()) => return,
                Err(ActorError::MailboxFull) => {
                    debug!(vm_id = %id, "Pass already queued");
                    return;
                }
                Err(_) => {
                    self.actors.remove(&id);
                }
            }
        }

        let actor = ResourceActor::new(
            id,
            Arc::clone(&self.reconciler),
            self.requeue_sink(),
        );
        let handle = self.supervisor.spawn(actor, RESOURCE_MAILBOX_SIZE);
        // A fresh mailbox has room for one message.
        if let Err(e) = handle.try_send(ResourceMessage::Reconcile(trigger)) {
            error!(vm_id = %id, error = %e, "Failed to trigger new actor");
            return;
        }
        self.actors.insert(id, handle);
    }
}
