//! Core actor framework types and traits.
//!
//! Provides the fundamental building blocks for the actor system:
//! - `Actor` trait for defining actor behavior
//! - `Supervisor` for tracking actor lifecycles
//! - `ActorHandle` for sending messages to actors

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name, unique among live actors.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}

    /// Called for each message still queued when the actor stopped itself.
    ///
    /// The mailbox is already closed, so senders see the actor as stopped.
    async fn on_undelivered(&mut self, msg: Self::Message, ctx: &mut ActorContext) {
        debug!(actor_id = %ctx.actor_id, msg = ?msg, "Dropping undelivered message");
    }
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    pub actor_id: String,

    pub messages_processed: u64,
}

impl ActorContext {
    pub fn new(actor_id: String) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Transient error; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error; the actor stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Actor mailbox is full.
    #[error("mailbox full")]
    MailboxFull,

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
#[derive(Clone)]
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
}

impl<M: Message> ActorHandle<M> {
    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    /// True once the actor has stopped and closed its mailbox.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Supervised actor task.
struct Child {
    task_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Child {
    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Tracks spawned actors and stops them on shutdown.
///
/// Actors that stop on their own are reaped; they are not restarted. The
/// owner spawns a fresh actor the next time it has work for that name.
#[derive(Default)]
pub struct Supervisor {
    children: HashMap<String, Child>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn an actor under its name with a bounded mailbox.
    ///
    /// A finished actor with the same name is replaced.
    pub fn spawn<A>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message>
    where
        A: Actor,
    {
        let actor_id = actor.name().to_string();
        let (tx, rx) = mpsc::channel(mailbox_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(run_actor_loop(actor, rx, shutdown_rx, actor_id.clone()));

        if let Some(previous) = self.children.insert(
            actor_id.clone(),
            Child {
                task_handle,
                shutdown_tx,
            },
        ) {
            // The previous actor closed its mailbox and is finishing on_stop.
            if previous.is_running() {
                debug!(actor_id = %actor_id, "Replaced a stopping actor");
                previous.stop();
            }
        }

        debug!(actor_id = %actor_id, "Spawned actor");

        ActorHandle { tx }
    }

    /// Forget actors whose task has finished. Returns how many were removed.
    pub fn reap(&mut self) -> usize {
        let before = self.children.len();
        self.children.retain(|_, child| child.is_running());
        before - self.children.len()
    }

    /// Stop all supervised actors.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");

        for child in self.children.values() {
            child.stop();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if self.children.values().all(|c| !c.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for (actor_id, child) in &self.children {
            if child.is_running() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                child.abort();
            }
        }

        self.children.clear();
    }

    /// Get count of running actors.
    pub fn running_count(&self) -> usize {
        self.children.values().filter(|c| c.is_running()).count()
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

/// Run the main actor loop.
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    debug!(actor_id = %actor_id, "Actor started");

    let mut self_stopped = false;
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };

                ctx.messages_processed += 1;

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(actor_id = %actor_id, "Actor requested stop");
                        self_stopped = true;
                        break;
                    }
                    Err(ActorError::Permanent(e)) => {
                        error!(actor_id = %actor_id, error = %e, "Actor failed");
                        self_stopped = true;
                        break;
                    }
                    Err(e) => {
                        warn!(actor_id = %actor_id, error = %e, "Actor error");
                    }
                }
            }
        }
    }

    // Close the mailbox before cleanup so senders see the actor as stopped.
    rx.close();

    actor.on_stop(&mut ctx).await;

    // Messages accepted while the last message was handled. On shutdown
    // they are dropped with the rest of the controller.
    if self_stopped {
        while let Ok(msg) = rx.try_recv() {
            actor.on_undelivered(msg, &mut ctx).await;
        }
    }

    debug!(
        actor_id = %ctx.actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    enum TestMessage {
        Ping,
        Stop,
        Fail,
    }

    struct TestActor {
        name: String,
        pings: Arc<AtomicU32>,
        undelivered: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Actor for TestActor {
        type Message = TestMessage;

        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(
            &mut self,
            msg: TestMessage,
            _ctx: &mut ActorContext,
        ) -> Result<bool, ActorError> {
            match msg {
                TestMessage::Ping => {
                    self.pings.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
                TestMessage::Stop => Ok(false),
                TestMessage::Fail => Err(ActorError::Permanent("boom".to_string())),
            }
        }

        async fn on_undelivered(&mut self, _msg: TestMessage, _ctx: &mut ActorContext) {
            self.undelivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Counters {
        pings: Arc<AtomicU32>,
        undelivered: Arc<AtomicU32>,
    }

    fn actor(name: &str) -> (TestActor, Counters) {
        let pings = Arc::new(AtomicU32::new(0));
        let undelivered = Arc::new(AtomicU32::new(0));
        (
            TestActor {
                name: name.to_string(),
                pings: Arc::clone(&pings),
                undelivered: Arc::clone(&undelivered),
            },
            Counters { pings, undelivered },
        )
    }

    async fn wait_stopped(supervisor: &Supervisor) {
        while supervisor.running_count() > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_try_send_reports_full_mailbox() {
        let (tx, _rx) = mpsc::channel::<TestMessage>(1);
        let handle = ActorHandle { tx };

        handle.try_send(TestMessage::Ping).unwrap();
        assert!(matches!(
            handle.try_send(TestMessage::Ping),
            Err(ActorError::MailboxFull)
        ));
    }

    #[tokio::test]
    async fn test_actor_processes_then_stops() {
        let mut supervisor = Supervisor::new();
        let (actor, counters) = actor("a");
        let handle = supervisor.spawn(actor, 4);

        handle.try_send(TestMessage::Ping).unwrap();
        handle.try_send(TestMessage::Ping).unwrap();
        handle.try_send(TestMessage::Stop).unwrap();

        wait_stopped(&supervisor).await;
        assert!(handle.is_closed());
        assert_eq!(counters.pings.load(Ordering::SeqCst), 2);
        assert!(matches!(
            handle.try_send(TestMessage::Ping),
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_messages_queued_behind_stop_are_handed_back() {
        let mut supervisor = Supervisor::new();
        let (actor, counters) = actor("a");
        let handle = supervisor.spawn(actor, 4);

        // Both are queued before the actor task first runs.
        handle.try_send(TestMessage::Stop).unwrap();
        handle.try_send(TestMessage::Ping).unwrap();

        wait_stopped(&supervisor).await;
        assert_eq!(counters.pings.load(Ordering::SeqCst), 0);
        assert_eq!(counters.undelivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_messages() {
        let mut supervisor = Supervisor::new();
        let (actor, counters) = actor("a");
        let handle = supervisor.spawn(actor, 4);

        handle.try_send(TestMessage::Ping).unwrap();
        supervisor.stop_all().await;

        // Shutdown wins the biased select before the mailbox is read.
        assert_eq!(counters.pings.load(Ordering::SeqCst), 0);
        assert_eq!(counters.undelivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_actor() {
        let mut supervisor = Supervisor::new();
        let (actor, _) = actor("a");
        let handle = supervisor.spawn(actor, 4);

        handle.try_send(TestMessage::Fail).unwrap();
        wait_stopped(&supervisor).await;
        assert!(handle.is_closed());
        assert_eq!(supervisor.reap(), 1);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn(actor("a").0, 4);
        supervisor.spawn(actor("b").0, 4);
        assert_eq!(supervisor.running_count(), 2);

        supervisor.stop_all().await;
        assert_eq!(supervisor.running_count(), 0);
    }
}
