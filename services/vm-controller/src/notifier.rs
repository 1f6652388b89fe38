//! Completion notifier.
//!
//! Bridges background waits (task polling, property watches) back to the
//! control loop. A wait runs as a detached task and, when it finishes, sends
//! one signal over a shared channel. A single [`Dispatcher`] drains that
//! channel and turns each signal into a requeue of the owning resource.
//!
//! Waits are keyed by resource and concern. Launching a wait whose key is
//! already in flight does nothing, so a reconciler can ask for the same wait
//! on every pass. A completion is always delivered, including when the wait
//! errors or panics; delivering one too many is harmless.
//!
//! An address wait carries a fingerprint of its requirements. Launching one
//! with a new fingerprint aborts the stale wait for the same resource.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, debug_span, info, warn, Instrument};
use vmctl_id::{VmId, WatchId};

/// Receives "re-examine this resource" signals.
pub trait RequeueSink: Send + Sync {
    fn requeue(&self, id: VmId);
}

impl RequeueSink for mpsc::UnboundedSender<VmId> {
    fn requeue(&self, id: VmId) {
        // A closed receiver means the controller is shutting down.
        let _ = self.send(id);
    }
}

/// What a background wait is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitConcern {
    /// A remote task reaching a terminal state.
    Task(String),
    /// Every NIC getting a MAC address.
    Macs,
    /// Required guest addresses appearing, keyed by a fingerprint of the
    /// requirements.
    Addresses(String),
    /// The guest powering itself off.
    PowerOff,
}

impl std::fmt::Display for WaitConcern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task(id) => write!(f, "task:{id}"),
            Self::Macs => f.write_str("macs"),
            Self::Addresses(fingerprint) => write!(f, "addresses:{fingerprint}"),
            Self::PowerOff => f.write_str("power_off"),
        }
    }
}

impl WaitConcern {
    /// True if a wait for `self` makes an in-flight wait for `other` obsolete.
    fn supersedes(&self, other: &WaitConcern) -> bool {
        matches!(
            (self, other),
            (Self::Addresses(new), Self::Addresses(old)) if new != old
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    pub resource: VmId,
    pub concern: WaitConcern,
}

impl WaitKey {
    pub fn new(resource: VmId, concern: WaitConcern) -> Self {
        Self { resource, concern }
    }
}

#[derive(Debug)]
enum Signal {
    Progress(VmId),
    Completed {
        key: WaitKey,
        outcome: Result<(), String>,
    },
}

/// Handle given to a wait for reporting intermediate progress.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    resource: VmId,
    tx: mpsc::UnboundedSender<Signal>,
}

impl ProgressReporter {
    /// Ask for the resource to be re-examined without ending the wait.
    pub fn report(&self) {
        let _ = self.tx.send(Signal::Progress(self.resource));
    }
}

/// Sends the completion when dropped, so a panicking wait still reports.
struct CompletionGuard {
    key: Option<WaitKey>,
    outcome: Result<(), String>,
    tx: mpsc::UnboundedSender<Signal>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let outcome = std::mem::replace(&mut self.outcome, Ok(()));
            let _ = self.tx.send(Signal::Completed { key, outcome });
        }
    }
}

/// Launches background waits.
#[derive(Clone)]
pub struct CompletionNotifier {
    in_flight: Arc<Mutex<InFlight>>,
    tx: mpsc::UnboundedSender<Signal>,
}

type InFlight = HashMap<WaitKey, AbortHandle>;

impl CompletionNotifier {
    /// Create a notifier and the dispatcher that consumes its signals.
    pub fn new() -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(Mutex::new(HashMap::new()));
        (
            Self {
                in_flight: Arc::clone(&in_flight),
                tx,
            },
            Dispatcher { rx, in_flight },
        )
    }

    fn in_flight_set(&self) -> std::sync::MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `wait` in the background and requeue `key.resource` when it ends.
    ///
    /// Returns false without launching anything if a wait for `key` is
    /// already in flight. Waits that `key` supersedes are aborted; their
    /// completion is still delivered. Never blocks.
    pub fn notify_on_completion<F, Fut, E>(&self, key: WaitKey, wait: F) -> bool
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display,
    {
        // Held until the handle is stored so the dispatcher cannot remove
        // the key first.
        let mut in_flight = self.in_flight_set();
        if in_flight.contains_key(&key) {
            return false;
        }

        for (stale, handle) in in_flight.iter() {
            if stale.resource == key.resource && key.concern.supersedes(&stale.concern) {
                debug!(
                    vm_id = %key.resource,
                    concern = %stale.concern,
                    "Aborting superseded wait"
                );
                handle.abort();
            }
        }

        let watch_id = WatchId::new();
        debug!(
            vm_id = %key.resource,
            concern = %key.concern,
            watch_id = %watch_id,
            "Launching background wait"
        );
        let span = debug_span!(
            "wait",
            vm_id = %key.resource,
            concern = %key.concern,
            watch_id = %watch_id
        );

        let reporter = ProgressReporter {
            resource: key.resource,
            tx: self.tx.clone(),
        };
        let fut = wait(reporter);
        let mut guard = CompletionGuard {
            key: Some(key.clone()),
            outcome: Err("wait aborted".to_string()),
            tx: self.tx.clone(),
        };

        let task = tokio::spawn(
            async move {
                guard.outcome = fut.await.map_err(|e| e.to_string());
                drop(guard);
            }
            .instrument(span),
        );
        in_flight.insert(key, task.abort_handle());

        true
    }

    pub fn is_in_flight(&self, key: &WaitKey) -> bool {
        self.in_flight_set().contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight_set().len()
    }
}

/// Drains completion signals and requeues their resources.
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<Signal>,
    in_flight: Arc<Mutex<InFlight>>,
}

impl Dispatcher {
    /// Run until shutdown or until every notifier handle is dropped.
    pub async fn run(mut self, sink: Arc<dyn RequeueSink>, mut shutdown: watch::Receiver<bool>) {
        info!("Completion dispatcher started");

        loop {
            tokio::select! {
                signal = self.rx.recv() => {
                    let Some(signal) = signal else {
                        break;
                    };
                    self.dispatch(signal, sink.as_ref());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Completion dispatcher stopped");
    }

    fn dispatch(&self, signal: Signal, sink: &dyn RequeueSink) {
        match signal {
            Signal::Progress(id) => {
                debug!(vm_id = %id, "Wait progress");
                sink.requeue(id);
            }
            Signal::Completed { key, outcome } => {
                self.in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                match outcome {
                    Ok(()) => {
                        debug!(vm_id = %key.resource, concern = %key.concern, "Wait completed")
                    }
                    Err(e) => warn!(
                        vm_id = %key.resource,
                        concern = %key.concern,
                        error = %e,
                        "Wait ended with error"
                    ),
                }
                sink.requeue(key.resource);
            }
        }
    }
}
