//! Recovery from a controller restart with the SQLite store.
//!
//! All progress lives in the persisted status, so a fresh reconciler on the
//! same database picks up where the previous one stopped.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{t0, test_spec, BACKOFF, POLL};
use vmctl_controller::capability::PlainScope;
use vmctl_controller::remote::{OperationKind, TaskMode};
use vmctl_controller::session::{SessionCache, SharedConnector};
use vmctl_controller::{
    CompletionNotifier, ManagedVm, MockProvider, ObjectStore, Reconciler, ReconcilerConfig,
    SqliteObjectStore, VmPhase,
};
use vmctl_reconcile::{Action, ManualClock};

fn build_reconciler(
    path: &Path,
    provider: &Arc<MockProvider>,
    clock: &Arc<ManualClock>,
) -> Reconciler {
    let store = Arc::new(SqliteObjectStore::open(path).unwrap());
    let sessions = Arc::new(SessionCache::new(Arc::new(SharedConnector::new(
        provider.clone(),
    ))));
    let (notifier, _dispatcher) = CompletionNotifier::new();
    Reconciler::new(
        store,
        sessions,
        notifier,
        Arc::new(PlainScope),
        clock.clone(),
        ReconcilerConfig {
            retry_backoff: BACKOFF,
            task_poll_interval: POLL,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_in_flight_task_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vmctl.db");
    let provider = Arc::new(MockProvider::new());
    provider.set_task_mode(TaskMode::Manual);
    let clock = Arc::new(ManualClock::new(t0()));

    let vm = {
        let store = SqliteObjectStore::open(&path).unwrap();
        store.put(ManagedVm::new("web-0", test_spec())).await.unwrap()
    };

    {
        let reconciler = build_reconciler(&path, &provider, &clock);
        assert_eq!(
            reconciler.reconcile(vm.id).await.unwrap(),
            Action::Requeue(POLL)
        );
    }

    provider.complete_task("t1");

    let reconciler = build_reconciler(&path, &provider, &clock);
    assert_eq!(
        reconciler.reconcile(vm.id).await.unwrap(),
        Action::Requeue(POLL)
    );
    assert_eq!(
        provider.submissions(),
        vec![OperationKind::Clone, OperationKind::PowerOn]
    );

    let store = SqliteObjectStore::open(&path).unwrap();
    let stored = store.get(vm.id).await.unwrap().unwrap();
    assert_eq!(stored.status.phase, VmPhase::PoweringOn);
    assert_eq!(stored.status.task_ref.as_deref(), Some("t2"));
}

#[tokio::test]
async fn test_backoff_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vmctl.db");
    let provider = Arc::new(MockProvider::new());
    provider.fail_next(OperationKind::Clone, "quota exceeded");
    let clock = Arc::new(ManualClock::new(t0()));

    let vm = {
        let store = SqliteObjectStore::open(&path).unwrap();
        store.put(ManagedVm::new("web-0", test_spec())).await.unwrap()
    };

    {
        let reconciler = build_reconciler(&path, &provider, &clock);
        reconciler.reconcile(vm.id).await.unwrap();
        assert_eq!(
            reconciler.reconcile(vm.id).await.unwrap(),
            Action::Requeue(BACKOFF)
        );
    }

    clock.advance(Duration::from_secs(30));
    let reconciler = build_reconciler(&path, &provider, &clock);
    assert_eq!(
        reconciler.reconcile(vm.id).await.unwrap(),
        Action::Requeue(Duration::from_secs(30))
    );
    assert_eq!(provider.submission_count(), 1);

    clock.advance(Duration::from_secs(30));
    reconciler.reconcile(vm.id).await.unwrap();
    assert_eq!(provider.submission_count(), 2);
}
