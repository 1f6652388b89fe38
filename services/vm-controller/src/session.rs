//! Provider session cache.
//!
//! Sessions are expensive to establish, so one is kept per server key and
//! shared by every reconcile pass that targets that server. A pass that sees
//! an authentication failure invalidates the entry; the next pass connects
//! again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::remote::{RemoteError, Session};

/// Establishes new sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &str) -> Result<Arc<dyn Session>, RemoteError>;
}

/// Connector that always returns the same session. Used with the simulated
/// provider, which has no real connection to establish.
pub struct SharedConnector {
    session: Arc<dyn Session>,
}

impl SharedConnector {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Connector for SharedConnector {
    async fn connect(&self, _server: &str) -> Result<Arc<dyn Session>, RemoteError> {
        Ok(Arc::clone(&self.session))
    }
}

/// Cache of live sessions keyed by server.
pub struct SessionCache {
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<String, Arc<dyn Session>>>,
}

impl SessionCache {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached session for `server`, connecting if there is none.
    ///
    /// The cache lock is held across the connect so concurrent callers for
    /// the same key share one connection attempt.
    pub async fn get_or_create(&self, server: &str) -> Result<Arc<dyn Session>, RemoteError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(server) {
            return Ok(Arc::clone(session));
        }

        let session = self.connector.connect(server).await?;
        info!(server = %server, "Provider session established");
        sessions.insert(server.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Drop the cached session for `server`.
    pub async fn invalidate(&self, server: &str) -> bool {
        let removed = self.sessions.lock().await.remove(server).is_some();
        if removed {
            debug!(server = %server, "Provider session invalidated");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockProvider;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingConnector {
        connects: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, _server: &str) -> Result<Arc<dyn Session>, RemoteError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RemoteError::Transport("no route to host".to_string()));
            }
            Ok(Arc::new(MockProvider::new()))
        }
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_session() {
        let connector = Arc::new(CountingConnector {
            connects: AtomicU32::new(0),
            fail: false,
        });
        let cache = SessionCache::new(connector.clone());

        cache.get_or_create("vc-a").await.unwrap();
        cache.get_or_create("vc-a").await.unwrap();
        cache.get_or_create("vc-b").await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reconnect() {
        let connector = Arc::new(CountingConnector {
            connects: AtomicU32::new(0),
            fail: false,
        });
        let cache = SessionCache::new(connector.clone());

        cache.get_or_create("vc-a").await.unwrap();
        assert!(cache.invalidate("vc-a").await);
        assert!(!cache.invalidate("vc-a").await);
        cache.get_or_create("vc-a").await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_cached() {
        let connector = Arc::new(CountingConnector {
            connects: AtomicU32::new(0),
            fail: true,
        });
        let cache = SessionCache::new(connector);

        assert!(cache.get_or_create("vc-a").await.is_err());
        assert!(cache.is_empty().await);
    }
}
