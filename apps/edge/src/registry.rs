use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::tunnel::TunnelConnection;

/// Edge-wide map from backend id (subdomain) to its live tunnel connection.
///
/// This is the only state shared across tunnel connections: written when a
/// backend connects or disconnects, read on every inbound public request.
/// The registry holds the strong references to connections; exchanges only
/// ever hold the connection's frame queue.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Mutex<HashMap<String, Arc<TunnelConnection>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TunnelConnection>>> {
        self.backends.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a connection under its claimed backend id.
    ///
    /// A previous holder of the id is destroyed (all its exchanges
    /// aborted, its socket told to close) before the new connection
    /// becomes resolvable, so no request can leak across the swap.
    pub fn register(&self, conn: Arc<TunnelConnection>) {
        let id = conn.backend_id().to_string();
        let mut backends = self.lock();
        if let Some(old) = backends.remove(&id) {
            info!(backend_id = %id, "Replacing live backend, destroying previous connection");
            old.destroy();
        }
        backends.insert(id, conn);
    }

    /// Tunnel currently serving `id`, if any. `None` means no backend: the
    /// caller answers gateway-unavailable and creates nothing.
    pub fn resolve(&self, id: &str) -> Option<Arc<TunnelConnection>> {
        self.lock().get(id).cloned()
    }

    /// Remove the entry for the connection's id, but only if the entry
    /// still points at this very connection. A close racing a takeover
    /// must not evict the replacement.
    pub fn unregister(&self, id: &str, conn: &TunnelConnection) {
        let mut backends = self.lock();
        match backends.get(id) {
            Some(current) if current.token() == conn.token() => {
                backends.remove(id);
                debug!(backend_id = %id, "Backend unregistered");
            }
            _ => {
                debug!(backend_id = %id, "Stale unregister ignored");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use culvert_common::{ExchangeHandle, ExchangeKind, ExchangeMsg};
    use uuid::Uuid;

    #[test]
    fn test_register_and_resolve() {
        let registry = BackendRegistry::new();
        let (conn, _rx) = TunnelConnection::new("abc".to_string());
        registry.register(conn.clone());

        let resolved = registry.resolve("abc").unwrap();
        assert_eq!(resolved.token(), conn.token());
        assert!(registry.resolve("xyz").is_none());
    }

    #[test]
    fn test_register_destroys_previous_holder_first() {
        let registry = BackendRegistry::new();
        let (old, _old_rx) = TunnelConnection::new("abc".to_string());
        let (h, mut exchange_rx) = ExchangeHandle::new(Uuid::new_v4(), ExchangeKind::Http);
        old.table().insert(h);
        registry.register(old.clone());

        let (new, _new_rx) = TunnelConnection::new("abc".to_string());
        registry.register(new.clone());

        // The old connection lost all its exchanges and the id now resolves
        // to the replacement.
        assert!(old.table().is_empty());
        assert!(matches!(exchange_rx.try_recv().unwrap(), ExchangeMsg::Abort));
        assert_eq!(registry.resolve("abc").unwrap().token(), new.token());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_unregister_keeps_replacement() {
        let registry = BackendRegistry::new();
        let (old, _old_rx) = TunnelConnection::new("abc".to_string());
        let (new, _new_rx) = TunnelConnection::new("abc".to_string());
        registry.register(old.clone());
        registry.register(new.clone());

        // The old connection's delayed close must not evict the new one.
        registry.unregister("abc", &old);
        assert_eq!(registry.resolve("abc").unwrap().token(), new.token());

        registry.unregister("abc", &new);
        assert!(registry.is_empty());
    }
}
