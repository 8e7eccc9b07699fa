use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::Frame;

/// Message delivered to an exchange task's inbox.
#[derive(Debug)]
pub enum ExchangeMsg {
    /// A frame addressed to this exchange's correlation id
    Frame(Frame),
    /// Force-terminate: the owning tunnel connection is going away
    Abort,
}

/// Kind tag for table entries, mainly for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Http,
    Socket,
}

/// Uniform capability to feed or abort one in-flight exchange.
///
/// Whatever an exchange actually is (an HTTP cycle or a proxied WebSocket),
/// the table only ever sees this handle: frames go in through [`deliver`],
/// teardown through [`abort`]. The exchange itself is a task draining the
/// receiving half.
///
/// [`deliver`]: ExchangeHandle::deliver
/// [`abort`]: ExchangeHandle::abort
#[derive(Debug, Clone)]
pub struct ExchangeHandle {
    id: Uuid,
    kind: ExchangeKind,
    tx: mpsc::UnboundedSender<ExchangeMsg>,
}

impl ExchangeHandle {
    /// Create a handle and the inbox its exchange task will drain.
    pub fn new(id: Uuid, kind: ExchangeKind) -> (Self, mpsc::UnboundedReceiver<ExchangeMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, kind, tx }, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Deliver a frame to the exchange. Returns false if its task is gone.
    pub fn deliver(&self, frame: Frame) -> bool {
        self.tx.send(ExchangeMsg::Frame(frame)).is_ok()
    }

    /// Ask the exchange to tear down immediately.
    pub fn abort(&self) {
        let _ = self.tx.send(ExchangeMsg::Abort);
    }
}

/// In-flight exchanges of one tunnel connection, keyed by correlation id.
///
/// Shared between the tunnel's read loop (routing inbound frames) and the
/// exchange tasks (deregistering themselves); all access goes through the
/// internal lock, which is never held across an await point.
#[derive(Debug, Default)]
pub struct ExchangeTable {
    entries: Mutex<HashMap<Uuid, ExchangeHandle>>,
}

impl ExchangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ExchangeHandle>> {
        // A panicked holder cannot leave the map mid-mutation; recover it.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handle under its id.
    ///
    /// Ids are freshly generated UUIDs, so an occupied slot means an id was
    /// reused while still registered; the stale entry is aborted and
    /// replaced so the invariant of one exchange per id holds.
    pub fn insert(&self, handle: ExchangeHandle) {
        let id = handle.id();
        if let Some(stale) = self.lock().insert(id, handle) {
            warn!(%id, "Replacing exchange already registered under this id");
            stale.abort();
        }
    }

    /// Remove the entry for `id`, if any. Safe to call repeatedly.
    pub fn remove(&self, id: &Uuid) -> Option<ExchangeHandle> {
        self.lock().remove(id)
    }

    /// Route an inbound frame to the exchange that owns its id.
    ///
    /// Returns false when no exchange claims the id (or its task already
    /// exited); the caller drops the frame.
    pub fn route(&self, frame: Frame) -> bool {
        let handle = self.lock().get(&frame.id).cloned();
        match handle {
            Some(handle) => handle.deliver(frame),
            None => false,
        }
    }

    /// Abort every registered exchange and clear the table.
    pub fn abort_all(&self) {
        let drained: Vec<ExchangeHandle> = {
            let mut entries = self.lock();
            entries.drain().map(|(_, handle)| handle).collect()
        };
        debug!(count = drained.len(), "Aborting all exchanges");
        for handle in drained {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.lock().contains_key(id)
    }
}

/// Removes an exchange from its table when dropped.
///
/// Every exit path of an exchange task (end frame, disconnect, timeout,
/// abort, panic) funnels through dropping this guard, so deregistration
/// happens exactly once however the task ends.
#[derive(Debug)]
pub struct Registration {
    table: Arc<ExchangeTable>,
    id: Uuid,
}

impl Registration {
    /// Insert `handle` into `table` and return the guard that undoes it.
    pub fn register(table: Arc<ExchangeTable>, handle: ExchangeHandle) -> Self {
        let id = handle.id();
        table.insert(handle);
        Self { table, id }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_to_registered_exchange() {
        let table = ExchangeTable::new();
        let id = Uuid::new_v4();
        let (handle, mut rx) = ExchangeHandle::new(id, ExchangeKind::Http);
        table.insert(handle);

        assert!(table.route(Frame::request_end(id)));
        match rx.try_recv().unwrap() {
            ExchangeMsg::Frame(frame) => assert_eq!(frame.id, id),
            other => panic!("Expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_id_is_not_routed() {
        let table = ExchangeTable::new();
        assert!(!table.route(Frame::request_end(Uuid::new_v4())));
    }

    #[test]
    fn test_route_after_task_exit_reports_failure() {
        let table = ExchangeTable::new();
        let id = Uuid::new_v4();
        let (handle, rx) = ExchangeHandle::new(id, ExchangeKind::Http);
        table.insert(handle);
        drop(rx); // the exchange task is gone

        assert!(!table.route(Frame::request_end(id)));
    }

    #[test]
    fn test_abort_all_drains_and_signals() {
        let table = ExchangeTable::new();
        let (h1, mut rx1) = ExchangeHandle::new(Uuid::new_v4(), ExchangeKind::Http);
        let (h2, mut rx2) = ExchangeHandle::new(Uuid::new_v4(), ExchangeKind::Socket);
        table.insert(h1);
        table.insert(h2);

        table.abort_all();
        assert!(table.is_empty());
        assert!(matches!(rx1.try_recv().unwrap(), ExchangeMsg::Abort));
        assert!(matches!(rx2.try_recv().unwrap(), ExchangeMsg::Abort));
    }

    #[test]
    fn test_registration_deregisters_on_drop() {
        let table = Arc::new(ExchangeTable::new());
        let id = Uuid::new_v4();
        let (handle, _rx) = ExchangeHandle::new(id, ExchangeKind::Http);

        let registration = Registration::register(table.clone(), handle);
        assert!(table.contains(&id));

        drop(registration);
        assert!(!table.contains(&id));
        // A second removal of the same id is a no-op.
        assert!(table.remove(&id).is_none());
    }

    #[test]
    fn test_insert_replaces_and_aborts_stale_entry() {
        let table = ExchangeTable::new();
        let id = Uuid::new_v4();
        let (stale, mut stale_rx) = ExchangeHandle::new(id, ExchangeKind::Http);
        let (fresh, _fresh_rx) = ExchangeHandle::new(id, ExchangeKind::Http);

        table.insert(stale);
        table.insert(fresh);

        assert_eq!(table.len(), 1);
        assert!(matches!(stale_rx.try_recv().unwrap(), ExchangeMsg::Abort));
    }
}
