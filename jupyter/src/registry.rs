//! Interception registry
//!
//! An ordered list of `(socket, msg_type, handler)` entries. The relay looks up
//! every entry matching an inbound message and runs their handlers in
//! registration order. Handlers may add or remove entries while a dispatch is
//! in progress: dispatch works on a snapshot taken before the first handler
//! runs, so such changes only affect later messages.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;
use crate::relay::ProxyRelay;
use crate::socket::{Side, SocketType};
use crate::wire::Frames;

/// Where a message is headed when a handler sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub side: Side,
    pub socket: SocketType,
}

/// Outcome of a handler: frames to pass on, or `None` to drop the message
pub type InterceptResult = Result<Option<Frames>>;

pub type InterceptFuture = Pin<Box<dyn Future<Output = InterceptResult> + Send>>;

/// A registered message handler
pub type Handler = Arc<dyn Fn(Arc<ProxyRelay>, Target, Frames) -> InterceptFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<ProxyRelay>, Target, Frames) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InterceptResult> + Send + 'static,
{
    Arc::new(move |relay, target, frames| Box::pin(f(relay, target, frames)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterceptorId(u64);

/// Registration details visible to lookup predicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub id: InterceptorId,
    pub socket: SocketType,
    pub msg_type: String,
    pub tag: Option<String>,
}

struct Entry {
    info: EntryInfo,
    handler: Handler,
}

#[derive(Default)]
pub struct InterceptionRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl InterceptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        // Entries are only ever pushed or removed whole, so a poisoned list is
        // still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a permanent handler
    pub fn add(&self, socket: SocketType, msg_type: &str, handler: Handler) -> InterceptorId {
        self.insert(socket, msg_type, None, handler)
    }

    /// Register a handler that can later be removed together with every other
    /// handler sharing `tag`
    pub fn add_tagged(
        &self,
        socket: SocketType,
        msg_type: &str,
        tag: &str,
        handler: Handler,
    ) -> InterceptorId {
        self.insert(socket, msg_type, Some(tag.to_string()), handler)
    }

    fn insert(
        &self,
        socket: SocketType,
        msg_type: &str,
        tag: Option<String>,
        handler: Handler,
    ) -> InterceptorId {
        let id = InterceptorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push(Entry {
            info: EntryInfo {
                id,
                socket,
                msg_type: msg_type.to_string(),
                tag,
            },
            handler,
        });
        id
    }

    pub fn remove(&self, id: InterceptorId) -> bool {
        self.remove_where(|e| e.id == id) > 0
    }

    pub fn remove_tagged(&self, tag: &str) -> usize {
        self.remove_where(|e| e.tag.as_deref() == Some(tag))
    }

    /// Remove every entry matching `pred`, returning how many were removed
    pub fn remove_where(&self, pred: impl Fn(&EntryInfo) -> bool) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|e| !pred(&e.info));
        before - entries.len()
    }

    pub fn find(&self, pred: impl Fn(&EntryInfo) -> bool) -> Vec<EntryInfo> {
        self.entries()
            .iter()
            .filter(|e| pred(&e.info))
            .map(|e| e.info.clone())
            .collect()
    }

    /// Snapshot of the handlers for `(socket, msg_type)`, in registration order
    pub fn matching(&self, socket: SocketType, msg_type: &str) -> Vec<Handler> {
        self.entries()
            .iter()
            .filter(|e| e.info.socket == socket && e.info.msg_type == msg_type)
            .map(|e| e.handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passthrough() -> Handler {
        handler(|_relay, _target, frames| async move { Ok(Some(frames)) })
    }

    #[test]
    fn test_matching_preserves_order() {
        let registry = InterceptionRegistry::new();
        let a = registry.add(SocketType::Shell, "execute_request", passthrough());
        let _ = registry.add(SocketType::Iopub, "stream", passthrough());
        let b = registry.add(SocketType::Shell, "execute_request", passthrough());

        assert_eq!(registry.matching(SocketType::Shell, "execute_request").len(), 2);
        assert!(registry.matching(SocketType::Control, "execute_request").is_empty());

        let ids: Vec<_> = registry
            .find(|e| e.msg_type == "execute_request")
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_remove_by_id_and_tag() {
        let registry = InterceptionRegistry::new();
        let keep = registry.add(SocketType::Shell, "kernel_info_request", passthrough());
        let id = registry.add_tagged(SocketType::Iopub, "stream", "exec-1", passthrough());
        registry.add_tagged(SocketType::Iopub, "error", "exec-1", passthrough());
        registry.add_tagged(SocketType::Iopub, "error", "exec-2", passthrough());

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.remove_tagged("exec-1"), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(|e| e.id == keep).len(), 1);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_removal() {
        let registry = InterceptionRegistry::new();
        registry.add_tagged(SocketType::Iopub, "stream", "t", passthrough());
        let snapshot = registry.matching(SocketType::Iopub, "stream");
        registry.remove_tagged("t");
        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty());
    }
}
