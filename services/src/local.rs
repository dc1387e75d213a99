//! Process-local service implementations.
//!
//! These satisfy the service traits entirely in memory and are what tests
//! and single-process deployments run against. They are deliberately
//! simple: a `Mutex` around a map, the way a local stand-in should be.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::{ClusterView, EventId, Kronos, NameMap, ServerMgr, ServiceError};

#[derive(Default)]
pub struct LocalNameMap {
    bindings: Mutex<HashMap<String, u64>>,
}

impl LocalNameMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameMap for LocalNameMap {
    fn put(&self, handle: &str, loc: u64) -> Result<(), ServiceError> {
        self.bindings
            .lock()
            .unwrap()
            .insert(handle.to_owned(), loc);
        Ok(())
    }

    fn get(&self, handle: &str) -> Result<Option<u64>, ServiceError> {
        Ok(self.bindings.lock().unwrap().get(handle).cloned())
    }

    fn rebind(&self, handle: &str, new_loc: u64) -> Result<(), ServiceError> {
        let mut bindings = self.bindings.lock().unwrap();
        bindings.insert(handle.to_owned(), new_loc);
        Ok(())
    }

    fn remove(&self, handle: &str) -> Result<(), ServiceError> {
        self.bindings.lock().unwrap().remove(handle);
        Ok(())
    }
}

/// Orders concurrent events by (own-slot counter, vt id).
///
/// Any stable total order satisfies the oracle contract; this one needs no
/// state. Calls are counted so tests can observe memoization upstream.
#[derive(Default)]
pub struct LocalKronos {
    calls: AtomicU64,
}

impl LocalKronos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(AtomicOrdering::SeqCst)
    }
}

impl Kronos for LocalKronos {
    fn order_pair(&self, a: EventId, b: EventId) -> Result<Ordering, ServiceError> {
        assert_ne!(a, b, "asked to order an event against itself");
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        // counter first so the order roughly tracks real time
        Ok((a.1, a.0).cmp(&(b.1, b.0)))
    }
}

#[derive(Default)]
pub struct LocalServerMgr {
    view: Mutex<ClusterView>,
}

impl LocalServerMgr {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerMgr for LocalServerMgr {
    fn view(&self) -> Result<ClusterView, ServiceError> {
        Ok(self.view.lock().unwrap().clone())
    }

    fn register(&self, id: u64, addr: String) -> Result<ClusterView, ServiceError> {
        let mut view = self.view.lock().unwrap();
        view.members.retain(|&(m, _)| m != id);
        view.members.push((id, addr));
        view.epoch += 1;
        Ok(view.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namemap_binds_and_rebinds() {
        let nm = LocalNameMap::new();
        assert_eq!(nm.get("a").unwrap(), None);
        nm.put("a", 2).unwrap();
        assert_eq!(nm.get("a").unwrap(), Some(2));
        nm.rebind("a", 3).unwrap();
        assert_eq!(nm.get("a").unwrap(), Some(3));
        nm.remove("a").unwrap();
        assert_eq!(nm.get("a").unwrap(), None);
    }

    #[test]
    fn kronos_is_a_total_order() {
        let k = LocalKronos::new();
        let a = (0, 5);
        let b = (1, 5);
        let ab = k.order_pair(a, b).unwrap();
        let ba = k.order_pair(b, a).unwrap();
        assert_ne!(ab, Ordering::Equal);
        assert_eq!(ab, ba.reverse());
        // stable across calls
        assert_eq!(k.order_pair(a, b).unwrap(), ab);
        assert_eq!(k.calls(), 3);
    }

    #[test]
    fn server_mgr_epochs_grow() {
        let sm = LocalServerMgr::new();
        let v1 = sm.register(0, "127.0.0.1:4000".into()).unwrap();
        let v2 = sm.register(1, "127.0.0.1:4001".into()).unwrap();
        assert!(v2.epoch > v1.epoch);
        assert_eq!(sm.view().unwrap().members.len(), 2);
    }
}
