//! The in-memory graph partition owned by one shard.
//!
//! A coarse directory maps node handles to per-node locks; all mutation of
//! a node (and of the edges it owns) happens under that node's lock. A
//! secondary edge index (neighbor handle → local source handles) lets
//! migration rewrite neighbor pointers in O(degree) instead of scanning
//! the whole partition.
//!
//! Lock order is directory → node; the directory lock is dropped before a
//! node lock is taken and is never held across I/O.

use std::sync::{Arc, Mutex, RwLock};

use fnv::{FnvHashMap, FnvHashSet};

use weaver::clock::VectorClock;
use weaver::data::{NodeHandle, ServerId};
use weaver::error::UserError;

use crate::order::TimeOracle;

pub mod element;
pub mod node;

pub use self::element::{Element, Property};
pub use self::node::{DeferredWrite, Edge, Node, NodeState};

pub struct GraphStore {
    nodes: RwLock<FnvHashMap<NodeHandle, Arc<Mutex<Node>>>>,
    edge_index: Mutex<FnvHashMap<NodeHandle, FnvHashSet<NodeHandle>>>,
    num_shards: usize,
}

impl GraphStore {
    pub fn new(num_shards: usize) -> Self {
        GraphStore {
            nodes: RwLock::new(FnvHashMap::default()),
            edge_index: Mutex::new(FnvHashMap::default()),
            num_shards,
        }
    }

    /// Nodes resident on this shard, tombstones included.
    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Create a node under the write clock. A handle that is still alive at
    /// `at` collides; a tombstoned predecessor is replaced.
    pub fn create_node(
        &self,
        handle: &NodeHandle,
        at: &VectorClock,
        oracle: &TimeOracle,
    ) -> Result<(), UserError> {
        let existing = {
            let dir = self.nodes.read().unwrap();
            dir.get(handle).cloned()
        };
        if let Some(old) = existing {
            let alive = old.lock().unwrap().alive_at(at, oracle);
            if alive {
                return Err(UserError::AlreadyExists);
            }
        }

        let fresh = Node::new(handle.clone(), at.clone(), self.num_shards);
        let mut dir = self.nodes.write().unwrap();
        match dir.get(handle) {
            Some(cur) => {
                // lost a race with another creator iff the occupant is
                // alive; otherwise replace the tombstone
                let alive = cur.lock().unwrap().alive_at(at, oracle);
                if alive {
                    return Err(UserError::AlreadyExists);
                }
                dir.insert(handle.clone(), Arc::new(Mutex::new(fresh)));
            }
            None => {
                dir.insert(handle.clone(), Arc::new(Mutex::new(fresh)));
            }
        }
        Ok(())
    }

    /// Install a fully-formed node (migration step-2 arrival).
    pub fn install_node(&self, node: Node) -> Arc<Mutex<Node>> {
        let handle = node.handle.clone();
        let arc = Arc::new(Mutex::new(node));
        self.nodes.write().unwrap().insert(handle, arc.clone());
        arc
    }

    pub fn node_ref(&self, handle: &NodeHandle) -> Option<Arc<Mutex<Node>>> {
        self.nodes.read().unwrap().get(handle).cloned()
    }

    /// Scoped access to a node under its lock; the lock is released on
    /// every exit path when the closure returns.
    pub fn with_node<R, F>(&self, handle: &NodeHandle, f: F) -> Option<R>
    where
        F: FnOnce(&mut Node) -> R,
    {
        let arc = self.node_ref(handle)?;
        let mut guard = arc.lock().unwrap();
        Some(f(&mut guard))
    }

    /// Physically remove a node (migration step 3 / GC).
    pub fn remove_node(&self, handle: &NodeHandle) -> Option<Arc<Mutex<Node>>> {
        self.nodes.write().unwrap().remove(handle)
    }

    pub fn handles(&self) -> Vec<NodeHandle> {
        self.nodes.read().unwrap().keys().cloned().collect()
    }

    /// Handles of nodes alive at `at`, for global program fan-out.
    pub fn alive_handles(&self, at: &VectorClock, oracle: &TimeOracle) -> Vec<NodeHandle> {
        let snapshot: Vec<_> = {
            let dir = self.nodes.read().unwrap();
            dir.values().cloned().collect()
        };
        let mut alive = Vec::new();
        for arc in snapshot {
            let n = arc.lock().unwrap();
            if n.alive_at(at, oracle) {
                alive.push(n.handle.clone());
            }
        }
        alive
    }

    // -------- edge index --------

    pub fn index_edge(&self, nbr: &NodeHandle, src: &NodeHandle) {
        let mut index = self.edge_index.lock().unwrap();
        index
            .entry(nbr.clone())
            .or_insert_with(FnvHashSet::default)
            .insert(src.clone());
    }

    pub fn deindex_edge(&self, nbr: &NodeHandle, src: &NodeHandle) {
        let mut index = self.edge_index.lock().unwrap();
        if let Some(set) = index.get_mut(nbr) {
            set.remove(src);
            if set.is_empty() {
                index.remove(nbr);
            }
        }
    }

    /// Drop all of `node`'s out-edges from the index (migration freeze).
    pub fn deindex_node_edges(&self, node: &Node) {
        let mut index = self.edge_index.lock().unwrap();
        for edge in node.out_edges.values() {
            if let Some(set) = index.get_mut(&edge.nbr.handle) {
                set.remove(&node.handle);
                if set.is_empty() {
                    index.remove(&edge.nbr.handle);
                }
            }
        }
    }

    /// Index all of `node`'s out-edges (migration install).
    pub fn index_node_edges(&self, node: &Node) {
        let mut index = self.edge_index.lock().unwrap();
        for edge in node.out_edges.values() {
            index
                .entry(edge.nbr.handle.clone())
                .or_insert_with(FnvHashSet::default)
                .insert(node.handle.clone());
        }
    }

    pub fn sources_of(&self, nbr: &NodeHandle) -> Vec<NodeHandle> {
        self.edge_index
            .lock()
            .unwrap()
            .get(nbr)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rewrite `nbr.loc` on every local edge pointing at a migrated node.
    pub fn update_migrated_nbr(&self, nbr: &NodeHandle, old_loc: ServerId, new_loc: ServerId) {
        for src in self.sources_of(nbr) {
            let _ = self.with_node(&src, |n| {
                for edge in n.out_edges.values_mut() {
                    if edge.nbr.handle == *nbr && edge.nbr.loc == old_loc {
                        edge.nbr.loc = new_loc;
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::test_oracle;
    use weaver::data::RemoteNode;

    fn ticked(ticks: u64) -> VectorClock {
        let mut c = VectorClock::new(0, 1);
        for _ in 0..ticks {
            c.tick();
        }
        c
    }

    #[test]
    fn create_collides_only_with_live_nodes() {
        let oracle = test_oracle();
        let store = GraphStore::new(1);
        let v1 = ticked(1);
        let v2 = ticked(2);
        let v3 = ticked(3);

        store.create_node(&"a".into(), &v1, &oracle).unwrap();
        assert_eq!(
            store.create_node(&"a".into(), &v2, &oracle),
            Err(UserError::AlreadyExists)
        );

        store
            .with_node(&"a".into(), |n| n.base.delete(v2.clone()))
            .unwrap();
        // the old incarnation is dead at v3, so the handle is reusable
        store.create_node(&"a".into(), &v3, &oracle).unwrap();
    }

    #[test]
    fn edge_index_tracks_sources() {
        let store = GraphStore::new(2);
        let v = ticked(1);
        let oracle = test_oracle();
        store.create_node(&"a".into(), &v, &oracle).unwrap();
        store
            .with_node(&"a".into(), |n| {
                n.add_edge("e".into(), v.clone(), RemoteNode::new(ServerId(2), "b".into()));
            })
            .unwrap();
        store.index_edge(&"b".into(), &"a".into());

        assert_eq!(store.sources_of(&"b".into()), vec![NodeHandle::from("a")]);

        store.update_migrated_nbr(&"b".into(), ServerId(2), ServerId(3));
        let loc = store
            .with_node(&"a".into(), |n| {
                n.out_edges.values().next().unwrap().nbr.loc
            })
            .unwrap();
        assert_eq!(loc, ServerId(3));

        store.deindex_edge(&"b".into(), &"a".into());
        assert!(store.sources_of(&"b".into()).is_empty());
    }

    #[test]
    fn alive_enumeration_skips_tombstones() {
        let oracle = test_oracle();
        let store = GraphStore::new(1);
        let v1 = ticked(1);
        let v2 = ticked(2);
        store.create_node(&"a".into(), &v1, &oracle).unwrap();
        store.create_node(&"b".into(), &v1, &oracle).unwrap();
        store
            .with_node(&"b".into(), |n| n.base.delete(v2.clone()))
            .unwrap();

        let mut at_v1 = store.alive_handles(&v1, &oracle);
        at_v1.sort();
        assert_eq!(at_v1, vec![NodeHandle::from("a"), NodeHandle::from("b")]);

        let at_v2 = store.alive_handles(&v2, &oracle);
        assert_eq!(at_v2, vec![NodeHandle::from("a")]);
    }
}
