//! Nodes and the edges they own.
//!
//! An edge lives entirely inside its source node: the node's lock covers
//! every node field and the whole out-edge map. Neighbor references are
//! (shard id, handle) values, never pointers, so a node serializes cleanly
//! when it migrates — deferred writes buffered while it was frozen travel
//! inside the node itself.

use fnv::FnvHashMap;

use weaver::clock::VectorClock;
use weaver::data::{EdgeHandle, NodeHandle, PendingUpdate, RemoteNode, ServerId};

use crate::graph::element::Element;
use crate::order::TimeOracle;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeState {
    Stable,
    /// Frozen on the source shard while migration step 2 drains in-flight
    /// writes.
    InTransit,
    /// Sent to the new shard; awaiting step-3 cleanup on the old one.
    Moved,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub handle: EdgeHandle,
    pub base: Element,
    pub nbr: RemoteNode,
    /// Node-program traversals since the last migration sweep; feeds CLDG.
    pub msg_count: u64,
}

impl Edge {
    pub fn new(handle: EdgeHandle, created: VectorClock, nbr: RemoteNode) -> Self {
        Edge {
            handle,
            base: Element::new(created),
            nbr,
            msg_count: 0,
        }
    }

    /// Called under the node lock whenever a node program walks this edge.
    pub fn traverse(&mut self) {
        self.msg_count += 1;
    }
}

/// A write buffered while its target node was frozen or absent; replayed
/// in vclock order once the node is stable again.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeferredWrite {
    pub vclock: VectorClock,
    pub update: PendingUpdate,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Node {
    pub handle: NodeHandle,
    pub base: Element,
    pub out_edges: FnvHashMap<EdgeHandle, Edge>,
    pub state: NodeState,
    pub new_loc: Option<ServerId>,
    /// Mutated since the last migration sweep looked at it.
    pub updated: bool,
    /// Chosen for a higher-numbered shard once; skip next sweep to avoid
    /// ping-pong.
    pub already_migr: bool,
    /// Per-shard cross-shard traffic attributed to this node (CLDG).
    pub msg_count: Vec<u64>,
    /// Candidate scores, scratch for the migration sweep.
    #[serde(skip)]
    pub migr_score: Vec<f64>,
    pub deferred_writes: Vec<DeferredWrite>,
}

impl Node {
    pub fn new(handle: NodeHandle, created: VectorClock, num_shards: usize) -> Self {
        Node {
            handle,
            base: Element::new(created),
            out_edges: FnvHashMap::default(),
            state: NodeState::Stable,
            new_loc: None,
            updated: false,
            already_migr: false,
            msg_count: vec![0; num_shards],
            migr_score: vec![0.0; num_shards],
            deferred_writes: Vec::new(),
        }
    }

    pub fn alive_at(&self, at: &VectorClock, oracle: &TimeOracle) -> bool {
        self.base.alive_at(at, oracle)
    }

    pub fn is_frozen(&self) -> bool {
        self.state != NodeState::Stable
    }

    pub fn add_edge(&mut self, handle: EdgeHandle, created: VectorClock, nbr: RemoteNode) {
        let edge = Edge::new(handle.clone(), created, nbr);
        self.out_edges.insert(handle, edge);
    }

    pub fn live_edges<'a>(
        &'a self,
        at: &'a VectorClock,
        oracle: &'a TimeOracle,
    ) -> impl Iterator<Item = &'a Edge> {
        self.out_edges
            .values()
            .filter(move |e| e.base.alive_at(at, oracle))
    }

    pub fn count_live_edges(&self, at: &VectorClock, oracle: &TimeOracle) -> u64 {
        self.live_edges(at, oracle).count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::test_oracle;

    #[test]
    fn edges_live_inside_the_node() {
        let oracle = test_oracle();
        let mut v = VectorClock::new(0, 1);
        v.tick();
        let mut n = Node::new("a".into(), v.clone(), 2);
        n.add_edge("e1".into(), v.clone(), RemoteNode::new(ServerId(1), "b".into()));
        n.add_edge("e2".into(), v.clone(), RemoteNode::new(ServerId(2), "c".into()));
        assert_eq!(n.count_live_edges(&v, &oracle), 2);

        let mut v2 = v.clone();
        v2.tick();
        let e1 = EdgeHandle::from("e1");
        n.out_edges.get_mut(&e1).unwrap().base.delete(v2.clone());
        assert_eq!(n.count_live_edges(&v, &oracle), 2);
        assert_eq!(n.count_live_edges(&v2, &oracle), 1);
    }

    #[test]
    fn node_serializes_with_buffered_writes() {
        let v = VectorClock::zero(1);
        let mut n = Node::new("a".into(), v.clone(), 1);
        n.deferred_writes.push(DeferredWrite {
            vclock: v.clone(),
            update: PendingUpdate::DeleteNode { node: "a".into() },
        });
        let bytes = bincode::serialize(&n).unwrap();
        let back: Node = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.handle, n.handle);
        assert_eq!(back.deferred_writes.len(), 1);
        // scratch does not travel
        assert!(back.migr_score.is_empty());
    }
}
