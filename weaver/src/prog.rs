//! Node-program types shared by clients and shards.
//!
//! A node program is a graph walk executed by hopping across shards: at
//! each visited node the program consumes its parameters, may read the node
//! under the request's vector clock, and emits follow-on (remote node,
//! parameters) pairs. The dispatch contract is a closed set of program
//! types; parameters travel as one tagged enum so the wire never carries
//! virtual dispatch.

use crate::data::{NodeHandle, RemoteNode};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ProgType {
    ReadNEdges,
    ReadNodeProps,
    Reachability,
    EdgeCount,
}

impl ProgType {
    /// Global programs fan out over every live node instead of starting
    /// from client-named handles.
    pub fn is_global(self) -> bool {
        match self {
            ProgType::EdgeCount => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProgParams {
    ReadNEdges(ReadNEdgesParams),
    ReadNodeProps(ReadNodePropsParams),
    Reachability(ReachParams),
    EdgeCount(EdgeCountParams),
}

impl ProgParams {
    pub fn prog_type(&self) -> ProgType {
        match *self {
            ProgParams::ReadNEdges(..) => ProgType::ReadNEdges,
            ProgParams::ReadNodeProps(..) => ProgType::ReadNodeProps,
            ProgParams::Reachability(..) => ProgType::Reachability,
            ProgParams::EdgeCount(..) => ProgType::EdgeCount,
        }
    }
}

/// Count a node's live out-edges.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadNEdgesParams {
    pub num_edges: u64,
}

/// Read a node's properties visible at the request clock; an empty key
/// list fetches everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadNodePropsParams {
    pub keys: Vec<String>,
    pub node_props: Vec<(String, String)>,
}

/// Breadth-first reachability from the start node to `dest`, traversing
/// only edges that carry every property in `edge_props`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReachParams {
    pub dest: NodeHandle,
    pub edge_props: Vec<(String, String)>,
    /// True on the reply legs flowing back toward the start node.
    pub returning: bool,
    pub reachable: bool,
    pub prev_node: RemoteNode,
    pub hops: u64,
}

impl ReachParams {
    pub fn to(dest: NodeHandle) -> Self {
        ReachParams {
            dest,
            ..Default::default()
        }
    }
}

/// Global program: total live-edge count across the whole graph. The
/// coordinating shard fans chunks of nodes out and seeds `aggregator`;
/// every visited node reports its count there, and the aggregator returns
/// the sum once `responses_left` hits zero.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeCountParams {
    pub responses_left: u64,
    pub total: u64,
    pub returning: bool,
    pub aggregator: RemoteNode,
}
