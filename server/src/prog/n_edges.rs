//! Live out-edge count for one node.

use weaver::clock::VectorClock;
use weaver::data::RemoteNode;
use weaver::prog::{ProgParams, ReadNEdgesParams};

use crate::graph::Node;
use crate::order::TimeOracle;

pub fn run(
    node: &mut Node,
    coord: &RemoteNode,
    mut params: ReadNEdgesParams,
    at: &VectorClock,
    oracle: &TimeOracle,
) -> Vec<(RemoteNode, ProgParams)> {
    params.num_edges = node.count_live_edges(at, oracle);
    vec![(coord.clone(), ProgParams::ReadNEdges(params))]
}
