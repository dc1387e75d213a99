//! Property read for one node.

use weaver::clock::VectorClock;
use weaver::data::RemoteNode;
use weaver::prog::{ProgParams, ReadNodePropsParams};

use crate::graph::Node;
use crate::order::TimeOracle;

pub fn run(
    node: &mut Node,
    coord: &RemoteNode,
    mut params: ReadNodePropsParams,
    at: &VectorClock,
    oracle: &TimeOracle,
) -> Vec<(RemoteNode, ProgParams)> {
    let fetch_all = params.keys.is_empty();
    for (key, value) in node.base.properties_at(at, oracle) {
        if fetch_all || params.keys.contains(&key) {
            params.node_props.push((key, value));
        }
    }
    vec![(coord.clone(), ProgParams::ReadNodeProps(params))]
}
