//! Breadth-first reachability.
//!
//! Forward legs flood outward along edges that carry the requested
//! properties; every node remembers who first reached it (`prev`) and how
//! many children it is waiting on (`out_count`). Reply legs flow back up
//! that tree: a positive answer short-circuits to the parent immediately,
//! a negative one waits until every child has answered. The start node's
//! parent is the coordinating VT, so the final reply leaves the graph.

use weaver::clock::VectorClock;
use weaver::data::RemoteNode;
use weaver::prog::{ProgParams, ReachParams};

use crate::graph::Node;
use crate::order::TimeOracle;

#[derive(Debug, Default)]
pub struct ReachState {
    pub visited: bool,
    pub out_count: u64,
    pub replied: bool,
    pub prev: RemoteNode,
}

fn reply(prev: &RemoteNode, params: &ReachParams, reachable: bool) -> (RemoteNode, ProgParams) {
    let mut p = params.clone();
    p.returning = true;
    p.reachable = reachable;
    p.prev_node = RemoteNode::default();
    (prev.clone(), ProgParams::Reachability(p))
}

pub fn run(
    node: &mut Node,
    this: &RemoteNode,
    params: ReachParams,
    state: &mut ReachState,
    at: &VectorClock,
    oracle: &TimeOracle,
) -> Vec<(RemoteNode, ProgParams)> {
    let mut out = Vec::new();

    if params.returning {
        // a child's verdict
        if params.reachable {
            if !state.replied {
                state.replied = true;
                out.push(reply(&state.prev, &params, true));
            }
        } else {
            state.out_count = state.out_count.saturating_sub(1);
            if state.out_count == 0 && !state.replied {
                state.replied = true;
                out.push(reply(&state.prev, &params, false));
            }
        }
        return out;
    }

    if state.visited {
        // already part of the search tree; this branch is redundant
        out.push(reply(&params.prev_node, &params, false));
        return out;
    }

    state.visited = true;
    state.prev = params.prev_node.clone();

    if node.handle == params.dest {
        state.replied = true;
        out.push(reply(&state.prev, &params, true));
        return out;
    }

    let mut next = Vec::new();
    for edge in node.out_edges.values_mut() {
        if !edge.base.alive_at(at, oracle) {
            continue;
        }
        if !edge
            .base
            .has_all_properties(&params.edge_props, at, oracle)
        {
            continue;
        }
        edge.traverse();
        next.push(edge.nbr.clone());
    }

    if next.is_empty() {
        state.replied = true;
        out.push(reply(&state.prev, &params, false));
        return out;
    }

    state.out_count = next.len() as u64;
    for nbr in next {
        let mut p = params.clone();
        p.prev_node = this.clone();
        p.hops += 1;
        out.push((nbr, ProgParams::Reachability(p)));
    }
    out
}

/// A forward leg hit a node deleted at the request clock: answer the
/// parent negatively so the wait count drains.
pub fn on_deleted(params: ReachParams) -> Vec<(RemoteNode, ProgParams)> {
    if params.returning {
        return vec![];
    }
    let prev = params.prev_node.clone();
    vec![reply(&prev, &params, false)]
}
