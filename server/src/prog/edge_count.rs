//! Global live-edge count.
//!
//! The fan-out path visits every live node on the shard. Ordinary nodes
//! report their own count to the seeded aggregator node; the aggregator
//! folds reports (and its own count) into its state and releases the total
//! to the coordinator once every expected response has arrived.

use weaver::clock::VectorClock;
use weaver::data::RemoteNode;
use weaver::prog::{EdgeCountParams, ProgParams};

use crate::graph::Node;
use crate::order::TimeOracle;

#[derive(Debug, Default)]
pub struct EdgeCountState {
    pub responses_left: u64,
    pub total: u64,
}

pub fn run(
    node: &mut Node,
    this: &RemoteNode,
    coord: &RemoteNode,
    mut params: EdgeCountParams,
    state: &mut EdgeCountState,
    at: &VectorClock,
    oracle: &TimeOracle,
) -> Vec<(RemoteNode, ProgParams)> {
    let mut out = Vec::new();

    if this.handle == params.aggregator.handle {
        if state.responses_left == 0 {
            // first touch
            state.responses_left = params.responses_left;
            state.total = 0;
        }
        if params.returning {
            state.total += params.total;
        } else {
            state.total += node.count_live_edges(at, oracle);
        }
        state.responses_left -= 1;
        if state.responses_left == 0 {
            params.total = state.total;
            out.push((coord.clone(), ProgParams::EdgeCount(params)));
        }
    } else {
        params.total = node.count_live_edges(at, oracle);
        params.returning = true;
        let aggregator = params.aggregator.clone();
        out.push((aggregator, ProgParams::EdgeCount(params)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::order::test_oracle;
    use weaver::data::ServerId;

    fn ticked() -> VectorClock {
        let mut c = VectorClock::new(0, 1);
        c.tick();
        c
    }

    #[test]
    fn ordinary_nodes_report_to_the_aggregator() {
        let oracle = test_oracle();
        let v = ticked();
        let mut node = Node::new("n".into(), v.clone(), 1);
        node.add_edge("e".into(), v.clone(), RemoteNode::new(ServerId(1), "m".into()));
        let this = RemoteNode::new(ServerId(1), "n".into());
        let coord = RemoteNode::coordinator(0);
        let agg = RemoteNode::new(ServerId(1), "agg".into());

        let mut state = EdgeCountState::default();
        let params = EdgeCountParams {
            responses_left: 3,
            total: 0,
            returning: false,
            aggregator: agg.clone(),
        };
        let out = run(&mut node, &this, &coord, params, &mut state, &v, &oracle);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, agg);
        match out[0].1 {
            ProgParams::EdgeCount(ref p) => {
                assert!(p.returning);
                assert_eq!(p.total, 1);
            }
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn aggregator_releases_once_all_responses_land() {
        let oracle = test_oracle();
        let v = ticked();
        let mut node = Node::new("agg".into(), v.clone(), 1);
        node.add_edge("e".into(), v.clone(), RemoteNode::new(ServerId(1), "m".into()));
        let this = RemoteNode::new(ServerId(1), "agg".into());
        let coord = RemoteNode::coordinator(0);
        let agg = this.clone();
        let mut state = EdgeCountState::default();

        // its own (non-returning) visit seeds the count
        let seed = EdgeCountParams {
            responses_left: 2,
            total: 0,
            returning: false,
            aggregator: agg.clone(),
        };
        let out = run(&mut node, &this, &coord, seed, &mut state, &v, &oracle);
        assert!(out.is_empty());
        assert_eq!(state.responses_left, 1);
        assert_eq!(state.total, 1);

        // one peer report arrives; the total goes to the coordinator
        let report = EdgeCountParams {
            responses_left: 2,
            total: 4,
            returning: true,
            aggregator: agg,
        };
        let out = run(&mut node, &this, &coord, report, &mut state, &v, &oracle);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, coord);
        match out[0].1 {
            ProgParams::EdgeCount(ref p) => assert_eq!(p.total, 5),
            ref other => panic!("unexpected {:?}", other),
        }
    }
}
