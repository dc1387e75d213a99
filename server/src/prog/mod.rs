//! The node-program runtime.
//!
//! A node program arrives as a batch of (handle, params, previous-node)
//! tuples stamped with the request's vector clock. For each tuple the
//! runtime resolves the target node:
//!
//! - missing → parked under `deferred_reads` (the node is migrating in);
//! - deleted at the request clock → the program's deleted-node hook runs,
//!   so walks can unwind instead of stranding their parents;
//! - frozen (IN_TRANSIT/MOVED) → the tuple is forwarded to the node's new
//!   location;
//! - otherwise the program function runs under the node's lock, with its
//!   per-node state fetched from the state cache.
//!
//! Follow-on work is batched one message per destination shard per hop;
//! anything addressed to a VT id returns as `NodeProgReturn`. Global
//! programs fan out over the shard's live nodes in worker-sized chunks.

use fnv::FnvHashMap;

use weaver::clock::VectorClock;
use weaver::data::{NodeHandle, RemoteNode, ServerId};
use weaver::message::{Message, ProgArg};
use weaver::prog::{ProgParams, ProgType};

use crate::graph::Node;
use crate::queue::ProgMsg;
use crate::shard::Shard;

pub mod edge_count;
pub mod n_edges;
pub mod node_props;
pub mod reach;

pub use self::edge_count::EdgeCountState;
pub use self::reach::ReachState;

/// Constant the original wire protocol carries in `NodeProgReturn`.
const VT_PTR: u64 = 1337;

/// Per-node program state, keyed by (program, request, node).
#[derive(Debug)]
pub enum ProgState {
    Reach(ReachState),
    EdgeCount(EdgeCountState),
}

type StateKey = (ProgType, u64, NodeHandle);

/// The state cache: created on first touch, read on revisits, purged when
/// the request id falls under every VT's completion floor.
pub struct StateCache {
    inner: std::sync::Mutex<FnvHashMap<StateKey, ProgState>>,
}

impl StateCache {
    pub fn new() -> Self {
        StateCache {
            inner: std::sync::Mutex::new(FnvHashMap::default()),
        }
    }

    fn take(&self, key: &StateKey) -> Option<ProgState> {
        self.inner.lock().unwrap().remove(key)
    }

    fn put(&self, key: StateKey, state: ProgState) {
        self.inner.lock().unwrap().insert(key, state);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Drop state for explicitly-finished requests.
    pub fn purge_reqs(&self, req_ids: &[u64]) {
        if req_ids.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|&(_, req, _), _| !req_ids.contains(&req));
    }

    /// Drop state for requests below the per-VT completion floors.
    pub fn purge_below(&self, floors: &[u64]) {
        let num_vts = floors.len() as u64;
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|&(_, req, _), _| req > floors[(req % num_vts) as usize]);
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one node-program message to completion at this shard.
pub fn run(shard: &Shard, msg: ProgMsg) {
    {
        let mut migr = shard.migr.lock().unwrap();
        let vt = msg.vt_id as usize;
        if migr.max_prog_id[vt] < msg.req_id {
            migr.max_prog_id[vt] = msg.req_id;
        }
    }

    if shard.sched.is_done(msg.req_id) {
        return;
    }

    if msg.global {
        fan_out(shard, msg);
        return;
    }

    let coord = RemoteNode::coordinator(msg.vt_id);
    let this_shard = shard.id;
    let mut start = msg.args;
    let mut batched: FnvHashMap<ServerId, Vec<ProgArg>> = FnvHashMap::default();

    while !start.is_empty() {
        for (handle, params, prev) in start.drain(..) {
            if shard.sched.is_done(msg.req_id) {
                return;
            }

            let this_node = RemoteNode::new(this_shard, handle.clone());
            let node_ref = match shard.graph.node_ref(&handle) {
                Some(r) => r,
                None => {
                    // migrating in; park until it lands
                    buffer_deferred_read(
                        shard,
                        msg.prog,
                        msg.vt_id,
                        &msg.vclock,
                        msg.req_id,
                        handle,
                        params,
                        prev,
                    );
                    continue;
                }
            };

            enum Visit {
                Ran(Vec<(RemoteNode, ProgParams)>),
                Deleted(ProgParams, RemoteNode),
                Forward(ServerId, ProgParams, RemoteNode),
            }

            let visit = {
                let mut node = node_ref.lock().unwrap();
                if !node.alive_at(&msg.vclock, &shard.oracle) {
                    Visit::Deleted(params, prev)
                } else if node.is_frozen() {
                    let new_loc = node.new_loc.expect("frozen node has a destination");
                    Visit::Forward(new_loc, params, prev)
                } else {
                    let key = (msg.prog, msg.req_id, handle.clone());
                    let mut state = shard.prog_states.take(&key);
                    let out = dispatch(
                        shard,
                        &mut node,
                        &this_node,
                        &coord,
                        params,
                        &mut state,
                        &msg.vclock,
                    );
                    if let Some(state) = state {
                        shard.prog_states.put(key, state);
                    }
                    Visit::Ran(out)
                }
            };

            match visit {
                Visit::Ran(out) => {
                    for (rn, p) in out {
                        if !shard.config.is_shard(rn.loc) {
                            shard.send_to_vt(
                                rn.loc.0,
                                Message::NodeProgReturn {
                                    prog: msg.prog,
                                    req_id: msg.req_id,
                                    vt_ptr: VT_PTR,
                                    params: p,
                                },
                            );
                        } else {
                            if rn.loc != this_shard {
                                let mut counts = shard.msg_counts.lock().unwrap();
                                *counts.entry(handle.clone()).or_insert(0) += 1;
                            }
                            batched
                                .entry(rn.loc)
                                .or_insert_with(Vec::new)
                                .push((rn.handle, p, this_node.clone()));
                        }
                    }
                }
                Visit::Deleted(params, prev) => {
                    for (rn, p) in on_deleted(msg.prog, params, &prev) {
                        if !shard.config.is_shard(rn.loc) {
                            shard.send_to_vt(
                                rn.loc.0,
                                Message::NodeProgReturn {
                                    prog: msg.prog,
                                    req_id: msg.req_id,
                                    vt_ptr: VT_PTR,
                                    params: p,
                                },
                            );
                        } else {
                            batched
                                .entry(rn.loc)
                                .or_insert_with(Vec::new)
                                .push((rn.handle, p, this_node.clone()));
                        }
                    }
                }
                Visit::Forward(new_loc, params, prev) => {
                    let fwd = Message::NodeProg {
                        prog: msg.prog,
                        global: false,
                        vt_id: msg.vt_id,
                        vclock: msg.vclock.clone(),
                        req_id: msg.req_id,
                        args: vec![(handle.clone(), params, prev)],
                    };
                    if shard.send(new_loc, fwd).is_err() {
                        shard.send_to_vt(msg.vt_id, Message::NodeProgFail { req_id: msg.req_id });
                        return;
                    }
                }
            }
        }

        // one message per destination per hop
        let mut failed = false;
        let prog = msg.prog;
        let vt_id = msg.vt_id;
        let req_id = msg.req_id;
        let vclock = msg.vclock.clone();
        batched.retain(|&loc, args| {
            if loc == this_shard {
                return true;
            }
            let out = Message::NodeProg {
                prog,
                global: false,
                vt_id,
                vclock: vclock.clone(),
                req_id,
                args: std::mem::replace(args, Vec::new()),
            };
            if shard.send(loc, out).is_err() {
                failed = true;
            }
            false
        });
        if failed {
            shard.send_to_vt(msg.vt_id, Message::NodeProgFail { req_id: msg.req_id });
            return;
        }

        start = batched.remove(&this_shard).unwrap_or_default();
    }
}

/// Split a global program over this shard's live nodes and re-enqueue the
/// chunks as ordinary programs, seeding the aggregator node.
fn fan_out(shard: &Shard, msg: ProgMsg) {
    assert_eq!(msg.args.len(), 1, "global programs carry one start tuple");
    let (_, params, _) = msg.args.into_iter().next().unwrap();

    let alive = shard.graph.alive_handles(&msg.vclock, &shard.oracle);
    if alive.is_empty() {
        // nothing on this shard; answer with the params untouched
        shard.send_to_vt(
            msg.vt_id,
            Message::NodeProgReturn {
                prog: msg.prog,
                req_id: msg.req_id,
                vt_ptr: VT_PTR,
                params,
            },
        );
        return;
    }

    let seeded = seed_global(
        params,
        alive.len() as u64,
        RemoteNode::new(shard.id, alive[0].clone()),
    );

    let workers = shard.config.num_threads.max(2);
    let chunk = (alive.len() / (workers - 1)).max(1);
    for handles in alive.chunks(chunk) {
        let args = handles
            .iter()
            .map(|h| (h.clone(), seeded.clone(), RemoteNode::default()))
            .collect();
        shard.sched.add_read(ProgMsg {
            prog: msg.prog,
            global: false,
            vt_id: msg.vt_id,
            vclock: msg.vclock.clone(),
            req_id: msg.req_id,
            args,
        });
    }
}

fn seed_global(params: ProgParams, fan: u64, aggregator: RemoteNode) -> ProgParams {
    match params {
        ProgParams::EdgeCount(mut p) => {
            p.responses_left = fan;
            p.aggregator = aggregator;
            ProgParams::EdgeCount(p)
        }
        other => other,
    }
}

fn buffer_deferred_read(
    shard: &Shard,
    prog: ProgType,
    vt_id: u64,
    vclock: &VectorClock,
    req_id: u64,
    handle: NodeHandle,
    params: ProgParams,
    prev: RemoteNode,
) {
    let single = ProgMsg {
        prog,
        global: false,
        vt_id,
        vclock: vclock.clone(),
        req_id,
        args: vec![(handle.clone(), params, prev)],
    };
    {
        let mut migr = shard.migr.lock().unwrap();
        // the node may have landed between the directory miss and now, in
        // which case its parked-read drain has already run
        if shard.graph.node_ref(&handle).is_none() {
            debug!(shard.log, "buffering read for absent node";
                   "node" => %handle, "req" => req_id);
            migr.deferred_reads
                .entry(handle)
                .or_insert_with(Vec::new)
                .push(single);
            return;
        }
    }
    shard.sched.add_read(single);
}

/// Run the program function for one node visit.
fn dispatch(
    shard: &Shard,
    node: &mut Node,
    this: &RemoteNode,
    coord: &RemoteNode,
    params: ProgParams,
    state: &mut Option<ProgState>,
    at: &VectorClock,
) -> Vec<(RemoteNode, ProgParams)> {
    match params {
        ProgParams::ReadNEdges(p) => n_edges::run(node, coord, p, at, &shard.oracle),
        ProgParams::ReadNodeProps(p) => node_props::run(node, coord, p, at, &shard.oracle),
        ProgParams::Reachability(p) => {
            let mut s = match state.take() {
                Some(ProgState::Reach(s)) => s,
                _ => ReachState::default(),
            };
            let out = reach::run(node, this, p, &mut s, at, &shard.oracle);
            *state = Some(ProgState::Reach(s));
            out
        }
        ProgParams::EdgeCount(p) => {
            let mut s = match state.take() {
                Some(ProgState::EdgeCount(s)) => s,
                _ => EdgeCountState::default(),
            };
            let out = edge_count::run(node, this, coord, p, &mut s, at, &shard.oracle);
            *state = Some(ProgState::EdgeCount(s));
            out
        }
    }
}

/// A branch reached a node that is deleted at the request clock. Programs
/// answer their parent so walks unwind instead of hanging.
fn on_deleted(
    prog: ProgType,
    params: ProgParams,
    prev: &RemoteNode,
) -> Vec<(RemoteNode, ProgParams)> {
    match params {
        ProgParams::ReadNEdges(p) => vec![(prev.clone(), ProgParams::ReadNEdges(p))],
        ProgParams::ReadNodeProps(p) => vec![(prev.clone(), ProgParams::ReadNodeProps(p))],
        ProgParams::Reachability(p) => reach::on_deleted(p),
        // global fan-out only enumerates nodes alive at the request clock
        ProgParams::EdgeCount(_) => {
            debug_assert!(false, "{:?} branch hit a deleted node", prog);
            vec![]
        }
    }
}
