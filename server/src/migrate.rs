//! Online node migration.
//!
//! A migration token circulates the shard ring; the holder streams its
//! nodes through a scoring sweep and relocates them one at a time:
//!
//! 1. **freeze** — mark the node IN_TRANSIT, drop its edges from the edge
//!    index, rebind its handle to the destination in the NameMap;
//! 2. **drain & send** — once two NOPs from every VT have passed (no
//!    in-flight write predating the rebind can still be queued), ship the
//!    serialized node (buffered writes included) and mark the local copy
//!    MOVED;
//! 3. **forget** — after every peer has acked the neighbor rewrite and
//!    every program that might reference the node here has completed,
//!    physically delete it and move to the next candidate.
//!
//! The receiving shard replays buffered writes in clock order before the
//! node goes STABLE, then re-dispatches any reads that were parked waiting
//! for it.

use std::collections::VecDeque;
use std::mem;
use std::sync::MutexGuard;
use std::thread;
use std::time::Duration;

use fnv::FnvHashMap;
use rand::Rng;

use weaver::config::MigrationPolicy;
use weaver::data::{NodeHandle, ServerId};
use weaver::message::Message;

use crate::apply;
use crate::graph::{DeferredWrite, Node, NodeState};
use crate::queue::ProgMsg;
use crate::shard::Shard;

/// NOP pulses from every VT required between freeze and send.
pub const MIGR_NOP_PULSES: u64 = 2;
/// Token pulses a holder sits through before electing to migrate; the
/// post-increment comparison fires on the fourth pulse.
pub const MIGR_CHANCE_THRESHOLD: u64 = 2;

/// All migration bookkeeping, one lock. Deferred read/write maps live here
/// too: they are consulted exactly on the migration paths.
pub struct MigrationState {
    /// A node is frozen and waiting for the NOP drain.
    pub current_migr: bool,
    /// This token visit already initiated (or declined) its migrations.
    pub migrated: bool,
    pub migr_token: bool,
    pub migr_token_hops: u64,
    pub migr_vt: u64,
    pub migr_chance: u64,
    pub migr_node: NodeHandle,
    pub migr_shard: ServerId,
    /// NOPs per VT since the freeze.
    pub nop_count: Vec<u64>,
    /// Per-VT program ids the peers had seen when they acked; step 3 waits
    /// for completion past these.
    pub target_prog_id: Vec<u64>,
    /// Largest program id this shard has seen per VT.
    pub max_prog_id: Vec<u64>,
    /// Per-VT completion floor advertised by NOPs.
    pub max_done_id: Vec<u64>,
    /// Which shards acked the neighbor rewrite.
    pub edge_acks: Vec<bool>,
    /// Candidate stream for the current sweep, with aggregate message
    /// counts for CLDG ordering.
    pub sweep_queue: VecDeque<(NodeHandle, u64)>,
    /// Last known node count per shard (own slot kept fresh locally).
    pub shard_node_count: Vec<u64>,
    /// Writes addressed to nodes that have not arrived yet.
    pub deferred_writes: FnvHashMap<NodeHandle, Vec<DeferredWrite>>,
    /// Reads parked for nodes that have not arrived yet.
    pub deferred_reads: FnvHashMap<NodeHandle, Vec<ProgMsg>>,
}

impl MigrationState {
    pub fn new(num_vts: usize, num_shards: usize) -> Self {
        MigrationState {
            current_migr: false,
            migrated: false,
            migr_token: false,
            migr_token_hops: 0,
            migr_vt: 0,
            migr_chance: 0,
            migr_node: NodeHandle::default(),
            migr_shard: ServerId::default(),
            nop_count: vec![0; num_vts],
            target_prog_id: vec![0; num_vts],
            max_prog_id: vec![0; num_vts],
            max_done_id: vec![0; num_vts],
            edge_acks: vec![false; num_shards],
            sweep_queue: VecDeque::new(),
            shard_node_count: vec![0; num_shards],
            deferred_writes: FnvHashMap::default(),
            deferred_reads: FnvHashMap::default(),
        }
    }
}

/// The token arrived from the previous shard in the ring (or the VT).
pub fn handle_token(shard: &Shard, hops: u64, vt_id: u64) {
    let mut migr = shard.migr.lock().unwrap();
    migr.migr_token = true;
    migr.migr_token_hops = hops;
    migr.migr_vt = vt_id;
    migr.migrated = false;
    info!(shard.log, "received migration token"; "hops" => hops);
}

/// All shards have acked step 3's preconditions?
///
/// Caller holds the migration lock. Resets the ack set when it fires so a
/// completed migration triggers exactly once.
pub fn check_step3(migr: &mut MutexGuard<MigrationState>) -> bool {
    let mut ready = migr.edge_acks.iter().all(|&a| a);
    for v in 0..migr.target_prog_id.len() {
        ready = ready && migr.target_prog_id[v] <= migr.max_done_id[v];
    }
    if ready {
        for a in migr.edge_acks.iter_mut() {
            *a = false;
        }
    }
    ready
}

/// Snapshot the per-node traffic counters and stream every resident node
/// through the scoring sweep.
pub fn begin_sweep(shard: &Shard) {
    let agg = {
        let mut counts = shard.msg_counts.lock().unwrap();
        mem::replace(&mut *counts, FnvHashMap::default())
    };

    let cldg = shard.config.migration_policy == MigrationPolicy::Cldg;
    let mut queue: VecDeque<(NodeHandle, u64)> = shard
        .graph
        .handles()
        .into_iter()
        .map(|h| {
            let c = agg.get(&h).cloned().unwrap_or(0);
            (h, c)
        })
        .collect();
    if cldg {
        let mut v: Vec<_> = queue.into_iter().collect();
        v.sort_by(|a, b| b.1.cmp(&a.1));
        queue = v.into_iter().collect();
    }

    {
        let mut migr = shard.migr.lock().unwrap();
        migr.sweep_queue = queue;
    }
    info!(shard.log, "migration sweep started");
    sweep(shard);
}

/// Work the candidate stream until a migration starts or it runs dry.
pub fn sweep(shard: &Shard) {
    let self_idx = shard.config.shard_index(shard.id);
    let num_shards = shard.config.num_shards as usize;
    let capacity = shard.config.capacity as f64;
    let policy = shard.config.migration_policy;

    loop {
        let (candidate, counts) = {
            let mut migr = shard.migr.lock().unwrap();
            let mut counts = migr.shard_node_count.clone();
            counts[self_idx] = shard.graph.len() as u64;
            (migr.sweep_queue.pop_front(), counts)
        };
        let (handle, _) = match candidate {
            Some(c) => c,
            None => {
                end_sweep(shard);
                return;
            }
        };

        let dest = shard.graph.with_node(&handle, |n| {
            if n.base.deleted().is_some() || n.is_frozen() || n.already_migr {
                n.already_migr = false;
                return None;
            }
            n.updated = false;

            n.migr_score.clear();
            n.migr_score.resize(num_shards, 0.0);
            match policy {
                MigrationPolicy::Cldg => {
                    for e in n.out_edges.values_mut() {
                        let idx = shard.config.shard_index(e.nbr.loc);
                        n.msg_count[idx] += e.msg_count;
                        e.msg_count = 0;
                    }
                    for j in 0..num_shards {
                        let penalty = 1.0 - counts[j] as f64 / capacity;
                        n.migr_score[j] = n.msg_count[j] as f64 * penalty;
                    }
                }
                MigrationPolicy::Ldg => {
                    for e in n.out_edges.values() {
                        n.migr_score[shard.config.shard_index(e.nbr.loc)] += 1.0;
                    }
                    for j in 0..num_shards {
                        n.migr_score[j] *= 1.0 - counts[j] as f64 / capacity;
                    }
                }
            }

            let mut max_pos = self_idx;
            let mut ties = vec![self_idx];
            for j in 0..num_shards {
                if j == self_idx {
                    continue;
                }
                if n.migr_score[max_pos] < n.migr_score[j] {
                    max_pos = j;
                    ties = vec![j];
                } else if n.migr_score[max_pos] == n.migr_score[j] {
                    ties.push(j);
                }
            }
            for c in n.msg_count.iter_mut() {
                *c = 0;
            }

            let dest_idx = balanced_assignment(&counts, &ties);
            let dest = shard.config.shard_at(dest_idx);
            if dest > shard.id {
                n.already_migr = true;
            }
            if dest == shard.id {
                None
            } else {
                Some(dest)
            }
        });

        match dest {
            Some(Some(dest)) => {
                if step1(shard, &handle, dest) {
                    return;
                }
                // candidate raced a write; fall through to the next one
            }
            _ => continue,
        }
    }
}

/// Least-loaded shard among the tied top scorers, random beyond that.
fn balanced_assignment(counts: &[u64], ties: &[usize]) -> usize {
    let mut min_cap = counts[ties[0]];
    let mut best = vec![ties[0]];
    for &idx in &ties[1..] {
        if counts[idx] < min_cap {
            min_cap = counts[idx];
            best = vec![idx];
        } else if counts[idx] == min_cap {
            best.push(idx);
        }
    }
    best[rand::thread_rng().gen_range(0, best.len())]
}

/// Step 1: freeze the node and repoint the NameMap. Returns false when the
/// candidate was mutated since selection and the sweep should move on.
fn step1(shard: &Shard, handle: &NodeHandle, dest: ServerId) -> bool {
    let arc = match shard.graph.node_ref(handle) {
        Some(a) => a,
        None => return false,
    };
    let mut n = arc.lock().unwrap();
    if n.updated {
        info!(shard.log, "canceling migration for updated node"; "node" => %handle);
        return false;
    }

    {
        let mut migr = shard.migr.lock().unwrap();
        migr.current_migr = true;
        for x in migr.nop_count.iter_mut() {
            *x = 0;
        }
        migr.migr_node = handle.clone();
        migr.migr_shard = dest;
    }

    n.state = NodeState::InTransit;
    n.new_loc = Some(dest);
    shard.graph.deindex_node_edges(&n);
    drop(n);

    rebind_with_retry(shard, handle, dest);
    info!(shard.log, "migration step 1"; "node" => %handle, "to" => %dest);
    true
}

fn rebind_with_retry(shard: &Shard, handle: &NodeHandle, dest: ServerId) {
    let mut backoff = Duration::from_millis(10);
    loop {
        match shard.namemap.rebind(handle.as_str(), dest.0) {
            Ok(()) => return,
            Err(e) => {
                warn!(shard.log, "namemap rebind failed, retrying";
                      "node" => %handle, "error" => ?e);
                thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
        }
    }
}

/// Step 2 request: the NOP drain elapsed (the caller already claimed the
/// transition by clearing `current_migr`); ship the node.
pub fn step2_req(shard: &Shard) {
    let (handle, dest) = {
        let mut migr = shard.migr.lock().unwrap();
        for t in migr.target_prog_id.iter_mut() {
            *t = 0;
        }
        for a in migr.edge_acks.iter_mut() {
            *a = false;
        }
        (migr.migr_node.clone(), migr.migr_shard)
    };

    let arc = shard
        .graph
        .node_ref(&handle)
        .expect("migrating node is resident until step 3");
    let data = {
        let mut n = arc.lock().unwrap();
        let data = bincode::serialize(&*n).expect("nodes serialize");
        n.state = NodeState::Moved;
        // buffered writes travel with the node
        n.deferred_writes.clear();
        data
    };

    info!(shard.log, "migration step 2: sending node";
          "node" => %handle, "to" => %dest, "bytes" => data.len());
    let msg = Message::MigrateSendNode {
        node: handle,
        from: shard.id,
        data,
    };
    if let Err(e) = shard.send(dest, msg) {
        // the next token pass retries this node; log loudly
        error!(shard.log, "failed to send migrated node"; "error" => ?e);
    }
}

/// Step 2 response: install an arriving node, replay everything it missed,
/// tell the world, release parked reads.
pub fn step2_resp(shard: &Shard, handle: NodeHandle, from: ServerId, data: Vec<u8>) {
    let mut node: Node =
        bincode::deserialize(&data).expect("migrated node payload must deserialize");
    node.state = NodeState::Stable;
    node.new_loc = None;

    // replay buffered writes in clock order before anyone can see the node
    let mut writes = mem::replace(&mut node.deferred_writes, Vec::new());
    {
        let mut migr = shard.migr.lock().unwrap();
        if let Some(pending) = migr.deferred_writes.remove(&handle) {
            writes.extend(pending);
        }
    }
    writes.sort_by(|a, b| shard.oracle.total_order(&a.vclock, &b.vclock));
    for w in writes {
        if let Err(e) = apply::apply_on_node(shard, &mut node, &w.vclock, &w.update) {
            debug!(shard.log, "buffered write no longer applies";
                   "node" => %handle, "error" => %e);
        }
    }

    shard.graph.index_node_edges(&node);
    shard.graph.install_node(node);
    // writers that parked while the node was being prepared replay now
    apply::drain_deferred_writes(shard, &handle);
    info!(shard.log, "migration step 2: installed node"; "node" => %handle, "from" => %from);

    // every other shard rewrites its edges; we rewrite ours here, which
    // also acks the old location on our behalf
    for peer in shard.config.shard_ids() {
        if peer == shard.id {
            continue;
        }
        let upd = Message::MigratedNbrUpdate {
            node: handle.clone(),
            old_loc: from,
            new_loc: shard.id,
        };
        if let Err(e) = shard.send(peer, upd) {
            error!(shard.log, "failed to send neighbor update"; "peer" => %peer, "error" => ?e);
        }
    }
    handle_nbr_update(shard, &handle, from, shard.id);

    let parked = {
        let mut migr = shard.migr.lock().unwrap();
        migr.deferred_reads.remove(&handle)
    };
    if let Some(parked) = parked {
        debug!(shard.log, "replaying parked reads"; "node" => %handle, "count" => parked.len());
        for msg in parked {
            shard.sched.add_read(msg);
        }
    }
}

/// Rewrite local edges pointing at a migrated node, then ack its old shard
/// with our program high-water marks and node count.
pub fn handle_nbr_update(shard: &Shard, node: &NodeHandle, old_loc: ServerId, new_loc: ServerId) {
    shard.graph.update_migrated_nbr(node, old_loc, new_loc);
    let target_prog_id = {
        let migr = shard.migr.lock().unwrap();
        migr.max_prog_id.clone()
    };
    let ack = Message::MigratedNbrAck {
        from: shard.id,
        target_prog_id,
        node_count: shard.graph.len() as u64,
    };
    if let Err(e) = shard.send(old_loc, ack) {
        error!(shard.log, "failed to ack neighbor update"; "error" => ?e);
    }
}

/// A peer finished rewriting its neighbors.
pub fn handle_nbr_ack(shard: &Shard, from: ServerId, target_req_id: Vec<u64>, node_count: u64) {
    let mut migr = shard.migr.lock().unwrap();
    for v in 0..migr.target_prog_id.len() {
        if migr.target_prog_id[v] < target_req_id[v] {
            migr.target_prog_id[v] = target_req_id[v];
        }
    }
    let idx = shard.config.shard_index(from);
    migr.edge_acks[idx] = true;
    migr.shard_node_count[idx] = node_count;
}

/// Step 3: every precondition held at the last NOP; the old copy goes away
/// and the sweep resumes.
pub fn step3(shard: &Shard) {
    let handle = {
        let migr = shard.migr.lock().unwrap();
        migr.migr_node.clone()
    };
    shard.graph.remove_node(&handle);
    info!(shard.log, "migration step 3: forgot node"; "node" => %handle);
    sweep(shard);
}

/// Sweep exhausted: pass the token along the ring.
fn end_sweep(shard: &Shard) {
    let (hops, vt) = {
        let mut migr = shard.migr.lock().unwrap();
        migr.migr_token = false;
        migr.migr_token_hops = migr.migr_token_hops.saturating_sub(1);
        (migr.migr_token_hops, migr.migr_vt)
    };
    let next = shard.config.next_shard(shard.id);
    info!(shard.log, "migration sweep done, passing token";
          "next" => %next, "hops" => hops);
    if let Err(e) = shard.send(next, Message::MigrationToken { hops, vt_id: vt }) {
        error!(shard.log, "failed to pass migration token"; "error" => ?e);
    }
}

/// Reads parked for `handle` become runnable (node created or installed).
pub fn drain_deferred_reads(shard: &Shard, handle: &NodeHandle) {
    let parked = {
        let mut migr = shard.migr.lock().unwrap();
        migr.deferred_reads.remove(handle)
    };
    if let Some(parked) = parked {
        for msg in parked {
            shard.sched.add_read(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_assignment_prefers_least_loaded() {
        let counts = vec![10, 3, 7];
        assert_eq!(balanced_assignment(&counts, &[0, 1, 2]), 1);
        assert_eq!(balanced_assignment(&counts, &[0, 2]), 2);
        // a single tie is returned as-is
        assert_eq!(balanced_assignment(&counts, &[0]), 0);
    }

    #[test]
    fn step3_gate_needs_acks_and_prog_completion() {
        let state = std::sync::Mutex::new(MigrationState::new(1, 2));
        {
            let mut migr = state.lock().unwrap();
            migr.edge_acks = vec![true, false];
            assert!(!check_step3(&mut migr));

            migr.edge_acks = vec![true, true];
            migr.target_prog_id = vec![5];
            migr.max_done_id = vec![4];
            assert!(!check_step3(&mut migr));

            migr.max_done_id = vec![5];
            assert!(check_step3(&mut migr));
            // firing resets the acks
            assert!(migr.edge_acks.iter().all(|&a| !a));
            assert!(!check_step3(&mut migr));
        }
    }
}
