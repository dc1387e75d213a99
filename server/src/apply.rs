//! Applying transactions at a shard.
//!
//! The scheduler has already released the transaction in qts order; this
//! module walks its updates in the given order under the transaction's
//! vector clock. Updates whose target is frozen by migration are buffered
//! (into the node's own list if it is resident, into the shard's
//! deferred-write map if it has not arrived yet) and are not errors; user
//! errors are collected into the transaction status, and the first one wins.

use weaver::clock::VectorClock;
use weaver::data::{PendingUpdate, RemoteNode};
use weaver::error::UserError;
use weaver::message::{Message, TxStatus};

use crate::graph::{DeferredWrite, Node};
use crate::migrate;
use crate::shard::Shard;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    /// Target is migrating; the write is buffered, not failed.
    Deferred,
}

/// Run one transaction to completion and acknowledge the VT.
pub fn apply_tx(
    shard: &Shard,
    vt_id: u64,
    tx_id: u64,
    vclock: VectorClock,
    updates: Vec<PendingUpdate>,
) {
    let mut status = TxStatus::Committed;
    for upd in &updates {
        if let Err(e) = apply_update(shard, &vclock, upd) {
            debug!(shard.log, "update failed";
                   "tx" => tx_id, "error" => %e);
            if status.is_committed() {
                status = TxStatus::Error(e);
            }
        }
    }

    shard.sched.record_completed_write(vt_id, &vclock);
    trace!(shard.log, "tx applied"; "tx" => tx_id, "vt" => vt_id);
    shard.send_to_vt(vt_id, Message::TxDone { tx_id, status });
}

/// Apply one update, buffering it if its target is frozen or not yet here.
pub fn apply_update(
    shard: &Shard,
    at: &VectorClock,
    upd: &PendingUpdate,
) -> Result<ApplyOutcome, UserError> {
    if let PendingUpdate::CreateNode { ref node } = *upd {
        shard.graph.create_node(node, at, &shard.oracle)?;
        // writes and reads from other VTs may have raced the create and
        // parked under this handle
        drain_deferred_writes(shard, node);
        migrate::drain_deferred_reads(shard, node);
        return Ok(ApplyOutcome::Applied);
    }

    let target = upd.target().clone();
    loop {
        let applied = shard.graph.with_node(&target, |n| {
            if n.is_frozen() {
                n.deferred_writes.push(DeferredWrite {
                    vclock: at.clone(),
                    update: upd.clone(),
                });
                return Ok(ApplyOutcome::Deferred);
            }
            apply_on_node(shard, n, at, upd).map(|()| ApplyOutcome::Applied)
        });

        match applied {
            Some(result) => return result,
            None => {
                // absent but addressed here: the node is migrating in
                let mut migr = shard.migr.lock().unwrap();
                if shard.graph.node_ref(&target).is_some() {
                    // it landed while we looked; its buffered-write drain
                    // has already run, so apply directly
                    continue;
                }
                migr.deferred_writes
                    .entry(target)
                    .or_insert_with(Vec::new)
                    .push(DeferredWrite {
                        vclock: at.clone(),
                        update: upd.clone(),
                    });
                return Ok(ApplyOutcome::Deferred);
            }
        }
    }
}

/// Replay shard-level buffered writes onto a node that just appeared.
pub(crate) fn drain_deferred_writes(shard: &Shard, handle: &weaver::data::NodeHandle) {
    let pending = {
        let mut migr = shard.migr.lock().unwrap();
        migr.deferred_writes.remove(handle)
    };
    let mut writes = match pending {
        Some(w) => w,
        None => return,
    };
    writes.sort_by(|a, b| shard.oracle.total_order(&a.vclock, &b.vclock));
    let _ = shard.graph.with_node(handle, |n| {
        for w in writes {
            if let Err(e) = apply_on_node(shard, n, &w.vclock, &w.update) {
                debug!(shard.log, "buffered write no longer applies";
                       "node" => %handle, "error" => %e);
            }
        }
    });
}

/// Mutate a node the caller has locked. Shared with the migration engine,
/// which replays buffered writes through here once a node lands.
pub fn apply_on_node(
    shard: &Shard,
    n: &mut Node,
    at: &VectorClock,
    upd: &PendingUpdate,
) -> Result<(), UserError> {
    if !n.alive_at(at, &shard.oracle) {
        return Err(UserError::NodeNotFound);
    }

    match *upd {
        PendingUpdate::CreateNode { .. } => unreachable!("node creation goes via the directory"),
        PendingUpdate::CreateEdge {
            ref edge,
            ref dst,
            dst_loc,
            ..
        } => {
            let loc = dst_loc.expect("destination location is resolved by the VT");
            n.add_edge(edge.clone(), at.clone(), RemoteNode::new(loc, dst.clone()));
            shard.graph.index_edge(dst, &n.handle);
        }
        PendingUpdate::DeleteNode { .. } => {
            n.base.delete(at.clone());
        }
        PendingUpdate::DeleteEdge { ref edge, .. } => {
            match n.out_edges.get_mut(edge) {
                Some(e) if e.base.alive_at(at, &shard.oracle) => {
                    e.base.delete(at.clone());
                }
                _ => return Err(UserError::EdgeNotFound),
            }
        }
        PendingUpdate::SetNodeProperty {
            ref key, ref value, ..
        } => {
            n.base.set_property(key, value, at, &shard.oracle);
        }
        PendingUpdate::SetEdgeProperty {
            ref edge,
            ref key,
            ref value,
            ..
        } => match n.out_edges.get_mut(edge) {
            Some(e) if e.base.alive_at(at, &shard.oracle) => {
                e.base.set_property(key, value, at, &shard.oracle);
            }
            _ => return Err(UserError::EdgeNotFound),
        },
    }

    n.updated = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeState;
    use crate::shard::test_support;
    use weaver::data::NodeHandle;

    fn clock(ticks: u64) -> VectorClock {
        let mut c = VectorClock::new(0, 1);
        for _ in 0..ticks {
            c.tick();
        }
        c
    }

    #[test]
    fn duplicate_create_is_a_user_error() {
        let t = test_support::shard(1, 1);
        let upd = PendingUpdate::CreateNode { node: "a".into() };
        assert_eq!(
            apply_update(&t.shard, &clock(1), &upd).unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            apply_update(&t.shard, &clock(2), &upd),
            Err(UserError::AlreadyExists)
        );
    }

    #[test]
    fn set_property_on_deleted_node_is_not_found() {
        let t = test_support::shard(1, 1);
        apply_update(
            &t.shard,
            &clock(1),
            &PendingUpdate::CreateNode { node: "a".into() },
        )
        .unwrap();
        apply_update(
            &t.shard,
            &clock(2),
            &PendingUpdate::DeleteNode { node: "a".into() },
        )
        .unwrap();
        assert_eq!(
            apply_update(
                &t.shard,
                &clock(3),
                &PendingUpdate::SetNodeProperty {
                    node: "a".into(),
                    key: "k".into(),
                    value: "v".into(),
                },
            ),
            Err(UserError::NodeNotFound)
        );
    }

    #[test]
    fn missing_edge_is_a_user_error() {
        let t = test_support::shard(1, 1);
        apply_update(
            &t.shard,
            &clock(1),
            &PendingUpdate::CreateNode { node: "a".into() },
        )
        .unwrap();
        assert_eq!(
            apply_update(
                &t.shard,
                &clock(2),
                &PendingUpdate::DeleteEdge {
                    edge: "nope".into(),
                    src: "a".into(),
                },
            ),
            Err(UserError::EdgeNotFound)
        );
    }

    #[test]
    fn writes_to_absent_nodes_are_buffered_for_migration() {
        let t = test_support::shard(1, 1);
        let upd = PendingUpdate::SetNodeProperty {
            node: "ghost".into(),
            key: "k".into(),
            value: "v".into(),
        };
        assert_eq!(
            apply_update(&t.shard, &clock(1), &upd).unwrap(),
            ApplyOutcome::Deferred
        );
        let migr = t.shard.migr.lock().unwrap();
        let buffered = migr
            .deferred_writes
            .get(&NodeHandle::from("ghost"))
            .unwrap();
        assert_eq!(buffered.len(), 1);
    }

    #[test]
    fn frozen_nodes_buffer_writes_in_place() {
        let t = test_support::shard(1, 2);
        apply_update(
            &t.shard,
            &clock(1),
            &PendingUpdate::CreateNode { node: "a".into() },
        )
        .unwrap();
        t.shard
            .graph
            .with_node(&"a".into(), |n| {
                n.state = NodeState::InTransit;
                n.new_loc = Some(t.shard.config.shard_at(1));
            })
            .unwrap();

        let upd = PendingUpdate::DeleteNode { node: "a".into() };
        assert_eq!(
            apply_update(&t.shard, &clock(2), &upd).unwrap(),
            ApplyOutcome::Deferred
        );
        let buffered = t
            .shard
            .graph
            .with_node(&"a".into(), |n| n.deferred_writes.len())
            .unwrap();
        assert_eq!(buffered, 1);
    }

    #[test]
    fn tx_acks_with_the_first_user_error() {
        let t = test_support::shard(1, 1);
        let vt = t.mesh.endpoint(0);

        apply_tx(
            &t.shard,
            0,
            7,
            clock(1),
            vec![
                PendingUpdate::CreateNode { node: "a".into() },
                PendingUpdate::CreateNode { node: "a".into() },
            ],
        );

        use weaver_channel::Transport;
        let env = vt.recv().unwrap();
        match env.msg {
            Message::TxDone { tx_id, status } => {
                assert_eq!(tx_id, 7);
                assert_eq!(status, TxStatus::Error(UserError::AlreadyExists));
            }
            other => panic!("unexpected {:?}", other),
        }
        // completing the tx advanced the qts expectation
        assert_eq!(t.shard.sched.next_expected_qts(0), 2);
    }
}
