//! The shard server: message intake, NOP processing, and the glue between
//! the store, scheduler, applier, program runtime, and migration engine.
//!
//! The intake thread classifies incoming messages into the scheduler's
//! lanes; a pool of workers drains the scheduler. NOPs do the shard's
//! housekeeping: they advance the qts sequence and the read frontier like
//! any write, and additionally clock the migration state machine, garbage
//! collect program state, and refresh load signals.

use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;
use slog::Logger;

use weaver::config::Config;
use weaver::data::{NodeHandle, ServerId};
use weaver::message::Message;

use weaver_channel::{Envelope, SendError, Transport};
use weaver_services::{Kronos, NameMap};

use crate::apply;
use crate::graph::GraphStore;
use crate::migrate::{self, MigrationState, MIGR_CHANCE_THRESHOLD, MIGR_NOP_PULSES};
use crate::order::TimeOracle;
use crate::prog::{self, StateCache};
use crate::queue::{ControlMsg, NopData, ProgMsg, Scheduler, WorkItem, WriteKind, WriteUnit};
use crate::worker;

#[derive(Default)]
struct LoadProgress {
    max_time_ms: u64,
    shards_done: u64,
}

/// Builds a shard wired to an in-process mesh and local services; shared
/// by the unit tests of the modules that need a full shard around them.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use weaver::config::MigrationPolicy;
    use weaver_channel::Mesh;
    use weaver_services::{LocalKronos, LocalNameMap};

    pub struct TestShard {
        pub shard: Arc<Shard>,
        pub namemap: Arc<LocalNameMap>,
        pub mesh: Mesh<Message>,
    }

    pub fn test_config(num_vts: u64, num_shards: u64) -> Config {
        Config {
            num_vts,
            num_shards,
            max_cache_entries: 128,
            num_threads: 4,
            nop_interval_ms: 10,
            capacity: 1000,
            migration_policy: MigrationPolicy::Ldg,
            vts: (0..num_vts).map(|i| format!("127.0.0.1:{}", 6400 + i)).collect(),
            shards: (0..num_shards)
                .map(|i| format!("127.0.0.1:{}", 6500 + i))
                .collect(),
            kv: "127.0.0.1:1982".into(),
            kronos: "127.0.0.1:1992".into(),
            server_mgr: "127.0.0.1:2002".into(),
        }
    }

    /// One unstarted shard (the first one in the config); callers drive it
    /// directly instead of spawning workers.
    pub fn shard(num_vts: u64, num_shards: u64) -> TestShard {
        let config = Arc::new(test_config(num_vts, num_shards));
        let mesh = Mesh::<Message>::new();
        let namemap = Arc::new(LocalNameMap::new());
        let transport: Arc<dyn Transport<Message>> =
            Arc::new(mesh.endpoint(config.shard_at(0).0));
        let nm: Arc<dyn NameMap> = namemap.clone();
        let log = slog::Logger::root(slog::Discard, o!());
        let shard = Shard::new(config, transport, nm, Arc::new(LocalKronos::new()), log);
        TestShard {
            shard,
            namemap,
            mesh,
        }
    }
}

pub struct Shard {
    pub id: ServerId,
    pub config: Arc<Config>,
    pub log: Logger,
    pub graph: GraphStore,
    pub sched: Scheduler,
    pub oracle: Arc<TimeOracle>,
    pub namemap: Arc<dyn NameMap>,
    pub transport: Arc<dyn Transport<Message>>,
    pub prog_states: StateCache,
    pub migr: Mutex<MigrationState>,
    /// Cross-shard hops attributed to each local node since the last
    /// migration sweep (CLDG candidate ordering).
    pub msg_counts: Mutex<FnvHashMap<NodeHandle, u64>>,
    load_state: Mutex<LoadProgress>,
}

impl Shard {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport<Message>>,
        namemap: Arc<dyn NameMap>,
        kronos: Arc<dyn Kronos>,
        log: Logger,
    ) -> Arc<Shard> {
        let id = ServerId(transport.local_id());
        assert!(config.is_shard(id), "{} is not a shard id", id);
        let log = log.new(o!("shard" => id.0));
        let num_vts = config.num_vts as usize;
        let num_shards = config.num_shards as usize;

        Arc::new(Shard {
            id,
            graph: GraphStore::new(num_shards),
            sched: Scheduler::new(num_vts),
            oracle: Arc::new(TimeOracle::new(kronos, log.clone())),
            namemap,
            transport,
            prog_states: StateCache::new(),
            migr: Mutex::new(MigrationState::new(num_vts, num_shards)),
            msg_counts: Mutex::new(FnvHashMap::default()),
            load_state: Mutex::new(LoadProgress::default()),
            config,
            log,
        })
    }

    pub fn send(&self, to: ServerId, msg: Message) -> Result<(), SendError> {
        self.transport.send(to.0, msg)
    }

    /// Replies toward a VT are best-effort; the VT's timeouts drive retry.
    pub fn send_to_vt(&self, vt_id: u64, msg: Message) {
        if let Err(e) = self.transport.send(vt_id, msg) {
            error!(self.log, "failed to reach vt"; "vt" => vt_id, "error" => ?e);
        }
    }

    /// Serve until EXIT_WEAVER (or transport teardown).
    pub fn run(self: Arc<Self>) {
        info!(self.log, "shard serving"; "threads" => self.config.num_threads);
        let pool = worker::Pool::spawn(self.clone(), self.config.num_threads);
        loop {
            let env = match self.transport.recv() {
                Ok(env) => env,
                Err(_) => break,
            };
            if !self.intake(env) {
                break;
            }
        }
        self.sched.shutdown();
        pool.join();
        info!(self.log, "shard stopped");
    }

    /// Classify one message into the scheduler. Returns false on shutdown.
    fn intake(&self, env: Envelope<Message>) -> bool {
        match env.msg {
            Message::TxInit {
                vt_id,
                tx_id,
                vclock,
                qts,
                updates,
            } => {
                debug_assert_eq!(vclock.num_vts(), self.config.num_vts as usize);
                self.sched.add_write(WriteUnit {
                    vt_id,
                    qts,
                    vclock,
                    kind: WriteKind::Tx { tx_id, updates },
                });
            }
            Message::VtNop {
                vt_id,
                vclock,
                qts,
                req_id,
                done_reqs,
                max_done_id,
                shard_node_count,
            } => {
                self.sched.add_write(WriteUnit {
                    vt_id,
                    qts,
                    vclock: vclock.clone(),
                    kind: WriteKind::Nop(NopData {
                        vt_id,
                        vclock,
                        qts,
                        req_id,
                        done_reqs,
                        max_done_id,
                        shard_node_count,
                    }),
                });
            }
            Message::NodeProg {
                prog,
                global,
                vt_id,
                vclock,
                req_id,
                args,
            } => {
                self.sched.add_read(ProgMsg {
                    prog,
                    global,
                    vt_id,
                    vclock,
                    req_id,
                    args,
                });
            }
            Message::MigrateSendNode { node, from, data } => {
                self.sched
                    .add_control(ControlMsg::MigrateSendNode { node, from, data });
            }
            Message::MigratedNbrUpdate {
                node,
                old_loc,
                new_loc,
            } => {
                self.sched.add_control(ControlMsg::MigratedNbrUpdate {
                    node,
                    old_loc,
                    new_loc,
                });
            }
            Message::MigratedNbrAck {
                from,
                target_prog_id,
                node_count,
            } => {
                self.sched.add_control(ControlMsg::MigratedNbrAck {
                    from,
                    target_prog_id,
                    node_count,
                });
            }
            Message::MigrationToken { hops, vt_id } => {
                migrate::handle_token(self, hops, vt_id);
            }
            Message::LoadedGraph { load_time_ms } => {
                self.loaded_graph(load_time_ms);
            }
            Message::ExitWeaver => {
                info!(self.log, "exit requested");
                return false;
            }
            other => {
                warn!(self.log, "unexpected message"; "from" => env.from, "msg" => ?other);
            }
        }
        true
    }

    /// Process one NOP (already released in qts order).
    pub fn nop(&self, d: NopData) {
        // the NOP occupies one qts slot; completing it unblocks the next
        // write and advances the read frontier
        self.sched.record_completed_write(d.vt_id, &d.vclock);
        trace!(self.log, "nop"; "vt" => d.vt_id, "qts" => d.qts, "req" => d.req_id);

        self.sched.mark_done_bulk(&d.done_reqs);
        self.prog_states.purge_reqs(&d.done_reqs);

        let mut check_move = false;
        let mut check_init = false;
        let check_s3;
        let mut return_token_to = None;
        let cur_count;
        {
            let mut migr = self.migr.lock().unwrap();

            if migr.current_migr {
                migr.nop_count[d.vt_id as usize] += 1;
                check_move = migr.nop_count.iter().all(|&x| x >= MIGR_NOP_PULSES);
                if check_move {
                    // claimed here, under the lock: a concurrent NOP must
                    // not fire step 2 a second time
                    migr.current_migr = false;
                }
            }

            if !migr.migrated && migr.migr_token {
                if migr.migr_token_hops == 0 {
                    migr.migrated = true;
                    migr.migr_token = false;
                    return_token_to = Some(migr.migr_vt);
                } else {
                    let chance = migr.migr_chance;
                    migr.migr_chance += 1;
                    if chance > MIGR_CHANCE_THRESHOLD {
                        migr.migrated = true;
                        migr.migr_chance = 0;
                        check_init = true;
                    }
                }
            }

            // a later NOP may have overtaken this one once its qts slot was
            // released, so only ever move the floor forward
            let vt = d.vt_id as usize;
            if d.max_done_id > migr.max_done_id[vt] {
                migr.max_done_id[vt] = d.max_done_id;
            }
            check_s3 = migrate::check_step3(&mut migr);

            let self_idx = self.config.shard_index(self.id);
            for s in 0..self.config.num_shards as usize {
                if s != self_idx && s < d.shard_node_count.len() {
                    migr.shard_node_count[s] = d.shard_node_count[s];
                }
            }
            migr.shard_node_count[self_idx] = self.graph.len() as u64;
            cur_count = migr.shard_node_count[self_idx];
        }

        if let Some(vt) = return_token_to {
            info!(self.log, "returning migration token"; "vt" => vt);
            self.send_to_vt(vt, Message::MigrationToken { hops: 0, vt_id: vt });
        }

        if check_move {
            migrate::step2_req(self);
        } else if check_init {
            migrate::begin_sweep(self);
        } else if check_s3 {
            migrate::step3(self);
        }

        self.send_to_vt(
            d.vt_id,
            Message::VtNopAck {
                shard: self.id,
                node_count: cur_count,
            },
        );

        // GC: program state below every VT's completion floor is dead
        self.sched.raise_done_floor(d.vt_id, d.max_done_id);
        let floors = {
            let migr = self.migr.lock().unwrap();
            migr.max_done_id.clone()
        };
        self.prog_states.purge_below(&floors);
    }

    /// A peer finished its bulk load.
    fn loaded_graph(&self, load_time_ms: u64) {
        let mut state = self.load_state.lock().unwrap();
        if load_time_ms > state.max_time_ms {
            state.max_time_ms = load_time_ms;
        }
        state.shards_done += 1;
        if state.shards_done == self.config.num_shards {
            info!(self.log, "graph loaded on all shards";
                  "slowest_ms" => state.max_time_ms);
        } else {
            info!(self.log, "graph loaded"; "shards_done" => state.shards_done,
                  "slowest_ms" => state.max_time_ms);
        }
    }

    /// One unit of scheduled work; the worker pool calls this in a loop.
    pub fn work(&self) -> bool {
        match self.sched.next() {
            WorkItem::Write(unit) => match unit.kind {
                WriteKind::Tx { tx_id, updates } => {
                    apply::apply_tx(self, unit.vt_id, tx_id, unit.vclock, updates);
                }
                WriteKind::Nop(d) => self.nop(d),
            },
            WorkItem::Read(msg) => prog::run(self, msg),
            WorkItem::Control(c) => match c {
                ControlMsg::MigrateSendNode { node, from, data } => {
                    migrate::step2_resp(self, node, from, data);
                }
                ControlMsg::MigratedNbrUpdate {
                    node,
                    old_loc,
                    new_loc,
                } => {
                    migrate::handle_nbr_update(self, &node, old_loc, new_loc);
                }
                ControlMsg::MigratedNbrAck {
                    from,
                    target_prog_id,
                    node_count,
                } => {
                    migrate::handle_nbr_ack(self, from, target_prog_id, node_count);
                }
            },
            WorkItem::Shutdown => return false,
        }
        true
    }
}
