//! The vector timestamper.
//!
//! One VT serializes the transactions of every client attached to it: each
//! transaction bumps the VT's own vector-clock slot, takes the next qts for
//! every shard it touches, and fans out as TX_INIT. Reads snapshot the
//! current clock and travel as node programs. A timer thread pulses NOPs
//! so shards make progress (and garbage-collect) even when no client is
//! writing.
//!
//! Transaction ids and request ids are minted as `ctr * num_vts + vt_id`,
//! so they are globally unique while per-VT floors (`max_done_id`) stay
//! meaningful.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fnv::{FnvHashMap, FnvHashSet};
use slog::Logger;

use weaver::clock::VectorClock;
use weaver::config::{Config, ShardCount};
use weaver::data::{NodeHandle, PendingUpdate, ServerId};
use weaver::error::UserError;
use weaver::message::{Message, TxStatus};
use weaver::prog::{ProgParams, ProgType};

use weaver_channel::{Envelope, Transport};
use weaver_services::{NameMap, ServiceError};

const NAMEMAP_RETRIES: usize = 3;

struct TxWait {
    client: u64,
    client_tx_id: u64,
    pending: FnvHashSet<ServerId>,
    error: Option<UserError>,
}

struct ProgWait {
    client: u64,
    prog: ProgType,
    pending_returns: u64,
    partial: Option<ProgParams>,
}

struct VtState {
    vclock: VectorClock,
    /// Last qts assigned per shard; writes and NOPs both advance it.
    qts: Vec<u64>,
    tx_ctr: u64,
    req_ctr: u64,
    nop_ctr: u64,
    outstanding_tx: FnvHashMap<u64, TxWait>,
    outstanding_progs: FnvHashMap<u64, ProgWait>,
    /// Completed request ids not yet piggybacked on a NOP round.
    done_buffer: Vec<u64>,
    /// Completed ids above the floor, waiting for the gap to close.
    completed: BTreeSet<u64>,
    /// All of this VT's request ids ≤ this are complete.
    max_done_id: u64,
    /// Next own request id the floor is waiting on.
    next_done: u64,
    shard_node_counts: Vec<u64>,
    migration_waiter: Option<u64>,
}

pub struct Timestamper {
    pub vt_id: u64,
    pub config: Arc<Config>,
    /// Live shard count; only grows, one configuration epoch per growth.
    pub shard_count: ShardCount,
    pub log: Logger,
    pub transport: Arc<dyn Transport<Message>>,
    pub namemap: Arc<dyn NameMap>,
    state: Mutex<VtState>,
    stop: AtomicBool,
}

impl Timestamper {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport<Message>>,
        namemap: Arc<dyn NameMap>,
        log: Logger,
    ) -> Arc<Timestamper> {
        let vt_id = transport.local_id();
        assert!(vt_id < config.num_vts, "{} is not a vt id", vt_id);
        let log = log.new(o!("vt" => vt_id));
        let num_vts = config.num_vts;
        let num_shards = config.num_shards as usize;

        Arc::new(Timestamper {
            vt_id,
            transport,
            namemap,
            state: Mutex::new(VtState {
                vclock: VectorClock::new(vt_id, num_vts as usize),
                qts: vec![0; num_shards],
                tx_ctr: 0,
                req_ctr: 0,
                nop_ctr: 0,
                outstanding_tx: FnvHashMap::default(),
                outstanding_progs: FnvHashMap::default(),
                done_buffer: Vec::new(),
                completed: BTreeSet::new(),
                max_done_id: 0,
                next_done: num_vts + vt_id,
                shard_node_counts: vec![0; num_shards],
                migration_waiter: None,
            }),
            stop: AtomicBool::new(false),
            shard_count: config.shard_count(),
            config,
            log,
        })
    }

    /// Serve until EXIT_WEAVER.
    pub fn run(self: Arc<Self>) {
        info!(self.log, "vt serving";
              "nop_interval_ms" => self.config.nop_interval_ms);
        let timer = {
            let vt = self.clone();
            thread::Builder::new()
                .name(format!("vt-{}-nop", self.vt_id))
                .spawn(move || vt.nop_loop())
                .expect("spawning nop timer")
        };

        loop {
            let env = match self.transport.recv() {
                Ok(env) => env,
                Err(_) => break,
            };
            if !self.handle(env) {
                break;
            }
        }

        self.stop.store(true, Ordering::SeqCst);
        timer.join().expect("nop timer panicked");
        info!(self.log, "vt stopped");
    }

    fn nop_loop(&self) {
        let interval = Duration::from_millis(self.config.nop_interval_ms);
        while !self.stop.load(Ordering::SeqCst) {
            thread::sleep(interval);
            self.send_nops();
        }
    }

    /// One NOP round: every shard gets the next qts in its sequence plus
    /// the piggybacked completion and load gossip.
    fn send_nops(&self) {
        let sends = {
            let mut state = self.state.lock().unwrap();
            state.nop_ctr += 1;
            let done_reqs: Vec<u64> = state.done_buffer.drain(..).collect();
            let vclock = state.vclock.clone();
            let max_done_id = state.max_done_id;
            let counts = state.shard_node_counts.clone();
            let nop_ctr = state.nop_ctr;

            self.config
                .shard_ids()
                .into_iter()
                .map(|shard| {
                    let idx = self.config.shard_index(shard);
                    state.qts[idx] += 1;
                    (
                        shard,
                        Message::VtNop {
                            vt_id: self.vt_id,
                            vclock: vclock.clone(),
                            qts: state.qts[idx],
                            req_id: nop_ctr,
                            done_reqs: done_reqs.clone(),
                            max_done_id,
                            shard_node_count: counts.clone(),
                        },
                    )
                })
                .collect::<Vec<_>>()
        };

        for (shard, msg) in sends {
            if let Err(e) = self.transport.send(shard.0, msg) {
                warn!(self.log, "nop send failed"; "shard" => %shard, "error" => ?e);
            }
        }
    }

    fn handle(&self, env: Envelope<Message>) -> bool {
        let from = env.from;
        match env.msg {
            Message::ClientTxInit { tx_id, updates } => {
                self.client_tx(from, tx_id, updates);
            }
            Message::TxDone { tx_id, status } => {
                self.tx_done(ServerId(from), tx_id, status);
            }
            Message::ClientNodeProgReq { prog, args } => {
                self.client_prog(from, prog, args);
            }
            Message::NodeProgReturn {
                prog,
                req_id,
                params,
                ..
            } => {
                self.prog_return(prog, req_id, params);
            }
            Message::NodeProgFail { req_id } => {
                self.prog_fail(req_id);
            }
            Message::VtNopAck { shard, node_count } => {
                let mut state = self.state.lock().unwrap();
                let idx = self.config.shard_index(shard);
                state.shard_node_counts[idx] = node_count;
            }
            Message::ClientNodeCount => {
                let counts = self.state.lock().unwrap().shard_node_counts.clone();
                self.send_best_effort(from, Message::NodeCountReply { counts });
            }
            Message::StartMigration => {
                self.mint_token(None);
            }
            Message::OneStreamMigration => {
                self.mint_token(Some(from));
            }
            Message::MigrationToken { .. } => {
                info!(self.log, "migration token returned";
                      "node_counts" => ?self.state.lock().unwrap().shard_node_counts);
                let waiter = self.state.lock().unwrap().migration_waiter.take();
                if let Some(client) = waiter {
                    self.send_best_effort(client, Message::MigrationDone);
                }
            }
            Message::ExitWeaver => {
                info!(self.log, "exit requested, stopping shards");
                for shard in self.config.shard_ids() {
                    let _ = self.transport.send(shard.0, Message::ExitWeaver);
                }
                return false;
            }
            other => {
                warn!(self.log, "unexpected message"; "from" => from, "msg" => ?other);
            }
        }
        true
    }

    // -------- transactions --------

    fn client_tx(&self, client: u64, client_tx_id: u64, updates: Vec<PendingUpdate>) {
        // resolve placement before taking the serialization lock
        let mut per_shard: FnvHashMap<ServerId, Vec<PendingUpdate>> = FnvHashMap::default();
        for mut upd in updates {
            let target_loc = if upd.is_create_node() {
                let node = upd.target().clone();
                let loc = self.config.place_new_node(&node);
                if self
                    .namemap_retry(|nm| nm.put(node.as_str(), loc.0))
                    .is_err()
                {
                    self.send_best_effort(client, Message::ClientTxAbort { tx_id: client_tx_id });
                    return;
                }
                loc
            } else {
                match self.lookup(upd.target()) {
                    Some(loc) => loc,
                    None => {
                        debug!(self.log, "tx targets unknown node"; "node" => %upd.target());
                        self.send_best_effort(
                            client,
                            Message::ClientTxAbort { tx_id: client_tx_id },
                        );
                        return;
                    }
                }
            };

            if let PendingUpdate::CreateEdge {
                ref dst,
                ref mut dst_loc,
                ..
            } = upd
            {
                *dst_loc = match self.lookup(dst) {
                    Some(loc) => Some(loc),
                    None => {
                        self.send_best_effort(
                            client,
                            Message::ClientTxAbort { tx_id: client_tx_id },
                        );
                        return;
                    }
                };
            }

            per_shard
                .entry(target_loc)
                .or_insert_with(Vec::new)
                .push(upd);
        }

        if per_shard.is_empty() {
            self.send_best_effort(client, Message::ClientTxSuccess { tx_id: client_tx_id });
            return;
        }

        // the per-VT serialization point: clock, qts, and outstanding entry
        // are assigned atomically
        let sends = {
            let mut state = self.state.lock().unwrap();
            state.vclock.tick();
            state.tx_ctr += 1;
            let tx_id = state.tx_ctr * self.config.num_vts + self.vt_id;
            let vclock = state.vclock.clone();

            let mut pending = FnvHashSet::default();
            let mut sends = Vec::new();
            for (shard, upds) in per_shard {
                let idx = self.config.shard_index(shard);
                state.qts[idx] += 1;
                pending.insert(shard);
                sends.push((
                    shard,
                    Message::TxInit {
                        vt_id: self.vt_id,
                        tx_id,
                        vclock: vclock.clone(),
                        qts: state.qts[idx],
                        updates: upds,
                    },
                ));
            }
            state.outstanding_tx.insert(
                tx_id,
                TxWait {
                    client,
                    client_tx_id,
                    pending,
                    error: None,
                },
            );
            trace!(self.log, "tx serialized"; "tx" => tx_id, "shards" => sends.len());
            sends
        };

        for (shard, msg) in sends {
            if let Err(e) = self.transport.send(shard.0, msg) {
                // the shard will never ack; fail the tx now
                error!(self.log, "tx send failed"; "shard" => %shard, "error" => ?e);
            }
        }
    }

    fn tx_done(&self, shard: ServerId, tx_id: u64, status: TxStatus) {
        let reply = {
            let mut state = self.state.lock().unwrap();
            let finished = match state.outstanding_tx.get_mut(&tx_id) {
                Some(wait) => {
                    wait.pending.remove(&shard);
                    if let TxStatus::Error(e) = status {
                        if wait.error.is_none() {
                            wait.error = Some(e);
                        }
                    }
                    wait.pending.is_empty()
                }
                None => false,
            };
            if finished {
                state.outstanding_tx.remove(&tx_id)
            } else {
                None
            }
        };

        if let Some(wait) = reply {
            let msg = match wait.error {
                None => Message::ClientTxSuccess {
                    tx_id: wait.client_tx_id,
                },
                Some(ref e) => {
                    debug!(self.log, "tx aborted"; "tx" => tx_id, "error" => %e);
                    Message::ClientTxAbort {
                        tx_id: wait.client_tx_id,
                    }
                }
            };
            self.send_best_effort(wait.client, msg);
        }
    }

    // -------- node programs --------

    fn client_prog(&self, client: u64, prog: ProgType, args: Vec<(NodeHandle, ProgParams)>) {
        if args.is_empty() {
            self.send_best_effort(client, Message::NodeProgFail { req_id: 0 });
            return;
        }

        if prog.is_global() {
            self.global_prog(client, prog, args);
            return;
        }

        // resolve every start handle before sending anything
        let mut per_shard: FnvHashMap<ServerId, Vec<(NodeHandle, ProgParams)>> =
            FnvHashMap::default();
        for (handle, params) in args {
            match self.lookup(&handle) {
                Some(loc) => per_shard
                    .entry(loc)
                    .or_insert_with(Vec::new)
                    .push((handle, params)),
                None => {
                    debug!(self.log, "node program targets unknown node"; "node" => %handle);
                    self.send_best_effort(client, Message::NodeProgFail { req_id: 0 });
                    return;
                }
            }
        }

        let (req_id, vclock) = {
            let mut state = self.state.lock().unwrap();
            state.req_ctr += 1;
            let req_id = state.req_ctr * self.config.num_vts + self.vt_id;
            state.outstanding_progs.insert(
                req_id,
                ProgWait {
                    client,
                    prog,
                    pending_returns: 1,
                    partial: None,
                },
            );
            (req_id, state.vclock.clone())
        };

        for (shard, tuples) in per_shard {
            let args = tuples
                .into_iter()
                .map(|(h, p)| (h, p, weaver::data::RemoteNode::coordinator(self.vt_id)))
                .collect();
            let msg = Message::NodeProg {
                prog,
                global: false,
                vt_id: self.vt_id,
                vclock: vclock.clone(),
                req_id,
                args,
            };
            if self.transport.send(shard.0, msg).is_err() {
                self.prog_fail(req_id);
                return;
            }
        }
    }

    /// Broadcast a global program; every shard coordinates its own
    /// partition and returns a partial result.
    fn global_prog(&self, client: u64, prog: ProgType, args: Vec<(NodeHandle, ProgParams)>) {
        let (req_id, vclock) = {
            let mut state = self.state.lock().unwrap();
            state.req_ctr += 1;
            let req_id = state.req_ctr * self.config.num_vts + self.vt_id;
            state.outstanding_progs.insert(
                req_id,
                ProgWait {
                    client,
                    prog,
                    pending_returns: self.config.num_shards,
                    partial: None,
                },
            );
            (req_id, state.vclock.clone())
        };

        let (handle, params) = args.into_iter().next().unwrap();
        for shard in self.config.shard_ids() {
            let msg = Message::NodeProg {
                prog,
                global: true,
                vt_id: self.vt_id,
                vclock: vclock.clone(),
                req_id,
                args: vec![(
                    handle.clone(),
                    params.clone(),
                    weaver::data::RemoteNode::coordinator(self.vt_id),
                )],
            };
            if self.transport.send(shard.0, msg).is_err() {
                self.prog_fail(req_id);
                return;
            }
        }
    }

    fn prog_return(&self, prog: ProgType, req_id: u64, params: ProgParams) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            let done = match state.outstanding_progs.get_mut(&req_id) {
                Some(wait) => {
                    wait.partial = Some(merge_returns(wait.partial.take(), params));
                    wait.pending_returns -= 1;
                    wait.pending_returns == 0
                }
                // stale return for a request already answered or failed
                None => false,
            };
            if done {
                let wait = state.outstanding_progs.remove(&req_id).unwrap();
                self.complete_req(&mut state, req_id);
                Some(wait)
            } else {
                None
            }
        };

        if let Some(wait) = finished {
            let params = wait.partial.expect("finished request has a result");
            self.send_best_effort(
                wait.client,
                Message::NodeProgReturn {
                    prog,
                    req_id,
                    vt_ptr: 1337,
                    params,
                },
            );
        }
    }

    fn prog_fail(&self, req_id: u64) {
        let client = {
            let mut state = self.state.lock().unwrap();
            match state.outstanding_progs.remove(&req_id) {
                Some(wait) => {
                    // completing the id lets shards cancel and GC the request
                    self.complete_req(&mut state, req_id);
                    Some(wait.client)
                }
                None => None,
            }
        };
        if let Some(client) = client {
            warn!(self.log, "node program failed"; "req" => req_id);
            self.send_best_effort(client, Message::NodeProgFail { req_id });
        }
    }

    /// Record a finished request id and advance the completion floor over
    /// any now-contiguous prefix.
    fn complete_req(&self, state: &mut VtState, req_id: u64) {
        state.done_buffer.push(req_id);
        state.completed.insert(req_id);
        while state.completed.remove(&state.next_done) {
            state.max_done_id = state.next_done;
            state.next_done += self.config.num_vts;
        }
    }

    // -------- control --------

    fn mint_token(&self, waiter: Option<u64>) {
        {
            let mut state = self.state.lock().unwrap();
            state.migration_waiter = waiter;
        }
        let first = self.config.shard_at(0);
        let hops = self.shard_count.get();
        info!(self.log, "minting migration token"; "hops" => hops);
        let msg = Message::MigrationToken {
            hops,
            vt_id: self.vt_id,
        };
        if let Err(e) = self.transport.send(first.0, msg) {
            error!(self.log, "failed to mint migration token"; "error" => ?e);
        }
    }

    // -------- plumbing --------

    fn lookup(&self, handle: &NodeHandle) -> Option<ServerId> {
        match self.namemap_retry(|nm| nm.get(handle.as_str())) {
            Ok(Some(loc)) => Some(ServerId(loc)),
            _ => None,
        }
    }

    fn namemap_retry<R, F>(&self, f: F) -> Result<R, ServiceError>
    where
        F: Fn(&dyn NameMap) -> Result<R, ServiceError>,
    {
        let mut backoff = Duration::from_millis(5);
        let mut last = ServiceError::Unavailable;
        for _ in 0..NAMEMAP_RETRIES {
            match f(&*self.namemap) {
                Ok(r) => return Ok(r),
                Err(e) => {
                    warn!(self.log, "namemap call failed"; "error" => ?e);
                    last = e;
                    thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }
        Err(last)
    }

    fn send_best_effort(&self, to: u64, msg: Message) {
        if let Err(e) = self.transport.send(to, msg) {
            warn!(self.log, "reply dropped"; "to" => to, "error" => ?e);
        }
    }
}

fn merge_returns(partial: Option<ProgParams>, incoming: ProgParams) -> ProgParams {
    match (partial, incoming) {
        (None, p) => p,
        (Some(ProgParams::EdgeCount(mut acc)), ProgParams::EdgeCount(p)) => {
            acc.total += p.total;
            ProgParams::EdgeCount(acc)
        }
        // non-global programs produce exactly one return
        (Some(_), p) => p,
    }
}
