//! The shard's work scheduler.
//!
//! Writes (transactions and NOPs) are queued per VT and released strictly
//! in qts order: the unit at the head of a VT's queue runs only when its
//! qts equals the next expected value, and the expectation advances when
//! the unit *completes*, so one VT's writes never overlap. Reads (node
//! programs) are queued per VT by request id and released once the safe
//! frontier — every VT's own clock slot, as advanced by that VT's applied
//! writes and NOPs — has reached the read's clock. Migration traffic rides
//! a FIFO control lane that bypasses ordering entirely.
//!
//! Workers park here when nothing is runnable; every enqueue and every
//! completion wakes them.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Condvar, Mutex};

use fnv::FnvHashSet;

use weaver::clock::VectorClock;
use weaver::data::{NodeHandle, PendingUpdate, ServerId};
use weaver::message::ProgArg;
use weaver::prog::ProgType;

/// Everything a NOP carries to a shard.
#[derive(Clone, Debug)]
pub struct NopData {
    pub vt_id: u64,
    pub vclock: VectorClock,
    pub qts: u64,
    pub req_id: u64,
    pub done_reqs: Vec<u64>,
    pub max_done_id: u64,
    pub shard_node_count: Vec<u64>,
}

#[derive(Debug)]
pub enum WriteKind {
    Tx {
        tx_id: u64,
        updates: Vec<PendingUpdate>,
    },
    Nop(NopData),
}

#[derive(Debug)]
pub struct WriteUnit {
    pub vt_id: u64,
    pub qts: u64,
    pub vclock: VectorClock,
    pub kind: WriteKind,
}

impl PartialEq for WriteUnit {
    fn eq(&self, other: &Self) -> bool {
        self.qts == other.qts
    }
}
impl Eq for WriteUnit {}
impl PartialOrd for WriteUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WriteUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; flip so the smallest qts surfaces
        other.qts.cmp(&self.qts)
    }
}

/// A queued node program, exactly the wire message's fields.
#[derive(Clone, Debug)]
pub struct ProgMsg {
    pub prog: ProgType,
    pub global: bool,
    pub vt_id: u64,
    pub vclock: VectorClock,
    pub req_id: u64,
    pub args: Vec<ProgArg>,
}

#[derive(Debug)]
struct ReadUnit {
    msg: ProgMsg,
}

impl PartialEq for ReadUnit {
    fn eq(&self, other: &Self) -> bool {
        self.msg.req_id == other.msg.req_id
    }
}
impl Eq for ReadUnit {}
impl PartialOrd for ReadUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        other.msg.req_id.cmp(&self.msg.req_id)
    }
}

/// Migration traffic; runnable immediately.
#[derive(Debug)]
pub enum ControlMsg {
    MigrateSendNode {
        node: NodeHandle,
        from: ServerId,
        data: Vec<u8>,
    },
    MigratedNbrUpdate {
        node: NodeHandle,
        old_loc: ServerId,
        new_loc: ServerId,
    },
    MigratedNbrAck {
        from: ServerId,
        target_prog_id: Vec<u64>,
        node_count: u64,
    },
}

#[derive(Debug)]
pub enum WorkItem {
    Write(WriteUnit),
    Read(ProgMsg),
    Control(ControlMsg),
    Shutdown,
}

struct Inner {
    writes: Vec<BinaryHeap<WriteUnit>>,
    reads: Vec<BinaryHeap<ReadUnit>>,
    control: VecDeque<ControlMsg>,
    /// Next expected qts per VT; advances on write completion.
    next_qts: Vec<u64>,
    /// Per-VT own-slot counter of the latest completed write.
    frontier: Vec<u64>,
    /// Requests cancelled or completed, plus a per-VT completion floor.
    done: FnvHashSet<u64>,
    done_floor: Vec<u64>,
    shutdown: bool,
}

impl Inner {
    fn read_runnable(&self, msg: &ProgMsg) -> bool {
        (0..self.frontier.len()).all(|v| self.frontier[v] >= msg.vclock.slot(v as u64))
    }

    fn poll(&mut self) -> Option<WorkItem> {
        if self.shutdown {
            return Some(WorkItem::Shutdown);
        }
        if let Some(c) = self.control.pop_front() {
            return Some(WorkItem::Control(c));
        }
        for vt in 0..self.writes.len() {
            let runnable = match self.writes[vt].peek() {
                Some(unit) => unit.qts == self.next_qts[vt],
                None => false,
            };
            if runnable {
                let unit = self.writes[vt].pop().unwrap();
                return Some(WorkItem::Write(unit));
            }
        }
        for vt in 0..self.reads.len() {
            let runnable = match self.reads[vt].peek() {
                Some(unit) => self.read_runnable(&unit.msg),
                None => false,
            };
            if runnable {
                let unit = self.reads[vt].pop().unwrap();
                return Some(WorkItem::Read(unit.msg));
            }
        }
        None
    }
}

pub struct Scheduler {
    inner: Mutex<Inner>,
    cv: Condvar,
    num_vts: usize,
}

impl Scheduler {
    pub fn new(num_vts: usize) -> Self {
        Scheduler {
            inner: Mutex::new(Inner {
                writes: (0..num_vts).map(|_| BinaryHeap::new()).collect(),
                reads: (0..num_vts).map(|_| BinaryHeap::new()).collect(),
                control: VecDeque::new(),
                next_qts: vec![1; num_vts],
                frontier: vec![0; num_vts],
                done: FnvHashSet::default(),
                done_floor: vec![0; num_vts],
                shutdown: false,
            }),
            cv: Condvar::new(),
            num_vts,
        }
    }

    pub fn add_write(&self, unit: WriteUnit) {
        let mut inner = self.inner.lock().unwrap();
        inner.writes[unit.vt_id as usize].push(unit);
        self.cv.notify_all();
    }

    pub fn add_read(&self, msg: ProgMsg) {
        let mut inner = self.inner.lock().unwrap();
        inner.reads[msg.vt_id as usize].push(ReadUnit { msg });
        self.cv.notify_all();
    }

    pub fn add_control(&self, msg: ControlMsg) {
        let mut inner = self.inner.lock().unwrap();
        inner.control.push_back(msg);
        self.cv.notify_all();
    }

    /// Blocks until something is runnable. `Shutdown` is sticky: every
    /// worker that asks after shutdown sees it.
    pub fn next(&self) -> WorkItem {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.poll() {
                return item;
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Non-blocking variant used by tests.
    pub fn try_next(&self) -> Option<WorkItem> {
        self.inner.lock().unwrap().poll()
    }

    /// A write finished applying: advance the VT's qts expectation and the
    /// read frontier, and wake anyone gated on either.
    pub fn record_completed_write(&self, vt_id: u64, vclock: &VectorClock) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_qts[vt_id as usize] += 1;
        let slot = vclock.slot(vt_id);
        if slot > inner.frontier[vt_id as usize] {
            inner.frontier[vt_id as usize] = slot;
        }
        self.cv.notify_all();
    }

    /// Next qts this shard will run for `vt_id`; the gap-free sequence
    /// invariant is checked against this in tests.
    pub fn next_expected_qts(&self, vt_id: u64) -> u64 {
        self.inner.lock().unwrap().next_qts[vt_id as usize]
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        self.cv.notify_all();
    }

    // -------- done-request bookkeeping --------

    pub fn mark_done(&self, req_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.done.insert(req_id);
    }

    pub fn mark_done_bulk(&self, req_ids: &[u64]) {
        let mut inner = self.inner.lock().unwrap();
        inner.done.extend(req_ids.iter().cloned());
    }

    /// Request ids are minted as `ctr * num_vts + vt_id`, so the minting VT
    /// is recoverable and per-VT floors apply directly.
    pub fn is_done(&self, req_id: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        let vt = (req_id % self.num_vts as u64) as usize;
        req_id <= inner.done_floor[vt] || inner.done.contains(&req_id)
    }

    /// Raise a VT's completion floor (from its NOPs) and drop done-set
    /// entries the floor now covers.
    pub fn raise_done_floor(&self, vt_id: u64, max_done_id: u64) {
        let num_vts = self.num_vts as u64;
        let mut inner = self.inner.lock().unwrap();
        let floor = &mut inner.done_floor[vt_id as usize];
        if max_done_id > *floor {
            *floor = max_done_id;
        }
        let floors = inner.done_floor.clone();
        inner
            .done
            .retain(|&req| req > floors[(req % num_vts) as usize]);
    }
}
