//! Vector clocks.
//!
//! Every write is stamped by the VT that serialized it: a tuple of per-VT
//! counters plus a configuration epoch. Comparing two clocks yields a
//! partial order; concurrent pairs are totally ordered by the external
//! Kronos oracle (see the server's time oracle), keyed by each clock's
//! [`event id`](VectorClock::event_id).

use std::cmp::Ordering;

/// Outcome of comparing two vector clocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventOrd {
    Before,
    After,
    Equal,
    Concurrent,
}

impl EventOrd {
    pub fn flip(self) -> EventOrd {
        match self {
            EventOrd::Before => EventOrd::After,
            EventOrd::After => EventOrd::Before,
            other => other,
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct VectorClock {
    vt_id: u64,
    epoch: u64,
    counters: Vec<u64>,
}

impl VectorClock {
    /// A fresh clock owned by `vt_id`, all counters zero.
    pub fn new(vt_id: u64, num_vts: usize) -> Self {
        assert!((vt_id as usize) < num_vts);
        VectorClock {
            vt_id,
            epoch: 0,
            counters: vec![0; num_vts],
        }
    }

    /// The clock every stored element is older than nothing at: used by the
    /// bulk loaders for preexisting graph data.
    pub fn zero(num_vts: usize) -> Self {
        VectorClock {
            vt_id: 0,
            epoch: 0,
            counters: vec![0; num_vts],
        }
    }

    pub fn vt_id(&self) -> u64 {
        self.vt_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn counters(&self) -> &[u64] {
        &self.counters
    }

    pub fn num_vts(&self) -> usize {
        self.counters.len()
    }

    /// The owner's own slot; strictly increases with every stamped write.
    pub fn own(&self) -> u64 {
        self.counters[self.vt_id as usize]
    }

    pub fn slot(&self, vt_id: u64) -> u64 {
        self.counters.get(vt_id as usize).cloned().unwrap_or(0)
    }

    /// Advance the owner's slot; called once per serialized write or NOP.
    pub fn tick(&mut self) {
        self.counters[self.vt_id as usize] += 1;
    }

    /// Merge knowledge of another clock (pointwise max).
    pub fn observe(&mut self, other: &VectorClock) {
        assert_eq!(self.counters.len(), other.counters.len());
        for (mine, theirs) in self.counters.iter_mut().zip(&other.counters) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    /// The identifier Kronos knows this event by.
    pub fn event_id(&self) -> (u64, u64) {
        (self.vt_id, self.own())
    }

    /// Componentwise comparison. Clocks from different configuration epochs
    /// are ordered by epoch alone.
    pub fn compare(&self, other: &VectorClock) -> EventOrd {
        if self.epoch != other.epoch {
            return if self.epoch < other.epoch {
                EventOrd::Before
            } else {
                EventOrd::After
            };
        }

        let mut less = false;
        let mut greater = false;
        let len = self.counters.len().max(other.counters.len());
        for i in 0..len {
            let a = self.counters.get(i).cloned().unwrap_or(0);
            let b = other.counters.get(i).cloned().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return EventOrd::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => EventOrd::Equal,
            (true, false) => EventOrd::Before,
            (false, true) => EventOrd::After,
            (true, true) => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(vt_id: u64, counters: &[u64]) -> VectorClock {
        let mut c = VectorClock::new(vt_id, counters.len());
        c.counters = counters.to_vec();
        c
    }

    #[test]
    fn tick_bumps_own_slot_only() {
        let mut c = VectorClock::new(1, 3);
        c.tick();
        c.tick();
        assert_eq!(c.counters(), &[0, 2, 0]);
        assert_eq!(c.own(), 2);
        assert_eq!(c.event_id(), (1, 2));
    }

    #[test]
    fn componentwise_order() {
        let a = clock(0, &[1, 2]);
        let b = clock(0, &[2, 2]);
        assert_eq!(a.compare(&b), EventOrd::Before);
        assert_eq!(b.compare(&a), EventOrd::After);
        assert_eq!(a.compare(&a), EventOrd::Equal);
    }

    #[test]
    fn concurrent_pairs() {
        let a = clock(0, &[2, 0]);
        let b = clock(1, &[0, 2]);
        assert_eq!(a.compare(&b), EventOrd::Concurrent);
        assert_eq!(b.compare(&a), EventOrd::Concurrent);
    }

    #[test]
    fn epoch_dominates() {
        let mut a = clock(0, &[9, 9]);
        let b = clock(1, &[0, 1]);
        a.epoch = 0;
        let mut b2 = b.clone();
        b2.epoch = 1;
        assert_eq!(a.compare(&b2), EventOrd::Before);
        assert_eq!(b2.compare(&a), EventOrd::After);
    }

    #[test]
    fn observe_takes_pointwise_max() {
        let mut a = clock(0, &[3, 1]);
        let b = clock(1, &[1, 4]);
        a.observe(&b);
        assert_eq!(a.counters(), &[3, 4]);
    }
}
