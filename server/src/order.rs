//! The time oracle: a total order over write events.
//!
//! Vector-clock comparison settles most pairs; genuinely concurrent pairs
//! are settled by the external Kronos oracle and the verdict is memoized
//! for the life of the process, keyed by the two events' identifiers. A
//! Kronos outage therefore stalls only comparisons of pairs never seen
//! before — everything already memoized keeps resolving locally.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fnv::FnvHashMap;
use slog::Logger;

use weaver::clock::{EventOrd, VectorClock};
use weaver_services::{EventId, Kronos};

const BACKOFF_START: Duration = Duration::from_millis(10);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

pub struct TimeOracle {
    kronos: Arc<dyn Kronos>,
    memo: Mutex<FnvHashMap<(EventId, EventId), Ordering>>,
    log: Logger,
}

impl TimeOracle {
    pub fn new(kronos: Arc<dyn Kronos>, log: Logger) -> Self {
        TimeOracle {
            kronos,
            memo: Mutex::new(FnvHashMap::default()),
            log,
        }
    }

    /// Totally orders two stamped events. `Less` means `a` happened first.
    pub fn total_order(&self, a: &VectorClock, b: &VectorClock) -> Ordering {
        match a.compare(b) {
            EventOrd::Before => Ordering::Less,
            EventOrd::After => Ordering::Greater,
            EventOrd::Equal => Ordering::Equal,
            EventOrd::Concurrent => self.resolve(a, b),
        }
    }

    /// `a ≤ b` under the total order.
    pub fn before_eq(&self, a: &VectorClock, b: &VectorClock) -> bool {
        self.total_order(a, b) != Ordering::Greater
    }

    /// `a < b` under the total order.
    pub fn strictly_before(&self, a: &VectorClock, b: &VectorClock) -> bool {
        self.total_order(a, b) == Ordering::Less
    }

    pub fn earlier_of<'a>(&self, a: &'a VectorClock, b: &'a VectorClock) -> &'a VectorClock {
        if self.before_eq(a, b) {
            a
        } else {
            b
        }
    }

    /// Kronos verdict for a concurrent pair, memoized both ways.
    fn resolve(&self, a: &VectorClock, b: &VectorClock) -> Ordering {
        let ka = a.event_id();
        let kb = b.event_id();
        {
            let memo = self.memo.lock().unwrap();
            if let Some(&ord) = memo.get(&(ka, kb)) {
                return ord;
            }
        }

        let ord = self.ask_kronos(ka, kb);
        let mut memo = self.memo.lock().unwrap();
        memo.insert((ka, kb), ord);
        memo.insert((kb, ka), ord.reverse());
        ord
    }

    fn ask_kronos(&self, a: EventId, b: EventId) -> Ordering {
        let mut backoff = BACKOFF_START;
        loop {
            match self.kronos.order_pair(a, b) {
                Ok(ord) => {
                    assert_ne!(ord, Ordering::Equal, "kronos must break every tie");
                    return ord;
                }
                Err(e) => {
                    warn!(self.log, "kronos call failed, backing off";
                          "error" => ?e, "backoff_ms" => backoff.as_millis() as u64);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn memo_len(&self) -> usize {
        self.memo.lock().unwrap().len()
    }
}

#[cfg(test)]
pub fn test_oracle() -> TimeOracle {
    use slog::Drain;
    let log = Logger::root(slog::Discard.fuse(), o!());
    TimeOracle::new(Arc::new(weaver_services::LocalKronos::new()), log)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(vt_id: u64, ticks: u64) -> VectorClock {
        let mut c = VectorClock::new(vt_id, 2);
        for _ in 0..ticks {
            c.tick();
        }
        c
    }

    #[test]
    fn comparable_pairs_never_reach_kronos() {
        let kronos = Arc::new(weaver_services::LocalKronos::new());
        let log = Logger::root(slog::Discard, o!());
        let oracle = TimeOracle::new(kronos.clone(), log);

        let mut a = clock(0, 1);
        let b = a.clone();
        a.tick();
        assert_eq!(oracle.total_order(&b, &a), Ordering::Less);
        assert_eq!(kronos.calls(), 0);
    }

    #[test]
    fn concurrent_pairs_are_memoized() {
        let kronos = Arc::new(weaver_services::LocalKronos::new());
        let log = Logger::root(slog::Discard, o!());
        let oracle = TimeOracle::new(kronos.clone(), log);

        let a = clock(0, 2);
        let b = clock(1, 2);
        let ab = oracle.total_order(&a, &b);
        assert_ne!(ab, Ordering::Equal);
        assert_eq!(kronos.calls(), 1);

        // both directions answered from the memo
        assert_eq!(oracle.total_order(&a, &b), ab);
        assert_eq!(oracle.total_order(&b, &a), ab.reverse());
        assert_eq!(kronos.calls(), 1);
        assert_eq!(oracle.memo_len(), 2);
    }

    #[test]
    fn earlier_of_picks_under_the_total_order() {
        let oracle = super::test_oracle();
        let a = clock(0, 1);
        let mut b = a.clone();
        b.tick();
        assert_eq!(oracle.earlier_of(&a, &b), &a);
        assert_eq!(oracle.earlier_of(&b, &a), &a);
    }
}
