//! The shard's worker pool: a fixed set of threads draining the scheduler.

use std::sync::Arc;
use std::thread;

use crate::shard::Shard;

pub struct Pool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl Pool {
    pub fn spawn(shard: Arc<Shard>, num_threads: usize) -> Pool {
        let handles = (0..num_threads)
            .map(|i| {
                let shard = shard.clone();
                thread::Builder::new()
                    .name(format!("shard-{}-worker-{}", shard.id, i))
                    .spawn(move || while shard.work() {})
                    .expect("spawning worker")
            })
            .collect();
        Pool { handles }
    }

    pub fn join(self) {
        for h in self.handles {
            h.join().expect("worker panicked");
        }
    }
}
