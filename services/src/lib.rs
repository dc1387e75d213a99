//! Trait seams for the external services Weaver leans on.
//!
//! The runtime never talks to a concrete coordination service directly; it
//! goes through these traits. [`NameMap`] is the key→shard binding store
//! (backed by an external KV service in production), [`Kronos`] is the
//! timestamp oracle that totally orders concurrent event pairs, and
//! [`ServerMgr`] is the replicated membership/config state machine.
//!
//! The process-local implementations in [`local`] back tests and
//! single-process deployments.

#[macro_use]
extern crate serde_derive;

use std::cmp::Ordering;

pub mod local;

pub use crate::local::{LocalKronos, LocalNameMap, LocalServerMgr};

/// A service call that did not complete. All variants are transient: the
/// caller retries with backoff, possibly after refreshing its config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceError {
    Timeout,
    Unavailable,
}

/// An event identifier as Kronos sees it: the minting VT and the value of
/// that VT's own clock slot. Unique per stamped event.
pub type EventId = (u64, u64);

/// Key → shard-location bindings, rebindable during migration.
pub trait NameMap: Send + Sync {
    fn put(&self, handle: &str, loc: u64) -> Result<(), ServiceError>;

    fn get(&self, handle: &str) -> Result<Option<u64>, ServiceError>;

    /// Points an existing binding at a new shard.
    fn rebind(&self, handle: &str, new_loc: u64) -> Result<(), ServiceError>;

    fn remove(&self, handle: &str) -> Result<(), ServiceError>;

    /// Bulk insert used by the graph loaders.
    fn put_all(&self, bindings: &[(String, u64)]) -> Result<(), ServiceError> {
        for (h, loc) in bindings {
            self.put(h, *loc)?;
        }
        Ok(())
    }
}

/// The ordering oracle for concurrent vector clocks.
///
/// `order_pair` must be a total order: antisymmetric, never `Equal`, and
/// stable across calls for the same pair of events.
pub trait Kronos: Send + Sync {
    fn order_pair(&self, a: EventId, b: EventId) -> Result<Ordering, ServiceError>;
}

/// One membership epoch: who is in the deployment and where. This is the
/// wire form a remote ServerMgr client ships.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub epoch: u64,
    pub members: Vec<(u64, String)>,
}

/// Replicated server-management state machine.
pub trait ServerMgr: Send + Sync {
    /// Current view; retried by callers on `Timeout`/`Unavailable`.
    fn view(&self) -> Result<ClusterView, ServiceError>;

    /// Announce a server; bumps the epoch.
    fn register(&self, id: u64, addr: String) -> Result<ClusterView, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_view_round_trips() {
        let view = ClusterView {
            epoch: 3,
            members: vec![(0, "127.0.0.1:4000".to_owned()), (1, "127.0.0.1:4001".to_owned())],
        };
        let json = serde_json::to_string(&view).unwrap();
        let back: ClusterView = serde_json::from_str(&json).unwrap();
        assert_eq!(back, view);
    }
}
