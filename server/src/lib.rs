//! The Weaver server runtime: shards and vector timestampers.
//!
//! A shard (see [`shard::Shard`]) owns a partition of the graph: the
//! in-memory store with per-node locks, the qts-gated work scheduler, the
//! transaction applier, the node-program runtime, and the migration engine.
//! A VT (see [`vt::Timestamper`]) serializes client transactions, mints
//! vector clocks, and pulses NOPs that advance every shard's safe-to-run
//! frontier.
//!
//! Everything here is driven through the `weaver-channel` transport and the
//! `weaver-services` seams, so a whole deployment can run inside one
//! process for tests or across machines via the provided binaries.

#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate slog;

pub mod apply;
pub mod graph;
pub mod loader;
pub mod migrate;
pub mod order;
pub mod prog;
pub mod queue;
pub mod shard;
pub mod vt;
pub mod worker;

pub use crate::order::TimeOracle;
pub use crate::shard::Shard;
pub use crate::vt::Timestamper;
