//! Client bindings and wire types for Weaver.
//!
//! Weaver is a distributed, transactional graph store. A graph is
//! partitioned across a fixed set of shard servers; a fixed set of vector
//! timestampers (VTs) serialize client writes, stamp them with vector
//! clocks, and fan reads out as node programs that hop across shards.
//!
//! This crate holds everything both sides of the wire agree on: server and
//! element identifiers, vector clocks, the message enum, node-program
//! parameter types, deployment configuration, and the thin [`Client`].
//! The server runtime lives in `weaver-server`.

#![deny(missing_debug_implementations)]

#[macro_use]
extern crate serde_derive;

pub mod client;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod message;
pub mod prog;

pub use crate::client::{Client, ClientError, TxOutcome};
pub use crate::clock::{EventOrd, VectorClock};
pub use crate::config::{Config, MigrationPolicy, ShardCount};
pub use crate::data::{
    EdgeHandle, NodeHandle, PendingUpdate, RemoteNode, ServerId, MAX_NUM_SERVERS,
};
pub use crate::error::UserError;
pub use crate::message::{Message, TxStatus};
pub use crate::prog::{ProgParams, ProgType};
