//! Deployment configuration.
//!
//! One JSON document describes the whole deployment; every field is
//! required, and a missing key fails deserialization so binaries can exit
//! before touching the network. The config is read-mostly after startup:
//! servers share it behind an `Arc` and only the shard count may grow
//! across configuration epochs.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::RwLock;

use failure::Fail;

use crate::data::{NodeHandle, ServerId, MAX_NUM_SERVERS};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPolicy {
    /// Communication-weighted LDG: score by observed cross-shard traffic.
    Cldg,
    /// Plain LDG: score by neighbor placement.
    Ldg,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub num_vts: u64,
    pub num_shards: u64,
    pub max_cache_entries: u64,
    /// Worker threads per shard.
    pub num_threads: usize,
    pub nop_interval_ms: u64,
    /// Per-shard node capacity used as the load penalty denominator.
    pub capacity: u64,
    pub migration_policy: MigrationPolicy,
    /// VT endpoints; index i is VT id i.
    pub vts: Vec<String>,
    /// Shard endpoints; index i is server id `num_vts + i`.
    pub shards: Vec<String>,
    /// External key-value store backing the NameMap.
    pub kv: String,
    pub kronos: String,
    pub server_mgr: String,
}

#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "cannot read config: {}", _0)]
    Io(#[cause] io::Error),
    #[fail(display = "cannot parse config: {}", _0)]
    Parse(#[cause] serde_json::Error),
    #[fail(display = "invalid config: {}", _0)]
    Invalid(String),
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_vts == 0 {
            return Err(ConfigError::Invalid("num_vts must be at least 1".into()));
        }
        if self.num_shards == 0 {
            return Err(ConfigError::Invalid("num_shards must be at least 1".into()));
        }
        if self.num_vts + self.num_shards > MAX_NUM_SERVERS {
            return Err(ConfigError::Invalid(format!(
                "server ids must fit below {}",
                MAX_NUM_SERVERS
            )));
        }
        if self.vts.len() as u64 != self.num_vts {
            return Err(ConfigError::Invalid("vts list length != num_vts".into()));
        }
        if self.shards.len() as u64 != self.num_shards {
            return Err(ConfigError::Invalid(
                "shards list length != num_shards".into(),
            ));
        }
        if self.num_threads < 2 {
            return Err(ConfigError::Invalid(
                "num_threads must be at least 2".into(),
            ));
        }
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be nonzero".into()));
        }
        Ok(())
    }

    /// Shard ids start where VT ids end.
    pub fn shard_id_incr(&self) -> u64 {
        self.num_vts
    }

    pub fn shard_ids(&self) -> Vec<ServerId> {
        (0..self.num_shards)
            .map(|i| ServerId(self.shard_id_incr() + i))
            .collect()
    }

    pub fn vt_ids(&self) -> Vec<u64> {
        (0..self.num_vts).collect()
    }

    pub fn is_shard(&self, id: ServerId) -> bool {
        id.0 >= self.shard_id_incr() && id.0 < self.shard_id_incr() + self.num_shards
    }

    /// Dense index of a shard id into per-shard tables.
    pub fn shard_index(&self, id: ServerId) -> usize {
        assert!(self.is_shard(id), "{} is not a shard id", id);
        (id.0 - self.shard_id_incr()) as usize
    }

    pub fn shard_at(&self, index: usize) -> ServerId {
        assert!((index as u64) < self.num_shards);
        ServerId(self.shard_id_incr() + index as u64)
    }

    /// The next shard around the migration-token ring.
    pub fn next_shard(&self, id: ServerId) -> ServerId {
        let next = self.shard_index(id) + 1;
        self.shard_at(next % self.num_shards as usize)
    }

    /// Placement for a node created under this handle. Numeric handles
    /// place like the bulk loaders (`id mod num_shards`); everything else
    /// hashes.
    pub fn place_new_node(&self, handle: &NodeHandle) -> ServerId {
        let offset = match handle.as_str().parse::<u64>() {
            Ok(id) => id % self.num_shards,
            Err(_) => {
                let mut hasher = DefaultHasher::new();
                handle.hash(&mut hasher);
                hasher.finish() % self.num_shards
            }
        };
        self.shard_at(offset as usize)
    }

    /// id → endpoint map for the transport layer.
    pub fn socket_addrs(&self) -> Result<HashMap<u64, SocketAddr>, ConfigError> {
        let mut addrs = HashMap::new();
        for (i, addr) in self.vts.iter().enumerate() {
            addrs.insert(i as u64, parse_addr(addr)?);
        }
        for (i, addr) in self.shards.iter().enumerate() {
            addrs.insert(self.shard_id_incr() + i as u64, parse_addr(addr)?);
        }
        Ok(addrs)
    }

    /// The runtime shard-count cell seeded from this config.
    pub fn shard_count(&self) -> ShardCount {
        ShardCount::new(self.num_shards)
    }

    pub fn addr_of(&self, id: ServerId) -> Result<SocketAddr, ConfigError> {
        let s = if self.is_shard(id) {
            &self.shards[self.shard_index(id)]
        } else {
            &self.vts[id.0 as usize]
        };
        parse_addr(s)
    }
}

fn parse_addr(s: &str) -> Result<SocketAddr, ConfigError> {
    s.parse()
        .map_err(|_| ConfigError::Invalid(format!("bad endpoint {:?}", s)))
}

#[derive(Clone, Copy, Debug)]
struct ShardCountInner {
    num_shards: u64,
    epoch: u64,
}

/// The one deployment value that may change after startup: the shard
/// count, read-mostly behind an `RwLock` with a configuration epoch that
/// advances on growth. The shard set never shrinks, and it never changes
/// in the middle of a migration pass — `update` is the seam a grown
/// membership view plugs into.
#[derive(Debug)]
pub struct ShardCount {
    inner: RwLock<ShardCountInner>,
}

impl ShardCount {
    pub fn new(num_shards: u64) -> Self {
        ShardCount {
            inner: RwLock::new(ShardCountInner {
                num_shards,
                epoch: 0,
            }),
        }
    }

    pub fn get(&self) -> u64 {
        self.inner.read().unwrap().num_shards
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().unwrap().epoch
    }

    /// Install the count from a newer membership view and return the
    /// resulting epoch. A view with fewer shards than already seen is an
    /// invariant breach.
    pub fn update(&self, num_shards: u64) -> u64 {
        let mut inner = self.inner.write().unwrap();
        assert!(
            num_shards >= inner.num_shards,
            "the shard set only grows ({} -> {})",
            inner.num_shards,
            num_shards
        );
        if num_shards > inner.num_shards {
            inner.num_shards = num_shards;
            inner.epoch += 1;
        }
        inner.epoch
    }
}
