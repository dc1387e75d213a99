//! Bulk graph loading.
//!
//! Two line-oriented formats feed the engine directly, stamped with the
//! zero clock so every loaded element predates all client writes:
//!
//! - `snap`: `# <max_node_id>` then `<src> <dst>` per edge; nodes place at
//!   `id mod num_shards`.
//! - `weaver`: `# <num_nodes>`, that many `<node> <shard_offset>` lines,
//!   then `<src> <dst>` edge lines.
//!
//! Edge handles are minted as `max_node_id + running edge count`. Each
//! shard loads the same file, keeps what is placed on it, and pushes its
//! handle→shard bindings to the NameMap in batches.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use fnv::FnvHashMap;

use weaver::clock::VectorClock;
use weaver::data::{NodeHandle, RemoteNode, ServerId};

use crate::shard::Shard;

const NAMEMAP_BATCH: usize = 100_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GraphFormat {
    Snap,
    Weaver,
}

impl FromStr for GraphFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snap" => Ok(GraphFormat::Snap),
            "weaver" => Ok(GraphFormat::Weaver),
            other => Err(format!("unknown graph file format {:?}", other)),
        }
    }
}

#[derive(Debug)]
pub enum LoadError {
    Io(io::Error),
    Parse { line: u64, what: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LoadError::Io(ref e) => write!(f, "cannot read graph file: {}", e),
            LoadError::Parse { line, ref what } => {
                write!(f, "bad graph file at line {}: {}", line, what)
            }
        }
    }
}

impl From<io::Error> for LoadError {
    fn from(e: io::Error) -> Self {
        LoadError::Io(e)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LoadStats {
    pub nodes: u64,
    pub edges: u64,
}

struct Parser<R: BufRead> {
    lines: io::Lines<R>,
    line_no: u64,
}

impl<R: BufRead> Parser<R> {
    fn next_line(&mut self) -> Result<Option<String>, LoadError> {
        match self.lines.next() {
            Some(line) => {
                self.line_no += 1;
                Ok(Some(line?))
            }
            None => Ok(None),
        }
    }

    fn parse_err(&self, what: &str) -> LoadError {
        LoadError::Parse {
            line: self.line_no,
            what: what.to_owned(),
        }
    }

    /// `# <n>` header.
    fn header(&mut self) -> Result<u64, LoadError> {
        let line = self
            .next_line()?
            .ok_or_else(|| self.parse_err("missing header"))?;
        let rest = line
            .strip_prefix('#')
            .ok_or_else(|| self.parse_err("header must start with '#'"))?;
        rest.trim()
            .parse()
            .map_err(|_| self.parse_err("header is not a number"))
    }

    fn two_ids(&self, line: &str) -> Result<(u64, u64), LoadError> {
        let mut it = line.split_whitespace();
        let a = it
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| self.parse_err("expected two integers"))?;
        let b = it
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| self.parse_err("expected two integers"))?;
        Ok((a, b))
    }
}

pub fn load_file(shard: &Shard, format: GraphFormat, path: &Path) -> Result<LoadStats, LoadError> {
    let file = File::open(path)?;
    let mut parser = Parser {
        lines: BufReader::new(file).lines(),
        line_no: 0,
    };
    let mut loader = Loader {
        shard,
        zero: VectorClock::zero(shard.config.num_vts as usize),
        bindings: Vec::new(),
        stats: LoadStats::default(),
    };

    match format {
        GraphFormat::Snap => load_snap(&mut parser, &mut loader)?,
        GraphFormat::Weaver => load_weaver(&mut parser, &mut loader)?,
    }

    loader.flush_bindings();
    info!(shard.log, "graph file loaded";
          "nodes" => loader.stats.nodes, "edges" => loader.stats.edges);
    Ok(loader.stats)
}

struct Loader<'a> {
    shard: &'a Shard,
    zero: VectorClock,
    bindings: Vec<(String, u64)>,
    stats: LoadStats,
}

impl<'a> Loader<'a> {
    fn place(&self, id: u64) -> ServerId {
        self.shard
            .config
            .shard_at((id % self.shard.config.num_shards) as usize)
    }

    /// Create a local node unless an earlier line already did.
    fn ensure_node(&mut self, id: u64) {
        let handle = NodeHandle(id.to_string());
        if self
            .shard
            .graph
            .create_node(&handle, &self.zero, &self.shard.oracle)
            .is_ok()
        {
            self.stats.nodes += 1;
            self.bindings.push((handle.0, self.shard.id.0));
            if self.bindings.len() >= NAMEMAP_BATCH {
                self.flush_bindings();
            }
        }
    }

    fn add_edge(&mut self, src: u64, edge_id: u64, dst: u64, dst_loc: ServerId) {
        let src_handle = NodeHandle(src.to_string());
        let nbr = RemoteNode::new(dst_loc, NodeHandle(dst.to_string()));
        let added = self.shard.graph.with_node(&src_handle, |n| {
            n.add_edge(
                edge_id.to_string().into(),
                self.zero.clone(),
                nbr.clone(),
            );
        });
        assert!(added.is_some(), "edge source {} must be resident", src);
        self.shard.graph.index_edge(&nbr.handle, &src_handle);
        self.stats.edges += 1;
    }

    fn flush_bindings(&mut self) {
        if self.bindings.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.bindings, Vec::new());
        if let Err(e) = self.shard.namemap.put_all(&batch) {
            error!(self.shard.log, "namemap bulk put failed"; "error" => ?e);
        }
    }
}

fn load_snap<R: BufRead>(parser: &mut Parser<R>, loader: &mut Loader) -> Result<(), LoadError> {
    let max_node_id = parser.header()?;
    let mut edge_count = 0u64;

    while let Some(line) = parser.next_line()? {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (src, dst) = parser.two_ids(&line)?;
        edge_count += 1;
        let edge_id = max_node_id + edge_count;
        let src_loc = loader.place(src);
        let dst_loc = loader.place(dst);

        if src_loc == loader.shard.id {
            loader.ensure_node(src);
            loader.add_edge(src, edge_id, dst, dst_loc);
        }
        if dst_loc == loader.shard.id {
            loader.ensure_node(dst);
        }
    }
    Ok(())
}

fn load_weaver<R: BufRead>(parser: &mut Parser<R>, loader: &mut Loader) -> Result<(), LoadError> {
    let num_nodes = parser.header()?;
    let mut placements: FnvHashMap<u64, ServerId> = FnvHashMap::default();

    for _ in 0..num_nodes {
        let line = parser
            .next_line()?
            .ok_or_else(|| parser.parse_err("fewer node lines than the header promises"))?;
        let (node, offset) = parser.two_ids(&line)?;
        if offset >= loader.shard.config.num_shards {
            return Err(parser.parse_err("shard offset out of range"));
        }
        let loc = loader.shard.config.shard_at(offset as usize);
        placements.insert(node, loc);
        if loc == loader.shard.id {
            loader.ensure_node(node);
        }
    }

    let mut edge_count = 0u64;
    while let Some(line) = parser.next_line()? {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (src, dst) = parser.two_ids(&line)?;
        edge_count += 1;
        let edge_id = num_nodes + edge_count;
        let src_loc = *placements
            .get(&src)
            .ok_or_else(|| parser.parse_err("edge references an unplaced node"))?;
        let dst_loc = *placements
            .get(&dst)
            .ok_or_else(|| parser.parse_err("edge references an unplaced node"))?;
        if src_loc == loader.shard.id {
            loader.add_edge(src, edge_id, dst, dst_loc);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::test_support;
    use std::io::Write;
    use weaver_services::NameMap;

    #[test]
    fn snap_keeps_nodes_placed_by_modulus() {
        // this shard is index 0 of 2: even ids are local
        let t = test_support::shard(1, 2);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# 10").unwrap();
        writeln!(f, "0 1").unwrap();
        writeln!(f, "2 0").unwrap();
        writeln!(f, "1 3").unwrap();
        f.flush().unwrap();

        let stats = load_file(&t.shard, GraphFormat::Snap, f.path()).unwrap();
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.edges, 2);
        assert_eq!(t.shard.graph.len(), 2);

        assert_eq!(t.namemap.get("0").unwrap(), Some(t.shard.id.0));
        assert_eq!(t.namemap.get("2").unwrap(), Some(t.shard.id.0));
        // odd ids belong to the other shard's load pass
        assert_eq!(t.namemap.get("1").unwrap(), None);

        let out = t
            .shard
            .graph
            .with_node(&"0".into(), |n| {
                let e = n.out_edges.values().next().unwrap();
                (n.out_edges.len(), e.nbr.clone())
            })
            .unwrap();
        assert_eq!(out.0, 1);
        assert_eq!(out.1.handle, NodeHandle::from("1"));
        assert_eq!(out.1.loc, t.shard.config.shard_at(1));
    }

    #[test]
    fn weaver_format_places_explicitly() {
        let t = test_support::shard(1, 2);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# 2").unwrap();
        writeln!(f, "5 0").unwrap();
        writeln!(f, "6 1").unwrap();
        writeln!(f, "5 6").unwrap();
        writeln!(f, "6 5").unwrap();
        f.flush().unwrap();

        let stats = load_file(&t.shard, GraphFormat::Weaver, f.path()).unwrap();
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.edges, 1);
        let nbr_loc = t
            .shard
            .graph
            .with_node(&"5".into(), |n| n.out_edges.values().next().unwrap().nbr.loc)
            .unwrap();
        assert_eq!(nbr_loc, t.shard.config.shard_at(1));
    }

    #[test]
    fn missing_header_is_rejected() {
        let t = test_support::shard(1, 1);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "0 1").unwrap();
        f.flush().unwrap();
        match load_file(&t.shard, GraphFormat::Snap, f.path()) {
            Err(LoadError::Parse { line: 1, .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("snap".parse::<GraphFormat>().unwrap(), GraphFormat::Snap);
        assert_eq!(
            "weaver".parse::<GraphFormat>().unwrap(),
            GraphFormat::Weaver
        );
        assert!("tsv".parse::<GraphFormat>().is_err());
    }
}
