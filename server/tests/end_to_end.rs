//! Whole-deployment tests: VTs, shards, and clients wired through an
//! in-process mesh with local service stand-ins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use slog::{o, Discard, Logger};

use weaver::client::{Client, TxOutcome};
use weaver::config::{Config, MigrationPolicy};
use weaver::message::Message;
use weaver_channel::{Mesh, Transport};
use weaver_services::{LocalKronos, LocalNameMap, NameMap};

use weaver_server::{Shard, Timestamper};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(2000);

fn test_config(num_vts: u64, num_shards: u64) -> Config {
    Config {
        num_vts,
        num_shards,
        max_cache_entries: 128,
        num_threads: 4,
        nop_interval_ms: 10,
        capacity: 1000,
        migration_policy: MigrationPolicy::Ldg,
        vts: (0..num_vts).map(|i| format!("127.0.0.1:{}", 6200 + i)).collect(),
        shards: (0..num_shards)
            .map(|i| format!("127.0.0.1:{}", 6300 + i))
            .collect(),
        kv: "127.0.0.1:1982".into(),
        kronos: "127.0.0.1:1992".into(),
        server_mgr: "127.0.0.1:2002".into(),
    }
}

struct Cluster {
    config: Arc<Config>,
    mesh: Mesh<Message>,
    namemap: Arc<LocalNameMap>,
    kronos: Arc<LocalKronos>,
    servers: Vec<thread::JoinHandle<()>>,
}

impl Cluster {
    fn start(num_vts: u64, num_shards: u64) -> Cluster {
        let config = Arc::new(test_config(num_vts, num_shards));
        let mesh = Mesh::<Message>::new();
        let namemap = Arc::new(LocalNameMap::new());
        let kronos = Arc::new(LocalKronos::new());
        let log = Logger::root(Discard, o!());

        let mut servers = Vec::new();
        for vt_id in 0..num_vts {
            let transport: Arc<dyn Transport<Message>> = Arc::new(mesh.endpoint(vt_id));
            let vt_namemap: Arc<dyn NameMap> = namemap.clone();
            let vt = Timestamper::new(config.clone(), transport, vt_namemap, log.clone());
            servers.push(
                thread::Builder::new()
                    .name(format!("vt-{}", vt_id))
                    .spawn(move || vt.run())
                    .unwrap(),
            );
        }
        for shard_id in config.shard_ids() {
            let transport: Arc<dyn Transport<Message>> = Arc::new(mesh.endpoint(shard_id.0));
            let shard_namemap: Arc<dyn NameMap> = namemap.clone();
            let shard = Shard::new(
                config.clone(),
                transport,
                shard_namemap,
                kronos.clone(),
                log.clone(),
            );
            servers.push(
                thread::Builder::new()
                    .name(format!("shard-{}", shard_id))
                    .spawn(move || shard.run())
                    .unwrap(),
            );
        }

        Cluster {
            config,
            mesh,
            namemap,
            kronos,
            servers,
        }
    }

    fn client_on(&self, vt_id: u64) -> Client {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
        let transport: Arc<dyn Transport<Message>> = Arc::new(self.mesh.endpoint(id));
        Client::with_vt(transport, vt_id)
    }

    fn client(&self) -> Client {
        self.client_on(0)
    }

    fn shutdown(self) {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
        let killer = self.mesh.endpoint(id);
        for vt_id in 0..self.config.num_vts {
            let _ = killer.send(vt_id, Message::ExitWeaver);
        }
        for h in self.servers {
            h.join().unwrap();
        }
    }
}

#[test]
fn single_shard_tx_then_read() {
    let cluster = Cluster::start(1, 1);
    let mut c = cluster.client();

    c.begin_tx();
    let a = c.create_node(Some("a"));
    let b = c.create_node(Some("b"));
    c.create_edge(Some("e"), &a, &b);
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Committed);

    assert_eq!(c.read_n_edges(&a).unwrap(), 1);
    assert_eq!(c.read_n_edges(&b).unwrap(), 0);

    cluster.shutdown();
}

#[test]
fn cross_shard_edge() {
    let cluster = Cluster::start(1, 2);
    let mut c = cluster.client();

    // numeric handles place like the loader: "0" → first shard, "1" → second
    c.begin_tx();
    let a = c.create_node(Some("0"));
    let b = c.create_node(Some("1"));
    c.create_edge(Some("e"), &a, &b);
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Committed);

    assert_eq!(cluster.namemap.get("0").unwrap(), Some(1));
    assert_eq!(cluster.namemap.get("1").unwrap(), Some(2));

    assert_eq!(c.read_n_edges(&a).unwrap(), 1);
    assert_eq!(c.read_n_edges(&b).unwrap(), 0);

    // the walk crosses shards and the negative case unwinds
    assert!(c.reach(&a, &b, vec![]).unwrap());
    assert!(!c.reach(&b, &a, vec![]).unwrap());

    cluster.shutdown();
}

#[test]
fn tx_with_properties_round_trips() {
    let cluster = Cluster::start(1, 1);
    let mut c = cluster.client();

    c.begin_tx();
    let h = c.create_node(Some("h"));
    let hp = c.create_node(Some("hp"));
    c.create_edge(Some("e"), &h, &hp);
    c.set_node_property(&h, "K", "V");
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Committed);

    let props = c.read_node_props(&h, vec![]).unwrap();
    assert_eq!(props, vec![("K".to_owned(), "V".to_owned())]);

    cluster.shutdown();
}

#[test]
fn delete_tombstones_are_visible_to_later_reads_only() {
    let cluster = Cluster::start(1, 1);
    let mut c = cluster.client();

    c.begin_tx();
    let a = c.create_node(Some("a"));
    c.set_node_property(&a, "alive", "yes");
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Committed);

    // read before the delete sees the node
    let props = c.read_node_props(&a, vec![]).unwrap();
    assert_eq!(props.len(), 1);
    assert_eq!(c.read_n_edges(&a).unwrap(), 0);

    c.begin_tx();
    c.delete_node(&a);
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Committed);

    // reads after the delete observe nothing
    assert!(c.read_node_props(&a, vec![]).unwrap().is_empty());

    // a second delete is a user error and aborts
    c.begin_tx();
    c.delete_node(&a);
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Aborted);

    cluster.shutdown();
}

#[test]
fn duplicate_create_aborts() {
    let cluster = Cluster::start(1, 1);
    let mut c = cluster.client();

    c.begin_tx();
    c.create_node(Some("dup"));
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Committed);

    c.begin_tx();
    c.create_node(Some("dup"));
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Aborted);

    cluster.shutdown();
}

#[test]
fn global_edge_count_spans_shards() {
    let cluster = Cluster::start(1, 2);
    let mut c = cluster.client();

    c.begin_tx();
    let n0 = c.create_node(Some("0"));
    let n1 = c.create_node(Some("1"));
    let n2 = c.create_node(Some("2"));
    c.create_edge(Some("e1"), &n0, &n1);
    c.create_edge(Some("e2"), &n1, &n2);
    c.create_edge(Some("e3"), &n1, &n0);
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Committed);

    assert_eq!(c.edge_count().unwrap(), 3);

    cluster.shutdown();
}

#[test]
fn node_counts_flow_back_through_nops() {
    let cluster = Cluster::start(1, 2);
    let mut c = cluster.client();

    c.begin_tx();
    c.create_node(Some("0"));
    c.create_node(Some("1"));
    c.create_node(Some("2"));
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Committed);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let counts = c.node_count().unwrap();
        if counts.iter().sum::<u64>() == 3 {
            assert_eq!(counts.len(), 2);
            break;
        }
        assert!(Instant::now() < deadline, "counts never converged: {:?}", counts);
        thread::sleep(Duration::from_millis(20));
    }

    cluster.shutdown();
}

#[test]
fn migration_moves_connected_nodes_without_losing_reads() {
    let cluster = Cluster::start(1, 2);
    let mut c = cluster.client();

    // all of a's neighbors land on the second shard, so LDG must move "0"
    c.begin_tx();
    let a = c.create_node(Some("0"));
    let b = c.create_node(Some("1"));
    let d = c.create_node(Some("3"));
    c.create_edge(Some("ab"), &a, &b);
    c.create_edge(Some("ad"), &a, &d);
    assert_eq!(c.end_tx().unwrap(), TxOutcome::Committed);

    assert_eq!(cluster.namemap.get("0").unwrap(), Some(1));
    assert_eq!(c.read_n_edges(&a).unwrap(), 2);

    // reads hammer the node while the token makes its pass
    let reader_cluster_mesh = cluster.mesh.clone();
    let stop = Arc::new(AtomicU64::new(0));
    let reader_stop = stop.clone();
    let reader = thread::spawn(move || {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
        let transport: Arc<dyn Transport<Message>> =
            Arc::new(reader_cluster_mesh.endpoint(id));
        let mut rc = Client::with_vt(transport, 0);
        rc.set_timeout(Duration::from_secs(2));
        let mut reads = 0u64;
        while reader_stop.load(Ordering::SeqCst) == 0 {
            assert_eq!(rc.read_n_edges(&"0".into()).unwrap(), 2);
            reads += 1;
        }
        reads
    });

    c.single_stream_migration().unwrap();
    stop.store(1, Ordering::SeqCst);
    let reads = reader.join().unwrap();
    assert!(reads > 0);

    // the connected node ended up with its neighbors and nothing was lost
    assert_eq!(cluster.namemap.get("0").unwrap(), Some(2));
    assert_eq!(c.read_n_edges(&a).unwrap(), 2);
    assert_eq!(c.read_n_edges(&b).unwrap(), 0);
    assert_eq!(c.read_n_edges(&d).unwrap(), 0);
    assert!(c.reach(&a, &d, vec![]).unwrap());

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let counts = c.node_count().unwrap();
        if counts.iter().sum::<u64>() == 3 {
            break;
        }
        assert!(Instant::now() < deadline, "a node was lost: {:?}", counts);
        thread::sleep(Duration::from_millis(20));
    }

    cluster.shutdown();
}

#[test]
fn concurrent_delete_and_set_property_resolve_through_kronos() {
    let cluster = Cluster::start(2, 1);
    let mut ca = cluster.client_on(0);
    let mut cb = cluster.client_on(1);

    ca.begin_tx();
    let h = ca.create_node(Some("h"));
    assert_eq!(ca.end_tx().unwrap(), TxOutcome::Committed);

    // pad vt0's clock so its delete orders after vt1's write under the
    // oracle's counter ordering
    for i in 0..3 {
        ca.begin_tx();
        ca.create_node(Some(&format!("pad{}", i)));
        assert_eq!(ca.end_tx().unwrap(), TxOutcome::Committed);
    }

    ca.begin_tx();
    ca.delete_node(&h);
    assert_eq!(ca.end_tx().unwrap(), TxOutcome::Committed);

    // concurrent with the delete (vt1 never observed vt0's clock); Kronos
    // orders the write first, so it lands
    cb.begin_tx();
    cb.set_node_property(&h, "K", "V");
    assert_eq!(cb.end_tx().unwrap(), TxOutcome::Committed);

    // vt1's snapshot predates the delete under the resolved order
    let props = cb.read_node_props(&h, vec![]).unwrap();
    assert_eq!(props, vec![("K".to_owned(), "V".to_owned())]);
    assert!(cluster.kronos.calls() > 0);

    // identical comparisons are answered from the memo
    let calls_before = cluster.kronos.calls();
    let props = cb.read_node_props(&h, vec![]).unwrap();
    assert_eq!(props.len(), 1);
    assert_eq!(cluster.kronos.calls(), calls_before);

    // vt0 has observed its own delete; its readers see the tombstone
    assert!(ca.read_node_props(&h, vec![]).unwrap().is_empty());

    cluster.shutdown();
}
