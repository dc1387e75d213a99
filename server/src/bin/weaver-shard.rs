#[macro_use]
extern crate slog;

use std::path::Path;
use std::process::exit;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{App, Arg};
use slog::{Drain, Logger};
use slog_term::term_full;

use weaver::config::Config;
use weaver::data::ServerId;
use weaver::message::Message;
use weaver_channel::TcpTransport;
use weaver_services::{LocalKronos, LocalNameMap};

use weaver_server::loader::{self, GraphFormat};
use weaver_server::Shard;

fn main() {
    let matches = App::new("weaver-shard")
        .version("0.1.0")
        .about("One Weaver graph shard.")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .required(true)
                .help("Deployment config (JSON)."),
        )
        .arg(
            Arg::with_name("id")
                .short("i")
                .long("id")
                .takes_value(true)
                .required(true)
                .help("This shard's server id."),
        )
        .arg(
            Arg::with_name("graph_format")
                .long("graph-format")
                .takes_value(true)
                .requires("graph_file")
                .help("Bulk-load format: snap or weaver."),
        )
        .arg(
            Arg::with_name("graph_file")
                .long("graph-file")
                .takes_value(true)
                .requires("graph_format")
                .help("Graph file to bulk load at startup."),
        )
        .get_matches_safe()
        .unwrap_or_else(|e| {
            eprintln!("{}", e.message);
            exit(-1);
        });

    let log = Logger::root(Mutex::new(term_full()).fuse(), o!());

    let config = match Config::from_file(matches.value_of("config").unwrap()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            crit!(log, "config error"; "error" => %e);
            exit(-1);
        }
    };
    let id = match matches.value_of("id").unwrap().parse::<u64>() {
        Ok(id) if config.is_shard(ServerId(id)) => ServerId(id),
        _ => {
            crit!(log, "id is not a shard id in this config");
            exit(-1);
        }
    };

    let addrs = match config.socket_addrs() {
        Ok(a) => a,
        Err(e) => {
            crit!(log, "config error"; "error" => %e);
            exit(-1);
        }
    };
    let listen = addrs[&id.0];
    let transport = match TcpTransport::<Message>::bind(
        id.0,
        listen,
        addrs,
        Duration::from_secs(10),
    ) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            crit!(log, "cannot bind"; "addr" => %listen, "error" => %e);
            exit(-1);
        }
    };

    // external-service stand-ins; remote clients plug in at these seams
    let namemap = Arc::new(LocalNameMap::new());
    let kronos = Arc::new(LocalKronos::new());

    let shard = Shard::new(config.clone(), transport, namemap, kronos, log.clone());

    if let Some(format) = matches.value_of("graph_format") {
        let format: GraphFormat = match format.parse() {
            Ok(f) => f,
            Err(e) => {
                crit!(log, "bad graph format"; "error" => e);
                exit(-1);
            }
        };
        let path = Path::new(matches.value_of("graph_file").unwrap());
        let start = Instant::now();
        match loader::load_file(&shard, format, path) {
            Ok(stats) => {
                let elapsed = start.elapsed().as_millis() as u64;
                info!(log, "bulk load done";
                      "nodes" => stats.nodes, "edges" => stats.edges, "ms" => elapsed);
                let _ = shard.send(
                    config.shard_at(0),
                    Message::LoadedGraph {
                        load_time_ms: elapsed,
                    },
                );
            }
            Err(e) => {
                crit!(log, "bulk load failed"; "error" => %e);
                exit(-1);
            }
        }
    }

    shard.run();
}
