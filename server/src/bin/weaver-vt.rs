#[macro_use]
extern crate slog;

use std::process::exit;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{App, Arg};
use slog::{Drain, Logger};
use slog_term::term_full;

use weaver::config::Config;
use weaver::message::Message;
use weaver_channel::TcpTransport;
use weaver_services::LocalNameMap;

use weaver_server::Timestamper;

fn main() {
    let matches = App::new("weaver-vt")
        .version("0.1.0")
        .about("One Weaver vector timestamper.")
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
                .help("This VT's id (0..num_vts)."),
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
        Ok(id) if id < config.num_vts => id,
        _ => {
            crit!(log, "id is not a vt id in this config");
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
    let listen = addrs[&id];
    let transport =
        match TcpTransport::<Message>::bind(id, listen, addrs, Duration::from_secs(10)) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                crit!(log, "cannot bind"; "addr" => %listen, "error" => %e);
                exit(-1);
            }
        };

    // external-service stand-in; a remote client plugs in at this seam
    let namemap = Arc::new(LocalNameMap::new());

    let vt = Timestamper::new(config, transport, namemap, log);
    vt.run();
}
