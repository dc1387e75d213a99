//! Message transport between Weaver servers.
//!
//! All inter-server traffic goes through the [`Transport`] trait: a message
//! addressed to a server id either arrives intact or the sender learns that
//! the attempt timed out or the connection was disrupted. Two
//! implementations are provided: [`Mesh`] endpoints for wiring a whole
//! deployment inside one process (tests, benchmarks), and [`TcpTransport`]
//! for real deployments, built on the framing in [`tcp`].

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod tcp;

pub use crate::tcp::{TcpReceiver, TcpSender};

/// A transport send that did not succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendError {
    /// The peer did not take the message within the deadline; the
    /// connection may still be usable.
    Timeout,
    /// The connection is gone and could not be re-established.
    Disrupted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvError {
    /// No message arrived within the deadline.
    Timeout,
    /// All senders are gone.
    Disconnected,
}

/// A received message together with the id of the server that sent it.
#[derive(Debug, PartialEq)]
pub struct Envelope<T> {
    pub from: u64,
    pub msg: T,
}

/// Point-to-point messaging between servers identified by u64 ids.
pub trait Transport<T>: Send + Sync {
    fn local_id(&self) -> u64;

    fn send(&self, to: u64, msg: T) -> Result<(), SendError>;

    /// Blocks until a message arrives.
    fn recv(&self) -> Result<Envelope<T>, RecvError>;

    fn recv_timeout(&self, timeout: Duration) -> Result<Envelope<T>, RecvError>;
}

type MeshRegistry<T> = Mutex<HashMap<u64, mpsc::Sender<Envelope<T>>>>;

/// An in-process deployment: every endpoint can reach every other by id.
pub struct Mesh<T> {
    registry: Arc<MeshRegistry<T>>,
}

impl<T> Clone for Mesh<T> {
    fn clone(&self) -> Self {
        Mesh {
            registry: self.registry.clone(),
        }
    }
}

impl<T: Send> Mesh<T> {
    pub fn new() -> Self {
        Mesh {
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers `id` and returns its endpoint.
    ///
    /// Panics if the id is already taken; ids are assigned by the
    /// deployment config and never overlap.
    pub fn endpoint(&self, id: u64) -> MeshEndpoint<T> {
        let (tx, rx) = mpsc::channel();
        let mut reg = self.registry.lock().unwrap();
        assert!(
            reg.insert(id, tx).is_none(),
            "server id {} registered twice",
            id
        );
        MeshEndpoint {
            id,
            registry: self.registry.clone(),
            incoming: Mutex::new(rx),
        }
    }
}

impl<T: Send> Default for Mesh<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MeshEndpoint<T> {
    id: u64,
    registry: Arc<MeshRegistry<T>>,
    incoming: Mutex<mpsc::Receiver<Envelope<T>>>,
}

impl<T: Send> Transport<T> for MeshEndpoint<T> {
    fn local_id(&self) -> u64 {
        self.id
    }

    fn send(&self, to: u64, msg: T) -> Result<(), SendError> {
        let tx = {
            let reg = self.registry.lock().unwrap();
            match reg.get(&to) {
                Some(tx) => tx.clone(),
                None => return Err(SendError::Disrupted),
            }
        };
        tx.send(Envelope { from: self.id, msg })
            .map_err(|_| SendError::Disrupted)
    }

    fn recv(&self) -> Result<Envelope<T>, RecvError> {
        let rx = self.incoming.lock().unwrap();
        rx.recv().map_err(|_| RecvError::Disconnected)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Envelope<T>, RecvError> {
        let rx = self.incoming.lock().unwrap();
        rx.recv_timeout(timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => RecvError::Timeout,
            mpsc::RecvTimeoutError::Disconnected => RecvError::Disconnected,
        })
    }
}

type PeerMap<T> = Mutex<HashMap<u64, Arc<Mutex<TcpSender<T>>>>>;

/// TCP transport for one server.
///
/// Connections are established lazily by whichever side sends first and are
/// bidirectional: the accepting side keeps the write half of an accepted
/// socket so replies to the peer (clients included) reuse the connection.
pub struct TcpTransport<T> {
    id: u64,
    listen_addr: SocketAddr,
    addrs: HashMap<u64, SocketAddr>,
    peers: Arc<PeerMap<T>>,
    incoming: Mutex<mpsc::Receiver<Envelope<T>>>,
    incoming_tx: mpsc::Sender<Envelope<T>>,
    io_timeout: Duration,
}

impl<T> TcpTransport<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Binds `listen` and starts accepting peer connections.
    ///
    /// `addrs` lists the servers this one may initiate connections to;
    /// peers not listed (clients) can still connect in and be replied to.
    pub fn bind(
        id: u64,
        listen: SocketAddr,
        addrs: HashMap<u64, SocketAddr>,
        io_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(listen)?;
        let listen_addr = listener.local_addr()?;
        let (incoming_tx, incoming_rx) = mpsc::channel();
        let peers: Arc<PeerMap<T>> = Arc::new(Mutex::new(HashMap::new()));

        {
            let peers = peers.clone();
            let incoming_tx = incoming_tx.clone();
            thread::Builder::new()
                .name(format!("accept-{}", id))
                .spawn(move || {
                    for stream in listener.incoming() {
                        let mut stream = match stream {
                            Ok(s) => s,
                            Err(_) => continue,
                        };
                        let peer_id = match tcp::read_handshake(&mut stream) {
                            Ok(pid) => pid,
                            Err(_) => continue,
                        };
                        let _ = stream.set_nodelay(true);
                        if let Ok(write_half) = stream.try_clone() {
                            let mut reg = peers.lock().unwrap();
                            reg.insert(peer_id, Arc::new(Mutex::new(TcpSender::new(write_half))));
                        }
                        Self::spawn_reader(peer_id, stream, incoming_tx.clone());
                    }
                })
                .expect("spawning acceptor");
        }

        Ok(TcpTransport {
            id,
            listen_addr,
            addrs,
            peers,
            incoming: Mutex::new(incoming_rx),
            incoming_tx,
            io_timeout,
        })
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    fn spawn_reader(peer_id: u64, stream: TcpStream, tx: mpsc::Sender<Envelope<T>>) {
        thread::Builder::new()
            .name(format!("recv-{}", peer_id))
            .spawn(move || {
                let mut receiver = TcpReceiver::<T>::new(stream);
                while let Ok(msg) = receiver.recv() {
                    if tx.send(Envelope { from: peer_id, msg }).is_err() {
                        break;
                    }
                }
            })
            .expect("spawning reader");
    }

    fn connect(&self, to: u64) -> Result<Arc<Mutex<TcpSender<T>>>, SendError> {
        let addr = match self.addrs.get(&to) {
            Some(addr) => *addr,
            None => return Err(SendError::Disrupted),
        };
        let mut stream = TcpStream::connect_timeout(&addr, self.io_timeout)
            .map_err(|_| SendError::Disrupted)?;
        let _ = stream.set_nodelay(true);
        stream
            .set_write_timeout(Some(self.io_timeout))
            .map_err(|_| SendError::Disrupted)?;
        tcp::write_handshake(&mut stream, self.id).map_err(|_| SendError::Disrupted)?;
        let read_half = stream.try_clone().map_err(|_| SendError::Disrupted)?;
        Self::spawn_reader(to, read_half, self.incoming_tx.clone());

        let sender = Arc::new(Mutex::new(TcpSender::new(stream)));
        self.peers.lock().unwrap().insert(to, sender.clone());
        Ok(sender)
    }

    fn try_send(&self, to: u64, msg: &T) -> Result<(), SendError> {
        let existing = {
            let reg = self.peers.lock().unwrap();
            reg.get(&to).cloned()
        };
        let sender = match existing {
            Some(s) => s,
            None => self.connect(to)?,
        };
        let mut guard = sender.lock().unwrap();
        guard.send(msg).map_err(|e| {
            if e.is_timeout() {
                SendError::Timeout
            } else {
                SendError::Disrupted
            }
        })
    }
}

impl<T> Transport<T> for TcpTransport<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn local_id(&self) -> u64 {
        self.id
    }

    fn send(&self, to: u64, msg: T) -> Result<(), SendError> {
        match self.try_send(to, &msg) {
            Ok(()) => Ok(()),
            Err(SendError::Timeout) => Err(SendError::Timeout),
            Err(SendError::Disrupted) => {
                // stale connection; reconnect once before giving up
                self.peers.lock().unwrap().remove(&to);
                self.try_send(to, &msg)
            }
        }
    }

    fn recv(&self) -> Result<Envelope<T>, RecvError> {
        let rx = self.incoming.lock().unwrap();
        rx.recv().map_err(|_| RecvError::Disconnected)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Envelope<T>, RecvError> {
        let rx = self.incoming.lock().unwrap();
        rx.recv_timeout(timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => RecvError::Timeout,
            mpsc::RecvTimeoutError::Disconnected => RecvError::Disconnected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_routes_by_id() {
        let mesh = Mesh::<String>::new();
        let a = mesh.endpoint(0);
        let b = mesh.endpoint(1);

        a.send(1, "hi".to_owned()).unwrap();
        let env = b.recv().unwrap();
        assert_eq!(env.from, 0);
        assert_eq!(env.msg, "hi");

        assert_eq!(a.send(7, "nobody".to_owned()), Err(SendError::Disrupted));
    }

    #[test]
    fn mesh_recv_times_out() {
        let mesh = Mesh::<u32>::new();
        let a = mesh.endpoint(0);
        assert_eq!(
            a.recv_timeout(Duration::from_millis(10)),
            Err(RecvError::Timeout)
        );
    }

    #[test]
    fn tcp_round_trip_and_reply() {
        let timeout = Duration::from_secs(5);
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let b = TcpTransport::<u64>::bind(11, any, HashMap::new(), timeout).unwrap();
        let mut addrs_a = HashMap::new();
        addrs_a.insert(11, b.local_addr());
        let a = TcpTransport::<u64>::bind(10, any, addrs_a, timeout).unwrap();

        a.send(11, 99).unwrap();
        let env = b.recv().unwrap();
        assert_eq!((env.from, env.msg), (10, 99));

        // b never learned a's address; the reply rides the same socket
        b.send(10, 100).unwrap();
        let env = a.recv().unwrap();
        assert_eq!((env.from, env.msg), (11, 100));
    }
}
