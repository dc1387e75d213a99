//! Length-prefixed bincode framing over TCP.
//!
//! Every frame is a `u32` network-endian length followed by that many bytes
//! of bincode. A connection starts with an 8 byte handshake carrying the
//! sender's server id so the accepting side can route replies back over the
//! same socket.

use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::mem;
use std::net::TcpStream;

use bufstream::BufStream;
use byteorder::{ByteOrder, NetworkEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug)]
pub enum Error {
    Bincode(bincode::Error),
    Io(io::Error),
    Poisoned,
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Bincode(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// True when the failure was a write/read deadline, not a dead peer.
    pub fn is_timeout(&self) -> bool {
        match *self {
            Error::Io(ref e) => {
                e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut
            }
            Error::Bincode(ref e) => match **e {
                bincode::ErrorKind::Io(ref e) => {
                    e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut
                }
                _ => false,
            },
            Error::Poisoned => false,
        }
    }
}

macro_rules! poisoning_try {
    ( $self_:ident, $e:expr ) => {
        match $e {
            Ok(v) => v,
            Err(r) => {
                $self_.poisoned = true;
                return Err(r.into());
            }
        }
    };
}

/// Writes the sender-id handshake on a fresh stream.
pub fn write_handshake(stream: &mut TcpStream, id: u64) -> io::Result<()> {
    stream.write_u64::<NetworkEndian>(id)
}

/// Reads the sender-id handshake off an accepted stream.
pub fn read_handshake(stream: &mut TcpStream) -> io::Result<u64> {
    stream.read_u64::<NetworkEndian>()
}

pub struct TcpSender<T> {
    stream: BufStream<TcpStream>,
    poisoned: bool,

    phantom: PhantomData<T>,
}

impl<T: Serialize> TcpSender<T> {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufStream::new(stream),
            poisoned: false,
            phantom: PhantomData,
        }
    }

    pub fn send(&mut self, t: &T) -> Result<(), Error> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }

        let size = poisoning_try!(self, bincode::serialized_size(t)) as u32;
        poisoning_try!(self, self.stream.write_u32::<NetworkEndian>(size));
        poisoning_try!(self, bincode::serialize_into(&mut self.stream, t));
        poisoning_try!(self, self.stream.flush());
        Ok(())
    }
}

#[derive(Debug)]
pub enum RecvError {
    Disconnected,
    Deserialization,
}

pub struct TcpReceiver<T> {
    stream: TcpStream,
    poisoned: bool,

    // Frame bytes not yet handed to bincode.
    buffer: Vec<u8>,
    buffer_size: usize,

    phantom: PhantomData<T>,
}

impl<T> TcpReceiver<T>
where
    T: DeserializeOwned,
{
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            poisoned: false,
            buffer: vec![0; 1024],
            buffer_size: 0,
            phantom: PhantomData,
        }
    }

    fn fill_to(&mut self, target: usize) -> Result<(), RecvError> {
        if self.buffer.len() < target {
            self.buffer.resize(target, 0u8);
        }
        while self.buffer_size < target {
            match self.stream.read(&mut self.buffer[self.buffer_size..target]) {
                Ok(0) => return Err(RecvError::Disconnected),
                Ok(n) => self.buffer_size += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(RecvError::Disconnected),
            }
        }
        Ok(())
    }

    /// Blocks for the next full frame.
    pub fn recv(&mut self) -> Result<T, RecvError> {
        if self.poisoned {
            return Err(RecvError::Disconnected);
        }

        self.fill_to(mem::size_of::<u32>())?;
        let message_size = NetworkEndian::read_u32(&self.buffer[0..mem::size_of::<u32>()]);
        let target = message_size as usize + mem::size_of::<u32>();
        self.fill_to(target)?;

        match bincode::deserialize(&self.buffer[mem::size_of::<u32>()..target]) {
            Err(_) => {
                self.poisoned = true;
                Err(RecvError::Deserialization)
            }
            Ok(t) => {
                self.buffer_size = 0;
                Ok(t)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, TcpListener};
    use std::thread;

    fn connect() -> (TcpStream, TcpStream) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();
        let rx = TcpStream::connect(&listener.local_addr().unwrap()).unwrap();
        let tx = listener.accept().unwrap().0;

        (tx, rx)
    }

    #[test]
    fn it_sends() {
        let (tx, rx) = connect();
        let mut sender = TcpSender::<u32>::new(tx);
        let mut receiver = TcpReceiver::<u32>::new(rx);

        sender.send(&12).unwrap();
        assert_eq!(receiver.recv().unwrap(), 12);

        sender.send(&65).unwrap();
        sender.send(&13).unwrap();
        assert_eq!(receiver.recv().unwrap(), 65);
        assert_eq!(receiver.recv().unwrap(), 13);
    }

    #[test]
    fn it_sends_across_threads() {
        let (tx, rx) = connect();
        let mut sender = TcpSender::<Vec<String>>::new(tx);
        let mut receiver = TcpReceiver::<Vec<String>>::new(rx);

        let t1 = thread::spawn(move || {
            sender.send(&vec!["a".to_owned(), "b".to_owned()]).unwrap();
            sender.send(&vec![]).unwrap();
        });

        let t2 = thread::spawn(move || {
            assert_eq!(receiver.recv().unwrap(), vec!["a", "b"]);
            assert_eq!(receiver.recv().unwrap(), Vec::<String>::new());
        });

        t1.join().unwrap();
        t2.join().unwrap();
    }

    #[test]
    fn it_handshakes() {
        let (mut tx, mut rx) = connect();
        write_handshake(&mut tx, 42).unwrap();
        assert_eq!(read_handshake(&mut rx).unwrap(), 42);
    }
}
