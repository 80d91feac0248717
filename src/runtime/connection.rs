//! Client connections and the registry that tracks them.
//!
//! Each accepted socket is a `Connection` addressed by a mio `Token`.
//! The registry owns every live connection and knows the listening token,
//! which is watched for readiness but never read from or written to.

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

/// Token reserved for the listening socket. Client tokens never reach it.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// A byte-stream peer the relay can read from and broadcast to.
///
/// Implemented by `Connection` for real sockets and by in-memory peers in
/// tests. Dropping a peer releases its underlying resource.
pub trait Peer: Read + Write {
    /// Add this peer to the readiness set under `token`.
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;

    /// Remove this peer from the readiness set.
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    /// Block until the peer can accept more bytes (or has failed).
    fn wait_writable(&self) -> io::Result<()>;
}

/// A single accepted client.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    /// Remote address, informational only.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Peer for Connection {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn wait_writable(&self) -> io::Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };

        loop {
            // POLLERR/POLLHUP also wake us; the next write reports the failure.
            let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Returned by `ConnectionRegistry::add` when the registry is full.
///
/// Carries the rejected peer back so the caller can close it.
pub struct CapacityExceeded<P> {
    pub peer: P,
    pub capacity: usize,
}

impl<P> std::fmt::Debug for CapacityExceeded<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityExceeded")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<P> std::fmt::Display for CapacityExceeded<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection limit of {} reached", self.capacity)
    }
}

impl<P> std::error::Error for CapacityExceeded<P> {}

/// Registry of live client connections.
///
/// Tokens come from a monotonically increasing counter, so a token is never
/// handed out twice over the lifetime of one registry. Iteration is in
/// ascending token order.
pub struct ConnectionRegistry<P> {
    connections: BTreeMap<usize, P>,
    next_id: usize,
    max_connections: usize,
}

impl<P> ConnectionRegistry<P> {
    /// Create a new registry holding at most `max_connections` clients.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            next_id: 0,
            max_connections,
        }
    }

    /// Insert a new connection and return its token.
    ///
    /// At capacity the registry is left untouched and the peer is handed back.
    pub fn add(&mut self, peer: P) -> Result<Token, CapacityExceeded<P>> {
        if self.connections.len() >= self.max_connections || self.next_id == LISTENER_TOKEN.0 {
            return Err(CapacityExceeded {
                peer,
                capacity: self.max_connections,
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(id, peer);
        Ok(Token(id))
    }

    /// Remove a connection, returning it for release. No-op if absent.
    pub fn remove(&mut self, token: Token) -> Option<P> {
        self.connections.remove(&token.0)
    }

    /// Check if a client connection is live.
    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains_key(&token.0)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut P> {
        self.connections.get_mut(&token.0)
    }

    /// Every token that must be watched for readiness: clients, then the listener.
    ///
    /// The poller's interest list mirrors this set through register/deregister.
    #[cfg(test)]
    pub fn watched_set(&self) -> Vec<Token> {
        self.connections
            .keys()
            .map(|&id| Token(id))
            .chain(std::iter::once(LISTENER_TOKEN))
            .collect()
    }

    /// All client tokens except `excluding`, in ascending order.
    pub fn others(&self, excluding: Token) -> Vec<Token> {
        self.connections
            .keys()
            .filter(|&&id| id != excluding.0)
            .map(|&id| Token(id))
            .collect()
    }

    /// Number of live client connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of client connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
