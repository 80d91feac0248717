//! Listening socket: bind, accept, and hand new peers to the registry.

use crate::runtime::connection::{Connection, ConnectionRegistry, Peer};
use crate::runtime::StartupError;
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Result of one accept attempt.
#[derive(Debug)]
pub enum Accept {
    /// A new client was registered under this token.
    Registered(Token),
    /// A client was accepted but closed straight away (registry full).
    Rejected(SocketAddr),
    /// No more pending connections.
    Drained,
    /// `accept` itself failed.
    Failed(io::Error),
}

pub struct Listener {
    inner: TcpListener,
    #[cfg(test)]
    fail_next: std::cell::Cell<Option<i32>>,
}

impl Listener {
    /// Bind to `addr` with SO_REUSEADDR and start listening.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self, StartupError> {
        let listener = create_listener(addr, backlog)?;
        Ok(Self {
            inner: TcpListener::from_std(listener),
            #[cfg(test)]
            fail_next: std::cell::Cell::new(None),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Watch the listening socket under `token`.
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.inner, token, Interest::READABLE)
    }

    /// Re-register so that connections still queued are reported again.
    ///
    /// Readiness is edge-triggered: once accepting stops short of
    /// `WouldBlock`, the backlog is not signalled until a new connect arrives.
    pub fn rearm(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.reregister(&mut self.inner, token, Interest::READABLE)
    }

    /// Make the next `accept` fail with `errno` without touching the backlog.
    #[cfg(test)]
    pub fn fail_next_accept(&self, errno: i32) {
        self.fail_next.set(Some(errno));
    }

    /// Accept one pending connection and register it.
    pub fn accept(
        &self,
        connections: &mut ConnectionRegistry<Connection>,
        poll: &Registry,
    ) -> Accept {
        #[cfg(test)]
        if let Some(errno) = self.fail_next.take() {
            return Accept::Failed(io::Error::from_raw_os_error(errno));
        }

        let (stream, peer_addr) = match self.inner.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Accept::Drained,
            Err(e) => return Accept::Failed(e),
        };

        let token = match connections.add(Connection::new(stream, peer_addr)) {
            Ok(token) => token,
            Err(rejected) => {
                warn!(peer = %peer_addr, error = %rejected, "Rejecting connection");
                drop(rejected.peer);
                return Accept::Rejected(peer_addr);
            }
        };

        // Re-borrow after insert
        let Some(conn) = connections.get_mut(token) else {
            return Accept::Rejected(peer_addr);
        };
        if let Err(e) = conn.register(poll, token) {
            warn!(peer = %peer_addr, error = %e, "Failed to watch connection");
            connections.remove(token);
            return Accept::Rejected(peer_addr);
        }

        info!(conn_id = token.0, peer = %conn.peer_addr(), "Accepted connection");
        Accept::Registered(token)
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener, StartupError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(|e| StartupError::Bind(addr, e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| StartupError::Bind(addr, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| StartupError::Bind(addr, e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| StartupError::Bind(addr, e))?;
    socket
        .listen(backlog.min(i32::MAX as u32) as i32)
        .map_err(|e| StartupError::Listen(addr, e))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn accept_until_ready(
        listener: &Listener,
        connections: &mut ConnectionRegistry<Connection>,
        poll: &Poll,
    ) -> Accept {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match listener.accept(connections, poll.registry()) {
                Accept::Drained if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                other => return other,
            }
        }
    }

    #[test]
    fn test_accept_registers_connection() {
        let poll = Poll::new().unwrap();
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut connections = ConnectionRegistry::new(4);

        assert!(matches!(
            listener.accept(&mut connections, poll.registry()),
            Accept::Drained
        ));

        let client = TcpStream::connect(addr).unwrap();
        let token = match accept_until_ready(&listener, &mut connections, &poll) {
            Accept::Registered(token) => token,
            other => panic!("unexpected accept result: {other:?}"),
        };
        assert!(connections.contains(token));
        let conn = connections.get_mut(token).unwrap();
        assert_eq!(conn.peer_addr(), client.local_addr().unwrap());
    }

    #[test]
    fn test_accept_beyond_capacity_is_rejected() {
        let poll = Poll::new().unwrap();
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut connections = ConnectionRegistry::new(1);

        let _first = TcpStream::connect(addr).unwrap();
        let first = accept_until_ready(&listener, &mut connections, &poll);
        assert!(matches!(first, Accept::Registered(_)));

        let _second = TcpStream::connect(addr).unwrap();
        let second = accept_until_ready(&listener, &mut connections, &poll);
        assert!(matches!(second, Accept::Rejected(_)));
        assert_eq!(connections.len(), 1);
    }

    #[test]
    fn test_rearm_reports_queued_connection_again() {
        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(8);
        let mut listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        listener.register(poll.registry(), Token(0)).unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|event| event.token() == Token(0)));

        // Left in the backlog: no new edge, no new event
        poll.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
        assert!(events.is_empty());

        listener.rearm(poll.registry(), Token(0)).unwrap();
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|event| event.token() == Token(0)));
    }

    #[test]
    fn test_injected_accept_failure_leaves_backlog() {
        let poll = Poll::new().unwrap();
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut connections = ConnectionRegistry::new(4);

        let _client = TcpStream::connect(addr).unwrap();
        listener.fail_next_accept(libc::EMFILE);
        match listener.accept(&mut connections, poll.registry()) {
            Accept::Failed(e) => assert_eq!(e.raw_os_error(), Some(libc::EMFILE)),
            other => panic!("unexpected accept result: {other:?}"),
        }
        assert!(connections.is_empty());

        let accepted = accept_until_ready(&listener, &mut connections, &poll);
        assert!(matches!(accepted, Accept::Registered(_)));
    }

    #[test]
    fn test_bind_conflict_is_fatal_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let result = Listener::bind(addr, 16);
        assert!(matches!(result, Err(StartupError::Bind(a, _)) if a == addr));
    }
}
