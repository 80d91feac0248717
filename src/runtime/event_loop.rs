//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us which sockets are readable, then we
//! accept or relay on each of them in ascending token order.
//!
//! mio reports readiness edge-triggered. A client that yielded a chunk may
//! still have input buffered, so it is carried into the next turn instead of
//! being read again now; every ready client gets one chunk per turn. While
//! anything is carried, the wait does not block.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionRegistry, LISTENER_TOKEN};
use crate::runtime::listener::{Accept, Listener};
use crate::runtime::reaper;
use crate::runtime::relay::{MessageRelay, Relay};
use crate::runtime::StartupError;
use mio::{Events, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, trace};

const EVENTS_CAPACITY: usize = 1024;

/// The relay's single flow of control and all of its mutable state.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: Listener,
    connections: ConnectionRegistry<Connection>,
    relay: MessageRelay,
    ready: Vec<Token>,
    /// Clients that delivered a chunk last turn and have not hit `WouldBlock`.
    carried: Vec<Token>,
}

impl EventLoop {
    /// Bind the listening socket and build an idle loop around it.
    ///
    /// Any error here is fatal: the relay cannot start.
    pub fn bind(config: &Config) -> Result<Self, StartupError> {
        let poll = Poll::new().map_err(StartupError::Poll)?;
        let mut listener = Listener::bind(config.listen, config.backlog)?;
        listener
            .register(poll.registry(), LISTENER_TOKEN)
            .map_err(StartupError::Register)?;

        let relay = MessageRelay::new(config.chunk_size);
        let connections = ConnectionRegistry::new(config.max_connections);

        info!(
            addr = %config.listen,
            backlog = config.backlog,
            max_connections = connections.capacity(),
            chunk_size = relay.chunk_size(),
            "Relay listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            connections,
            relay,
            ready: Vec::with_capacity(EVENTS_CAPACITY),
            carried: Vec::new(),
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run forever. The only way out is terminating the process.
    pub fn run(&mut self) -> ! {
        loop {
            self.turn(None);
        }
    }

    /// One iteration: wait for readiness, then dispatch every ready token once.
    ///
    /// `limit` bounds the wait; `None` blocks until something is ready.
    fn turn(&mut self, limit: Option<Duration>) {
        let timeout = if self.carried.is_empty() {
            limit
        } else {
            Some(Duration::ZERO)
        };

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                error!(error = %e, "Readiness wait failed");
            }
            return;
        }

        self.ready.clear();
        self.ready.extend(self.events.iter().map(|event| event.token()));
        self.ready.append(&mut self.carried);
        self.ready.sort_unstable();
        self.ready.dedup();

        for i in 0..self.ready.len() {
            let token = self.ready[i];
            if token == LISTENER_TOKEN {
                self.accept_pending();
            } else if self.connections.contains(token) {
                self.relay_once(token);
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self
                .listener
                .accept(&mut self.connections, self.poll.registry())
            {
                Accept::Registered(token) => {
                    debug!(
                        conn_id = token.0,
                        clients = self.connections.len(),
                        "Client registered"
                    );
                }
                Accept::Rejected(peer) => {
                    debug!(peer = %peer, "Client closed on accept");
                }
                Accept::Drained => break,
                Accept::Failed(e) => {
                    error!(error = %e, "Accept error");
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) {
                        continue;
                    }
                    // Stopped short of WouldBlock: queued peers need a fresh event.
                    if let Err(e) = self.listener.rearm(self.poll.registry(), LISTENER_TOKEN) {
                        error!(error = %e, "Failed to re-arm listener");
                    }
                    break;
                }
            }
        }
    }

    /// Relay one chunk from `token`, tearing it down on EOF or error.
    fn relay_once(&mut self, token: Token) {
        match self
            .relay
            .handle(token, &mut self.connections, self.poll.registry())
        {
            Relay::Delivered(n) => {
                trace!(conn_id = token.0, bytes = n, "Carrying source to next turn");
                self.carried.push(token);
            }
            Relay::Idle => {}
            Relay::PeerClosed => {
                reaper::reap(&mut self.connections, self.poll.registry(), token, "eof");
            }
            Relay::ReadError(e) => {
                debug!(conn_id = token.0, error = %e, "Read error");
                reaper::reap(
                    &mut self.connections,
                    self.poll.registry(),
                    token,
                    "read error",
                );
            }
        }
    }

    #[cfg(test)]
    fn client_count(&self) -> usize {
        self.connections.len()
    }
}
