//! Chunk relay: one read from a source, one broadcast pass to everyone else.
//!
//! The destination set is captured before the first write, so a pass always
//! targets exactly the clients that were live when the chunk was read.
//! Writes are blocking full-writes: a destination that is not ready stalls
//! the pass (and with it the whole event loop) until it drains or fails.

use crate::runtime::connection::{ConnectionRegistry, Peer};
use crate::runtime::reaper;
use mio::{Registry, Token};
use std::io::{self, ErrorKind};
use tracing::{debug, warn};

/// Outcome of relaying from one readable source.
#[derive(Debug)]
pub enum Relay {
    /// A chunk of this many bytes was read and broadcast.
    Delivered(usize),
    /// Nothing to read right now; the source stays open.
    Idle,
    /// The source reached end-of-stream.
    PeerClosed,
    /// Reading from the source failed.
    ReadError(io::Error),
}

/// Reads chunks into a fixed buffer and fans them out.
pub struct MessageRelay {
    buf: Vec<u8>,
}

impl MessageRelay {
    /// Create a relay whose chunks are at most `chunk_size` bytes.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buf: vec![0u8; chunk_size],
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.buf.len()
    }

    /// Read one chunk from `source` and write it to every other client.
    ///
    /// Destinations whose write fails are reaped; the pass carries on to the
    /// rest. The source itself is left for the caller to reap.
    pub fn handle<P: Peer>(
        &mut self,
        source: Token,
        connections: &mut ConnectionRegistry<P>,
        poll: &Registry,
    ) -> Relay {
        let Some(peer) = connections.get_mut(source) else {
            return Relay::Idle;
        };

        let n = loop {
            match peer.read(&mut self.buf) {
                Ok(0) => return Relay::PeerClosed,
                Ok(n) => break n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Relay::Idle,
                Err(e) => return Relay::ReadError(e),
            }
        };
        let chunk = &self.buf[..n];

        let destinations = connections.others(source);
        for dst in &destinations {
            let Some(peer) = connections.get_mut(*dst) else {
                continue;
            };
            if let Err(e) = write_full(peer, chunk) {
                warn!(conn_id = dst.0, error = %e, "Write to client failed");
                reaper::reap(connections, poll, *dst, "write failed");
            }
        }

        debug!(
            conn_id = source.0,
            bytes = n,
            destinations = destinations.len(),
            "Chunk relayed"
        );
        Relay::Delivered(n)
    }
}

/// Write all of `buf` to `peer`, waiting out partial writes and `WouldBlock`.
///
/// Any error other than `Interrupted` or `WouldBlock` aborts the write.
pub fn write_full<P: Peer + ?Sized>(peer: &mut P, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match peer.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => peer.wait_writable()?,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
