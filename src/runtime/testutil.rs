//! In-memory peers for exercising the relay without sockets.

use super::connection::Peer;
use mio::{Registry, Token};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

#[derive(Default)]
pub struct MockState {
    /// Bytes waiting to be read by the relay.
    pub inbound: VecDeque<u8>,
    /// Report end-of-stream once `inbound` is empty.
    pub eof: bool,
    /// Fail the next read with this error kind.
    pub read_error: Option<io::ErrorKind>,
    /// Everything the relay wrote to this peer.
    pub outbound: Vec<u8>,
    /// Sizes of the individual successful writes.
    pub writes: Vec<usize>,
    /// Largest slice a single write accepts.
    pub write_limit: Option<usize>,
    /// Alternate between `WouldBlock` and a successful write.
    pub flaky: bool,
    pub would_block_next: bool,
    pub write_error: Option<io::ErrorKind>,
    pub waits: usize,
    pub deregistered: bool,
}

/// A peer whose state stays observable after the registry drops it.
#[derive(Clone, Default)]
pub struct MockPeer(pub Rc<RefCell<MockState>>);

impl MockPeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.0.borrow_mut().inbound.extend(bytes.iter().copied());
    }

    pub fn received(&self) -> Vec<u8> {
        self.0.borrow().outbound.clone()
    }

    pub fn state(&self) -> std::cell::RefMut<'_, MockState> {
        self.0.borrow_mut()
    }
}

impl Read for MockPeer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        if let Some(kind) = state.read_error.take() {
            return Err(io::Error::from(kind));
        }
        if state.inbound.is_empty() {
            return if state.eof {
                Ok(0)
            } else {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            };
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPeer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        if let Some(kind) = state.write_error {
            return Err(io::Error::from(kind));
        }
        if state.flaky {
            state.would_block_next = !state.would_block_next;
            if state.would_block_next {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
        }
        let n = state.write_limit.map_or(buf.len(), |limit| buf.len().min(limit));
        state.outbound.extend_from_slice(&buf[..n]);
        state.writes.push(n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Peer for MockPeer {
    fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        self.0.borrow_mut().deregistered = true;
        Ok(())
    }

    fn wait_writable(&self) -> io::Result<()> {
        self.0.borrow_mut().waits += 1;
        Ok(())
    }
}
