//! Single-threaded, readiness-driven relay runtime.
//!
//! Built on mio (epoll on Linux, kqueue on macOS). All state lives in one
//! `EventLoop`; no threads, no locks.
//!
//! - `ConnectionRegistry`: live client connections keyed by token
//! - `Listener`: accepts and registers new clients
//! - `MessageRelay`: reads one chunk and broadcasts it
//! - `reaper`: closes and unregisters failed connections

mod connection;
mod event_loop;
mod listener;
mod reaper;
mod relay;

#[cfg(test)]
mod testutil;

pub use event_loop::EventLoop;

use std::io;
use std::net::SocketAddr;

/// Errors that stop the relay from starting.
#[derive(Debug)]
pub enum StartupError {
    /// Creating the readiness poller failed.
    Poll(io::Error),
    /// Creating or binding the listening socket failed.
    Bind(SocketAddr, io::Error),
    /// `listen` on the bound socket failed.
    Listen(SocketAddr, io::Error),
    /// The listening socket could not be added to the poller.
    Register(io::Error),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Poll(e) => write!(f, "Failed to create poller: {}", e),
            StartupError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            StartupError::Listen(addr, e) => write!(f, "Failed to listen on {}: {}", addr, e),
            StartupError::Register(e) => write!(f, "Failed to watch listener: {}", e),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Poll(e)
            | StartupError::Bind(_, e)
            | StartupError::Listen(_, e)
            | StartupError::Register(e) => Some(e),
        }
    }
}
