//! Connection teardown.

use crate::runtime::connection::{ConnectionRegistry, Peer};
use mio::{Registry, Token};
use tracing::debug;

/// Close a connection and drop it from the registry.
///
/// Returns `false` when the token was already gone; reaping twice is a no-op.
pub fn reap<P: Peer>(
    connections: &mut ConnectionRegistry<P>,
    poll: &Registry,
    token: Token,
    reason: &str,
) -> bool {
    let Some(mut peer) = connections.remove(token) else {
        return false;
    };

    if let Err(e) = peer.deregister(poll) {
        debug!(conn_id = token.0, error = %e, "Deregister failed");
    }
    // Dropping the peer closes the socket.
    drop(peer);

    debug!(conn_id = token.0, reason, "Connection closed");
    true
}
