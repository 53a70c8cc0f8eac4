//! Thin socket helpers shared by the acceptor and connector.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Result;

/// Non-blocking close-on-exec TCP socket for `addr`'s family. Both flags are
/// set atomically at creation, so there is no window where a forked child
/// could inherit the fd.
pub(crate) fn new_stream_socket(addr: &SocketAddr) -> Result<Socket> {
    let ty = Type::STREAM.nonblocking().cloexec();
    let socket = Socket::new(Domain::for_address(*addr), ty, Some(Protocol::TCP))?;
    Ok(socket)
}

/// Bound (not yet listening) server socket with `SO_REUSEADDR` always on and
/// `SO_REUSEPORT` on request.
pub(crate) fn bind_listener(addr: SocketAddr, reuse_port: bool) -> Result<Socket> {
    let socket = new_stream_socket(&addr)?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}

pub(crate) fn local_addr_of(socket: &Socket) -> SocketAddr {
    socket
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .unwrap_or_else(unspecified)
}

pub(crate) fn peer_addr_of(socket: &Socket) -> SocketAddr {
    socket
        .peer_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .unwrap_or_else(unspecified)
}

fn unspecified() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// True when a connect landed on our own ephemeral port (possible when the
/// destination port lies inside the local ephemeral range). Addresses are
/// canonicalized first so `::ffff:127.0.0.1` and `127.0.0.1` compare equal.
pub(crate) fn is_self_connect(socket: &Socket) -> bool {
    let (Ok(local), Ok(peer)) = (socket.local_addr(), socket.peer_addr()) else {
        return false;
    };
    match (local.as_socket(), peer.as_socket()) {
        (Some(local), Some(peer)) => {
            local.port() == peer.port() && local.ip().to_canonical() == peer.ip().to_canonical()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listener_reports_a_real_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = bind_listener(addr, false).unwrap();
        assert_ne!(local_addr_of(&socket).port(), 0);
    }

    #[test]
    fn two_reuseport_listeners_share_a_port() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let port = local_addr_of(&first).port();
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        assert!(bind_listener(addr, true).is_ok());
    }
}
