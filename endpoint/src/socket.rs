//! Non-blocking UDP plumbing for the session's paired sockets.
//!
//! The run-step polls both sockets every millisecond, so receives must
//! never block and send failures must never abort the tick.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use tracing::{debug, warn};

/// Binds a datagram socket on all interfaces and switches it to
/// non-blocking mode. Port 0 requests an OS-assigned port.
pub(crate) fn bind_session_socket(port: u16) -> io::Result<UdpSocket> {
    // ---
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Receives one datagram if one is queued.
///
/// Returns `None` when the socket has nothing to deliver. Transient
/// receive errors (e.g. ICMP port-unreachable surfacing on a connected
/// platform) are logged and treated as "nothing received".
pub(crate) fn try_recv_from(socket: &UdpSocket, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
    // ---
    match socket.recv_from(buf) {
        Ok(received) => Some(received),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
        Err(e) => {
            debug!("socket receive error: {}", e);
            None
        }
    }
}

/// Sends one datagram, logging instead of failing.
///
/// UDP is fire-and-forget here: a lost keepalive or invitation is
/// recovered by the retry timers, so a send error never stops the session.
pub(crate) fn send_datagram(socket: &UdpSocket, payload: &[u8], dest: SocketAddr) {
    // ---
    if let Err(e) = socket.send_to(payload, dest) {
        warn!("failed to send {} bytes to {}: {}", payload.len(), dest, e);
    }
}
