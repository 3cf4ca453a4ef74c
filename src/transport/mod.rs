//! Channel transport - non-blocking sockets handed to the selector loop
//!
//! Channels are opaque connection handles to the rest of the crate: a
//! listening socket for a [`Server`] or a stream socket for an
//! [`Association`]. Sockets are opened with `socket2` (so the local endpoint
//! can be bound and address reuse enabled) and converted into `mio` sources.

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::debug;

use crate::association::Association;
use crate::server::Server;

pub mod metrics;

pub use metrics::{MetricsSnapshot, TransportMetrics};

/// Listen backlog for server sockets
const LISTEN_BACKLOG: i32 = 1024;

/// A socket together with the entity it belongs to, in transit to the
/// selector thread inside a [`ChangeRequest`](crate::change::ChangeRequest)
pub enum Channel {
    /// Listening socket of a started server
    Listener {
        /// Owning server
        server: Arc<Server>,
        /// Bound, non-blocking listener
        socket: TcpListener,
    },
    /// Accepted stream socket for a server-side association
    Stream {
        /// Association the peer was matched to
        association: Arc<Association>,
        /// Connected, non-blocking stream
        socket: TcpStream,
    },
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Listener { server, .. } => {
                f.debug_struct("Listener").field("server", &server.name()).finish()
            }
            Channel::Stream { association, .. } => f
                .debug_struct("Stream")
                .field("association", &association.name())
                .finish(),
        }
    }
}

/// Resolve `address:port` to the first matching socket address
pub fn resolve(address: &str, port: u16) -> io::Result<SocketAddr> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (address, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address found for {address}:{port}"),
        )
    })
}

/// Whether a peer socket address corresponds to the configured endpoint
pub fn matches_endpoint(peer: SocketAddr, address: &str, port: u16) -> bool {
    if peer.port() != port {
        return false;
    }
    match resolve(address, port) {
        Ok(expected) => canonical_ip(expected.ip()) == canonical_ip(peer.ip()),
        Err(_) => false,
    }
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Bind a non-blocking listening socket on `host:port`
pub fn listen(host: &str, port: u16) -> io::Result<TcpListener> {
    let addr = resolve(host, port)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    debug!("Listening on {}", addr);
    Ok(TcpListener::from_std(socket.into()))
}

/// Start a non-blocking connect from `host:host_port` to `peer:peer_port`.
///
/// The returned stream is usually still connecting; completion is reported
/// by writable readiness on the selector.
pub fn connect(host: &str, host_port: u16, peer: &str, peer_port: u16) -> io::Result<TcpStream> {
    let local = resolve(host, host_port)?;
    let remote = resolve(peer, peer_port)?;

    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;

    match socket.connect(&remote.into()) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }

    debug!("Connecting {} -> {}", local, remote);
    Ok(TcpStream::from_std(socket.into()))
}

/// Outcome of probing a stream whose connect was in flight
#[derive(Debug)]
pub enum ConnectProgress {
    /// Handshake finished
    Connected,
    /// Still waiting for the handshake
    Pending,
    /// Connect failed
    Failed(io::Error),
}

/// Check whether a pending connect has completed
pub fn connect_progress(socket: &TcpStream) -> ConnectProgress {
    match socket.take_error() {
        Ok(Some(e)) | Err(e) => return ConnectProgress::Failed(e),
        Ok(None) => {}
    }
    match socket.peer_addr() {
        Ok(_) => ConnectProgress::Connected,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectProgress::Pending,
        Err(e) => ConnectProgress::Failed(e),
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    err.kind() == io::ErrorKind::WouldBlock
}
