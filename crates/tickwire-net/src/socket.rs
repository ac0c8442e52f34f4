//! Blocking TCP connect and socket options for the connector thread.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tickwire_config::TransportConfig;

/// Keepalive idle time before the first keepalive packet.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
/// Interval between keepalive packets.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Why the connector thread could not produce a stream.
#[derive(Debug)]
pub(crate) enum ConnectFailure {
    /// The host name did not resolve to any address.
    Resolve(io::Error),
    /// Every resolved address refused or timed out.
    Connect(io::Error),
}

/// Socket options applied to every connected stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SocketOptions {
    pub nodelay: bool,
    pub read_timeout: Option<Duration>,
}

impl From<&TransportConfig> for SocketOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            nodelay: config.nodelay,
            read_timeout: config.recv_timeout(),
        }
    }
}

/// Resolve `host:port` and connect to the first address that accepts within
/// `timeout`.
pub(crate) fn open_stream(
    host: &str,
    port: u16,
    timeout: Duration,
    options: SocketOptions,
) -> Result<TcpStream, ConnectFailure> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(ConnectFailure::Resolve)?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectFailure::Resolve(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host} resolved to no addresses"),
        )));
    }

    let mut last_error = None;
    for addr in addrs {
        match connect_addr(addr, timeout) {
            Ok(stream) => {
                configure_stream(&stream, options).map_err(ConnectFailure::Connect)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(ConnectFailure::Connect(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "no address accepted")
    })))
}

fn connect_addr(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    if timeout.is_zero() {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "zero connect timeout"));
    }
    socket.connect_timeout(&addr.into(), timeout)?;
    Ok(socket.into())
}

/// Apply socket options to a connected stream.
pub(crate) fn configure_stream(stream: &TcpStream, options: SocketOptions) -> io::Result<()> {
    stream.set_nodelay(options.nodelay)?;
    stream.set_read_timeout(options.read_timeout)?;

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;

    Ok(())
}
