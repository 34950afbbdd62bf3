//! Datagram transport between the client and its gateway.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::protocol;

/// One datagram conversation with the gateway.
///
/// The engine is written against this seam so the whole protocol flow can
/// be driven by a scripted counterpart in tests. The real implementation is
/// [`UdpTransport`]. A transport must be safe to use from a single sender
/// and a single receiver concurrently.
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to the gateway.
    fn send(&self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive one datagram, returning its payload and source address.
    fn recv(&self) -> impl Future<Output = io::Result<(Vec<u8>, SocketAddr)>> + Send;
}

/// [`Transport`] over a UDP socket connected to the gateway.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds a socket of the gateway's address family and connects it to
    /// the gateway's PCP port.
    pub async fn connect(gateway: IpAddr) -> io::Result<Self> {
        let bind_addr: SocketAddr = match gateway {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect((gateway, protocol::SERVER_PORT)).await?;
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    async fn send(&self, buf: &[u8]) -> io::Result<()> {
        self.socket.send(buf).await.map(|_| ())
    }

    async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0; protocol::MAX_PACKET_SIZE];
        let (read, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(read);
        Ok((buf, from))
    }
}
