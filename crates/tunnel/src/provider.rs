use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use splittun_rules::Priority;

/// Reserved pseudo-tunnel id for the physical network interface.
pub const DIRECT_ID: &str = "__direct__";

pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// The resolver falls back to TCP upstreams on this.
    #[error("tunnel does not support udp")]
    UdpNotSupported,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Down,
    Connecting,
    Up,
    Error,
}

#[async_trait]
pub trait DatagramConn: Send + Sync {
    async fn send(&self, buf: &[u8]) -> std::io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// One tunnel backend. Implementations own their connection state; the
/// router only sees these entry points.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;
    async fn disconnect(&self);
    /// IPv4 address of the tunnel's virtual adapter, if it has one.
    fn adapter_ip(&self) -> Option<Ipv4Addr>;
    async fn dial_tcp(&self, target: SocketAddrV4) -> Result<Box<dyn ProxyStream>, DialError>;
    async fn dial_udp(&self, target: SocketAddrV4) -> Result<Box<dyn DatagramConn>, DialError>;
    fn name(&self) -> &str;
    fn protocol(&self) -> &str;
    /// Raw IP-level access, bypassing the provider's userspace stack.
    fn raw_forwarder(&self) -> Option<&dyn RawForwarder> {
        None
    }
    /// Remote server endpoints, for host-filter permits.
    fn endpoints(&self) -> Option<Vec<SocketAddrV4>> {
        None
    }
}

/// Inbound callback installed by the router. Returns true when the packet
/// was consumed (reverse-NATed to the TUN); false hands it back to the
/// provider's own IP stack.
pub type InboundHandler = Arc<dyn Fn(&mut [u8]) -> bool + Send + Sync>;

pub trait RawForwarder: Send + Sync {
    fn inject(&self, pkt: &[u8]) -> bool;
    fn inject_with_priority(&self, pkt: &[u8], priority: Priority) -> bool;
    fn set_inbound_handler(&self, handler: InboundHandler);
}
