use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use tokio::net::{TcpSocket, UdpSocket};

use crate::provider::{
    DIRECT_ID, DatagramConn, DialError, ProxyStream, TunnelProvider,
};

/// The `__direct__` pseudo-tunnel: dials bound to the physical NIC so
/// traffic escapes the TUN default route. Sockets carry the bypass mark
/// the host filter exempts from its drops.
#[derive(Default, Clone)]
pub struct DirectProvider {
    interface: Option<String>,
    local_ip: Option<Ipv4Addr>,
    socket_mark: Option<u32>,
}

impl DirectProvider {
    pub fn new(
        interface: Option<String>,
        local_ip: Option<Ipv4Addr>,
        socket_mark: Option<u32>,
    ) -> Self {
        Self {
            interface,
            local_ip,
            socket_mark,
        }
    }
}

#[async_trait]
impl TunnelProvider for DirectProvider {
    async fn connect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    fn adapter_ip(&self) -> Option<Ipv4Addr> {
        self.local_ip
    }

    async fn dial_tcp(&self, target: SocketAddrV4) -> Result<Box<dyn ProxyStream>, DialError> {
        let socket = TcpSocket::new_v4()?;
        if let Some(ifname) = &self.interface {
            bind_to_device(&socket, ifname)?;
        }
        if let Some(mark) = self.socket_mark {
            set_socket_mark(&socket, mark)?;
        }
        if let Some(ip) = self.local_ip {
            socket.bind(SocketAddr::V4(SocketAddrV4::new(ip, 0)))?;
        }
        let stream = socket.connect(SocketAddr::V4(target)).await?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, target: SocketAddrV4) -> Result<Box<dyn DatagramConn>, DialError> {
        let bind_ip = self.local_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let socket = UdpSocket::bind(SocketAddrV4::new(bind_ip, 0)).await?;
        if let Some(ifname) = &self.interface {
            bind_to_device(&socket, ifname)?;
        }
        if let Some(mark) = self.socket_mark {
            set_socket_mark(&socket, mark)?;
        }
        socket.connect(SocketAddr::V4(target)).await?;
        Ok(Box::new(DirectDatagram { socket }))
    }

    fn name(&self) -> &str {
        DIRECT_ID
    }

    fn protocol(&self) -> &str {
        "direct"
    }
}

struct DirectDatagram {
    socket: UdpSocket,
}

#[async_trait]
impl DatagramConn for DirectDatagram {
    async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.socket.send(buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.socket.recv(buf).await
    }
}

#[cfg(target_os = "linux")]
fn set_socket_mark(socket: &impl std::os::unix::io::AsRawFd, mark: u32) -> std::io::Result<()> {
    let fd = socket.as_raw_fd();
    let value: libc::c_uint = mark;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_socket_mark(_socket: &impl std::os::unix::io::AsRawFd, _mark: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn bind_to_device(
    socket: &impl std::os::unix::io::AsRawFd,
    interface: &str,
) -> std::io::Result<()> {
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(
    _socket: &impl std::os::unix::io::AsRawFd,
    _interface: &str,
) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dial_tcp_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let provider = DirectProvider::default();
        let mut stream = provider.dial_tcp(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_udp_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = match server.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], peer).await.unwrap();
        });

        let provider = DirectProvider::default();
        let conn = provider.dial_udp(addr).await.unwrap();
        conn.send(b"probe").await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"probe");
    }
}
