use std::net::{SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::provider::{DatagramConn, DialError, ProxyStream, TunnelProvider};
use crate::stream::PrefixedStream;

#[derive(Debug, Clone)]
pub struct HttpConnectSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Upstream HTTP CONNECT proxy as a tunnel backend. TCP only.
pub struct HttpConnectProvider {
    name: String,
    settings: HttpConnectSettings,
}

impl HttpConnectProvider {
    pub fn new(name: String, settings: HttpConnectSettings) -> Self {
        Self { name, settings }
    }

    async fn server_addr(&self) -> Result<SocketAddr, DialError> {
        let addrs = tokio::net::lookup_host((self.settings.host.as_str(), self.settings.port))
            .await?;
        let mut first = None;
        for addr in addrs {
            if first.is_none() {
                first = Some(addr);
            }
            if matches!(addr, SocketAddr::V4(_)) {
                return Ok(addr);
            }
        }
        first.ok_or_else(|| {
            DialError::Other(format!("proxy host did not resolve: {}", self.settings.host))
        })
    }
}

#[async_trait]
impl TunnelProvider for HttpConnectProvider {
    async fn connect(&self) -> anyhow::Result<()> {
        // Reachability probe; per-flow connections are dialed on demand.
        let addr = self.server_addr().await?;
        TcpStream::connect(addr).await?;
        Ok(())
    }

    async fn disconnect(&self) {}

    fn adapter_ip(&self) -> Option<std::net::Ipv4Addr> {
        None
    }

    async fn dial_tcp(&self, target: SocketAddrV4) -> Result<Box<dyn ProxyStream>, DialError> {
        let addr = self.server_addr().await?;
        let mut stream = TcpStream::connect(addr).await?;

        let mut request = format!(
            "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n",
            target.ip(),
            target.port(),
            target.ip(),
            target.port()
        );
        if let (Some(user), Some(pass)) = (&self.settings.username, &self.settings.password) {
            let auth =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            request.push_str(&format!("Proxy-Authorization: Basic {auth}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut buf = Vec::with_capacity(1024);
        let mut tmp = [0u8; 512];
        loop {
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                return Err(DialError::Other("proxy closed during CONNECT".to_string()));
            }
            buf.extend_from_slice(&tmp[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            if buf.len() > 16 * 1024 {
                return Err(DialError::Other("CONNECT response too large".to_string()));
            }
        }

        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(&buf)
            .map_err(|e| DialError::Other(format!("bad CONNECT response: {e}")))?
        {
            httparse::Status::Complete(n) => {
                let code = res.code.unwrap_or(0);
                if code != 200 {
                    return Err(DialError::Other(format!("CONNECT failed: HTTP {code}")));
                }
                let leftover = buf[n..].to_vec();
                Ok(Box::new(PrefixedStream::new(leftover, stream)))
            }
            httparse::Status::Partial => {
                Err(DialError::Other("CONNECT response incomplete".to_string()))
            }
        }
    }

    async fn dial_udp(&self, _target: SocketAddrV4) -> Result<Box<dyn DatagramConn>, DialError> {
        Err(DialError::UdpNotSupported)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> &str {
        "http"
    }
}
