use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use splittun_flow::FailoverCtx;
use splittun_rules::Fallback;
use splittun_tunnel::{DIRECT_ID, DatagramConn, DialError, ProxyStream};

use crate::ProxyShared;

/// At most 3 dial retries per connection attempt.
const MAX_FAILOVER_HOPS: usize = 3;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry on connection-level failures; never on cancellation.
pub fn should_fallback(err: &DialError) -> bool {
    match err {
        DialError::UdpNotSupported => false,
        DialError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
        ),
        // CONNECT rejections and the like; the fallback path may still work.
        DialError::Other(_) => true,
    }
}

pub struct DialOutcome {
    pub conn: Box<dyn ProxyStream>,
    pub tunnel_id: String,
}

pub struct UdpDialOutcome {
    pub conn: Box<dyn DatagramConn>,
    pub tunnel_id: String,
}

async fn dial_tcp_via(
    shared: &ProxyShared,
    tunnel_id: &str,
    target: SocketAddrV4,
) -> Result<Box<dyn ProxyStream>, DialError> {
    let entry = shared
        .registry
        .get(tunnel_id)
        .ok_or_else(|| DialError::Other(format!("unknown tunnel: {tunnel_id}")))?;
    match timeout(DIAL_TIMEOUT, entry.provider.dial_tcp(target)).await {
        Ok(result) => result,
        Err(_) => Err(DialError::Io(io::ErrorKind::TimedOut.into())),
    }
}

async fn dial_udp_via(
    shared: &ProxyShared,
    tunnel_id: &str,
    target: SocketAddrV4,
) -> Result<Box<dyn DatagramConn>, DialError> {
    let entry = shared
        .registry
        .get(tunnel_id)
        .ok_or_else(|| DialError::Other(format!("unknown tunnel: {tunnel_id}")))?;
    match timeout(DIAL_TIMEOUT, entry.provider.dial_udp(target)).await {
        Ok(result) => result,
        Err(_) => Err(DialError::Io(io::ErrorKind::TimedOut.into())),
    }
}

/// Dial through the flow's tunnel, falling back per the NAT entry's policy.
pub async fn dial_tcp_chain(
    shared: &ProxyShared,
    tunnel_id: &str,
    target: SocketAddrV4,
    failover: Option<&FailoverCtx>,
) -> Option<DialOutcome> {
    match dial_tcp_via(shared, tunnel_id, target).await {
        Ok(conn) => Some(DialOutcome {
            conn,
            tunnel_id: tunnel_id.to_string(),
        }),
        Err(err) => {
            warn!(tunnel = %tunnel_id, %target, %err, "dial failed");
            if !should_fallback(&err) {
                return None;
            }
            dial_tcp_fallback(shared, target, failover).await
        }
    }
}

/// Apply the fallback policy alone (used after early-EOF too): retry
/// direct, or resume the rule chain after the flow's rule index honoring
/// each rule's own fallback, capped at 3 hops.
pub async fn dial_tcp_fallback(
    shared: &ProxyShared,
    target: SocketAddrV4,
    failover: Option<&FailoverCtx>,
) -> Option<DialOutcome> {
    let ctx = failover?;
    match ctx.fallback {
        Fallback::Block | Fallback::Drop => None,
        Fallback::AllowDirect => dial_tcp_direct(shared, target).await,
        Fallback::Failover => {
            let rules = shared.rules.load();
            let mut cursor = ctx.rule_index;
            for _ in 0..MAX_FAILOVER_HOPS {
                let next = rules.matches_after(&ctx.exe, &ctx.base, cursor)?;
                cursor = next.index;
                match dial_tcp_via(shared, &next.tunnel_id, target).await {
                    Ok(conn) => {
                        info!(tunnel = %next.tunnel_id, %target, "failover dial succeeded");
                        return Some(DialOutcome {
                            conn,
                            tunnel_id: next.tunnel_id.clone(),
                        });
                    }
                    Err(err) => {
                        warn!(tunnel = %next.tunnel_id, %target, %err, "failover dial failed");
                        if !should_fallback(&err) {
                            return None;
                        }
                        match next.fallback {
                            Fallback::Block | Fallback::Drop => return None,
                            Fallback::AllowDirect => {
                                return dial_tcp_direct(shared, target).await;
                            }
                            Fallback::Failover => continue,
                        }
                    }
                }
            }
            None
        }
    }
}

async fn dial_tcp_direct(shared: &ProxyShared, target: SocketAddrV4) -> Option<DialOutcome> {
    match dial_tcp_via(shared, DIRECT_ID, target).await {
        Ok(conn) => {
            info!(%target, "direct fallback dial succeeded");
            Some(DialOutcome {
                conn,
                tunnel_id: DIRECT_ID.to_string(),
            })
        }
        Err(err) => {
            warn!(%target, %err, "direct fallback dial failed");
            None
        }
    }
}

pub(crate) async fn dial_udp_chain(
    shared: &ProxyShared,
    tunnel_id: &str,
    target: SocketAddrV4,
    failover: Option<&FailoverCtx>,
) -> Option<UdpDialOutcome> {
    match dial_udp_via(shared, tunnel_id, target).await {
        Ok(conn) => Some(UdpDialOutcome {
            conn,
            tunnel_id: tunnel_id.to_string(),
        }),
        Err(err) => {
            warn!(tunnel = %tunnel_id, %target, %err, "udp dial failed");
            if !should_fallback(&err) {
                return None;
            }
            let ctx = failover?;
            match ctx.fallback {
                Fallback::Block | Fallback::Drop => None,
                Fallback::AllowDirect | Fallback::Failover => {
                    match dial_udp_via(shared, DIRECT_ID, target).await {
                        Ok(conn) => Some(UdpDialOutcome {
                            conn,
                            tunnel_id: DIRECT_ID.to_string(),
                        }),
                        Err(err) => {
                            warn!(%target, %err, "direct udp fallback failed");
                            None
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_matrix() {
        assert!(should_fallback(&DialError::Io(
            io::ErrorKind::ConnectionReset.into()
        )));
        assert!(should_fallback(&DialError::Io(
            io::ErrorKind::ConnectionRefused.into()
        )));
        assert!(should_fallback(&DialError::Io(
            io::ErrorKind::UnexpectedEof.into()
        )));
        assert!(should_fallback(&DialError::Io(io::ErrorKind::TimedOut.into())));
        assert!(should_fallback(&DialError::Other("CONNECT failed".to_string())));

        assert!(!should_fallback(&DialError::UdpNotSupported));
        assert!(!should_fallback(&DialError::Io(
            io::ErrorKind::Interrupted.into()
        )));
        assert!(!should_fallback(&DialError::Io(
            io::ErrorKind::PermissionDenied.into()
        )));
    }
}
