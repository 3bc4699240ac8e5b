use std::io;
use std::net::Ipv4Addr;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use tun::r#async::{TunPacket, TunPacketCodec};

use splittun_net::packet::MAX_PACKET;
use splittun_netlink::{Netlink, find_overlapping_addr};
use splittun_router::{TunAdapter, TunSink};

type TunFramed = Framed<tun::AsyncDevice, TunPacketCodec>;

pub(crate) async fn ensure_tun_cidr_free(
    netlink: &Netlink,
    tun_ip: Ipv4Addr,
    prefix: u8,
) -> Result<()> {
    let addrs = netlink.ipv4_addrs().await?;
    if let Some(overlap) = find_overlapping_addr(&addrs, tun_ip, prefix) {
        return Err(anyhow!(
            "TUN CIDR {}/{} overlaps with existing address {}; choose a different tun.cidr",
            tun_ip,
            prefix,
            overlap
        ));
    }
    Ok(())
}

pub(crate) fn create_tun_device(
    tun_name: &str,
    tun_ip: Ipv4Addr,
    prefix: u8,
) -> Result<(TunReader, TunDeviceSink)> {
    let mask = if prefix == 0 {
        0u32
    } else {
        u32::MAX << (32 - prefix)
    };
    let mut cfg = tun::Configuration::default();
    cfg.name(tun_name)
        .address(tun_ip)
        .netmask(Ipv4Addr::from(mask))
        .mtu(splittun_net::packet::TUNNEL_MTU as i32)
        .up();
    cfg.platform(|platform| {
        platform.packet_information(false);
    });
    let device = tun::create_as_async(&cfg).context("failed to open TUN device")?;
    let (sink, stream) = device.into_framed().split();
    Ok((TunReader { stream }, TunDeviceSink { sink }))
}

pub(crate) struct TunReader {
    stream: SplitStream<TunFramed>,
}

#[async_trait]
impl TunAdapter for TunReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.next().await {
                Some(Ok(pkt)) => {
                    let bytes = pkt.get_bytes();
                    if bytes.len() > MAX_PACKET || bytes.len() > buf.len() {
                        continue;
                    }
                    buf[..bytes.len()].copy_from_slice(bytes);
                    return Ok(bytes.len());
                }
                Some(Err(err)) => return Err(err),
                None => return Err(io::ErrorKind::UnexpectedEof.into()),
            }
        }
    }
}

pub(crate) struct TunDeviceSink {
    sink: SplitSink<TunFramed, TunPacket>,
}

#[async_trait]
impl TunSink for TunDeviceSink {
    async fn write_packet(&mut self, pkt: &[u8]) -> io::Result<()> {
        self.sink.send(TunPacket::new(pkt.to_vec())).await
    }
}
