use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Context, Result, anyhow};
use futures_util::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::route::{RouteAttribute, RouteMessage};
use rtnetlink::{Handle, RouteMessageBuilder, new_connection};

pub struct Netlink {
    handle: Handle,
    _task: tokio::task::JoinHandle<()>,
}

impl Netlink {
    pub fn new() -> Result<Self> {
        let (conn, handle, _) = new_connection().context("failed to open netlink connection")?;
        let task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _task: task,
        })
    }

    pub async fn link_index(&self, name: &str) -> Result<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        if let Some(msg) = links.try_next().await? {
            return Ok(msg.header.index);
        }
        Err(anyhow!("interface not found: {name}"))
    }

    pub async fn ipv4_addrs(&self) -> Result<Vec<Ipv4Addr>> {
        let mut addrs = Vec::new();
        let mut req = self.handle.address().get().execute();
        while let Some(addr) = req.try_next().await? {
            for attr in &addr.attributes {
                match attr {
                    AddressAttribute::Address(IpAddr::V4(v4))
                    | AddressAttribute::Local(IpAddr::V4(v4)) => {
                        addrs.push(*v4);
                    }
                    _ => {}
                }
            }
        }
        addrs.sort();
        addrs.dedup();
        Ok(addrs)
    }

    /// Default route through the TUN with a low metric so it wins over the
    /// physical interface's default.
    pub async fn add_default_route(
        &self,
        tun_name: &str,
        tun_ip: Ipv4Addr,
        metric: u32,
    ) -> Result<()> {
        let idx = self.link_index(tun_name).await?;
        let mut route = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .output_interface(idx)
            .pref_source(tun_ip)
            .build();
        route.attributes.push(RouteAttribute::Priority(metric));
        self.handle
            .route()
            .add(route)
            .replace()
            .execute()
            .await
            .context("failed to add TUN default route")?;
        Ok(())
    }

    /// Name and first IPv4 address of the interface that currently carries
    /// the default route (the physical NIC for direct dials).
    pub async fn default_interface(&self) -> Result<(String, Ipv4Addr)> {
        let filter = RouteMessageBuilder::<Ipv4Addr>::new().build();
        let mut req = self.handle.route().get(filter).execute();
        while let Some(route) = req.try_next().await? {
            if route.header.destination_prefix_length != 0 {
                continue;
            }
            let Some(idx) = route_output_interface(&route) else {
                continue;
            };
            let name = self.link_name(idx).await?;
            let ip = self
                .interface_ipv4(idx)
                .await?
                .ok_or_else(|| anyhow!("default interface {name} has no IPv4 address"))?;
            return Ok((name, ip));
        }
        Err(anyhow!("no IPv4 default route found"))
    }

    async fn link_name(&self, index: u32) -> Result<String> {
        use netlink_packet_route::link::LinkAttribute;
        let mut links = self.handle.link().get().match_index(index).execute();
        if let Some(msg) = links.try_next().await? {
            for attr in &msg.attributes {
                if let LinkAttribute::IfName(name) = attr {
                    return Ok(name.clone());
                }
            }
        }
        Err(anyhow!("interface index {index} not found"))
    }

    async fn interface_ipv4(&self, index: u32) -> Result<Option<Ipv4Addr>> {
        let mut req = self.handle.address().get().execute();
        while let Some(addr) = req.try_next().await? {
            if u32::from(addr.header.index) != index {
                continue;
            }
            for attr in &addr.attributes {
                if let AddressAttribute::Address(IpAddr::V4(v4)) = attr {
                    return Ok(Some(*v4));
                }
            }
        }
        Ok(None)
    }
}

fn route_output_interface(route: &RouteMessage) -> Option<u32> {
    for attr in &route.attributes {
        if let RouteAttribute::Oif(idx) = attr {
            return Some(*idx);
        }
    }
    None
}

pub fn find_overlapping_addr(
    addrs: &[Ipv4Addr],
    tun_ip: Ipv4Addr,
    prefix: u8,
) -> Option<Ipv4Addr> {
    let mask = if prefix == 0 {
        0
    } else {
        (!0u32).checked_shl(32 - u32::from(prefix)).unwrap_or(0)
    };
    let tun_net = u32::from(tun_ip) & mask;
    addrs
        .iter()
        .find(|addr| (u32::from(**addr) & mask) == tun_net)
        .copied()
}
