//! Gateway and local interface address discovery.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use default_net::ip::{Ipv4Net, Ipv6Net};
use tracing::debug;

use crate::error::Error;

/// Returns the default-route next hop from the routing table.
///
/// This is the address PCP requests are directed to.
pub fn gateway_address() -> Result<IpAddr, Error> {
    let gateway = default_net::get_default_gateway().map_err(|e| {
        debug!("default gateway lookup failed: {e}");
        Error::GatewayNotFound
    })?;
    Ok(gateway.ip_addr)
}

/// Returns the local interface address on the same network as `gateway`.
///
/// Enumerates every interface address and picks the one whose prefix
/// contains the gateway; that address goes into the client field of every
/// request.
pub fn internal_address(gateway: IpAddr) -> Result<IpAddr, Error> {
    for iface in default_net::interface::get_interfaces() {
        match gateway {
            IpAddr::V4(gateway) => {
                if let Some(net) = iface.ipv4.iter().find(|net| contains_v4(net, gateway)) {
                    return Ok(IpAddr::V4(net.addr));
                }
            }
            IpAddr::V6(gateway) => {
                if let Some(net) = iface.ipv6.iter().find(|net| contains_v6(net, gateway)) {
                    return Ok(IpAddr::V6(net.addr));
                }
            }
        }
    }
    Err(Error::NoInternalAddress)
}

fn contains_v4(net: &Ipv4Net, ip: Ipv4Addr) -> bool {
    let mask = u32::from(net.netmask);
    u32::from(net.addr) & mask == u32::from(ip) & mask
}

fn contains_v6(net: &Ipv6Net, ip: Ipv6Addr) -> bool {
    let mask = u128::from(net.netmask);
    u128::from(net.addr) & mask == u128::from(ip) & mask
}
