use anyhow::{anyhow, Result};
use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, error, info, warn};
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    Ethernet,
    Wifi,
    Virtual,
    Other,
}

/// An IPv4 address bound to a local interface
#[derive(Debug, Clone)]
pub struct LocalAddress {
    pub interface: String,
    pub ip: Ipv4Addr,
    pub kind: InterfaceKind,
}

impl LocalAddress {
    fn new(interface: String, ip: Ipv4Addr) -> Self {
        let kind = classify(&interface);
        Self { interface, ip, kind }
    }

    /// Higher wins when choosing which address to advertise
    fn rank(&self) -> u8 {
        let kind_rank = match self.kind {
            InterfaceKind::Ethernet => 40,
            InterfaceKind::Wifi => 30,
            InterfaceKind::Other => 20,
            InterfaceKind::Virtual => 5,
        };
        // Peers on a LAN almost always share a private range with us
        if self.ip.is_private() {
            kind_rank + 50
        } else {
            kind_rank
        }
    }
}

fn classify(name: &str) -> InterfaceKind {
    let name = name.to_ascii_lowercase();
    if name.starts_with("docker")
        || name.starts_with("veth")
        || name.starts_with("br-")
        || name.starts_with("virbr")
        || name.starts_with("utun")
        || name.starts_with("tun")
        || name.starts_with("tap")
    {
        InterfaceKind::Virtual
    } else if name.starts_with("wl") || name.contains("wifi") || name.contains("wi-fi") {
        InterfaceKind::Wifi
    } else if name.starts_with("en") || name.starts_with("eth") {
        InterfaceKind::Ethernet
    } else {
        InterfaceKind::Other
    }
}

/// List every usable (non-loopback, non-link-local) IPv4 address, best first
pub fn candidate_addresses() -> Result<Vec<LocalAddress>> {
    let interfaces = get_if_addrs().map_err(|e| {
        error!("Failed to get network interfaces: {}", e);
        anyhow!("Failed to get network interfaces: {}", e)
    })?;

    let mut addresses: Vec<LocalAddress> = interfaces
        .into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some((iface.name, v4.ip)),
            IfAddr::V6(_) => None,
        })
        .filter(|(_, ip)| !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified())
        .map(|(name, ip)| LocalAddress::new(name, ip))
        .collect();

    addresses.sort_by(|a, b| b.rank().cmp(&a.rank()));

    for addr in &addresses {
        debug!("Candidate address {} on {} ({:?})", addr.ip, addr.interface, addr.kind);
    }

    Ok(addresses)
}

/// Pick the address to put in our service advertisement
pub fn advertise_address() -> Result<IpAddr> {
    match candidate_addresses() {
        Ok(addresses) => {
            if let Some(best) = addresses.first() {
                info!("Advertising on {} ({})", best.ip, best.interface);
                return Ok(IpAddr::V4(best.ip));
            }
            warn!("No usable IPv4 interface found, asking the OS for a default");
        }
        Err(e) => warn!("Interface enumeration failed ({}), asking the OS for a default", e),
    }

    local_ip().map_err(|e| {
        error!("Failed to determine local IP: {}", e);
        anyhow!("Failed to determine local IP: {}", e)
    })
}
