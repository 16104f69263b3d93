//! Interface enumeration, carried over from the original `NetUtil`.
//!
//! The C++ version opens a throwaway socket and drives it with `ioctl`
//! (`SIOCGIFBRDADDR`, `SIOCGIFHWADDR`, `SIOCGIFFLAGS`) one interface at a
//! time. `if-addrs` already walks `getifaddrs(3)` for addresses and flags;
//! `pnet`'s `datalink` layer is kept only for the MAC address, which
//! `if-addrs` doesn't expose.

use std::net::IpAddr;

use crate::error::{AittError, Result};

/// One network interface, as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
  pub name: String,
  pub address: String,
  pub broadcast: String,
  pub mac: String,
  pub is_up: bool,
  pub is_loopback: bool,
  pub multicast_enabled: bool,
  pub broadcast_enabled: bool,
}

/// Lists every interface `getifaddrs(3)` reports, IPv4 only (the transports
/// this crate ships only speak IPv4, matching the original).
pub fn interface_list() -> Result<Vec<Interface>> {
  let addrs = if_addrs::get_if_addrs().map_err(AittError::System)?;
  let datalink_macs: std::collections::HashMap<String, String> = pnet::datalink::interfaces()
    .into_iter()
    .map(|i| (i.name.clone(), format_mac(&i.mac)))
    .collect();

  let mut out = Vec::new();
  for addr in addrs {
    let if_addrs::Interface { name, addr, .. } = addr;
    let if_addrs::IfAddr::V4(v4) = addr else {
      continue;
    };
    let ip = IpAddr::V4(v4.ip);
    out.push(Interface {
      mac: datalink_macs.get(&name).cloned().unwrap_or_default(),
      broadcast: v4.broadcast.map(|b| b.to_string()).unwrap_or_default(),
      is_up: true, // getifaddrs only returns interfaces with IFF_RUNNING addresses
      is_loopback: ip.is_loopback(),
      multicast_enabled: !ip.is_loopback(),
      broadcast_enabled: v4.broadcast.is_some(),
      address: ip.to_string(),
      name,
    });
  }
  Ok(out)
}

/// The address of a single named interface, or [`AittError::InvalidArg`] if
/// it has no IPv4 address.
pub fn iface_addr(iface: &str) -> Result<std::net::Ipv4Addr> {
  interface_list()?
    .into_iter()
    .find(|i| i.name == iface)
    .and_then(|i| i.address.parse().ok())
    .ok_or_else(|| AittError::InvalidArg(format!("no IPv4 address on interface {iface}")))
}

/// First non-loopback, non-link-local IPv4 address found, used when
/// [`crate::AittOption::my_ip`] is unset.
pub fn default_my_ip() -> Result<std::net::Ipv4Addr> {
  interface_list()?
    .into_iter()
    .find(|i| i.is_up && !i.is_loopback)
    .and_then(|i| i.address.parse().ok())
    .ok_or_else(|| AittError::OperationFailed("no usable network interface".into()))
}

fn format_mac(mac: &pnet::datalink::MacAddr) -> String {
  mac.to_string()
}
