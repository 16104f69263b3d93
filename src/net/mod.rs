//! Sockets and interface introspection shared by the direct transports.

pub mod netutil;
pub mod udp;

pub use netutil::{default_my_ip, iface_addr, interface_list, Interface};
pub use udp::UdpSocket;
