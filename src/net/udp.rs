//! Thin UDP socket wrapper, carried over from the original `UDP` class.
//!
//! `socket2` does the heavy lifting (multicast join/leave, interface
//! selection); this type just pins down the options AITT needs and keeps
//! the same shape the SRTP transport and `MainLoop::add_watch` expect: a
//! `RawFd` to watch, and `send`/`recv` that work in terms of `SocketAddr`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};

use crate::error::{AittError, Result};

/// A non-blocking IPv4 UDP socket, optionally joined to a multicast group.
pub struct UdpSocket {
  inner: Socket,
}

impl UdpSocket {
  /// Binds to `host:port`. Port `0` asks the OS to pick one; read it back
  /// with [`UdpSocket::local_addr`].
  pub fn bind(host: Ipv4Addr, port: u16) -> Result<Self> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))
      .map_err(AittError::System)?;
    socket.set_reuse_address(true).map_err(AittError::System)?;
    Self::set_common_options(&socket)?;
    socket
      .bind(&SocketAddr::V4(SocketAddrV4::new(host, port)).into())
      .map_err(AittError::System)?;
    socket.set_nonblocking(true).map_err(AittError::System)?;
    Ok(UdpSocket { inner: socket })
  }

  /// An unbound, unconnected socket used purely as a send handle.
  pub fn unbound() -> Result<Self> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))
      .map_err(AittError::System)?;
    Self::set_common_options(&socket)?;
    socket.set_nonblocking(true).map_err(AittError::System)?;
    Ok(UdpSocket { inner: socket })
  }

  /// `SO_BROADCAST` and disabled multicast loopback, required on every
  /// socket regardless of whether it ends up bound, sending, or receiving.
  fn set_common_options(socket: &Socket) -> Result<()> {
    socket.set_broadcast(true).map_err(AittError::System)?;
    socket.set_multicast_loop_v4(false).map_err(AittError::System)?;
    Ok(())
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    self
      .inner
      .local_addr()
      .map_err(AittError::System)?
      .as_socket()
      .ok_or_else(|| AittError::OperationFailed("socket has no local address".into()))
  }

  pub fn send(&self, data: &[u8], to: SocketAddr) -> Result<usize> {
    self.inner.send_to(data, &to.into()).map_err(AittError::System)
  }

  /// Reads one datagram. Returns `Ok(None)` on `EWOULDBLOCK`, the expected
  /// result of a spurious `MainLoop` wakeup on a level-triggered watch.
  pub fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
    use std::mem::MaybeUninit;
    // SAFETY: `recv_from` only ever writes into the buffer it's given, and
    // `socket2` reports back exactly how many bytes of `buf` were
    // initialized via its return value.
    let uninit = unsafe {
      std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<MaybeUninit<u8>>(), buf.len())
    };
    match self.inner.recv_from(uninit) {
      Ok((n, addr)) => {
        let addr = addr
          .as_socket()
          .ok_or_else(|| AittError::OperationFailed("peer has no socket address".into()))?;
        Ok(Some((n, addr)))
      }
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
      Err(e) => Err(AittError::System(e)),
    }
  }

  pub fn join_multicast(&self, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
    self.inner.join_multicast_v4(&group, &iface).map_err(AittError::System)
  }

  pub fn leave_multicast(&self, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
    self.inner.leave_multicast_v4(&group, &iface).map_err(AittError::System)
  }

  /// Source-specific multicast join: only datagrams from `source` are
  /// delivered for `group`, instead of every sender on the group.
  pub fn join_source_multicast(&self, source: Ipv4Addr, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
    self.inner.join_ssm_v4(&source, &group, &iface).map_err(AittError::System)
  }

  pub fn leave_source_multicast(&self, source: Ipv4Addr, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
    self.inner.leave_ssm_v4(&source, &group, &iface).map_err(AittError::System)
  }

  pub fn set_multicast_interface(&self, iface: Ipv4Addr) -> Result<()> {
    self.inner.set_multicast_if_v4(&iface).map_err(AittError::System)
  }

  pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
    self.inner.set_multicast_ttl_v4(ttl).map_err(AittError::System)
  }

  /// Fd to hand to [`crate::mainloop::MainLoop::add_watch`].
  pub fn raw_handle(&self) -> RawFd {
    self.inner.as_raw_fd()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn loopback_send_recv_roundtrip() {
    let receiver = UdpSocket::bind(Ipv4Addr::LOCALHOST, 0).expect("bind");
    let addr = receiver.local_addr().expect("local_addr");
    let sender = UdpSocket::unbound().expect("unbound");

    sender.send(b"hello", addr).expect("send");

    let mut buf = [0u8; 64];
    // recv is non-blocking; the datagram is already queued by the time we
    // get here for a loopback send to a bound socket.
    let mut got = None;
    for _ in 0..1000 {
      if let Some(result) = receiver.recv(&mut buf).expect("recv") {
        got = Some(result);
        break;
      }
    }
    let (n, _from) = got.expect("datagram arrived");
    assert_eq!(&buf[..n], b"hello");
  }

  #[test]
  fn recv_without_data_returns_none() {
    let socket = UdpSocket::bind(Ipv4Addr::LOCALHOST, 0).expect("bind");
    let mut buf = [0u8; 16];
    assert!(socket.recv(&mut buf).expect("recv").is_none());
  }

  #[test]
  fn source_specific_multicast_join_and_leave_round_trip() {
    let socket = UdpSocket::bind(Ipv4Addr::UNSPECIFIED, 0).expect("bind");
    let source = Ipv4Addr::new(127, 0, 0, 1);
    let group = Ipv4Addr::new(239, 1, 2, 3);
    let iface = Ipv4Addr::UNSPECIFIED;
    socket.join_source_multicast(source, group, iface).expect("join_ssm");
    socket.leave_source_multicast(source, group, iface).expect("leave_ssm");
  }
}
