//! Shared wire-adjacent vocabulary: protocols, QoS, peer/subscription ids.

use enumflags2::{bitflags, BitFlags};

/// A peer identity: a short opaque string, unique per connected instance.
pub type PeerId = String;

/// Transport protocol a publish/subscribe call can be routed over.
///
/// `BUS` is the default broker-mediated channel; the rest are broker-less
/// direct transports. A publish/subscribe call may target more than one at
/// once, hence the bitflag representation (`spec.md` §4.7 "composite
/// handle").
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
  Bus = 0x1,
  Tcp = 0x2,
  TcpSecure = 0x4,
  UdpSrtp = 0x8,
}

pub type ProtocolSet = BitFlags<Protocol>;

/// Message delivery guarantee, independent of protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qos {
  AtMostOnce,
  AtLeastOnce,
  ExactlyOnce,
}

impl Default for Qos {
  fn default() -> Self {
    Qos::AtMostOnce
  }
}

/// Opaque id returned by `ModuleRegistry`/`Transport` subscriptions, and
/// reused by `Discovery` for listener registrations. Monotonically
/// allocated; never reused within a process lifetime.
pub type RegistrationId = u64;
