//! Facade-construction options, carried over from the original
//! `AittOption`/`AittOption.cc`.

use serde::{Deserialize, Serialize};

/// Options supplied when a facade is constructed.
///
/// Kept deliberately small and `serde`-derivable so a host application can
/// load it from whatever configuration format it already uses; the crate
/// itself does not pick a file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AittOption {
  /// Overrides interface auto-detection; if empty, the facade asks
  /// `crate::net::netutil` for the first non-loopback IPv4 address.
  pub my_ip: Option<String>,

  /// If set, the Bus Client is asked to discard any retained/queued state
  /// for this peer id before `connect` completes. Mirrors the original's
  /// `clear_session` flag, which is otherwise indistinguishable from a
  /// fresh peer id to the rest of the system.
  pub clear_session: bool,

  /// If set, the Module Registry loads a custom Bus Client backend (via
  /// `ModuleRegistry::new_custom_bus_client`) instead of the built-in one.
  pub custom_broker: Option<String>,

  /// PEM-encoded self-signed certificate and matching private key shared
  /// out-of-band with peers. Required to bring up `TCP_SECURE`; without it
  /// the Module Registry falls back to the null transport for that
  /// protocol.
  pub tcp_secure_cert_pem: Option<Vec<u8>>,
  pub tcp_secure_key_pem: Option<Vec<u8>>,

  /// Pre-shared AES-256 key for `UDP_SRTP` (see `crate::srtp::KEY_LEN`).
  /// Required to bring up `UDP_SRTP`; without it the Module Registry falls
  /// back to the null transport for that protocol.
  pub udp_srtp_key: Option<Vec<u8>>,
}

impl Default for AittOption {
  fn default() -> Self {
    AittOption {
      my_ip: None,
      clear_session: false,
      custom_broker: None,
      tcp_secure_cert_pem: None,
      tcp_secure_key_pem: None,
      udp_srtp_key: None,
    }
  }
}

impl AittOption {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_my_ip(mut self, ip: impl Into<String>) -> Self {
    self.my_ip = Some(ip.into());
    self
  }

  pub fn with_clear_session(mut self, clear: bool) -> Self {
    self.clear_session = clear;
    self
  }

  pub fn with_custom_broker(mut self, name: impl Into<String>) -> Self {
    self.custom_broker = Some(name.into());
    self
  }

  pub fn with_tcp_secure_identity(mut self, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
    self.tcp_secure_cert_pem = Some(cert_pem);
    self.tcp_secure_key_pem = Some(key_pem);
    self
  }

  pub fn with_udp_srtp_key(mut self, key: Vec<u8>) -> Self {
    self.udp_srtp_key = Some(key);
    self
  }
}
