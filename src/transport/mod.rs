//! Uniform publish/subscribe contract every transport module satisfies
//! (`spec.md` §4.6), replacing the original's `TransportModule`
//! inheritance hierarchy with a capability record: one `Box<dyn Transport>`
//! per protocol, stored by the [`crate::registry::ModuleRegistry`].

mod null;
mod tcp;
#[cfg(feature = "tcp-secure")]
mod tcp_secure;
#[cfg(feature = "udp-srtp")]
mod udp_srtp;

pub use null::NullTransport;
pub use tcp::TcpTransport;
#[cfg(feature = "tcp-secure")]
pub use tcp_secure::TcpSecureTransport;
#[cfg(feature = "udp-srtp")]
pub use udp_srtp::UdpSrtpTransport;

use std::any::Any;

use crate::error::Result;
use crate::types::{Protocol, Qos, RegistrationId};

/// Opaque per-subscribe user data, handed back unmodified on every
/// callback invocation and returned to the caller by `unsubscribe` — the
/// same contract `crate::mainloop::MainLoopData` uses for watch/idle/timer
/// sources.
pub type TransportData = Box<dyn Any + Send>;

/// `0` is reserved for [`NullTransport::subscribe`], which "returns no
/// handle" per `spec.md` §4.4.
pub type SubscribeHandle = RegistrationId;
pub const NO_HANDLE: SubscribeHandle = 0;

/// One inbound message, as delivered to a subscribe callback. Carries the
/// reply metadata the sender attached via `publish_with_reply`, if any, so
/// a handler can answer with `Transport::send_reply`.
#[derive(Debug, Clone)]
pub struct Message {
  pub topic: String,
  pub payload: Vec<u8>,
  pub reply_topic: Option<String>,
  pub correlation: Option<Vec<u8>>,
}

pub type SubscribeCallback = Box<dyn FnMut(&Message, Option<&mut TransportData>) + Send>;

/// A single wire protocol's publish/subscribe surface.
pub trait Transport: Send {
  fn protocol(&self) -> Protocol;

  /// Fire-and-forget publish.
  fn publish(&self, topic: &str, data: &[u8], qos: Qos, retain: bool) -> Result<()>;

  /// Same as `publish`, but stamps reply metadata onto the outgoing frame.
  /// Only the Bus Client-backed transport is required to implement this
  /// meaningfully; direct transports may return
  /// [`crate::error::AittError::NotSupported`].
  fn publish_with_reply(
    &self,
    topic: &str,
    data: &[u8],
    qos: Qos,
    retain: bool,
    reply_topic: &str,
    correlation: &[u8],
  ) -> Result<()>;

  fn subscribe(
    &self,
    topic: &str,
    cb: SubscribeCallback,
    data: Option<TransportData>,
    qos: Qos,
  ) -> Result<SubscribeHandle>;

  /// Returns the user data originally registered with `subscribe`.
  fn unsubscribe(&self, handle: SubscribeHandle) -> Result<Option<TransportData>>;

  /// Completes a reply correlated via `publish_with_reply`.
  fn send_reply(&self, msg: &Message, data: &[u8], qos: Qos, retain: bool) -> Result<()>;

  fn count_subscribers(&self, topic: &str) -> usize;
}
