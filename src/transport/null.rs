//! Sentinel transport for an unloaded protocol, carried over from the
//! original `NullTransport` (`src/NullTransport.{h,cc}`): every operation
//! is a no-op, `subscribe` hands back [`NO_HANDLE`] rather than failing, so
//! callers that always route through the registry don't need a special
//! case for "protocol not available".

use super::{Message, SubscribeCallback, SubscribeHandle, Transport, TransportData, NO_HANDLE};
use crate::error::Result;
use crate::types::{Protocol, Qos};

pub struct NullTransport {
  protocol: Protocol,
}

impl NullTransport {
  pub fn new(protocol: Protocol) -> Self {
    NullTransport { protocol }
  }
}

impl Transport for NullTransport {
  fn protocol(&self) -> Protocol {
    self.protocol
  }

  fn publish(&self, _topic: &str, _data: &[u8], _qos: Qos, _retain: bool) -> Result<()> {
    Ok(())
  }

  fn publish_with_reply(
    &self,
    _topic: &str,
    _data: &[u8],
    _qos: Qos,
    _retain: bool,
    _reply_topic: &str,
    _correlation: &[u8],
  ) -> Result<()> {
    Ok(())
  }

  fn subscribe(
    &self,
    _topic: &str,
    _cb: SubscribeCallback,
    _data: Option<TransportData>,
    _qos: Qos,
  ) -> Result<SubscribeHandle> {
    Ok(NO_HANDLE)
  }

  fn unsubscribe(&self, _handle: SubscribeHandle) -> Result<Option<TransportData>> {
    Ok(None)
  }

  fn send_reply(&self, _msg: &Message, _data: &[u8], _qos: Qos, _retain: bool) -> Result<()> {
    Ok(())
  }

  fn count_subscribers(&self, _topic: &str) -> usize {
    0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_operation_is_a_silent_no_op() {
    let t = NullTransport::new(Protocol::Tcp);
    t.publish("t", b"x", Qos::AtMostOnce, false).expect("publish");
    assert_eq!(t.count_subscribers("t"), 0);
    let handle = t
      .subscribe("t", Box::new(|_, _| {}), None, Qos::AtMostOnce)
      .expect("subscribe");
    assert_eq!(handle, NO_HANDLE);
  }
}
