//! SRTP/UDP transport: the [`crate::srtp::SrtpEnvelope`] wrapped in the
//! same `Transport` contract every other module satisfies. Unlike TCP,
//! there is no per-connection handshake to carry a topic, so each
//! plaintext datagram (before SRTP protection) is prefixed with its own
//! 2-byte-length-prefixed topic.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{Message, SubscribeCallback, SubscribeHandle, Transport, TransportData};
use crate::error::{AittError, Result};
use crate::srtp::SrtpEnvelope;
use crate::types::{Protocol, Qos};

const MAX_DATAGRAM_PAYLOAD: usize = 1200; // spec.md §8 invariant 4

struct Subscription {
  topic: String,
  cb: SubscribeCallback,
  data: Option<TransportData>,
}

pub struct UdpSrtpTransport {
  envelope: SrtpEnvelope,
  peers: Mutex<Vec<SocketAddr>>,
  subscriptions: Mutex<HashMap<SubscribeHandle, Subscription>>,
  next_handle: AtomicU64,
}

impl UdpSrtpTransport {
  pub fn bind(my_ip: Ipv4Addr, key: &[u8]) -> Result<Self> {
    Ok(UdpSrtpTransport {
      envelope: crate::srtp::bind(my_ip, 0, key)?,
      peers: Mutex::new(Vec::new()),
      subscriptions: Mutex::new(HashMap::new()),
      next_handle: AtomicU64::new(1),
    })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    self.envelope.local_addr()
  }

  pub fn add_peer(&self, peer: SocketAddr) {
    let mut peers = self.peers.lock().expect("peers lock");
    if !peers.contains(&peer) {
      peers.push(peer);
    }
  }

  pub fn raw_handle(&self) -> RawFd {
    self.envelope.raw_handle()
  }

  /// Reads and dispatches one pending datagram; a no-op (returns) on
  /// `EWOULDBLOCK`.
  pub fn readable(&self) -> Result<()> {
    let Some((plaintext, _from)) = self.envelope.recv(MAX_DATAGRAM_PAYLOAD)? else {
      return Ok(());
    };
    if plaintext.len() < 2 {
      return Err(AittError::OperationFailed("UDP_SRTP payload shorter than topic header".into()));
    }
    let topic_len = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
    if plaintext.len() < 2 + topic_len {
      return Err(AittError::OperationFailed("UDP_SRTP payload truncated".into()));
    }
    let topic = String::from_utf8_lossy(&plaintext[2..2 + topic_len]).into_owned();
    let payload = plaintext[2 + topic_len..].to_vec();

    let msg = Message { topic: topic.clone(), payload, reply_topic: None, correlation: None };
    let mut subs = self.subscriptions.lock().expect("subscriptions lock");
    for sub in subs.values_mut() {
      if sub.topic == topic {
        (sub.cb)(&msg, sub.data.as_mut());
      }
    }
    Ok(())
  }
}

impl Transport for UdpSrtpTransport {
  fn protocol(&self) -> Protocol {
    Protocol::UdpSrtp
  }

  fn publish(&self, topic: &str, data: &[u8], _qos: Qos, _retain: bool) -> Result<()> {
    let mut plaintext = Vec::with_capacity(2 + topic.len() + data.len());
    plaintext.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    plaintext.extend_from_slice(topic.as_bytes());
    plaintext.extend_from_slice(data);

    let peers = self.peers.lock().expect("peers lock").clone();
    for peer in peers {
      self.envelope.send(&plaintext, peer)?;
    }
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
    Err(AittError::NotSupported("UDP_SRTP transport does not support reply metadata".into()))
  }

  fn subscribe(
    &self,
    topic: &str,
    cb: SubscribeCallback,
    data: Option<TransportData>,
    _qos: Qos,
  ) -> Result<SubscribeHandle> {
    let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
    self
      .subscriptions
      .lock()
      .expect("subscriptions lock")
      .insert(handle, Subscription { topic: topic.to_string(), cb, data });
    Ok(handle)
  }

  fn unsubscribe(&self, handle: SubscribeHandle) -> Result<Option<TransportData>> {
    Ok(self.subscriptions.lock().expect("subscriptions lock").remove(&handle).and_then(|s| s.data))
  }

  fn send_reply(&self, _msg: &Message, _data: &[u8], _qos: Qos, _retain: bool) -> Result<()> {
    Err(AittError::NotSupported("UDP_SRTP transport does not support reply metadata".into()))
  }

  fn count_subscribers(&self, topic: &str) -> usize {
    self.subscriptions.lock().expect("subscriptions lock").values().filter(|s| s.topic == topic).count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn loopback_publish_is_observed_by_subscriber() {
    let key = [5u8; crate::srtp::KEY_LEN];
    let server = UdpSrtpTransport::bind(Ipv4Addr::LOCALHOST, &key).expect("bind server");
    let server_addr = server.local_addr().expect("local_addr");
    let client = UdpSrtpTransport::bind(Ipv4Addr::LOCALHOST, &key).expect("bind client");
    client.add_peer(server_addr);

    let received = std::sync::Arc::new(Mutex::new(Vec::new()));
    let received_cb = received.clone();
    server
      .subscribe(
        "room/1",
        Box::new(move |msg, _| received_cb.lock().unwrap().push(msg.payload.clone())),
        None,
        Qos::AtMostOnce,
      )
      .expect("subscribe");

    client.publish("room/1", b"hi", Qos::AtMostOnce, false).expect("publish");

    for _ in 0..1000 {
      server.readable().expect("readable");
      if !received.lock().unwrap().is_empty() {
        break;
      }
      std::thread::yield_now();
    }
    assert_eq!(received.lock().unwrap().as_slice(), [b"hi".to_vec()]);
  }
}
