//! Abstract pub/sub primitives the broker-mediated default protocol needs.
//! `spec.md` treats the concrete broker client as an opaque external
//! collaborator; this module gives that collaborator a trait so
//! [`crate::discovery::Discovery`] and the facade can be written and
//! tested without a live MQTT broker. `MockBusClient` is test-only
//! plumbing, grounded on the original's `mock/mosquitto.cc` +
//! `mock/MQTTMock.h`, which exist for exactly this purpose (driving
//! `tests/MQ_test.cc` without a real broker).

use crate::error::Result;
use crate::types::{PeerId, Qos, RegistrationId};

pub type BusMessageCallback = Box<dyn FnMut(&PeerId, &str, &[u8]) + Send>;
pub type ConnectionCallback = Box<dyn FnMut(bool) + Send>;

/// What `spec.md` §2/§4.7/§6 calls the Bus Client: the broker-mediated
/// pub/sub backend.
pub trait BusClient: Send {
  fn id(&self) -> &PeerId;

  fn connect(&self, host: &str, port: u16, username: Option<&str>, password: Option<&str>) -> Result<()>;
  fn disconnect(&self) -> Result<()>;

  /// Sets the message published on this client's behalf if it disconnects
  /// without calling `disconnect` first (socket drop, crash, network
  /// partition) — the mechanism `Discovery::stop` relies on for S2.
  fn set_will(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

  fn set_connection_callback(&self, cb: ConnectionCallback);

  fn publish(&self, topic: &str, payload: &[u8], qos: Qos, retain: bool) -> Result<()>;
  fn subscribe(&self, topic_filter: &str, cb: BusMessageCallback, qos: Qos) -> Result<RegistrationId>;
  fn unsubscribe(&self, handle: RegistrationId) -> Result<()>;
}

/// MQTT-style topic filter match: `+` matches exactly one level, `#` (only
/// valid as the final level) matches the rest of the topic, including
/// zero remaining levels.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
  let mut filter_levels = filter.split('/');
  let mut topic_levels = topic.split('/');
  loop {
    match (filter_levels.next(), topic_levels.next()) {
      (Some("#"), _) => return true,
      (Some("+"), Some(_)) => continue,
      (Some(f), Some(t)) if f == t => continue,
      (None, None) => return true,
      _ => return false,
    }
  }
}

#[cfg(any(test, feature = "testing"))]
pub use mock::MockBusClient;

#[cfg(any(test, feature = "testing"))]
mod mock {
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
  use std::sync::{Arc, Mutex};

  use super::{topic_matches, BusClient, BusMessageCallback, ConnectionCallback};
  use crate::error::Result;
  use crate::types::{PeerId, Qos, RegistrationId};

  struct Subscriber {
    filter: String,
    cb: BusMessageCallback,
  }

  struct Will {
    topic: String,
    payload: Vec<u8>,
    retain: bool,
  }

  #[derive(Default)]
  struct Broker {
    retained: HashMap<String, (PeerId, Vec<u8>)>,
    subscribers: HashMap<RegistrationId, Subscriber>,
    wills: HashMap<PeerId, Will>,
  }

  impl Broker {
    fn dispatch(&mut self, sender: &PeerId, topic: &str, payload: &[u8], retain: bool) {
      if retain {
        self.retained.insert(topic.to_string(), (sender.clone(), payload.to_vec()));
      }
      for sub in self.subscribers.values_mut() {
        if topic_matches(&sub.filter, topic) {
          (sub.cb)(sender, topic, payload);
        }
      }
    }
  }

  /// An in-process stand-in for a live broker connection, letting
  /// `Discovery`/facade tests exercise join/update/leave without a real
  /// MQTT server. Every `MockBusClient` sharing the same `Arc<Mutex<Broker>>`
  /// (construct with [`MockBusClient::paired_with`]) behaves as if they were
  /// peers talking to the same broker.
  pub struct MockBusClient {
    id: PeerId,
    broker: Arc<Mutex<Broker>>,
    connected: AtomicBool,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    own_handles: Mutex<Vec<RegistrationId>>,
  }

  impl MockBusClient {
    pub fn new(id: impl Into<PeerId>) -> Self {
      MockBusClient {
        id: id.into(),
        broker: Arc::new(Mutex::new(Broker::default())),
        connected: AtomicBool::new(false),
        connection_cb: Mutex::new(None),
        own_handles: Mutex::new(Vec::new()),
      }
    }

    /// Builds a client that shares `other`'s broker state, simulating a
    /// second peer connected to the same network.
    pub fn paired_with(id: impl Into<PeerId>, other: &MockBusClient) -> Self {
      MockBusClient {
        id: id.into(),
        broker: other.broker.clone(),
        connected: AtomicBool::new(false),
        connection_cb: Mutex::new(None),
        own_handles: Mutex::new(Vec::new()),
      }
    }

    /// Simulates an unclean disconnect (crash, network partition): the
    /// will is published, but `disconnect()` is never called, and
    /// `MockBusClient` itself isn't dropped either — matching "A
    /// terminates without calling stop()" in S2 (a live process that
    /// simply stops servicing its socket looks the same to the broker as
    /// one that's gone).
    pub fn simulate_unclean_disconnect(&self) {
      self.connected.store(false, Ordering::SeqCst);
      let will = self.broker.lock().expect("broker lock").wills.remove(&self.id);
      if let Some(will) = will {
        let mut broker = self.broker.lock().expect("broker lock");
        broker.dispatch(&self.id, &will.topic, &will.payload, will.retain);
      }
    }
  }

  static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

  impl BusClient for MockBusClient {
    fn id(&self) -> &PeerId {
      &self.id
    }

    fn connect(&self, _host: &str, _port: u16, _username: Option<&str>, _password: Option<&str>) -> Result<()> {
      self.connected.store(true, Ordering::SeqCst);
      if let Some(cb) = self.connection_cb.lock().expect("connection_cb lock").as_mut() {
        cb(true);
      }
      Ok(())
    }

    fn disconnect(&self) -> Result<()> {
      self.connected.store(false, Ordering::SeqCst);
      self.broker.lock().expect("broker lock").wills.remove(&self.id);
      if let Some(cb) = self.connection_cb.lock().expect("connection_cb lock").as_mut() {
        cb(false);
      }
      Ok(())
    }

    fn set_will(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
      self.broker.lock().expect("broker lock").wills.insert(
        self.id.clone(),
        Will { topic: topic.to_string(), payload: payload.to_vec(), retain },
      );
      Ok(())
    }

    fn set_connection_callback(&self, cb: ConnectionCallback) {
      *self.connection_cb.lock().expect("connection_cb lock") = Some(cb);
    }

    fn publish(&self, topic: &str, payload: &[u8], _qos: Qos, retain: bool) -> Result<()> {
      self.broker.lock().expect("broker lock").dispatch(&self.id, topic, payload, retain);
      Ok(())
    }

    fn subscribe(&self, topic_filter: &str, mut cb: BusMessageCallback, _qos: Qos) -> Result<RegistrationId> {
      let handle = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
      let mut broker = self.broker.lock().expect("broker lock");

      // Late joiners see current retained state, matching `spec.md` §3
      // "the Bus Client retains the last record per peer".
      for (topic, (sender, payload)) in broker.retained.clone() {
        if topic_matches(topic_filter, &topic) {
          cb(&sender, &topic, &payload);
        }
      }

      broker.subscribers.insert(handle, Subscriber { filter: topic_filter.to_string(), cb });
      drop(broker);
      self.own_handles.lock().expect("own_handles lock").push(handle);
      Ok(handle)
    }

    fn unsubscribe(&self, handle: RegistrationId) -> Result<()> {
      self.broker.lock().expect("broker lock").subscribers.remove(&handle);
      self.own_handles.lock().expect("own_handles lock").retain(|h| *h != handle);
      Ok(())
    }
  }

  impl Drop for MockBusClient {
    fn drop(&mut self) {
      let handles = std::mem::take(&mut *self.own_handles.lock().expect("own_handles lock"));
      let mut broker = self.broker.lock().expect("broker lock");
      for handle in handles {
        broker.subscribers.remove(&handle);
      }
    }
  }

}
