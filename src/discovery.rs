//! Peer-discovery plane, carried over from the original `AittDiscovery`:
//! publishes this process's reachability as a `flexbuffers`-encoded record
//! on a reserved topic, and dispatches inbound records to per-protocol
//! listeners.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::bus::BusClient;
use crate::error::{AittError, Result};
use crate::types::{PeerId, Protocol, Qos, RegistrationId};

/// Never exposed to user-level subscriptions (`spec.md` §3 invariant 1).
pub const DISCOVERY_TOPIC: &str = "aitt/discovery";

pub const STATUS_CONNECTED: &str = "connected";
pub const STATUS_DISCONNECTED: &str = "disconnected";

/// Invoked once per inbound discovery record, per registered listener, as
/// `(sender_id, status, sub_blob)`. `sub_blob` is empty if the protocol
/// this listener registered for isn't present in the record.
pub type DiscoveryCallback = Box<dyn FnMut(&PeerId, &str, &[u8]) + Send>;

/// Wire record, matching the comment block at the bottom of the original's
/// `AittDiscovery.h`:
/// ```text
/// map {
///   "status": "connected",
///   "tcp": Blob Data for tcp Module,
///   ...
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Record {
  status: String,
  #[serde(flatten)]
  protocols: BTreeMap<String, serde_bytes::ByteBuf>,
}

fn protocol_tag(protocol: Protocol) -> &'static str {
  match protocol {
    Protocol::Bus => "bus",
    Protocol::Tcp => "tcp",
    Protocol::TcpSecure => "tcp_secure",
    Protocol::UdpSrtp => "udp_srtp",
  }
}

fn encode(record: &Record) -> Result<Vec<u8>> {
  let mut builder = flexbuffers::FlexbufferSerializer::new();
  record
    .serialize(&mut builder)
    .map_err(|e| AittError::OperationFailed(format!("discovery record encode: {e}")))?;
  Ok(builder.take_buffer())
}

fn decode(bytes: &[u8]) -> Result<Record> {
  let reader = flexbuffers::Reader::get_root(bytes)
    .map_err(|e| AittError::OperationFailed(format!("discovery record decode: {e}")))?;
  Record::deserialize(reader)
    .map_err(|e| AittError::OperationFailed(format!("discovery record decode: {e}")))
}

#[derive(Clone)]
struct Listener {
  protocol: Protocol,
  cb: Arc<Mutex<DiscoveryCallback>>,
}

/// Peer-discovery plane. Owns one Bus Client subscription on
/// [`DISCOVERY_TOPIC`] for its whole lifetime; registering/removing
/// per-protocol listeners never touches the Bus Client.
pub struct Discovery {
  id: PeerId,
  bus: Arc<dyn BusClient>,
  record: Mutex<Record>,
  listeners: Arc<Mutex<BTreeMap<RegistrationId, Listener>>>,
  next_listener_id: AtomicU64,
  subscription: Mutex<Option<RegistrationId>>,
}

impl Discovery {
  pub fn new(id: PeerId, bus: Arc<dyn BusClient>) -> Self {
    Discovery {
      id,
      bus,
      record: Mutex::new(Record { status: STATUS_DISCONNECTED.to_string(), protocols: BTreeMap::new() }),
      listeners: Arc::new(Mutex::new(BTreeMap::new())),
      next_listener_id: AtomicU64::new(1),
      subscription: Mutex::new(None),
    }
  }

  /// Publishes `{"status":"connected", ...}` with the will set to
  /// `{"status":"disconnected"}`, and subscribes to inbound records.
  pub fn start(&self, host: &str, port: u16, username: Option<&str>, password: Option<&str>) -> Result<()> {
    self.bus.connect(host, port, username, password)?;

    let will = encode(&Record { status: STATUS_DISCONNECTED.to_string(), protocols: BTreeMap::new() })?;
    self.bus.set_will(DISCOVERY_TOPIC, &will, true)?;

    {
      let mut record = self.record.lock().expect("record lock");
      record.status = STATUS_CONNECTED.to_string();
    }
    self.publish_record()?;

    let id = self.id.clone();
    let listeners = self.listeners.clone();
    let handle = self.bus.subscribe(
      DISCOVERY_TOPIC,
      Box::new(move |sender, _topic, payload| {
        dispatch(&id, sender, payload, &listeners);
      }),
      Qos::AtLeastOnce,
    )?;
    *self.subscription.lock().expect("subscription lock") = Some(handle);
    Ok(())
  }

  /// Replaces `protocol`'s sub-blob and republishes the full record.
  pub fn update(&self, protocol: Protocol, blob: &[u8]) -> Result<()> {
    {
      let mut record = self.record.lock().expect("record lock");
      record
        .protocols
        .insert(protocol_tag(protocol).to_string(), serde_bytes::ByteBuf::from(blob.to_vec()));
    }
    self.publish_record()
  }

  /// Publishes `{"status":"disconnected"}` and unsubscribes.
  pub fn stop(&self) -> Result<()> {
    if let Some(handle) = self.subscription.lock().expect("subscription lock").take() {
      self.bus.unsubscribe(handle)?;
    }
    let disconnected = encode(&Record { status: STATUS_DISCONNECTED.to_string(), protocols: BTreeMap::new() })?;
    self.bus.publish(DISCOVERY_TOPIC, &disconnected, Qos::AtLeastOnce, true)?;
    self.bus.disconnect()
  }

  /// Registers a listener for inbound records concerning `protocol`.
  /// Returns an opaque, monotonically allocated id usable with
  /// [`Discovery::remove_discovery_cb`].
  pub fn add_discovery_cb(&self, protocol: Protocol, cb: DiscoveryCallback) -> RegistrationId {
    let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
    self
      .listeners
      .lock()
      .expect("listeners lock")
      .insert(id, Listener { protocol, cb: Arc::new(Mutex::new(cb)) });
    id
  }

  /// Safe to call from inside a dispatch callback: removal takes effect on
  /// the next dispatch, since each dispatch holds its own snapshot of the
  /// listener list (`spec.md` §4.5 invariant).
  pub fn remove_discovery_cb(&self, id: RegistrationId) {
    self.listeners.lock().expect("listeners lock").remove(&id);
  }

  fn publish_record(&self) -> Result<()> {
    let bytes = encode(&self.record.lock().expect("record lock"))?;
    self.bus.publish(DISCOVERY_TOPIC, &bytes, Qos::AtLeastOnce, true)
  }
}

/// Parses one inbound record and fans it out to every registered listener.
/// Clones the `Arc<Mutex<DiscoveryCallback>>` handles out from under the
/// `listeners` lock and releases it before calling any of them, so a
/// listener that calls `remove_discovery_cb` (or registers a new one)
/// mid-dispatch never re-locks the same mutex it's being called under.
fn dispatch(
  local_id: &PeerId,
  sender: &PeerId,
  payload: &[u8],
  listeners: &Mutex<BTreeMap<RegistrationId, Listener>>,
) {
  if sender == local_id {
    return;
  }
  let record = match decode(payload) {
    Ok(r) => r,
    Err(e) => {
      log::warn!("Discovery: dropping malformed record from {sender}: {e}");
      return;
    }
  };

  let snapshot: Vec<Listener> = listeners.lock().expect("listeners lock").values().cloned().collect();
  for listener in snapshot {
    let sub_blob = record
      .protocols
      .get(protocol_tag(listener.protocol))
      .map(|b| b.as_slice())
      .unwrap_or(&[]);
    (listener.cb.lock().expect("listener cb lock"))(sender, &record.status, sub_blob);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::MockBusClient;
  use std::sync::Arc;

  #[test]
  fn listener_sees_exactly_one_connected_record() {
    let bus_a = Arc::new(MockBusClient::new("a"));
    let bus_b = Arc::new(MockBusClient::paired_with("b", &bus_a));

    let discovery_a = Discovery::new("a".to_string(), bus_a.clone());
    let discovery_b = Discovery::new("b".to_string(), bus_b.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    discovery_b.add_discovery_cb(
      Protocol::Tcp,
      Box::new(move |sender, status, _blob| {
        seen_cb.lock().unwrap().push((sender.clone(), status.to_string()));
      }),
    );
    discovery_b.start("127.0.0.1", 1883, None, None).expect("b start");
    discovery_a.start("127.0.0.1", 1883, None, None).expect("a start");

    let got = seen.lock().unwrap();
    assert_eq!(got.as_slice(), [("a".to_string(), STATUS_CONNECTED.to_string())]);
  }

  #[test]
  fn leave_via_will_delivers_disconnected_record() {
    let bus_a = Arc::new(MockBusClient::new("a"));
    let bus_b = Arc::new(MockBusClient::paired_with("b", &bus_a));

    let discovery_a = Discovery::new("a".to_string(), bus_a.clone());
    let discovery_b = Discovery::new("b".to_string(), bus_b.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    discovery_b.add_discovery_cb(
      Protocol::Tcp,
      Box::new(move |sender, status, _blob| {
        seen_cb.lock().unwrap().push((sender.clone(), status.to_string()));
      }),
    );
    discovery_b.start("127.0.0.1", 1883, None, None).expect("b start");
    discovery_a.start("127.0.0.1", 1883, None, None).expect("a start");

    bus_a.simulate_unclean_disconnect();

    let got = seen.lock().unwrap();
    assert_eq!(
      got.as_slice(),
      [
        ("a".to_string(), STATUS_CONNECTED.to_string()),
        ("a".to_string(), STATUS_DISCONNECTED.to_string()),
      ]
    );
  }

  #[test]
  fn remove_discovery_cb_from_inside_a_callback_does_not_deadlock() {
    let bus_a = Arc::new(MockBusClient::new("a"));
    let bus_b = Arc::new(MockBusClient::paired_with("b", &bus_a));

    let discovery_a = Discovery::new("a".to_string(), bus_a.clone());
    let discovery_b = Discovery::new("b".to_string(), bus_b.clone());

    let discovery_b = Arc::new(discovery_b);
    let self_id: Arc<Mutex<Option<RegistrationId>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(0u32));

    let discovery_b_cb = discovery_b.clone();
    let self_id_cb = self_id.clone();
    let seen_cb = seen.clone();
    let id = discovery_b.add_discovery_cb(
      Protocol::Tcp,
      Box::new(move |_sender, _status, _blob| {
        *seen_cb.lock().unwrap() += 1;
        if let Some(id) = *self_id_cb.lock().unwrap() {
          discovery_b_cb.remove_discovery_cb(id);
        }
      }),
    );
    *self_id.lock().unwrap() = Some(id);

    discovery_b.start("127.0.0.1", 1883, None, None).expect("b start");
    discovery_a.start("127.0.0.1", 1883, None, None).expect("a start");
    assert_eq!(*seen.lock().unwrap(), 1);

    discovery_a.update(Protocol::Tcp, b"again").expect("update");
    assert_eq!(*seen.lock().unwrap(), 1, "listener removed itself, should not fire again");
  }

  #[test]
  fn update_replaces_sub_blob_and_republishes() {
    let bus_a = Arc::new(MockBusClient::new("a"));
    let bus_b = Arc::new(MockBusClient::paired_with("b", &bus_a));

    let discovery_a = Discovery::new("a".to_string(), bus_a.clone());
    let discovery_b = Discovery::new("b".to_string(), bus_b.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    discovery_b.add_discovery_cb(
      Protocol::Tcp,
      Box::new(move |_sender, _status, blob| seen_cb.lock().unwrap().push(blob.to_vec())),
    );
    discovery_b.start("127.0.0.1", 1883, None, None).expect("b start");
    discovery_a.start("127.0.0.1", 1883, None, None).expect("a start");
    discovery_a.update(Protocol::Tcp, b"127.0.0.1:9000").expect("update");

    let got = seen.lock().unwrap();
    assert_eq!(got.last().unwrap(), b"127.0.0.1:9000");
  }
}
