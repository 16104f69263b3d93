//! The `Aitt` facade, carried over from the original's top-level `AITT`
//! class: the one thing a user-facing caller touches. Owns Discovery and
//! the Module Registry, dispatches a `publish`/`subscribe` call's protocol
//! bitset across the Bus Client and whichever direct transports it names,
//! and queues calls made before `connect()` succeeds.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::bus::BusClient;
use crate::discovery::Discovery;
use crate::error::{AittError, Result};
use crate::option::AittOption;
use crate::registry::ModuleRegistry;
use crate::transport::{Message, SubscribeCallback, TransportData};
use crate::types::{PeerId, ProtocolSet, Protocol, Qos, RegistrationId};

/// One per-protocol handle making up a [`SubscriptionHandle`].
enum ProtocolHandle {
  Bus(RegistrationId),
  Direct(Protocol, crate::transport::SubscribeHandle),
}

/// A subscription's registration state. Starts `Queued` if `subscribe()`
/// was called before `connect()` succeeded, moves to `Registered` once
/// `flush_pending` performs the real registration, and moves to
/// `Cancelled` if `unsubscribe` is called in the meantime (so flushing a
/// subscription that was already unsubscribed while still queued is a
/// no-op instead of registering something the caller already gave up).
enum SubscriptionState {
  Queued,
  Registered(Vec<ProtocolHandle>),
  Cancelled,
}

/// Composite handle returned by [`Aitt::subscribe`]; records, in order,
/// the per-protocol handles so `unsubscribe` can reverse them
/// (`spec.md` §4.7). Shared with the pending queue entry when the
/// subscribe call itself was queued, so the handle is valid to hold and
/// later unsubscribe even before `connect()` flushes it.
pub struct SubscriptionHandle {
  state: Arc<Mutex<SubscriptionState>>,
}

enum QueuedCall {
  Publish { topic: String, data: Vec<u8>, protocols: ProtocolSet, qos: Qos, retain: bool },
  Subscribe {
    topic: String,
    cb: Arc<Mutex<SubscribeCallback>>,
    protocols: ProtocolSet,
    qos: Qos,
    state: Arc<Mutex<SubscriptionState>>,
  },
}

pub struct Aitt {
  id: PeerId,
  bus: Arc<dyn BusClient>,
  discovery: Discovery,
  registry: ModuleRegistry,
  connected: Mutex<bool>,
  pending: Mutex<VecDeque<QueuedCall>>,
  connection_cb: Mutex<Option<Box<dyn FnMut(bool) + Send>>>,
}

impl Aitt {
  pub fn new(id: impl Into<PeerId>, bus: Arc<dyn BusClient>, option: &AittOption) -> Result<Self> {
    let id = id.into();
    let my_ip = match &option.my_ip {
      Some(ip) => ip.parse().map_err(|_| AittError::InvalidArg(format!("invalid my_ip {ip}")))?,
      None => crate::net::default_my_ip()?,
    };
    let registry = ModuleRegistry::new(my_ip, option)?;
    let discovery = Discovery::new(id.clone(), bus.clone());
    Ok(Aitt {
      id,
      bus,
      discovery,
      registry,
      connected: Mutex::new(false),
      pending: Mutex::new(VecDeque::new()),
      connection_cb: Mutex::new(None),
    })
  }

  pub fn id(&self) -> &PeerId {
    &self.id
  }

  /// Starts Discovery against the given broker and flushes any publishes
  /// queued before this call.
  pub fn connect(&self, host: &str, port: u16) -> Result<()> {
    self.discovery.start(host, port, None, None)?;
    *self.connected.lock().expect("connected lock") = true;
    if let Some(cb) = self.connection_cb.lock().expect("connection_cb lock").as_mut() {
      cb(true);
    }
    self.flush_pending()
  }

  pub fn disconnect(&self) -> Result<()> {
    self.discovery.stop()?;
    *self.connected.lock().expect("connected lock") = false;
    if let Some(cb) = self.connection_cb.lock().expect("connection_cb lock").as_mut() {
      cb(false);
    }
    Ok(())
  }

  pub fn set_connection_callback(&self, cb: Box<dyn FnMut(bool) + Send>) {
    *self.connection_cb.lock().expect("connection_cb lock") = Some(cb);
  }

  /// For a protocol bitset including `BUS`, delegates to the Bus Client;
  /// for each direct protocol bit, also delegates to that transport.
  /// Queued (unbounded FIFO) if called before `connect()` succeeds.
  pub fn publish(&self, topic: &str, data: &[u8], protocols: ProtocolSet, qos: Qos, retain: bool) -> Result<()> {
    if !*self.connected.lock().expect("connected lock") {
      self.pending.lock().expect("pending lock").push_back(QueuedCall::Publish {
        topic: topic.to_string(),
        data: data.to_vec(),
        protocols,
        qos,
        retain,
      });
      return Ok(());
    }
    self.publish_now(topic, data, protocols, qos, retain)
  }

  fn publish_now(&self, topic: &str, data: &[u8], protocols: ProtocolSet, qos: Qos, retain: bool) -> Result<()> {
    if protocols.contains(Protocol::Bus) {
      self.bus.publish(topic, data, qos, retain)?;
    }
    for protocol in [Protocol::Tcp, Protocol::TcpSecure, Protocol::UdpSrtp] {
      if protocols.contains(protocol) {
        self.registry.get(protocol)?.publish(topic, data, qos, retain)?;
      }
    }
    Ok(())
  }

  fn flush_pending(&self) -> Result<()> {
    let queued: Vec<_> = self.pending.lock().expect("pending lock").drain(..).collect();
    for call in queued {
      match call {
        QueuedCall::Publish { topic, data, protocols, qos, retain } => {
          self.publish_now(&topic, &data, protocols, qos, retain)?;
        }
        QueuedCall::Subscribe { topic, cb, protocols, qos, state } => {
          // The caller may have unsubscribed already while this was still
          // queued; honor that instead of registering something nobody
          // wants anymore.
          if matches!(*state.lock().expect("state lock"), SubscriptionState::Cancelled) {
            continue;
          }
          let parts = self.subscribe_now(&topic, cb, protocols, qos)?;
          *state.lock().expect("state lock") = SubscriptionState::Registered(parts);
        }
      }
    }
    Ok(())
  }

  /// Subscribes across every protocol bit set, returning a composite
  /// handle that reverses them in registration order on `unsubscribe`.
  /// Queued (unbounded FIFO) if called before `connect()` succeeds, the
  /// way `publish` already is — the returned handle is valid immediately
  /// either way.
  pub fn subscribe(
    &self,
    topic: &str,
    cb: SubscribeCallback,
    protocols: ProtocolSet,
    qos: Qos,
  ) -> Result<SubscriptionHandle> {
    // A `subscribe` call naming more than one protocol fans the same user
    // callback out to each transport's own callback slot; shared through a
    // mutex since `SubscribeCallback` is `FnMut`, not `Fn`.
    let shared_cb: Arc<Mutex<SubscribeCallback>> = Arc::new(Mutex::new(cb));

    if !*self.connected.lock().expect("connected lock") {
      let state = Arc::new(Mutex::new(SubscriptionState::Queued));
      self.pending.lock().expect("pending lock").push_back(QueuedCall::Subscribe {
        topic: topic.to_string(),
        cb: shared_cb,
        protocols,
        qos,
        state: state.clone(),
      });
      return Ok(SubscriptionHandle { state });
    }

    let parts = self.subscribe_now(topic, shared_cb, protocols, qos)?;
    Ok(SubscriptionHandle { state: Arc::new(Mutex::new(SubscriptionState::Registered(parts))) })
  }

  fn subscribe_now(
    &self,
    topic: &str,
    shared_cb: Arc<Mutex<SubscribeCallback>>,
    protocols: ProtocolSet,
    qos: Qos,
  ) -> Result<Vec<ProtocolHandle>> {
    let mut parts = Vec::new();

    if protocols.contains(Protocol::Bus) {
      let topic_owned = topic.to_string();
      let bus_cb = shared_cb.clone();
      let handle = self.bus.subscribe(
        topic,
        Box::new(move |_sender, topic, payload| {
          let msg = Message {
            topic: topic_owned.clone(),
            payload: payload.to_vec(),
            reply_topic: None,
            correlation: None,
          };
          (bus_cb.lock().expect("cb lock"))(&msg, None);
        }),
        qos,
      );
      match handle {
        Ok(h) => parts.push(ProtocolHandle::Bus(h)),
        Err(e) => {
          unwind(&self.registry, &self.bus, &parts);
          return Err(e);
        }
      }
    }

    for protocol in [Protocol::Tcp, Protocol::TcpSecure, Protocol::UdpSrtp] {
      if !protocols.contains(protocol) {
        continue;
      }
      let transport = match self.registry.get(protocol) {
        Ok(t) => t,
        Err(e) => {
          unwind(&self.registry, &self.bus, &parts);
          return Err(e);
        }
      };
      let trampoline_cb = shared_cb.clone();
      let trampoline: SubscribeCallback = Box::new(move |msg: &Message, data: Option<&mut TransportData>| {
        (trampoline_cb.lock().expect("shared_cb lock"))(msg, data);
      });
      match transport.subscribe(topic, trampoline, None, qos) {
        Ok(h) => parts.push(ProtocolHandle::Direct(protocol, h)),
        Err(e) => {
          unwind(&self.registry, &self.bus, &parts);
          return Err(e);
        }
      }
    }

    Ok(parts)
  }

  /// Reverses every per-protocol handle recorded by `subscribe`. A handle
  /// still sitting in the pending queue is marked cancelled instead, so
  /// `flush_pending` skips registering it once `connect()` succeeds.
  pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
    let mut state = handle.state.lock().expect("state lock");
    match std::mem::replace(&mut *state, SubscriptionState::Cancelled) {
      SubscriptionState::Registered(parts) => unwind(&self.registry, &self.bus, &parts),
      SubscriptionState::Queued | SubscriptionState::Cancelled => Ok(()),
    }
  }
}

fn unwind(registry: &ModuleRegistry, bus: &Arc<dyn BusClient>, parts: &[ProtocolHandle]) -> Result<()> {
  for part in parts {
    match part {
      ProtocolHandle::Bus(h) => bus.unsubscribe(*h)?,
      ProtocolHandle::Direct(protocol, h) => {
        registry.get(*protocol)?.unsubscribe(*h)?;
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::MockBusClient;

  fn new_aitt(id: &str, bus: Arc<dyn BusClient>) -> Aitt {
    let option = AittOption::new().with_my_ip("127.0.0.1");
    Aitt::new(id, bus, &option).expect("Aitt::new")
  }

  #[test]
  fn publish_dispatches_through_the_bus_client() {
    let bus_a = Arc::new(MockBusClient::new("a"));
    let bus_b = Arc::new(MockBusClient::paired_with("b", &bus_a));
    let aitt_a = new_aitt("a", bus_a.clone());
    let aitt_b = new_aitt("b", bus_b.clone());
    aitt_a.connect("127.0.0.1", 1883).expect("a connect");
    aitt_b.connect("127.0.0.1", 1883).expect("b connect");

    let bus_hits: ProtocolSet = Protocol::Bus.into();
    let seen_bus = Arc::new(Mutex::new(0u32));
    let seen_bus_cb = seen_bus.clone();
    aitt_b
      .subscribe(
        "room/1",
        Box::new(move |_msg, _| *seen_bus_cb.lock().unwrap() += 1),
        bus_hits,
        Qos::AtLeastOnce,
      )
      .expect("subscribe bus");

    aitt_a.publish("room/1", b"hi", bus_hits, Qos::AtLeastOnce, false).expect("publish");
    assert_eq!(*seen_bus.lock().unwrap(), 1);
  }

  #[test]
  fn subscribe_registers_both_bus_and_direct_parts_and_unsubscribe_reverses_both() {
    let bus = Arc::new(MockBusClient::new("a"));
    let aitt = new_aitt("a", bus.clone());
    aitt.connect("127.0.0.1", 1883).expect("connect");

    let protocols: ProtocolSet = Protocol::Bus | Protocol::Tcp;
    let handle = aitt
      .subscribe("room/1", Box::new(|_msg, _| {}), protocols, Qos::AtLeastOnce)
      .expect("subscribe");
    let tcp = aitt.registry.get(Protocol::Tcp).expect("tcp transport");
    assert_eq!(tcp.count_subscribers("room/1"), 1);

    aitt.unsubscribe(handle).expect("unsubscribe");
    assert_eq!(tcp.count_subscribers("room/1"), 0);
  }

  #[test]
  fn publish_before_connect_is_queued_and_flushed_on_connect() {
    let bus_a = Arc::new(MockBusClient::new("a"));
    let bus_b = Arc::new(MockBusClient::paired_with("b", &bus_a));
    let aitt_a = new_aitt("a", bus_a.clone());
    let aitt_b = new_aitt("b", bus_b.clone());
    aitt_b.connect("127.0.0.1", 1883).expect("b connect");

    let bus_hits: ProtocolSet = Protocol::Bus.into();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    aitt_b
      .subscribe(
        "room/1",
        Box::new(move |msg, _| seen_cb.lock().unwrap().push(msg.payload.clone())),
        bus_hits,
        Qos::AtLeastOnce,
      )
      .expect("subscribe");

    // a hasn't connected yet: this must queue rather than fail.
    aitt_a.publish("room/1", b"queued", bus_hits, Qos::AtLeastOnce, false).expect("publish queues");
    assert!(seen.lock().unwrap().is_empty());

    aitt_a.connect("127.0.0.1", 1883).expect("a connect flushes queue");
    assert_eq!(seen.lock().unwrap().as_slice(), [b"queued".to_vec()]);
  }

  #[test]
  fn subscribe_before_connect_is_queued_and_flushed_on_connect() {
    let bus_a = Arc::new(MockBusClient::new("a"));
    let bus_b = Arc::new(MockBusClient::paired_with("b", &bus_a));
    let aitt_a = new_aitt("a", bus_a.clone());
    let aitt_b = new_aitt("b", bus_b.clone());

    let bus_hits: ProtocolSet = Protocol::Bus.into();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    // b hasn't connected yet: this must queue rather than register immediately.
    let _handle = aitt_b
      .subscribe(
        "room/1",
        Box::new(move |msg, _| seen_cb.lock().unwrap().push(msg.payload.clone())),
        bus_hits,
        Qos::AtLeastOnce,
      )
      .expect("subscribe queues");

    aitt_a.connect("127.0.0.1", 1883).expect("a connect");
    aitt_a.publish("room/1", b"too early", bus_hits, Qos::AtLeastOnce, false).expect("publish");
    assert!(seen.lock().unwrap().is_empty(), "b hasn't flushed its queued subscribe yet");

    aitt_b.connect("127.0.0.1", 1883).expect("b connect flushes queue");
    aitt_a.publish("room/1", b"after flush", bus_hits, Qos::AtLeastOnce, false).expect("publish");
    assert_eq!(seen.lock().unwrap().as_slice(), [b"after flush".to_vec()]);
  }

  #[test]
  fn unsubscribing_a_still_queued_subscribe_cancels_it_instead_of_registering() {
    let bus_a = Arc::new(MockBusClient::new("a"));
    let bus_b = Arc::new(MockBusClient::paired_with("b", &bus_a));
    let aitt_a = new_aitt("a", bus_a.clone());
    let aitt_b = new_aitt("b", bus_b.clone());

    let seen = Arc::new(Mutex::new(0u32));
    let seen_cb = seen.clone();
    let handle = aitt_b
      .subscribe(
        "room/1",
        Box::new(move |_msg, _| *seen_cb.lock().unwrap() += 1),
        Protocol::Bus.into(),
        Qos::AtLeastOnce,
      )
      .expect("subscribe queues");
    aitt_b.unsubscribe(handle).expect("unsubscribe a still-queued subscribe");

    aitt_a.connect("127.0.0.1", 1883).expect("a connect");
    aitt_b.connect("127.0.0.1", 1883).expect("b connect flushes queue");
    aitt_a.publish("room/1", b"hi", Protocol::Bus.into(), Qos::AtLeastOnce, false).expect("publish");

    assert_eq!(*seen.lock().unwrap(), 0, "cancelled queued subscribe must not register on flush");
  }
}
