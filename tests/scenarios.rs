//! End-to-end scenarios from `spec.md` §8, driven through the crate's
//! public surface. Requires the `testing` feature for `MockBusClient`:
//! `cargo test --features testing`.

#![cfg(feature = "testing")]

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use aitt::bus::{BusClient, MockBusClient};
use aitt::discovery::Discovery;
use aitt::mainloop::poll::PollMainLoop;
use aitt::mainloop::{Disposition, MainLoop};
use aitt::registry::ModuleRegistry;
use aitt::types::{Protocol, Qos};

// S1 — Discovery join: B's listener sees exactly one "connected" record
// from A, sent after B starts listening.
#[test]
fn s1_discovery_join() {
  let bus_a = Arc::new(MockBusClient::new("a"));
  let bus_b = Arc::new(MockBusClient::paired_with("b", &bus_a));

  let discovery_a = Discovery::new("a".to_string(), bus_a.clone());
  let discovery_b = Discovery::new("b".to_string(), bus_b.clone());

  let seen = Arc::new(Mutex::new(Vec::new()));
  let seen_cb = seen.clone();
  discovery_b.add_discovery_cb(
    Protocol::Tcp,
    Box::new(move |sender, status, _blob| seen_cb.lock().unwrap().push((sender.clone(), status.to_string()))),
  );

  discovery_b.start("127.0.0.1", 1883, None, None).expect("b start");
  discovery_a.start("127.0.0.1", 1883, None, None).expect("a start");

  let got = seen.lock().unwrap();
  assert_eq!(got.as_slice(), [("a".to_string(), "connected".to_string())]);
}

// S2 — Discovery leave via will: after S1, A terminates without calling
// stop(); B's listener receives a "disconnected" record from A.
#[test]
fn s2_discovery_leave_via_will() {
  let bus_a = Arc::new(MockBusClient::new("a"));
  let bus_b = Arc::new(MockBusClient::paired_with("b", &bus_a));

  let discovery_a = Discovery::new("a".to_string(), bus_a.clone());
  let discovery_b = Discovery::new("b".to_string(), bus_b.clone());

  let seen = Arc::new(Mutex::new(Vec::new()));
  let seen_cb = seen.clone();
  discovery_b.add_discovery_cb(
    Protocol::Tcp,
    Box::new(move |sender, status, _blob| seen_cb.lock().unwrap().push((sender.clone(), status.to_string()))),
  );

  discovery_b.start("127.0.0.1", 1883, None, None).expect("b start");
  discovery_a.start("127.0.0.1", 1883, None, None).expect("a start");

  // A terminates without calling stop() — simulated by dropping straight to
  // an unclean disconnect, which publishes the will set by `Discovery::start`.
  bus_a.simulate_unclean_disconnect();

  let got = seen.lock().unwrap();
  assert_eq!(
    got.as_slice(),
    [("a".to_string(), "connected".to_string()), ("a".to_string(), "disconnected".to_string())]
  );
}

// S3 — SRTP loopback: client sends a fixed payload to a server sharing the
// same key; server receives the identical plaintext back.
//
// `spec.md` S3 specifies a 43-byte fixed key vector, sized for `libsrtp`'s
// combined AES-256 master-key-plus-salt format. This crate's envelope
// derives its nonce directly from (ssrc, ts, seq) instead of a persistent
// rollover counter (see DESIGN.md), so it needs no separate salt and takes
// a plain `KEY_LEN`-byte (32) AES-256 key; the scenario is reproduced here
// with a key sized to this crate's actual key material.
#[test]
fn s3_srtp_loopback() {
  use aitt::srtp::KEY_LEN;

  let key = [0x5au8; KEY_LEN];
  let server = aitt::srtp::bind(Ipv4Addr::LOCALHOST, 0, &key).expect("bind server");
  let server_addr = server.local_addr().expect("local_addr");
  let client = aitt::srtp::bind(Ipv4Addr::LOCALHOST, 0, &key).expect("bind client");

  client.send(b"hello\0", server_addr).expect("send");

  let mut got = None;
  for _ in 0..1000 {
    if let Some(result) = server.recv(64).expect("recv") {
      got = Some(result);
      break;
    }
    std::thread::yield_now();
  }
  let (payload, _from) = got.expect("datagram arrived");
  assert_eq!(payload, b"hello\0".to_vec());
}

// S4 — UDP send/recv: an unbound client sends to a server bound on an
// OS-assigned port; the server's recv reports the payload and a loopback
// sender address.
#[test]
fn s4_udp_send_recv() {
  use aitt::net::UdpSocket;

  let server = UdpSocket::bind(Ipv4Addr::UNSPECIFIED, 0).expect("bind server");
  let port = server.local_addr().expect("local_addr").port();
  let client = UdpSocket::unbound().expect("unbound client");

  client.send(b"ping", (Ipv4Addr::LOCALHOST, port).into()).expect("send");

  let mut got = None;
  let mut buf = [0u8; 16];
  for _ in 0..1000 {
    if let Some(result) = server.recv(&mut buf).expect("recv") {
      got = Some(result);
      break;
    }
    std::thread::yield_now();
  }
  let (n, from) = got.expect("datagram arrived");
  assert_eq!(&buf[..n], b"ping");
  assert!(from.ip().is_loopback());
}

// S5 — Unsubscribe returns stored data: a watch registered with user data
// D on fd F returns D when removed.
#[test]
fn s5_remove_watch_returns_stored_data() {
  let main_loop = PollMainLoop::new().expect("new");
  let (read_fd, _write_fd) = {
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    let (a, b) = UnixStream::pair().expect("socketpair");
    (a.as_raw_fd(), b)
  };
  main_loop.add_watch(
    read_fd,
    Box::new(|_result, _fd, _data| Disposition::Continue),
    Some(Box::new(42u32)),
  );

  let data = main_loop.remove_watch(read_fd).expect("watch was registered");
  assert_eq!(*data.downcast::<u32>().expect("stored type"), 42u32);
}

#[test]
fn s5_removing_an_unregistered_watch_is_a_no_op() {
  let main_loop = PollMainLoop::new().expect("new");
  assert!(main_loop.remove_watch(999).is_none());
}

// S6 — Null transport: an unknown/unloaded protocol's registry entry
// behaves as a silent no-op and reports zero subscribers.
#[test]
fn s6_null_transport_is_a_silent_no_op() {
  let registry = ModuleRegistry::new(Ipv4Addr::LOCALHOST, &aitt::AittOption::default()).expect("new");
  let transport = registry.get(Protocol::TcpSecure).expect("falls back to null transport");
  transport.publish("t", b"x", Qos::AtMostOnce, false).expect("publish is a no-op");
  assert_eq!(transport.count_subscribers("t"), 0);
}
