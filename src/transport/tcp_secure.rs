//! TLS-wrapped variant of [`super::tcp::TcpTransport`]'s framing, backed by
//! `rustls` with a preshared self-signed certificate/key pair supplied
//! through [`crate::option::AittOption`] (the original's `TCP_SECURE`
//! transport has no broker-issued PKI to lean on either — it's meant for a
//! local, already-trusted network).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustls::{ClientConnection, ServerConnection, ServerName, StreamOwned};

use super::{Message, SubscribeCallback, SubscribeHandle, Transport, TransportData};
use crate::error::{AittError, Result};
use crate::types::{Protocol, Qos};

trait TlsStream: Read + Write + Send {}
impl TlsStream for StreamOwned<ClientConnection, TcpStream> {}
impl TlsStream for StreamOwned<ServerConnection, TcpStream> {}

struct Subscription {
  topic: String,
  cb: SubscribeCallback,
  data: Option<TransportData>,
}

#[derive(Default)]
struct FrameReader {
  buf: Vec<u8>,
  topic: Option<String>,
}

impl FrameReader {
  fn feed(&mut self, chunk: &[u8]) {
    self.buf.extend_from_slice(chunk);
  }

  fn try_take_frame(&mut self) -> Option<Vec<u8>> {
    if self.buf.len() < 4 {
      return None;
    }
    let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
    if self.buf.len() < 4 + len {
      return None;
    }
    let frame = self.buf[4..4 + len].to_vec();
    self.buf.drain(..4 + len);
    Some(frame)
  }
}

fn write_frame(stream: &mut dyn TlsStream, bytes: &[u8]) -> std::io::Result<()> {
  stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
  stream.write_all(bytes)
}

pub struct TcpSecureTransport {
  protocol: Protocol,
  listener: TcpListener,
  local_addr: SocketAddr,
  server_config: Arc<rustls::ServerConfig>,
  client_config: Arc<rustls::ClientConfig>,
  outbound: Mutex<HashMap<SocketAddr, Box<dyn TlsStream>>>,
  inbound: Mutex<HashMap<RawFd, (Box<dyn TlsStream>, FrameReader)>>,
  subscriptions: Mutex<HashMap<SubscribeHandle, Subscription>>,
  next_handle: AtomicU64,
}

impl TcpSecureTransport {
  /// `cert_pem`/`key_pem` are a self-signed certificate and its matching
  /// private key, both PEM-encoded, shared out-of-band between peers.
  pub fn bind(
    my_ip: std::net::Ipv4Addr,
    cert_pem: &[u8],
    key_pem: &[u8],
  ) -> Result<Self> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
      .collect::<std::result::Result<_, _>>()
      .map_err(AittError::System)?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
      .map_err(AittError::System)?
      .ok_or_else(|| AittError::InvalidArg("no private key found in key_pem".into()))?;

    let server_config = rustls::ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(certs.clone(), key.clone_key())
      .map_err(|e| AittError::OperationFailed(format!("rustls server config: {e}")))?;

    let mut root_store = rustls::RootCertStore::empty();
    for cert in &certs {
      root_store
        .add(cert.clone())
        .map_err(|e| AittError::OperationFailed(format!("rustls root store: {e}")))?;
    }
    let client_config = rustls::ClientConfig::builder()
      .with_root_certificates(root_store)
      .with_no_client_auth();

    let listener = TcpListener::bind((my_ip, 0)).map_err(AittError::System)?;
    listener.set_nonblocking(true).map_err(AittError::System)?;
    let local_addr = listener.local_addr().map_err(AittError::System)?;

    Ok(TcpSecureTransport {
      protocol: Protocol::TcpSecure,
      listener,
      local_addr,
      server_config: Arc::new(server_config),
      client_config: Arc::new(client_config),
      outbound: Mutex::new(HashMap::new()),
      inbound: Mutex::new(HashMap::new()),
      subscriptions: Mutex::new(HashMap::new()),
      next_handle: AtomicU64::new(1),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn listener_fd(&self) -> RawFd {
    self.listener.as_raw_fd()
  }

  pub fn connect_peer(&self, peer: SocketAddr, server_name: &str) -> Result<()> {
    let mut outbound = self.outbound.lock().expect("outbound lock");
    if outbound.contains_key(&peer) {
      return Ok(());
    }
    let name = ServerName::try_from(server_name.to_string())
      .map_err(|_| AittError::InvalidArg(format!("invalid TLS server name {server_name}")))?;
    let conn = ClientConnection::new(self.client_config.clone(), name)
      .map_err(|e| AittError::OperationFailed(format!("rustls client connection: {e}")))?;
    let sock = TcpStream::connect(peer).map_err(AittError::System)?;
    sock.set_nonblocking(true).map_err(AittError::System)?;
    outbound.insert(peer, Box::new(StreamOwned::new(conn, sock)));
    Ok(())
  }

  pub fn accept(&self) -> Result<Option<RawFd>> {
    match self.listener.accept() {
      Ok((sock, _addr)) => {
        sock.set_nonblocking(true).map_err(AittError::System)?;
        let fd = sock.as_raw_fd();
        let conn = ServerConnection::new(self.server_config.clone())
          .map_err(|e| AittError::OperationFailed(format!("rustls server connection: {e}")))?;
        let stream: Box<dyn TlsStream> = Box::new(StreamOwned::new(conn, sock));
        self.inbound.lock().expect("inbound lock").insert(fd, (stream, FrameReader::default()));
        Ok(Some(fd))
      }
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
      Err(e) => Err(AittError::System(e)),
    }
  }

  pub fn readable(&self, fd: RawFd) -> Result<bool> {
    let mut inbound = self.inbound.lock().expect("inbound lock");
    let Some((stream, reader)) = inbound.get_mut(&fd) else {
      return Ok(true);
    };

    let mut chunk = [0u8; 4096];
    let n = match stream.read(&mut chunk) {
      Ok(0) => {
        drop(inbound);
        self.inbound.lock().expect("inbound lock").remove(&fd);
        return Ok(false);
      }
      Ok(n) => n,
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
      Err(e) => return Err(AittError::System(e)),
    };
    reader.feed(&chunk[..n]);

    if reader.topic.is_none() {
      if let Some(frame) = reader.try_take_frame() {
        reader.topic = Some(String::from_utf8_lossy(&frame).into_owned());
      }
    }
    let Some(topic) = reader.topic.clone() else {
      return Ok(true);
    };

    while let Some(payload) = reader.try_take_frame() {
      let msg = Message { topic: topic.clone(), payload, reply_topic: None, correlation: None };
      let mut subs = self.subscriptions.lock().expect("subscriptions lock");
      for sub in subs.values_mut() {
        if sub.topic == msg.topic {
          (sub.cb)(&msg, sub.data.as_mut());
        }
      }
    }
    Ok(true)
  }
}

impl Transport for TcpSecureTransport {
  fn protocol(&self) -> Protocol {
    self.protocol
  }

  fn publish(&self, topic: &str, data: &[u8], _qos: Qos, _retain: bool) -> Result<()> {
    let mut outbound = self.outbound.lock().expect("outbound lock");
    for stream in outbound.values_mut() {
      write_frame(stream.as_mut(), topic.as_bytes()).map_err(AittError::System)?;
      write_frame(stream.as_mut(), data).map_err(AittError::System)?;
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
    Err(AittError::NotSupported("TCP_SECURE transport does not support reply metadata".into()))
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
    Err(AittError::NotSupported("TCP_SECURE transport does not support reply metadata".into()))
  }

  fn count_subscribers(&self, topic: &str) -> usize {
    self.subscriptions.lock().expect("subscriptions lock").values().filter(|s| s.topic == topic).count()
  }
}
