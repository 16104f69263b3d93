//! SRTP envelope over a UDP socket, carried over from the original
//! `modules/srtp/SRTP.{h,cc}`. Frames every datagram with a 12-byte RTP-v2
//! header (sequence, timestamp, SSRC) and AES-256-GCM-protects the payload,
//! exactly as the original configures `libsrtp`, minus the library itself
//! (see [`crypto`] for the redesign).

mod crypto;
mod header;

use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub use crypto::{ReplayWindow, KEY_LEN};
pub use header::{RtpHeader, HEADER_LEN};

use crate::error::{AittError, Result};
use crate::net::UdpSocket;

static SESSIONS: AtomicUsize = AtomicUsize::new(0);

const MAX_TRAILER_LEN: usize = crypto::TAG_LEN;
/// Comfortably larger than any payload this crate's transports produce; the
/// original mirrors `libsrtp`'s `SRTP_MAX_TRAILER_LEN` the same way.
const DEFAULT_TTL: u8 = 5;

/// SRTP-protected UDP transport. One instance per remote peer/session, like
/// the original's one-`SRTP`-per-`UDP` ownership.
pub struct SrtpEnvelope {
  udp: UdpSocket,
  cipher: crypto::Cipher,
  seq: Mutex<u16>,
  ts: Mutex<u32>,
  ssrc: u32,
  ttl: u8,
  replay: Mutex<ReplayWindow>,
}

impl SrtpEnvelope {
  pub fn new(udp: UdpSocket, key: &[u8]) -> Result<Self> {
    let cipher = crypto::Cipher::new(key)?;
    let previously_open = SESSIONS.fetch_add(1, Ordering::SeqCst);
    if previously_open == 0 {
      log::info!("SRTP: first session opened, AES-256-GCM-8");
    }
    Ok(SrtpEnvelope {
      udp,
      cipher,
      seq: Mutex::new(0),
      ts: Mutex::new(0),
      ssrc: 0xdead_beef,
      ttl: DEFAULT_TTL,
      replay: Mutex::new(ReplayWindow::new()),
    })
  }

  pub fn ttl(&self) -> u8 {
    self.ttl
  }

  /// Encrypts `payload` and sends it to `to`.
  pub fn send(&self, payload: &[u8], to: SocketAddr) -> Result<usize> {
    let seq = {
      let mut seq = self.seq.lock().expect("seq lock");
      *seq = seq.wrapping_add(1);
      *seq
    };
    let ts = {
      let mut ts = self.ts.lock().expect("ts lock");
      let current = *ts;
      *ts = ts.wrapping_add(1);
      current
    };

    let header = RtpHeader { version: 2, payload_type: 1, seq, ts, ssrc: self.ssrc };
    let mut header_bytes = [0u8; HEADER_LEN];
    header.encode(&mut header_bytes);

    let mut body = payload.to_vec();
    self.cipher.protect(&header_bytes, self.ssrc, ts, seq, &mut body)?;

    let mut wire = Vec::with_capacity(HEADER_LEN + body.len());
    wire.extend_from_slice(&header_bytes);
    wire.extend_from_slice(&body);
    self.udp.send(&wire, to)
  }

  /// Receives, authenticates, and replay-checks one datagram. Returns
  /// `Ok(None)` on `EWOULDBLOCK` the same as the underlying
  /// [`UdpSocket::recv`].
  pub fn recv(&self, buf_hint: usize) -> Result<Option<(Vec<u8>, SocketAddr)>> {
    let mut wire = vec![0u8; buf_hint + HEADER_LEN + MAX_TRAILER_LEN];
    let Some((n, from)) = self.udp.recv(&mut wire)? else {
      return Ok(None);
    };
    wire.truncate(n);

    if wire.len() < HEADER_LEN {
      return Err(AittError::OperationFailed("SRTP packet shorter than RTP header".into()));
    }
    let mut header_bytes = [0u8; HEADER_LEN];
    header_bytes.copy_from_slice(&wire[..HEADER_LEN]);
    let header = RtpHeader::decode(&header_bytes);
    if header.version != 2 {
      return Err(AittError::OperationFailed(format!("invalid RTP version {}", header.version)));
    }

    let mut body = wire[HEADER_LEN..].to_vec();
    self.cipher.unprotect(&header_bytes, header.ssrc, header.ts, header.seq, &mut body)?;

    self.replay.lock().expect("replay lock").check_and_record(header.seq)?;

    Ok(Some((body, from)))
  }

  pub fn raw_handle(&self) -> RawFd {
    self.udp.raw_handle()
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    self.udp.local_addr()
  }
}

impl Drop for SrtpEnvelope {
  fn drop(&mut self) {
    if SESSIONS.fetch_sub(1, Ordering::SeqCst) == 1 {
      log::debug!("SRTP: last session closed");
    }
  }
}

pub fn bind(host: Ipv4Addr, port: u16, key: &[u8]) -> Result<SrtpEnvelope> {
  SrtpEnvelope::new(UdpSocket::bind(host, port)?, key)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn loopback_protect_unprotect_roundtrip() {
    let key = [9u8; KEY_LEN];
    let receiver = bind(Ipv4Addr::LOCALHOST, 0, &key).expect("bind receiver");
    let addr = receiver.udp.local_addr().expect("local_addr");
    let sender = SrtpEnvelope::new(UdpSocket::unbound().expect("unbound"), &key).expect("sender");

    sender.send(b"secret payload", addr).expect("send");

    let mut got = None;
    for _ in 0..1000 {
      if let Some(result) = receiver.recv(64).expect("recv") {
        got = Some(result);
        break;
      }
    }
    let (payload, _from) = got.expect("datagram arrived");
    assert_eq!(payload, b"secret payload");
  }

  #[test]
  fn tampered_packet_is_rejected() {
    let key = [3u8; KEY_LEN];
    let receiver = bind(Ipv4Addr::LOCALHOST, 0, &key).expect("bind receiver");
    let addr = receiver.udp.local_addr().expect("local_addr");
    let sender = SrtpEnvelope::new(UdpSocket::unbound().expect("unbound"), &key).expect("sender");

    sender.send(b"hello", addr).expect("send");

    let mut wire = vec![0u8; 256];
    let (n, _from) = receiver.udp.recv(&mut wire).expect("recv").expect("arrived");
    wire[HEADER_LEN] ^= 0xff; // flip a ciphertext byte
    let tampered = UdpSocket::bind(Ipv4Addr::LOCALHOST, 0).expect("tamper sender");
    tampered.send(&wire[..n], addr).expect("resend tampered");

    // Original datagram already drained above; this is a fresh one carrying
    // the flipped byte, so the GCM tag must fail to authenticate.
    for _ in 0..1000 {
      match receiver.recv(64) {
        Ok(None) => continue,
        Ok(Some(_)) => panic!("tampered packet must not authenticate"),
        Err(_) => return,
      }
    }
    panic!("tampered packet never arrived");
  }
}
