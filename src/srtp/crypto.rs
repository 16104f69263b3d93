//! AES-256-GCM envelope and 128-packet replay window, replacing the
//! original's `libsrtp` dependency (`srtp_protect`/`srtp_unprotect`,
//! `srtp_crypto_policy_set_aes_gcm_256_8_auth`). `aes-gcm` has no built-in
//! anti-replay, unlike `libsrtp`, so the sliding bitmask here stands in for
//! `policy.window_size = 128` / `allow_repeat_tx = 0`.

use aes_gcm::aead::consts::{U12, U8};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};

use crate::error::{AittError, Result};

/// AES-256-GCM truncated to an 8-byte tag, matching
/// `srtp_crypto_policy_set_aes_gcm_256_8_auth`'s `auth_tag_len = 8`.
type Aes256Gcm8 = AesGcm<Aes256, U12, U8>;

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 8;

pub struct Cipher {
  cipher: Aes256Gcm8,
}

impl Cipher {
  pub fn new(key: &[u8]) -> Result<Self> {
    if key.len() != KEY_LEN {
      return Err(AittError::InvalidArg(format!(
        "SRTP key must be {KEY_LEN} bytes, got {}",
        key.len()
      )));
    }
    Ok(Cipher { cipher: Aes256Gcm8::new_from_slice(key).expect("key length checked above") })
  }

  /// Nonce derivation is AITT-specific (not RFC 3711's ROC-based scheme,
  /// since there is no `libsrtp` session keeping the rollover counter):
  /// ssrc || ts || seq || 2 reserved zero bytes, which is unique as long as
  /// `(ssrc, ts, seq)` never repeats, true for the lifetime of one
  /// [`super::SrtpEnvelope`].
  fn nonce(ssrc: u32, ts: u32, seq: u16) -> Nonce<U12> {
    let mut bytes = [0u8; 12];
    bytes[0..4].copy_from_slice(&ssrc.to_be_bytes());
    bytes[4..8].copy_from_slice(&ts.to_be_bytes());
    bytes[8..10].copy_from_slice(&seq.to_be_bytes());
    Nonce::<U12>::clone_from_slice(&bytes)
  }

  /// Encrypts `payload` in place, appending the 8-byte tag; `header` is
  /// authenticated but not encrypted, matching SRTP's AEAD-over-the-RTP-
  /// header contract.
  pub fn protect(
    &self,
    header_aad: &[u8],
    ssrc: u32,
    ts: u32,
    seq: u16,
    payload: &mut Vec<u8>,
  ) -> Result<()> {
    let nonce = Self::nonce(ssrc, ts, seq);
    self
      .cipher
      .encrypt_in_place(&nonce, header_aad, payload)
      .map_err(|_| AittError::OperationFailed("SRTP protect failed".into()))
  }

  /// Inverse of [`Cipher::protect`]; truncates the trailing tag off on
  /// success.
  pub fn unprotect(
    &self,
    header_aad: &[u8],
    ssrc: u32,
    ts: u32,
    seq: u16,
    payload: &mut Vec<u8>,
  ) -> Result<()> {
    let nonce = Self::nonce(ssrc, ts, seq);
    self
      .cipher
      .decrypt_in_place(&nonce, header_aad, payload)
      .map_err(|_| AittError::OperationFailed("SRTP unprotect failed".into()))
  }
}

/// RFC 3711 §3.3.2-style sliding replay window, 128 packets wide. Tracks a
/// rollover counter the same way RFC 3711 Appendix A's `guess_index` does,
/// so a wire `seq` that wraps 65535 -> 0 keeps advancing the window instead
/// of looking 65408 packets stale.
#[derive(Debug, Default)]
pub struct ReplayWindow {
  highest_seq: Option<u64>,
  bitmask: u128,
}

impl ReplayWindow {
  pub const WIDTH: u64 = 128;

  pub fn new() -> Self {
    Self::default()
  }

  /// Extends a wire `seq` to the 64-bit `(rollover << 16) | seq` space by
  /// picking whichever of the neighboring rollover counts lands closest to
  /// the current highest extended sequence number.
  fn extend(&self, seq: u16) -> u64 {
    let Some(highest) = self.highest_seq else {
      return seq as u64;
    };
    let roc = highest >> 16;
    [roc.saturating_sub(1), roc, roc + 1]
      .into_iter()
      .map(|r| (r << 16) | seq as u64)
      .min_by_key(|candidate| candidate.abs_diff(highest))
      .expect("3 candidates, never empty")
  }

  /// Checks `seq` against the window and, if it's new, records it.
  /// Rejects duplicates and packets older than the window.
  pub fn check_and_record(&mut self, seq: u16) -> Result<()> {
    let seq = self.extend(seq);
    let Some(highest) = self.highest_seq else {
      self.highest_seq = Some(seq);
      self.bitmask = 1;
      return Ok(());
    };

    if seq > highest {
      let shift = seq - highest;
      self.bitmask = if shift >= Self::WIDTH { 0 } else { self.bitmask << shift };
      self.bitmask |= 1;
      self.highest_seq = Some(seq);
      return Ok(());
    }

    let age = highest - seq;
    if age >= Self::WIDTH {
      return Err(AittError::OperationFailed(format!(
        "SRTP packet too old: seq {seq}, highest {highest}"
      )));
    }
    let bit = 1u128 << age;
    if self.bitmask & bit != 0 {
      return Err(AittError::OperationFailed(format!("SRTP replayed packet: seq {seq}")));
    }
    self.bitmask |= bit;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn protect_unprotect_roundtrip() {
    let key = [7u8; KEY_LEN];
    let cipher = Cipher::new(&key).expect("new");
    let aad = b"header";
    let mut payload = b"hello world".to_vec();
    cipher.protect(aad, 1, 2, 3, &mut payload).expect("protect");
    assert_ne!(payload, b"hello world".to_vec());
    cipher.unprotect(aad, 1, 2, 3, &mut payload).expect("unprotect");
    assert_eq!(payload, b"hello world".to_vec());
  }

  #[test]
  fn wrong_key_length_is_rejected() {
    assert!(Cipher::new(&[0u8; 10]).is_err());
  }

  #[test]
  fn replay_window_rejects_duplicate_and_stale() {
    let mut window = ReplayWindow::new();
    window.check_and_record(100).expect("first seen");
    assert!(window.check_and_record(100).is_err(), "duplicate must be rejected");
    window.check_and_record(101).expect("advances");
    assert!(window.check_and_record(0).is_err(), "too far behind the window");
  }

  #[test]
  fn replay_window_accepts_in_order_and_small_reorder() {
    let mut window = ReplayWindow::new();
    for seq in [10u16, 11, 13, 12, 14] {
      window.check_and_record(seq).expect("within window");
    }
  }

  #[test]
  fn replay_window_accepts_sequence_rollover() {
    let mut window = ReplayWindow::new();
    window.check_and_record(65534).expect("first seen");
    window.check_and_record(65535).expect("advances to wire max");
    window.check_and_record(0).expect("wraps forward, not stale");
    window.check_and_record(1).expect("keeps advancing past the wrap");
    assert!(window.check_and_record(65535).is_err(), "pre-wrap seq is now a duplicate");
  }
}
