// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Authenticated encryption for block payloads.
//!
//! Payloads are sealed with AES-256-GCM under a single process-wide key. The
//! ciphertext layout is `IV || body || tag`: a fresh 12-byte IV drawn from
//! the CSPRNG for every invocation, followed by the GCM body and the 16-byte
//! authentication tag. Any bit flip in the IV, body, or tag is detected on
//! open.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::OnceLock;

use crate::OramError;

/// Length in bytes of the per-message IV.
pub const IV_LEN: usize = 12;
/// Length in bytes of the GCM authentication tag.
pub const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

// The process-wide key. Generated once, immutable afterwards; key rotation
// is out of scope.
static CIPHER: OnceLock<Aes256Gcm> = OnceLock::new();

fn cipher() -> &'static Aes256Gcm {
    CIPHER.get_or_init(|| {
        let mut key_bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key_bytes);
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes))
    })
}

/// Encrypts `plaintext`, returning `IV || body || tag`.
///
/// The output is `IV_LEN + plaintext.len() + TAG_LEN` bytes long.
pub fn seal(plaintext: &[u8]) -> Result<Vec<u8>, OramError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let body = cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| OramError::Malformed)?;

    let mut output = Vec::with_capacity(IV_LEN + body.len());
    output.extend_from_slice(&iv);
    output.extend_from_slice(&body);
    Ok(output)
}

/// Decrypts a ciphertext produced by [`seal`], verifying its tag.
///
/// Returns [`OramError::Malformed`] if the input is shorter than
/// `IV_LEN + TAG_LEN`, and [`OramError::AuthFail`] if tag verification
/// fails.
pub fn open(ciphertext: &[u8]) -> Result<Vec<u8>, OramError> {
    if ciphertext.len() < IV_LEN + TAG_LEN {
        return Err(OramError::Malformed);
    }
    let (iv, body) = ciphertext.split_at(IV_LEN);
    cipher()
        .decrypt(Nonce::from_slice(iv), body)
        .map_err(|_| OramError::AuthFail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let plaintext = b"interest:/example/video/segment0";
        let sealed = seal(plaintext).unwrap();
        assert_eq!(sealed.len(), IV_LEN + plaintext.len() + TAG_LEN);
        assert_eq!(open(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn round_trip_empty() {
        let sealed = seal(b"").unwrap();
        assert_eq!(sealed.len(), IV_LEN + TAG_LEN);
        assert_eq!(open(&sealed).unwrap(), b"");
    }

    #[test]
    fn fresh_iv_per_invocation() {
        let a = seal(b"same plaintext").unwrap();
        let b = seal(b"same plaintext").unwrap();
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn tamper_any_byte_fails_authentication() {
        let sealed = seal(b"content-store payload").unwrap();
        for index in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[index] ^= 0x01;
            assert_eq!(open(&tampered), Err(OramError::AuthFail), "byte {index}");
        }
    }

    #[test]
    fn truncated_input_is_malformed() {
        assert_eq!(open(&[]), Err(OramError::Malformed));
        assert_eq!(
            open(&[0u8; IV_LEN + TAG_LEN - 1]),
            Err(OramError::Malformed)
        );
    }
}
