/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Digest and stream-cipher shims.  The concrete primitives live in
//! external crates; operations consume only these narrow interfaces.

use aes::Aes256;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use md5::Digest as _;

use crate::core::error::{Error, Result};

/// Incremental hash over a data stream.
pub trait DigestLike {
    fn update(&mut self, data: &[u8]);
    fn finish(&mut self) -> Vec<u8>;
}

pub struct Md5Hash(md5::Md5);

impl Md5Hash {
    pub fn new() -> Self {
        Md5Hash(md5::Md5::new())
    }
}

impl DigestLike for Md5Hash {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }
    fn finish(&mut self) -> Vec<u8> {
        self.0.finalize_reset().to_vec()
    }
}

/// AES-256 key derived from a password: SHA-256(password).
fn key_from_password(password: &str) -> [u8; 32] {
    let mut h = sha2::Sha256::new();
    h.update(password.as_bytes());
    h.finalize().into()
}

/// CFB initialization vector: the first 16 bytes of SHA-1(key).
fn iv_from_key(key: &[u8; 32]) -> [u8; 16] {
    let mut h = sha1::Sha1::new();
    h.update(key);
    let d = h.finalize();
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&d[..16]);
    iv
}

pub enum Direction {
    Encrypt,
    Decrypt,
}

enum CfbState {
    Enc(BufEncryptor<Aes256>),
    Dec(BufDecryptor<Aes256>),
}

/// AES-256-CFB stream cipher for `copy --encrypt/--decrypt`.
pub struct AesCfb {
    state: CfbState,
}

impl AesCfb {
    pub fn new(password: &str, dir: Direction) -> Result<Self> {
        let key = key_from_password(password);
        let iv = iv_from_key(&key);
        let state = match dir {
            Direction::Encrypt => CfbState::Enc(
                BufEncryptor::new_from_slices(&key, &iv)
                    .map_err(|e| Error::internal(format!("cipher init: {}", e)))?,
            ),
            Direction::Decrypt => CfbState::Dec(
                BufDecryptor::new_from_slices(&key, &iv)
                    .map_err(|e| Error::internal(format!("cipher init: {}", e)))?,
            ),
        };
        Ok(AesCfb { state })
    }

    /// Transform `buf` in place.  CFB is a stream mode: any chunking of the
    /// input produces the same output stream.
    pub fn process(&mut self, buf: &mut [u8]) {
        match &mut self.state {
            CfbState::Enc(c) => c.encrypt(buf),
            CfbState::Dec(c) => c.decrypt(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_value() {
        let mut h = Md5Hash::new();
        h.update(b"abc");
        assert_eq!(
            "900150983cd24fb0d6963f7d28e17f72",
            hex(&h.finish())
        );
    }

    #[test]
    fn test_cfb_roundtrip_chunked() {
        let mut enc = AesCfb::new("pw", Direction::Encrypt).unwrap();
        let mut data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let orig = data.clone();
        // encrypt in uneven chunks
        let (a, b) = data.split_at_mut(7);
        enc.process(a);
        enc.process(b);
        assert_ne!(orig, data);

        let mut dec = AesCfb::new("pw", Direction::Decrypt).unwrap();
        dec.process(&mut data);
        assert_eq!(orig, data);
    }

    #[test]
    fn test_wrong_password_garbles() {
        let mut enc = AesCfb::new("pw", Direction::Encrypt).unwrap();
        let mut data = b"secret".to_vec();
        enc.process(&mut data);
        let mut dec = AesCfb::new("other", Direction::Decrypt).unwrap();
        dec.process(&mut data);
        assert_ne!(b"secret".to_vec(), data);
    }

    fn hex(d: &[u8]) -> String {
        d.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
