//! AES-256-CBC page cipher. The key derives from the password via PBKDF2
//! (HMAC-SHA1, 1000 iterations) with a 16-byte salt stored in the plaintext
//! prefix of the header page. Every page encrypts as one CBC unit with the
//! salt as IV; the header page keeps its first [`PLAIN_PREFIX`] bytes clear
//! so the magic and the salt stay readable without the password.

use aes::cipher::{block_padding::NoPadding, BlockModeDecrypt, BlockModeEncrypt, KeyIvInit};
use rand::RngCore;

use super::page::PAGE_SIZE;
use super::stream::{PageStream, StreamKind};
use crate::error::{DbError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const SALT_SIZE: usize = 16;
/// Plaintext prefix of the data file's page 0 (magic, version, timestamps,
/// salt, allocation heads). Must stay a multiple of the AES block size.
pub const PLAIN_PREFIX: usize = 96;

const PBKDF2_ITERATIONS: u32 = 1000;

/// Frozen key material; cloned into each wrapped stream.
#[derive(Clone)]
pub struct AesStream {
    key: [u8; 32],
    salt: [u8; SALT_SIZE],
}

impl AesStream {
    pub fn new(password: &str, salt: [u8; SALT_SIZE]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<sha1::Sha1>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key);
        AesStream { key, salt }
    }

    pub fn generate_salt() -> [u8; SALT_SIZE] {
        let mut salt = [0u8; SALT_SIZE];
        // the all-zero salt means "not encrypted" in the header
        while salt.iter().all(|&b| b == 0) {
            rand::rng().fill_bytes(&mut salt);
        }
        salt
    }

    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    pub fn wrap(&self, inner: Box<dyn PageStream>, kind: StreamKind) -> EncryptedStream {
        EncryptedStream {
            inner,
            crypto: self.clone(),
            kind,
        }
    }

    fn region(&self, kind: StreamKind, position: u64) -> usize {
        if kind == StreamKind::Data && position == 0 {
            PLAIN_PREFIX
        } else {
            0
        }
    }

    fn encrypt(&self, kind: StreamKind, position: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.region(kind, position);
        let region = &mut buf[start..];
        let len = region.len();
        Aes256CbcEnc::new(&self.key.into(), &self.salt.into())
            .encrypt_padded::<NoPadding>(region, len)
            .map_err(|_| DbError::crypto("page encryption failed"))?;
        Ok(())
    }

    fn decrypt(&self, kind: StreamKind, position: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.region(kind, position);
        let region = &mut buf[start..];
        Aes256CbcDec::new(&self.key.into(), &self.salt.into())
            .decrypt_padded::<NoPadding>(region)
            .map_err(|_| DbError::crypto("page decryption failed"))?;
        Ok(())
    }
}

/// A [`PageStream`] that encrypts on write and decrypts on read.
pub struct EncryptedStream {
    inner: Box<dyn PageStream>,
    crypto: AesStream,
    kind: StreamKind,
}

impl PageStream for EncryptedStream {
    fn read_page(&mut self, position: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_page(position, buf)?;
        // reads past the end yield zero pages, never ciphertext
        if buf.iter().all(|&b| b == 0) {
            return Ok(());
        }
        self.crypto.decrypt(self.kind, position, buf)
    }

    fn write_page(&mut self, position: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut cipher = buf.to_vec();
        self.crypto.encrypt(self.kind, position, &mut cipher)?;
        self.inner.write_page(position, &cipher)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.inner.set_len(len)
    }
}
