//! Hybrid RSA-OAEP / AES-256-CFB stream encryption
//!
//! The stream starts with a random AES key encrypted under the recipient's
//! RSA key (OAEP, SHA-256). The blob is as long as the RSA modulus and its
//! first 16 bytes double as the CFB IV. Everything after it is the
//! AES-CFB ciphertext of the payload.

use crate::error::{DiagError, Result};
use aes::Aes256;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::io::{self, Read, Write};
use std::path::Path;
use x509_cert::der::{DecodePem, Encode};
use x509_cert::Certificate;

const AES_KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Load a recipient key from a PEM certificate, SPKI public key or PKCS#1 public key
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = std::fs::read_to_string(path)?;
    parse_public_key(&pem).map_err(|e| DiagError::CryptoKey(format!("{}: {}", path.display(), e)))
}

fn parse_public_key(pem: &str) -> std::result::Result<RsaPublicKey, String> {
    if pem.contains("BEGIN CERTIFICATE") {
        let cert = Certificate::from_pem(pem.as_bytes()).map_err(|e| e.to_string())?;
        let spki = cert
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| e.to_string())?;
        return RsaPublicKey::from_public_key_der(&spki).map_err(|e| e.to_string());
    }
    if pem.contains("BEGIN RSA PUBLIC KEY") {
        return RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| e.to_string());
    }
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| e.to_string())
}

/// Load a PKCS#8 or PKCS#1 private key
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = std::fs::read_to_string(path)?;
    let key = if pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(&pem).map_err(|e| e.to_string())
    } else {
        RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| e.to_string())
    };
    key.map_err(|e| DiagError::CryptoKey(format!("{}: {}", path.display(), e)))
}

/// Encrypts everything written through it
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: BufEncryptor<Aes256>,
    buf: Vec<u8>,
}

impl<W: Write> EncryptWriter<W> {
    /// Writes the wrapped key to `inner` right away
    pub fn new(key: &RsaPublicKey, mut inner: W) -> Result<Self> {
        let mut aes_key = [0u8; AES_KEY_LEN];
        OsRng.fill_bytes(&mut aes_key);

        let wrapped = key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &aes_key)
            .map_err(|e| DiagError::CryptoKey(format!("failed to wrap session key: {}", e)))?;
        if wrapped.len() != key.size() || wrapped.len() < IV_LEN {
            return Err(DiagError::Bug(format!(
                "wrapped key is {} bytes for a {} byte modulus",
                wrapped.len(),
                key.size()
            )));
        }
        inner.write_all(&wrapped)?;

        let cipher = BufEncryptor::<Aes256>::new_from_slices(&aes_key, &wrapped[..IV_LEN])
            .map_err(|e| DiagError::Bug(format!("cfb init: {}", e)))?;
        Ok(Self {
            inner,
            cipher,
            buf: Vec::new(),
        })
    }

    pub fn into_inner(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.cipher.encrypt(&mut self.buf);
        self.inner.write_all(&self.buf)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts a stream produced by [`EncryptWriter`]
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: BufDecryptor<Aes256>,
}

impl<R: Read> DecryptReader<R> {
    /// Reads and unwraps the session key from the head of `inner`
    pub fn new(key: &RsaPrivateKey, mut inner: R) -> Result<Self> {
        let mut wrapped = vec![0u8; key.size()];
        inner.read_exact(&mut wrapped).map_err(|e| {
            DiagError::CryptoKey(format!("stream too short for the wrapped key: {}", e))
        })?;
        let aes_key = key
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .map_err(|e| DiagError::CryptoKey(format!("failed to unwrap session key: {}", e)))?;
        let cipher = BufDecryptor::<Aes256>::new_from_slices(&aes_key, &wrapped[..IV_LEN])
            .map_err(|e| DiagError::CryptoKey(format!("bad session key: {}", e)))?;
        Ok(Self { inner, cipher })
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(out)?;
        self.cipher.decrypt(&mut out[..n]);
        Ok(n)
    }
}
