//! Install-bound encrypted JSON documents.
//!
//! Record file format:
//! ```text
//! MAGIC (4) | VERSION (1) | MEM_COST (4) | TIME_COST (4) | PARALLELISM (4) | NONCE (24) | CIPHERTEXT
//! ```
//!
//! The wrapping key is Argon2id over a fixed context string and the
//! installation's random salt file. Without that salt file the record
//! cannot be opened.

use std::path::{Path, PathBuf};

use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::random::random_array;
use crate::crypto::{DerivedKey, KdfParams, SALT_LEN, derive_key};
use crate::error::{Error, Result};
use crate::storage::{Storage, load_or_create_secret};

const MAGIC: &[u8; 4] = b"VGRS";
const VERSION_V1: u8 = 1;
const NONCE_LEN: usize = 24;
const HEADER_LEN: usize = 4 + 1 + 4 + 4 + 4 + NONCE_LEN;
/// Stored costs may exceed `max(configured, default)` by at most this factor.
const COST_HEADROOM: u32 = 4;

/// An encrypted JSON document bound to one installation.
pub struct RecordStore {
    storage: Storage,
    context: &'static str,
    salt_path: PathBuf,
    kdf: KdfParams,
    /// Upper bounds for the memory, time and parallelism read from a header.
    ceiling: [u32; 3],
    key: Option<(KdfParams, DerivedKey)>,
}

impl RecordStore {
    /// `context` separates the keys of different stores sharing one salt.
    pub fn new(
        path: impl Into<PathBuf>,
        context: &'static str,
        salt_path: impl Into<PathBuf>,
        kdf: KdfParams,
    ) -> Self {
        Self {
            storage: Storage::new(path),
            context,
            salt_path: salt_path.into(),
            kdf,
            ceiling: cost_ceiling(kdf),
            key: None,
        }
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    pub fn exists(&self) -> bool {
        self.storage.exists()
    }

    /// Decrypt and deserialize the document.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingStore`] if the file does not exist
    /// - [`Error::CorruptStore`] if the header, the install salt, the
    ///   authentication tag or the JSON is bad, or if the header asks for
    ///   costs far above the configured ones
    pub fn load<T: DeserializeOwned>(&mut self) -> Result<T> {
        if !self.storage.exists() {
            return Err(Error::MissingStore(self.path().to_path_buf()));
        }
        let data = self.storage.load()?;

        let (kdf, nonce, ciphertext) = self.parse(&data)?;
        if !self.salt_path.exists() {
            return Err(Error::corrupt(self.path(), "install salt is missing"));
        }
        let key = self.key_for(kdf)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(XNonce::from_slice(nonce), ciphertext)
                .map_err(|_| Error::corrupt(self.path(), "authentication failed"))?,
        );

        // keep writing with the parameters the record was created with
        self.kdf = kdf;

        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::corrupt(self.path(), format!("invalid document: {e}")))
    }

    /// Serialize, encrypt under a fresh nonce and atomically replace the file.
    pub fn save<T: Serialize>(&mut self, document: &T) -> Result<()> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(document)
                .map_err(|e| Error::corrupt(self.path(), format!("unserializable document: {e}")))?,
        );

        let kdf = self.kdf;
        let key = self.key_for(kdf)?;
        let nonce: [u8; NONCE_LEN] = random_array()?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| Error::corrupt(self.path(), "encryption failed"))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION_V1);
        buf.extend_from_slice(&kdf.mem_cost_kib().to_le_bytes());
        buf.extend_from_slice(&kdf.time_cost().to_le_bytes());
        buf.extend_from_slice(&kdf.parallelism().to_le_bytes());
        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(&ciphertext);

        self.storage.save(&buf)?;
        debug!(path = %self.path().display(), bytes = buf.len(), "saved record store");
        Ok(())
    }

    fn parse<'a>(&self, data: &'a [u8]) -> Result<(KdfParams, &'a [u8], &'a [u8])> {
        if data.len() < HEADER_LEN {
            return Err(Error::corrupt(self.path(), "file too short"));
        }
        if &data[..4] != MAGIC {
            return Err(Error::corrupt(self.path(), "invalid magic"));
        }
        if data[4] != VERSION_V1 {
            return Err(Error::corrupt(
                self.path(),
                format!("unsupported version: {}", data[4]),
            ));
        }

        let u32_at = |off: usize| u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
        let costs = [u32_at(5), u32_at(9), u32_at(13)];
        if costs.iter().zip(self.ceiling).any(|(cost, max)| *cost > max) {
            return Err(Error::corrupt(
                self.path(),
                format!("key derivation costs {costs:?} exceed limit {:?}", self.ceiling),
            ));
        }
        let kdf = KdfParams::new(costs[0], costs[1], costs[2])
            .map_err(|e| Error::corrupt(self.path(), e.to_string()))?;

        let nonce = &data[17..17 + NONCE_LEN];
        let ciphertext = &data[HEADER_LEN..];
        Ok((kdf, nonce, ciphertext))
    }

    /// The wrapping key for `kdf`, derived once and then cached.
    fn key_for(&mut self, kdf: KdfParams) -> Result<DerivedKey> {
        if let Some((cached_kdf, key)) = &self.key {
            if *cached_kdf == kdf {
                return Ok(key.clone());
            }
        }

        let salt = load_or_create_secret(&self.salt_path, SALT_LEN)?;
        let key = derive_key(self.context, &salt, kdf)?;
        self.key = Some((kdf, key.clone()));
        Ok(key)
    }
}

fn cost_ceiling(configured: KdfParams) -> [u32; 3] {
    let default = KdfParams::default();
    [
        configured.mem_cost_kib().max(default.mem_cost_kib()),
        configured.time_cost().max(default.time_cost()),
        configured.parallelism().max(default.parallelism()),
    ]
    .map(|cost| cost.saturating_mul(COST_HEADROOM))
}
