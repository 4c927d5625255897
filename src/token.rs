//! Time-locked password tokens.
//!
//! `base64url(JSON {"password", "expiry"}) "." base64url(HMAC-SHA256(JSON))`
//!
//! Validity depends only on the signature and the current time; tokens are
//! never stored.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use base64::alphabet::URL_SAFE;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};
use crate::crypto::mac::{hmac_sha256, hmac_sha256_verify};
use crate::error::{Error, Result};
use crate::storage::load_or_create_secret;

/// URL-safe base64 without padding on output; padded input is accepted.
const B64: GeneralPurpose = GeneralPurpose::new(
    &URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const APP_TOKEN_KEY: &[u8] = b"vaultguard/time-lock/v1/app-signing-key";
const INSTALL_KEY_LEN: usize = 32;

/// Supplies the secret that signs tokens.
pub trait SigningKeyProvider: Send + Sync {
    fn signing_key(&self) -> Result<Zeroizing<Vec<u8>>>;
}

/// The fixed application-wide key. Every installation shares it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppKey;

impl SigningKeyProvider for AppKey {
    fn signing_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(APP_TOKEN_KEY.to_vec()))
    }
}

/// A random 32-byte key created on first use and kept in a file, so tokens
/// only validate on the installation that issued them.
#[derive(Debug, Clone)]
pub struct InstallKey {
    path: PathBuf,
}

impl InstallKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SigningKeyProvider for InstallKey {
    fn signing_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        load_or_create_secret(&self.path, INSTALL_KEY_LEN)
    }
}

#[derive(Serialize, Deserialize)]
struct Payload {
    password: String,
    /// Unix seconds after which the token is dead.
    expiry: i64,
}

impl Drop for Payload {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.password);
    }
}

pub struct TokenService {
    keys: Arc<dyn SigningKeyProvider>,
    clock: Arc<dyn Clock>,
}

impl Default for TokenService {
    fn default() -> Self {
        Self::new(Arc::new(AppKey))
    }
}

impl TokenService {
    pub fn new(keys: Arc<dyn SigningKeyProvider>) -> Self {
        Self::with_clock(keys, Arc::new(SystemClock))
    }

    pub fn with_clock(keys: Arc<dyn SigningKeyProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { keys, clock }
    }

    /// Issue a token that unlocks `base_password` for `duration_secs`.
    ///
    /// Returns the token and its expiry in Unix seconds.
    pub fn issue(&self, base_password: &str, duration_secs: u64) -> Result<(String, i64)> {
        if base_password.is_empty() {
            return Err(Error::EmptyPassword);
        }
        let duration = i64::try_from(duration_secs)
            .map_err(|_| Error::Validation("token duration too large"))?;
        let expiry = self.clock.unix().saturating_add(duration);

        let payload = Payload {
            password: base_password.to_owned(),
            expiry,
        };
        let json = Zeroizing::new(
            serde_json::to_vec(&payload).map_err(|_| Error::MalformedToken)?,
        );

        let key = self.keys.signing_key()?;
        let sig = hmac_sha256(&key, &json);

        let token = format!("{}.{}", B64.encode(&*json), B64.encode(sig));
        Ok((token, expiry))
    }

    /// Check a token and return the password it carries.
    ///
    /// The signature is checked before anything in the payload is trusted.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedToken`] if the token is not two base64url parts
    /// - [`Error::BadSignature`] if the signature does not match
    /// - [`Error::Expired`] if the expiry has passed
    pub fn validate(&self, token: &str) -> Result<Zeroizing<String>> {
        let (payload_b64, sig_b64) = token.trim().split_once('.').ok_or(Error::MalformedToken)?;
        if sig_b64.contains('.') {
            return Err(Error::MalformedToken);
        }

        let json = Zeroizing::new(B64.decode(payload_b64).map_err(|_| Error::MalformedToken)?);
        let sig = B64.decode(sig_b64).map_err(|_| Error::MalformedToken)?;

        let key = self.keys.signing_key()?;
        if !hmac_sha256_verify(&key, &json, &sig) {
            return Err(Error::BadSignature);
        }

        let payload: Payload = serde_json::from_slice(&json).map_err(|_| Error::MalformedToken)?;
        if self.clock.unix() > payload.expiry {
            return Err(Error::Expired);
        }

        Ok(Zeroizing::new(payload.password.clone()))
    }
}
