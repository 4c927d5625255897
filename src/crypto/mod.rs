//! Cryptographic primitives.
//!
//! Provides password-based key derivation, random bytes, HMAC and the
//! AES-256-CBC block cipher used by file containers.

pub mod cipher;
pub mod kdf;
pub mod mac;
pub mod random;

pub use cipher::{decrypt_cbc, encrypt_cbc};
pub use kdf::{DerivedKey, KdfParams, derive_key, hash_password, verify_password};
pub use mac::{constant_time_eq, hmac_sha256};
pub use random::{generate_iv, generate_salt, random_array, random_bytes};

/// Length of the salt (16 bytes).
pub const SALT_LEN: usize = 16;
/// Length of the CBC initialization vector (16 bytes).
pub const IV_LEN: usize = 16;
/// Length of the derived key (32 bytes / 256 bits).
pub const KEY_LEN: usize = 32;
/// AES block size in bytes.
pub const BLOCK_LEN: usize = 16;
/// Length of an HMAC-SHA256 tag.
pub const MAC_LEN: usize = 32;
/// Length of a password hash blob (`salt || derived key`).
pub const PASSWORD_HASH_LEN: usize = SALT_LEN + KEY_LEN;

/// Name recorded in the activity log for file containers.
pub const ALGORITHM: &str = "AES-256-CBC";
