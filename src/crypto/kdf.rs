use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{KEY_LEN, PASSWORD_HASH_LEN, SALT_LEN, constant_time_eq, generate_salt};
use crate::error::{Error, Result};

/// A 256-bit key derived from a password. Zeroed on drop.
pub type DerivedKey = Zeroizing<[u8; KEY_LEN]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            // default memory cost
            mem_cost_kib: 64 * 1024, // 64 MiB
            // default number of iterations
            time_cost: 3,
            // default number of threads
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn new(mem_cost_kib: u32, time_cost: u32, parallelism: u32) -> Result<Self> {
        let params = Self {
            mem_cost_kib,
            time_cost,
            parallelism,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn mem_cost_kib(&self) -> u32 {
        self.mem_cost_kib
    }

    pub fn time_cost(&self) -> u32 {
        self.time_cost
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn validate(&self) -> Result<()> {
        if self.time_cost < 1 {
            return Err(Error::Kdf("argon2 time cost must be >= 1".into()));
        }
        if self.parallelism < 1 {
            return Err(Error::Kdf("argon2 parallelism must be >= 1".into()));
        }
        if self.mem_cost_kib < 8 * self.parallelism {
            return Err(Error::Kdf(
                "argon2 memory cost must be at least 8 * parallelism".into(),
            ));
        }
        Ok(())
    }
}

/// Derive a 32-byte key from `password` and `salt` with Argon2id.
///
/// Deterministic for the same `(password, salt, kdf)` triple.
pub fn derive_key(password: &str, salt: &[u8], kdf: KdfParams) -> Result<DerivedKey> {
    kdf.validate()?;

    let params = Params::new(
        kdf.mem_cost_kib,
        kdf.time_cost,
        kdf.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| Error::Kdf(format!("failed to construct Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut *key)
        .map_err(|e| Error::Kdf(format!("argon2 key derivation failed: {e}")))?;

    Ok(key)
}

/// Hash a password for credential storage. Returns `salt || derived key`.
///
/// A fresh salt is generated when `salt` is `None`.
pub fn hash_password(password: &str, salt: Option<[u8; SALT_LEN]>, kdf: KdfParams) -> Result<Vec<u8>> {
    let salt = match salt {
        Some(s) => s,
        None => generate_salt()?,
    };
    let key = derive_key(password, &salt, kdf)?;

    let mut blob = Vec::with_capacity(PASSWORD_HASH_LEN);
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&*key);
    Ok(blob)
}

/// Recompute the key for `password` and compare it to `blob` in constant time.
///
/// A blob of the wrong length never matches.
pub fn verify_password(password: &str, blob: &[u8], kdf: KdfParams) -> Result<bool> {
    if blob.len() != PASSWORD_HASH_LEN {
        return Ok(false);
    }
    let (salt, stored) = blob.split_at(SALT_LEN);
    let key = derive_key(password, salt, kdf)?;
    Ok(constant_time_eq(&*key, stored))
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_is_deterministic() {
        let salt = [42u8; 16];
        let kdf = test_params();

        let k1 = derive_key("password", &salt, kdf).unwrap();
        let k2 = derive_key("password", &salt, kdf).unwrap();

        assert_eq!(*k1, *k2);
    }

    #[test]
    fn kdf_params_affect_output() {
        let salt = [7u8; 16];

        let kdf1 = KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        };
        let kdf2 = KdfParams {
            mem_cost_kib: 2048,
            time_cost: 1,
            parallelism: 1,
        };

        let k1 = derive_key("pw", &salt, kdf1).unwrap();
        let k2 = derive_key("pw", &salt, kdf2).unwrap();

        assert_ne!(*k1, *k2);
    }

    #[test]
    fn kdf_invalid_params_fail_gracefully() {
        assert!(KdfParams::new(0, 0, 0).is_err());
        assert!(KdfParams::new(8, 1, 2).is_err());
        assert!(KdfParams::new(16, 1, 2).is_ok());
    }

    #[test]
    fn hash_and_verify() {
        let kdf = test_params();
        let blob = hash_password("hunter22", None, kdf).unwrap();

        assert_eq!(blob.len(), PASSWORD_HASH_LEN);
        assert!(verify_password("hunter22", &blob, kdf).unwrap());
        assert!(!verify_password("hunter23", &blob, kdf).unwrap());
    }

    #[test]
    fn hash_with_fixed_salt_is_reproducible() {
        let kdf = test_params();
        let a = hash_password("pw", Some([3u8; 16]), kdf).unwrap();
        let b = hash_password("pw", Some([3u8; 16]), kdf).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..SALT_LEN], &[3u8; 16]);
    }

    #[test]
    fn verify_rejects_truncated_blob() {
        let kdf = test_params();
        let blob = hash_password("pw", None, kdf).unwrap();
        assert!(!verify_password("pw", &blob[..40], kdf).unwrap());
    }
}
