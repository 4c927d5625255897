//! Installation layout and security tunables.
//!
//! One `Config` describes one installation: every component receives it
//! (or the part it needs) explicitly.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::crypto::KdfParams;
use crate::error::{Error, Result};

pub const MAX_LOGIN_ATTEMPTS: u32 = 3;
pub const LOCKOUT_SECS: i64 = 120;
pub const OTP_VALIDITY_SECS: i64 = 300;
pub const OTP_LENGTH: u32 = 6;
pub const OTP_MAX_ATTEMPTS: u32 = 3;
pub const WIPE_PASSES: usize = 7;
pub const SESSION_TIMEOUT_SECS: i64 = 300;
pub const HISTORY_LIMIT: usize = 200;

const USERS_FILE: &str = "users.vgs";
const HISTORY_FILE: &str = "history.vgs";
const INSTALL_SALT_FILE: &str = "install.salt";
const CHAIN_KEY_FILE: &str = "chain.key";
const TOKEN_KEY_FILE: &str = "token.key";

/// Lockout and OTP limits for the credential store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPolicy {
    pub max_login_attempts: u32,
    pub lockout_secs: i64,
    pub otp_validity_secs: i64,
    pub otp_length: u32,
    pub otp_max_attempts: u32,
    /// Upper bound on live OTP challenges held in memory.
    pub otp_capacity: usize,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            max_login_attempts: MAX_LOGIN_ATTEMPTS,
            lockout_secs: LOCKOUT_SECS,
            otp_validity_secs: OTP_VALIDITY_SECS,
            otp_length: OTP_LENGTH,
            otp_max_attempts: OTP_MAX_ATTEMPTS,
            otp_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Scratch space for decrypted working copies; wiped by a panic lock.
    pub temp_dir: PathBuf,
    pub kdf: KdfParams,
    pub auth: AuthPolicy,
    pub wipe_passes: usize,
    pub history_limit: usize,
    pub session_timeout_secs: i64,
}

impl Config {
    /// A configuration rooted at `root`: stores under `root/data`, scratch
    /// files under `root/tmp`.
    pub fn from_dir(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join("data"),
            temp_dir: root.join("tmp"),
            kdf: KdfParams::default(),
            auth: AuthPolicy::default(),
            wipe_passes: WIPE_PASSES,
            history_limit: HISTORY_LIMIT,
            session_timeout_secs: SESSION_TIMEOUT_SECS,
        }
    }

    /// The platform's per-user data directory for vaultguard.
    pub fn default_location() -> Result<Self> {
        let project_dirs = ProjectDirs::from("", "", "vaultguard").ok_or(Error::Validation(
            "could not determine platform directories",
        ))?;
        Ok(Self::from_dir(project_dirs.data_dir()))
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join(USERS_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join(HISTORY_FILE)
    }

    pub fn install_salt_path(&self) -> PathBuf {
        self.data_dir.join(INSTALL_SALT_FILE)
    }

    pub fn chain_key_path(&self) -> PathBuf {
        self.data_dir.join(CHAIN_KEY_FILE)
    }

    pub fn token_key_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_KEY_FILE)
    }
}
