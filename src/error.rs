use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the engine can report to a caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{}' is empty; nothing to encrypt", .0.display())]
    EmptyFile(PathBuf),

    #[error("password cannot be empty")]
    EmptyPassword,

    #[error("wrong password or corrupted file")]
    BadPassword,

    #[error("token signature mismatch; token was tampered with")]
    BadSignature,

    #[error("malformed token")]
    MalformedToken,

    #[error("token expired")]
    Expired,

    #[error("account locked; try again in {retry_after}s")]
    AccountLocked { retry_after: i64 },

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("no pending OTP; request a new one")]
    NoChallenge,

    #[error("OTP expired; request a new one")]
    OtpExpired,

    #[error("incorrect OTP; {remaining} attempt(s) left")]
    InvalidCode { remaining: u32 },

    #[error("too many wrong OTP attempts; request a new one")]
    OtpAttemptsExhausted,

    #[error("malformed container: {0}")]
    MalformedContainer(&'static str),

    #[error("store '{}' does not exist", .0.display())]
    MissingStore(PathBuf),

    #[error("store '{}' is corrupted: {reason}", path.display())]
    CorruptStore { path: PathBuf, reason: String },

    #[error("audit chain broken at entry #{index}")]
    ChainBroken { index: usize },

    #[error("{0}")]
    Validation(&'static str),

    #[error("username '{0}' already taken")]
    UsernameTaken(String),

    #[error("user '{0}' not found")]
    UserNotFound(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("OS random generator unavailable")]
    Random,
}

impl Error {
    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Error::CorruptStore {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Failures the user can fix by retrying with different input.
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Error::EmptyPassword
                | Error::BadPassword
                | Error::BadSignature
                | Error::MalformedToken
                | Error::Expired
                | Error::AccountLocked { .. }
                | Error::InvalidCredentials
                | Error::NoChallenge
                | Error::OtpExpired
                | Error::InvalidCode { .. }
                | Error::OtpAttemptsExhausted
                | Error::Validation(_)
                | Error::UsernameTaken(_)
        )
    }

    /// Data that is unreadable or has been tampered with. Never retried.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Error::MalformedContainer(_) | Error::CorruptStore { .. } | Error::ChainBroken { .. }
        )
    }
}
