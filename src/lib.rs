//! Local file protection: password-based file encryption, secure deletion,
//! time-lock tokens, an encrypted multi-user credential store and a
//! tamper-evident activity log.
//!
//! [`Vaultguard`] wires the components together for one installation. Each
//! component can also be used on its own.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod format;
pub mod history;
pub mod records;
pub mod session;
pub mod storage;
pub mod strength;
pub mod token;
pub mod users;
pub mod wipe;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{AuthPolicy, Config};
pub use crate::crypto::KdfParams;
pub use crate::engine::{DecryptOutcome, EncryptOptions, FileCipher, read_hidden_metadata};
pub use crate::error::{Error, Result};
pub use crate::format::{CipherContainer, HiddenMetadata};
pub use crate::history::{Action, Anchor, ChainReport, HistoryEntry, HistoryLog, Status};
pub use crate::records::RecordStore;
pub use crate::session::SessionManager;
pub use crate::storage::Storage;
pub use crate::strength::{StrengthTier, password_strength};
pub use crate::token::{AppKey, InstallKey, SigningKeyProvider, TokenService};
pub use crate::users::{AccountState, CredentialStore, NewUser, OtpGrant, OtpPurpose, UserRecord};
pub use crate::wipe::{WipeReport, wipe, wipe_tree};

/// Where [`Vaultguard::encrypt`] puts the ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptTarget {
    /// Write `<file>.enc` and keep the original.
    #[default]
    NewFile,
    /// Atomically replace the original.
    InPlace,
}

/// One installation: its stores, keys and the current session.
pub struct Vaultguard {
    config: Config,
    cipher: FileCipher,
    users: CredentialStore,
    history: HistoryLog,
    tokens: TokenService,
    session: SessionManager,
}

impl Vaultguard {
    pub fn open(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Open with an installation-bound token key instead of the shared
    /// application key.
    pub fn with_install_token_key(config: Config) -> Result<Self> {
        let mut vg = Self::open(config)?;
        vg.tokens = TokenService::new(Arc::new(InstallKey::new(vg.config.token_key_path())));
        Ok(vg)
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let users = CredentialStore::with_clock(&config, clock.clone())?;
        let history = HistoryLog::with_clock(&config, clock.clone())?;

        Ok(Self {
            cipher: FileCipher::with_clock(config.kdf, clock.clone()),
            tokens: TokenService::with_clock(Arc::new(AppKey), clock.clone()),
            session: SessionManager::with_clock(&config, clock),
            users,
            history,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cipher(&self) -> &FileCipher {
        &self.cipher
    }

    pub fn users(&self) -> &CredentialStore {
        &self.users
    }

    pub fn users_mut(&mut self) -> &mut CredentialStore {
        &mut self.users
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut HistoryLog {
        &mut self.history
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Authenticate and start a session for `username`.
    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.users.authenticate(username, password)?;
        self.session.login(username);
        Ok(())
    }

    pub fn logout(&self) {
        self.session.logout();
    }

    /// Encrypt `path` and return where the ciphertext now lives.
    pub fn encrypt(
        &mut self,
        path: &Path,
        password: &str,
        target: EncryptTarget,
        options: &EncryptOptions,
    ) -> Result<PathBuf> {
        self.session.touch();
        let result = match target {
            EncryptTarget::NewFile => self.cipher.encrypt_to_new_file(path, password, options),
            EncryptTarget::InPlace => self
                .cipher
                .encrypt_in_place(path, password, options)
                .map(|()| path.to_path_buf()),
        };
        self.record(Action::Encrypt, path, result)
    }

    pub fn decrypt(
        &mut self,
        path: &Path,
        password: &str,
        output: Option<&Path>,
    ) -> Result<DecryptOutcome> {
        self.session.touch();
        let result = self.cipher.decrypt_file(path, password, output);
        self.record(Action::Decrypt, path, result)
    }

    /// Decrypt with the base password carried by a time-lock token.
    pub fn decrypt_with_token(
        &mut self,
        path: &Path,
        token: &str,
        output: Option<&Path>,
    ) -> Result<DecryptOutcome> {
        self.session.touch();
        let result = self
            .tokens
            .validate(token)
            .and_then(|password| self.cipher.decrypt_file(path, &password, output));
        self.record(Action::Decrypt, path, result)
    }

    pub fn secure_delete(&mut self, path: &Path) -> Result<()> {
        self.session.touch();
        let result = wipe(path, self.config.wipe_passes);
        self.record(Action::SecureDelete, path, result)
    }

    /// Wipe a whole directory. A partial wipe is recorded as failed but
    /// still returns the report.
    pub fn secure_delete_tree(&mut self, dir: &Path) -> Result<WipeReport> {
        self.session.touch();
        let report = wipe_tree(dir, self.config.wipe_passes);
        let status = if report.is_complete() {
            Status::Success
        } else {
            Status::Failed
        };
        let user = self.session.username().unwrap_or_default();
        self.history
            .append(Action::SecureDelete, &display_name(dir), crypto::ALGORITHM, status, &user)?;
        Ok(report)
    }

    pub fn panic_lock(&self) -> WipeReport {
        self.session.panic_lock()
    }

    /// Log the outcome of `action` and hand back the operation's result.
    ///
    /// A failed operation keeps its own error even if logging also fails.
    fn record<T>(&mut self, action: Action, path: &Path, result: Result<T>) -> Result<T> {
        let status = if result.is_ok() {
            Status::Success
        } else {
            Status::Failed
        };
        let user = self.session.username().unwrap_or_default();
        let logged = self
            .history
            .append(action, &display_name(path), crypto::ALGORITHM, status, &user);

        match (result, logged) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(log_err)) => {
                warn!(error = %log_err, "could not record failed operation");
                Err(e)
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
