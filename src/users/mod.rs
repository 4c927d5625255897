//! Encrypted user records and the login state machine.
//!
//! Per account: `Active` until `max_login_attempts` consecutive failures,
//! then `Locked(until)`. A locked account refuses logins without looking at
//! the password; once `until` passes the next attempt starts from a clean
//! counter.

mod otp;

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};
use crate::config::{AuthPolicy, Config};
use crate::crypto::{KdfParams, PASSWORD_HASH_LEN, hash_password, verify_password};
use crate::error::{Error, Result};
use crate::records::RecordStore;

pub use otp::{OtpGrant, OtpPurpose};
use otp::OtpCache;

const STORE_CONTEXT: &str = "vaultguard/users/v1";

const MIN_USERNAME_LEN: usize = 3;
const MIN_PASSWORD_LEN: usize = 8;
const MIN_MOBILE_LEN: usize = 7;

/// One account as persisted in the user store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    username: String,
    #[serde(with = "b64")]
    password_hash: Vec<u8>,
    /// Cost parameters `password_hash` was computed with.
    kdf: KdfParams,
    email: String,
    mobile: String,
    full_name: String,
    created_at: DateTime<Utc>,
    last_login: Option<DateTime<Utc>>,
    login_attempts: u32,
    /// Unix seconds.
    lockout_until: Option<i64>,
}

impl UserRecord {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn mobile(&self) -> &str {
        &self.mobile
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_login(&self) -> Option<DateTime<Utc>> {
        self.last_login
    }

    pub fn login_attempts(&self) -> u32 {
        self.login_attempts
    }

    pub fn lockout_until(&self) -> Option<i64> {
        self.lockout_until
    }
}

mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Active,
    Locked { until: i64 },
}

/// Registration form.
#[derive(Debug, Clone, Copy)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub email: &'a str,
    pub mobile: &'a str,
    pub full_name: &'a str,
}

impl NewUser<'_> {
    fn validate(&self) -> Result<()> {
        if self.username.trim().chars().count() < MIN_USERNAME_LEN {
            return Err(Error::Validation("username must be at least 3 characters"));
        }
        validate_password(self.password)?;
        if !self.email.contains('@') {
            return Err(Error::Validation("email address is invalid"));
        }
        if self.mobile.trim().chars().count() < MIN_MOBILE_LEN {
            return Err(Error::Validation("mobile number is too short"));
        }
        Ok(())
    }
}

fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::Validation("password must be at least 8 characters"));
    }
    Ok(())
}

/// All accounts of one installation plus their pending OTP challenges.
///
/// Every mutation is written through to the encrypted store before the call
/// returns; a failed write leaves the in-memory records unchanged. Not safe
/// against a second process writing the same store.
pub struct CredentialStore {
    store: RecordStore,
    users: BTreeMap<String, UserRecord>,
    otps: OtpCache,
    policy: AuthPolicy,
    kdf: KdfParams,
    clock: Arc<dyn Clock>,
}

impl CredentialStore {
    pub fn open(config: &Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Open the store, starting empty when it does not exist yet.
    ///
    /// A store that exists but cannot be decrypted is an error, never a
    /// fresh start.
    pub fn with_clock(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut store = RecordStore::new(
            config.users_path(),
            STORE_CONTEXT,
            config.install_salt_path(),
            config.kdf,
        );
        let users = match store.load() {
            Ok(users) => users,
            Err(Error::MissingStore(_)) => BTreeMap::new(),
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            users,
            otps: OtpCache::new(config.auth.otp_capacity, config.auth.otp_max_attempts),
            policy: config.auth,
            kdf: config.kdf,
            clock,
        })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn user_exists(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn user(&self, username: &str) -> Option<&UserRecord> {
        self.users.get(username)
    }

    pub fn mobile_for(&self, username: &str) -> Option<&str> {
        self.users.get(username).map(|u| u.mobile.as_str())
    }

    pub fn username_for_mobile(&self, mobile: &str) -> Option<&str> {
        let mobile = mobile.trim();
        self.users
            .values()
            .find(|u| u.mobile == mobile)
            .map(|u| u.username.as_str())
    }

    pub fn state(&self, username: &str) -> Option<AccountState> {
        let user = self.users.get(username)?;
        Some(match user.lockout_until {
            Some(until) if self.clock.unix() < until => AccountState::Locked { until },
            _ => AccountState::Active,
        })
    }

    pub fn register(&mut self, new: NewUser<'_>) -> Result<()> {
        new.validate()?;
        let username = new.username.trim();
        if self.users.contains_key(username) {
            return Err(Error::UsernameTaken(username.to_owned()));
        }

        let record = UserRecord {
            username: username.to_owned(),
            password_hash: hash_password(new.password, None, self.kdf)?,
            kdf: self.kdf,
            email: new.email.trim().to_owned(),
            mobile: new.mobile.trim().to_owned(),
            full_name: new.full_name.trim().to_owned(),
            created_at: self.clock.now(),
            last_login: None,
            login_attempts: 0,
            lockout_until: None,
        };
        self.put_user(record)?;

        info!(username, "registered user");
        Ok(())
    }

    /// Check a login.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCredentials`] for a wrong password or an unknown
    ///   username; both cost one key derivation and one store write
    /// - [`Error::AccountLocked`] while a lockout is running
    pub fn authenticate(&mut self, username: &str, password: &str) -> Result<&UserRecord> {
        let now = self.clock.now();
        let now_secs = now.timestamp();

        let Some(current) = self.users.get(username) else {
            let _ = verify_password(password, &[0u8; PASSWORD_HASH_LEN], self.kdf)?;
            // same write as a failed login on a real account
            self.store.save(&self.users)?;
            warn!("login failed");
            return Err(Error::InvalidCredentials);
        };
        let mut user = current.clone();

        if let Some(until) = user.lockout_until {
            if now_secs < until {
                warn!(username, retry_after = until - now_secs, "login refused: account locked");
                return Err(Error::AccountLocked {
                    retry_after: until - now_secs,
                });
            }
            user.lockout_until = None;
            user.login_attempts = 0;
        }

        let ok = verify_password(password, &user.password_hash, user.kdf)?;
        if ok {
            user.login_attempts = 0;
            user.last_login = Some(now);
        } else {
            user.login_attempts += 1;
            if user.login_attempts >= self.policy.max_login_attempts {
                user.lockout_until = Some(now_secs + self.policy.lockout_secs);
                warn!(username, "too many failed logins; account locked");
            }
        }

        self.put_user(user)?;
        if !ok {
            warn!("login failed");
            return Err(Error::InvalidCredentials);
        }

        info!(username, "login succeeded");
        self.users
            .get(username)
            .ok_or_else(|| Error::UserNotFound(username.to_owned()))
    }

    /// Start an OTP challenge for `mobile` and return the code.
    ///
    /// The caller delivers the code. A reset challenge is only issued when
    /// `mobile` belongs to `username`.
    pub fn generate_otp(
        &mut self,
        mobile: &str,
        purpose: OtpPurpose,
        username: &str,
    ) -> Result<Zeroizing<String>> {
        let mobile = mobile.trim();
        if mobile.is_empty() {
            return Err(Error::Validation("mobile number is required"));
        }
        if purpose == OtpPurpose::Reset && self.mobile_for(username) != Some(mobile) {
            return Err(Error::UserNotFound(username.to_owned()));
        }

        let now = self.clock.unix();
        let code = self.otps.issue(
            mobile,
            purpose,
            username,
            self.policy.otp_length,
            now + self.policy.otp_validity_secs,
            now,
        )?;
        info!(?purpose, "issued one-time code");
        Ok(code)
    }

    pub fn verify_otp(&mut self, mobile: &str, code: &str) -> Result<OtpGrant> {
        let result = self.otps.verify(mobile.trim(), code, self.clock.unix());
        if let Err(e) = &result {
            warn!(error = %e, "OTP verification failed");
        }
        result
    }

    /// Drop the challenge for `mobile`, if any.
    pub fn cancel_otp(&mut self, mobile: &str) {
        self.otps.clear(mobile.trim());
    }

    /// Remove expired challenges; returns how many were dropped.
    pub fn sweep_expired_otps(&mut self) -> usize {
        self.otps.sweep(self.clock.unix())
    }

    /// Set a new password using the grant from [`CredentialStore::verify_otp`].
    /// The grant is used up. Clears any lockout.
    pub fn reset_password(&mut self, grant: OtpGrant, new_password: &str) -> Result<()> {
        if grant.purpose() != OtpPurpose::Reset {
            return Err(Error::Validation("grant was not issued for a password reset"));
        }
        validate_password(new_password)?;

        let mut user = self
            .users
            .get(grant.username())
            .filter(|u| u.mobile == grant.mobile())
            .cloned()
            .ok_or_else(|| Error::UserNotFound(grant.username().to_owned()))?;

        user.password_hash = hash_password(new_password, None, self.kdf)?;
        user.kdf = self.kdf;
        user.login_attempts = 0;
        user.lockout_until = None;
        self.put_user(user)?;

        info!(username = grant.username(), "password reset");
        Ok(())
    }

    /// Insert or replace `record` and persist. If the save fails the
    /// previous record (or its absence) is restored.
    fn put_user(&mut self, record: UserRecord) -> Result<()> {
        let username = record.username.clone();
        let previous = self.users.insert(username.clone(), record);

        if let Err(e) = self.store.save(&self.users) {
            match previous {
                Some(previous) => self.users.insert(username, previous),
                None => self.users.remove(&username),
            };
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::kdf::test_params;
    use std::path::Path;
    use tempfile::tempdir;

    const PW: &str = "hunter2hunter2";

    fn config(dir: &Path) -> Config {
        Config::from_dir(dir).with_kdf(test_params())
    }

    fn alice() -> NewUser<'static> {
        NewUser {
            username: "alice",
            password: PW,
            email: "alice@example.com",
            mobile: "5550100",
            full_name: "Alice Liddell",
        }
    }

    fn open(dir: &Path, clock: Arc<ManualClock>) -> CredentialStore {
        CredentialStore::with_clock(&config(dir), clock).unwrap()
    }

    #[test]
    fn register_then_authenticate() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(1_000));
        let mut users = open(dir.path(), clock.clone());
        users.register(alice()).unwrap();

        clock.advance(5);
        let user = users.authenticate("alice", PW).unwrap();
        assert_eq!(user.login_attempts(), 0);
        assert_eq!(user.last_login().map(|t| t.timestamp()), Some(1_005));
        assert_eq!(user.created_at().timestamp(), 1_000);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(0));
        open(dir.path(), clock.clone()).register(alice()).unwrap();

        let mut users = open(dir.path(), clock);
        assert!(users.user_exists("alice"));
        assert_eq!(users.mobile_for("alice"), Some("5550100"));
        assert_eq!(users.username_for_mobile("5550100"), Some("alice"));
        assert!(users.authenticate("alice", PW).is_ok());
    }

    #[test]
    fn registration_validation() {
        let dir = tempdir().unwrap();
        let mut users = open(dir.path(), Arc::new(ManualClock::at(0)));

        let short_name = NewUser { username: "al", ..alice() };
        let short_pw = NewUser { password: "short", ..alice() };
        let bad_email = NewUser { email: "alice.example.com", ..alice() };
        let bad_mobile = NewUser { mobile: "123", ..alice() };
        for form in [short_name, short_pw, bad_email, bad_mobile] {
            assert!(matches!(users.register(form), Err(Error::Validation(_))));
        }

        users.register(alice()).unwrap();
        assert!(matches!(users.register(alice()), Err(Error::UsernameTaken(_))));
    }

    #[test]
    fn usernames_are_case_sensitive() {
        let dir = tempdir().unwrap();
        let mut users = open(dir.path(), Arc::new(ManualClock::at(0)));
        users.register(alice()).unwrap();
        users.register(NewUser { username: "Alice", ..alice() }).unwrap();
        assert_eq!(users.len(), 2);
    }

    #[test]
    fn unknown_user_looks_like_wrong_password() {
        let dir = tempdir().unwrap();
        let mut users = open(dir.path(), Arc::new(ManualClock::at(0)));
        users.register(alice()).unwrap();

        let unknown = users.authenticate("mallory", PW).unwrap_err().to_string();
        let wrong = users.authenticate("alice", "not-the-password").unwrap_err().to_string();
        assert_eq!(unknown, wrong);
    }

    #[test]
    fn lockout_after_max_failures() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(10_000));
        let mut users = open(dir.path(), clock.clone());
        users.register(alice()).unwrap();

        for _ in 0..MAX_FAILURES {
            assert!(matches!(
                users.authenticate("alice", "wrong-password"),
                Err(Error::InvalidCredentials)
            ));
        }
        assert_eq!(
            users.state("alice"),
            Some(AccountState::Locked { until: 10_120 })
        );

        // the correct password does not help while locked
        assert!(matches!(
            users.authenticate("alice", PW),
            Err(Error::AccountLocked { retry_after: 120 })
        ));
        clock.advance(119);
        assert!(matches!(
            users.authenticate("alice", PW),
            Err(Error::AccountLocked { retry_after: 1 })
        ));

        clock.advance(1);
        assert_eq!(users.state("alice"), Some(AccountState::Active));
        assert!(users.authenticate("alice", PW).is_ok());
    }

    const MAX_FAILURES: u32 = crate::config::MAX_LOGIN_ATTEMPTS;

    #[test]
    fn lockout_is_persisted() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(0));
        let mut users = open(dir.path(), clock.clone());
        users.register(alice()).unwrap();
        for _ in 0..MAX_FAILURES {
            let _ = users.authenticate("alice", "wrong-password");
        }
        drop(users);

        let mut reopened = open(dir.path(), clock);
        assert!(matches!(
            reopened.authenticate("alice", PW),
            Err(Error::AccountLocked { .. })
        ));
    }

    #[test]
    fn success_resets_attempt_counter() {
        let dir = tempdir().unwrap();
        let mut users = open(dir.path(), Arc::new(ManualClock::at(0)));
        users.register(alice()).unwrap();

        let _ = users.authenticate("alice", "wrong-password");
        let _ = users.authenticate("alice", "wrong-password");
        assert_eq!(users.user("alice").unwrap().login_attempts(), 2);

        users.authenticate("alice", PW).unwrap();
        let _ = users.authenticate("alice", "wrong-password");
        assert_eq!(users.state("alice"), Some(AccountState::Active));
    }

    #[test]
    fn reset_password_with_otp() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(0));
        let mut users = open(dir.path(), clock.clone());
        users.register(alice()).unwrap();
        for _ in 0..MAX_FAILURES {
            let _ = users.authenticate("alice", "wrong-password");
        }

        let code = users.generate_otp("5550100", OtpPurpose::Reset, "alice").unwrap();
        assert_eq!(code.len(), 6);
        let grant = users.verify_otp("5550100", &code).unwrap();
        users.reset_password(grant, "brand-new-secret").unwrap();

        assert!(users.authenticate("alice", "brand-new-secret").is_ok());
        assert!(matches!(
            users.authenticate("alice", PW),
            Err(Error::InvalidCredentials)
        ));
    }

    #[test]
    fn reset_requires_matching_mobile_and_purpose() {
        let dir = tempdir().unwrap();
        let mut users = open(dir.path(), Arc::new(ManualClock::at(0)));
        users.register(alice()).unwrap();

        assert!(matches!(
            users.generate_otp("5559999", OtpPurpose::Reset, "alice"),
            Err(Error::UserNotFound(_))
        ));

        let code = users.generate_otp("5559999", OtpPurpose::Register, "").unwrap();
        let grant = users.verify_otp("5559999", &code).unwrap();
        assert!(matches!(
            users.reset_password(grant, "brand-new-secret"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn otp_expires() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(0));
        let mut users = open(dir.path(), clock.clone());

        let code = users.generate_otp("5550100", OtpPurpose::Register, "").unwrap();
        clock.advance(crate::config::OTP_VALIDITY_SECS + 1);
        assert!(matches!(users.verify_otp("5550100", &code), Err(Error::OtpExpired)));
    }

    #[test]
    fn sweep_drops_expired_challenges() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(0));
        let mut users = open(dir.path(), clock.clone());

        users.generate_otp("5550100", OtpPurpose::Register, "").unwrap();
        users.generate_otp("5550101", OtpPurpose::Register, "").unwrap();
        clock.advance(crate::config::OTP_VALIDITY_SECS + 1);
        assert_eq!(users.sweep_expired_otps(), 2);
    }

    #[test]
    fn corrupt_store_is_not_reset() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        open(dir.path(), Arc::new(ManualClock::at(0))).register(alice()).unwrap();

        std::fs::write(cfg.users_path(), b"garbage that is definitely not a record store").unwrap();
        assert!(matches!(
            CredentialStore::open(&cfg),
            Err(Error::CorruptStore { .. })
        ));
    }

    #[test]
    fn reset_needs_a_verified_code() {
        let dir = tempdir().unwrap();
        let mut users = open(dir.path(), Arc::new(ManualClock::at(0)));
        users.register(alice()).unwrap();

        let code = users.generate_otp("5550100", OtpPurpose::Reset, "alice").unwrap();
        let first = if code.starts_with('9') { '0' } else { '9' };
        let bad = format!("{first}{}", &code.as_str()[1..]);
        for _ in 0..crate::config::OTP_MAX_ATTEMPTS {
            assert!(users.verify_otp("5550100", &bad).is_err());
        }
        // the challenge is gone, so even the right code yields no grant
        assert!(matches!(
            users.verify_otp("5550100", &code),
            Err(Error::NoChallenge)
        ));
        assert!(users.authenticate("alice", PW).is_ok());
    }

    #[test]
    fn unknown_user_login_rewrites_the_store() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let mut users = open(dir.path(), Arc::new(ManualClock::at(0)));
        users.register(alice()).unwrap();

        let before = std::fs::read(cfg.users_path()).unwrap();
        assert!(matches!(
            users.authenticate("mallory", PW),
            Err(Error::InvalidCredentials)
        ));
        let after = std::fs::read(cfg.users_path()).unwrap();
        // fresh nonce on every save
        assert_ne!(before, after);
    }

    #[test]
    fn failed_save_leaves_records_unchanged() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let mut users = open(dir.path(), Arc::new(ManualClock::at(0)));
        users.register(alice()).unwrap();

        // a directory at the store path makes the atomic rename fail
        std::fs::remove_file(cfg.users_path()).unwrap();
        std::fs::create_dir(cfg.users_path()).unwrap();

        let bob = NewUser { username: "bob", mobile: "5550101", ..alice() };
        assert!(matches!(users.register(bob), Err(Error::Io { .. })));
        assert!(!users.user_exists("bob"));

        assert!(matches!(
            users.authenticate("alice", "wrong-password"),
            Err(Error::Io { .. })
        ));
        assert_eq!(users.user("alice").unwrap().login_attempts(), 0);

        std::fs::remove_dir(cfg.users_path()).unwrap();
        users.register(bob).unwrap();
        assert!(users.user_exists("bob"));
    }
}
