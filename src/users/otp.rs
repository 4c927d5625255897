//! One-time codes for registration and password recovery.
//!
//! Challenges live only in memory, one per mobile number, and are never
//! persisted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::constant_time_eq;
use crate::crypto::random::random_below;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    Register,
    Reset,
}

/// Proof that a code was verified. Consumed by flows that require it.
///
/// Only a successful [`CredentialStore::verify_otp`] hands one out; it
/// cannot be built or copied by callers.
///
/// ```compile_fail
/// use vaultguard::{OtpGrant, OtpPurpose};
///
/// let grant = OtpGrant {
///     mobile: "5550100".into(),
///     purpose: OtpPurpose::Reset,
///     username: "alice".into(),
/// };
/// ```
///
/// [`CredentialStore::verify_otp`]: crate::CredentialStore::verify_otp
#[derive(Debug, PartialEq, Eq)]
pub struct OtpGrant {
    mobile: String,
    purpose: OtpPurpose,
    username: String,
}

impl OtpGrant {
    pub fn mobile(&self) -> &str {
        &self.mobile
    }

    pub fn purpose(&self) -> OtpPurpose {
        self.purpose
    }

    /// The account named when the challenge was issued (empty for
    /// registration).
    pub fn username(&self) -> &str {
        &self.username
    }
}

struct Challenge {
    code: Zeroizing<String>,
    expiry: i64,
    purpose: OtpPurpose,
    username: String,
    attempts: u32,
}

/// Bounded map of live challenges keyed by mobile number.
pub(crate) struct OtpCache {
    challenges: HashMap<String, Challenge>,
    capacity: usize,
    max_attempts: u32,
}

impl OtpCache {
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            challenges: HashMap::new(),
            capacity: capacity.max(1),
            max_attempts,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    /// Start a challenge for `mobile`, replacing any live one.
    pub fn issue(
        &mut self,
        mobile: &str,
        purpose: OtpPurpose,
        username: &str,
        digits: u32,
        expiry: i64,
        now: i64,
    ) -> Result<Zeroizing<String>> {
        let code = generate_code(digits)?;

        self.sweep(now);
        if !self.challenges.contains_key(mobile) && self.challenges.len() >= self.capacity {
            self.evict_soonest_expiring();
        }

        self.challenges.insert(
            mobile.to_owned(),
            Challenge {
                code: code.clone(),
                expiry,
                purpose,
                username: username.to_owned(),
                attempts: 0,
            },
        );
        Ok(code)
    }

    /// Check `code` against the live challenge for `mobile`.
    ///
    /// A match clears the challenge. The `max_attempts`-th mismatch
    /// invalidates it.
    pub fn verify(&mut self, mobile: &str, code: &str, now: i64) -> Result<OtpGrant> {
        let challenge = self.challenges.get_mut(mobile).ok_or(Error::NoChallenge)?;

        if now > challenge.expiry {
            self.challenges.remove(mobile);
            return Err(Error::OtpExpired);
        }

        if !constant_time_eq(code.trim().as_bytes(), challenge.code.as_bytes()) {
            challenge.attempts += 1;
            if challenge.attempts >= self.max_attempts {
                self.challenges.remove(mobile);
                return Err(Error::OtpAttemptsExhausted);
            }
            return Err(Error::InvalidCode {
                remaining: self.max_attempts - challenge.attempts,
            });
        }

        let challenge = self
            .challenges
            .remove(mobile)
            .ok_or(Error::NoChallenge)?;
        Ok(OtpGrant {
            mobile: mobile.to_owned(),
            purpose: challenge.purpose,
            username: challenge.username,
        })
    }

    pub fn clear(&mut self, mobile: &str) {
        self.challenges.remove(mobile);
    }

    /// Drop every challenge whose expiry has passed.
    pub fn sweep(&mut self, now: i64) -> usize {
        let before = self.challenges.len();
        self.challenges.retain(|_, c| c.expiry >= now);
        before - self.challenges.len()
    }

    fn evict_soonest_expiring(&mut self) {
        if let Some(mobile) = self
            .challenges
            .iter()
            .min_by_key(|(_, c)| c.expiry)
            .map(|(m, _)| m.clone())
        {
            self.challenges.remove(&mobile);
        }
    }
}

fn generate_code(digits: u32) -> Result<Zeroizing<String>> {
    let digits = digits.clamp(4, 9);
    let n = random_below(10u32.pow(digits))?;
    Ok(Zeroizing::new(format!("{n:0width$}", width = digits as usize)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> OtpCache {
        OtpCache::new(8, 3)
    }

    fn wrong(code: &str) -> String {
        let first = if code.starts_with('0') { '1' } else { '0' };
        format!("{first}{}", &code[1..])
    }

    #[test]
    fn codes_have_requested_digits() {
        for _ in 0..50 {
            let code = generate_code(6).unwrap();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn verify_match_clears_challenge() {
        let mut otps = cache();
        let code = otps.issue("5550100", OtpPurpose::Reset, "alice", 6, 400, 100).unwrap();

        let grant = otps.verify("5550100", &code, 200).unwrap();
        assert_eq!(grant.purpose(), OtpPurpose::Reset);
        assert_eq!(grant.username(), "alice");
        assert_eq!(grant.mobile(), "5550100");
        assert!(matches!(otps.verify("5550100", &code, 200), Err(Error::NoChallenge)));
    }

    #[test]
    fn no_challenge() {
        let mut otps = cache();
        assert!(matches!(otps.verify("5550100", "123456", 0), Err(Error::NoChallenge)));
    }

    #[test]
    fn expired_challenge_is_removed() {
        let mut otps = cache();
        let code = otps.issue("5550100", OtpPurpose::Register, "", 6, 400, 100).unwrap();

        assert!(matches!(otps.verify("5550100", &code, 401), Err(Error::OtpExpired)));
        assert!(matches!(otps.verify("5550100", &code, 401), Err(Error::NoChallenge)));
    }

    #[test]
    fn three_misses_exhaust_the_challenge() {
        let mut otps = cache();
        let code = otps.issue("5550100", OtpPurpose::Register, "", 6, 400, 100).unwrap();
        let bad = wrong(&code);

        assert!(matches!(
            otps.verify("5550100", &bad, 101),
            Err(Error::InvalidCode { remaining: 2 })
        ));
        assert!(matches!(
            otps.verify("5550100", &bad, 102),
            Err(Error::InvalidCode { remaining: 1 })
        ));
        assert!(matches!(
            otps.verify("5550100", &bad, 103),
            Err(Error::OtpAttemptsExhausted)
        ));
        // even the right code is useless now
        assert!(matches!(otps.verify("5550100", &code, 104), Err(Error::NoChallenge)));
    }

    #[test]
    fn new_challenge_replaces_old() {
        let mut otps = cache();
        let first = otps.issue("5550100", OtpPurpose::Register, "", 6, 400, 100).unwrap();
        let second = otps.issue("5550100", OtpPurpose::Reset, "bob", 6, 500, 110).unwrap();
        assert_eq!(otps.len(), 1);

        if *first != *second {
            assert!(matches!(
                otps.verify("5550100", &first, 120),
                Err(Error::InvalidCode { .. })
            ));
        }
        let grant = otps.verify("5550100", &second, 120).unwrap();
        assert_eq!(grant.purpose(), OtpPurpose::Reset);
    }

    #[test]
    fn sweep_and_capacity() {
        let mut otps = OtpCache::new(2, 3);
        otps.issue("1111111", OtpPurpose::Register, "", 6, 150, 100).unwrap();
        otps.issue("2222222", OtpPurpose::Register, "", 6, 300, 100).unwrap();
        otps.issue("3333333", OtpPurpose::Register, "", 6, 400, 100).unwrap();

        // the soonest-expiring challenge made room
        assert_eq!(otps.len(), 2);
        assert!(matches!(otps.verify("1111111", "000000", 100), Err(Error::NoChallenge)));

        assert_eq!(otps.sweep(350), 1);
        assert_eq!(otps.len(), 1);
    }
}
