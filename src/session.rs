//! Who is logged in, and when the session should lock itself.
//!
//! There are no timers: the caller polls [`SessionManager::check_timeout`]
//! from whatever loop it runs.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::wipe::{WipeReport, wipe_tree};

#[derive(Debug, Default)]
struct State {
    username: Option<String>,
    locked: bool,
    last_activity: i64,
    lock_requested: bool,
}

pub struct SessionManager {
    state: Mutex<State>,
    timeout_secs: i64,
    temp_dir: PathBuf,
    wipe_passes: usize,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(config: &Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State {
                locked: true,
                ..State::default()
            }),
            timeout_secs: config.session_timeout_secs,
            temp_dir: config.temp_dir.clone(),
            wipe_passes: config.wipe_passes,
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // the state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn login(&self, username: &str) {
        let mut state = self.state();
        state.username = Some(username.to_owned());
        state.locked = false;
        state.lock_requested = false;
        state.last_activity = self.clock.unix();
        info!(username, "session started");
    }

    pub fn logout(&self) {
        let mut state = self.state();
        state.username = None;
        state.locked = true;
        state.lock_requested = false;
        info!("session ended");
    }

    /// Record user activity, pushing back the inactivity lock.
    pub fn touch(&self) {
        let mut state = self.state();
        if !state.locked {
            state.last_activity = self.clock.unix();
            state.lock_requested = false;
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    pub fn username(&self) -> Option<String> {
        self.state().username.clone()
    }

    /// Lock the session once it has been idle for the timeout.
    ///
    /// Returns `true` only on the call that performs the lock.
    pub fn check_timeout(&self) -> bool {
        let mut state = self.state();
        if state.locked {
            return false;
        }
        let idle = self.clock.unix() - state.last_activity;
        if idle >= self.timeout_secs && !state.lock_requested {
            state.locked = true;
            state.lock_requested = true;
            info!(idle_secs = idle, "session locked after inactivity");
            return true;
        }
        false
    }

    /// Whether a lock (timeout or panic) is waiting for the caller to act on.
    pub fn is_lock_requested(&self) -> bool {
        self.state().lock_requested
    }

    pub fn clear_lock_request(&self) {
        self.state().lock_requested = false;
    }

    /// Lock immediately and securely wipe the scratch directory.
    ///
    /// The directory is recreated empty afterwards. Per-file failures are in
    /// the returned report.
    pub fn panic_lock(&self) -> WipeReport {
        {
            let mut state = self.state();
            state.locked = true;
            state.lock_requested = true;
        }

        let report = wipe_tree(&self.temp_dir, self.wipe_passes);
        if let Err(e) = std::fs::create_dir_all(&self.temp_dir) {
            warn!(dir = %self.temp_dir.display(), error = %e, "could not recreate temp dir");
        }
        warn!(
            wiped = report.wiped.len(),
            failures = report.failures.len(),
            "panic lock triggered; temp files wiped"
        );
        report
    }
}
