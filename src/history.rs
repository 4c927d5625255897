//! Tamper-evident activity log.
//!
//! Each entry carries `hex(HMAC-SHA256(chain_key, canonical(entry) || prev))`
//! where `prev` is the previous entry's hash. The first entry links to the
//! genesis value. When the log outgrows its limit, the oldest entries are
//! dropped and the remaining ones are re-linked from a new genesis. The new
//! genesis is derived from the replaced chain's terminal hash, which the log
//! keeps as its [`Anchor`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::crypto::constant_time_eq;
use crate::crypto::mac::{hmac_sha256, to_hex};
use crate::error::{Error, Result};
use crate::records::RecordStore;
use crate::storage::load_or_create_secret;

const STORE_CONTEXT: &str = "vaultguard/history/v1";
const CHAIN_KEY_LEN: usize = 32;
const GENESIS: &str = "GENESIS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Encrypt,
    Decrypt,
    SecureDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: Action,
    pub filename: String,
    pub algorithm: String,
    pub status: Status,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub hash: String,
}

/// The fields covered by an entry's hash, in a fixed order.
#[derive(Serialize)]
struct Canonical<'a> {
    action: Action,
    filename: &'a str,
    algorithm: &'a str,
    status: Status,
    user: &'a str,
    timestamp: &'a DateTime<Utc>,
    prev: &'a str,
}

/// Link from the current chain segment back to the one it replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// Terminal hash of the replaced chain.
    pub predecessor_hash: String,
    /// Entries dropped over the life of the log.
    pub trimmed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HistoryDoc {
    #[serde(default)]
    anchor: Option<Anchor>,
    entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainReport {
    pub valid: bool,
    pub broken_at: Option<usize>,
    pub entries: usize,
}

pub struct HistoryLog {
    store: RecordStore,
    key: Zeroizing<Vec<u8>>,
    doc: HistoryDoc,
    limit: usize,
    clock: Arc<dyn Clock>,
}

impl HistoryLog {
    pub fn open(config: &Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut store = RecordStore::new(
            config.history_path(),
            STORE_CONTEXT,
            config.install_salt_path(),
            config.kdf,
        );
        let doc = match store.load() {
            Ok(doc) => doc,
            Err(Error::MissingStore(_)) => HistoryDoc::default(),
            Err(e) => return Err(e),
        };
        let key = load_or_create_secret(&config.chain_key_path(), CHAIN_KEY_LEN)?;

        Ok(Self {
            store,
            key,
            doc,
            limit: config.history_limit.max(1),
            clock,
        })
    }

    /// Oldest first.
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.doc.entries
    }

    /// Newest first.
    pub fn recent(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.doc.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.doc.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.entries.is_empty()
    }

    pub fn anchor(&self) -> Option<&Anchor> {
        self.doc.anchor.as_ref()
    }

    /// Append an entry, trimming and re-linking when over the limit.
    pub fn append(
        &mut self,
        action: Action,
        filename: &str,
        algorithm: &str,
        status: Status,
        user: &str,
    ) -> Result<()> {
        let prev = match self.doc.entries.last() {
            Some(last) => last.hash.clone(),
            None => self.genesis(),
        };

        let mut entry = HistoryEntry {
            action,
            filename: filename.to_owned(),
            algorithm: algorithm.to_owned(),
            status,
            user: user.to_owned(),
            timestamp: self.clock.now(),
            hash: String::new(),
        };
        entry.hash = self.entry_hash(&entry, &prev)?;

        self.update(|log| {
            log.doc.entries.push(entry);
            if log.doc.entries.len() > log.limit {
                let excess = log.doc.entries.len() - log.limit;
                log.restart_chain(excess)?;
            }
            Ok(())
        })?;
        debug!(?action, ?status, entries = self.doc.entries.len(), "appended history entry");
        Ok(())
    }

    /// Recompute every hash from the segment's genesis.
    pub fn verify_chain(&self) -> Result<ChainReport> {
        let mut prev = self.genesis();
        for (index, entry) in self.doc.entries.iter().enumerate() {
            let expected = self.entry_hash(entry, &prev)?;
            if !constant_time_eq(expected.as_bytes(), entry.hash.as_bytes()) {
                warn!(index, "history chain broken");
                return Ok(ChainReport {
                    valid: false,
                    broken_at: Some(index),
                    entries: self.doc.entries.len(),
                });
            }
            prev = entry.hash.clone();
        }

        Ok(ChainReport {
            valid: true,
            broken_at: None,
            entries: self.doc.entries.len(),
        })
    }

    /// Like [`HistoryLog::verify_chain`], with a break reported as an error.
    pub fn verify_intact(&self) -> Result<()> {
        match self.verify_chain()?.broken_at {
            Some(index) => Err(Error::ChainBroken { index }),
            None => Ok(()),
        }
    }

    /// Drop every entry. The anchor keeps the cleared chain's terminal hash.
    pub fn clear(&mut self) -> Result<()> {
        let count = self.doc.entries.len();
        self.update(|log| log.restart_chain(count))?;
        info!(cleared = count, "history cleared");
        Ok(())
    }

    /// Apply `change` and persist the result. On any error the document is
    /// rolled back.
    fn update(&mut self, change: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        let before = self.doc.clone();
        let result = change(self).and_then(|()| self.store.save(&self.doc));
        if result.is_err() {
            self.doc = before;
        }
        result
    }

    /// Drop the oldest `count` entries and re-link the rest from a new genesis.
    fn restart_chain(&mut self, count: usize) -> Result<()> {
        let Some(terminal) = self.doc.entries.last().map(|e| e.hash.clone()) else {
            return Ok(());
        };
        let count = count.min(self.doc.entries.len());

        self.doc.entries.drain(..count);
        let trimmed = self.doc.anchor.as_ref().map_or(0, |a| a.trimmed) + count as u64;
        self.doc.anchor = Some(Anchor {
            predecessor_hash: terminal,
            trimmed,
        });

        let mut prev = self.genesis();
        for i in 0..self.doc.entries.len() {
            let hash = self.entry_hash(&self.doc.entries[i], &prev)?;
            self.doc.entries[i].hash = hash.clone();
            prev = hash;
        }

        info!(dropped = count, kept = self.doc.entries.len(), "history chain restarted from new genesis");
        Ok(())
    }

    fn genesis(&self) -> String {
        match &self.doc.anchor {
            None => GENESIS.to_owned(),
            Some(anchor) => {
                let seed = format!("{GENESIS}:{}", anchor.predecessor_hash);
                to_hex(&hmac_sha256(&self.key, seed.as_bytes()))
            }
        }
    }

    fn entry_hash(&self, entry: &HistoryEntry, prev: &str) -> Result<String> {
        let canonical = Canonical {
            action: entry.action,
            filename: &entry.filename,
            algorithm: &entry.algorithm,
            status: entry.status,
            user: &entry.user,
            timestamp: &entry.timestamp,
            prev,
        };
        let bytes = serde_json::to_vec(&canonical)
            .map_err(|e| Error::corrupt(self.store.path(), format!("unserializable entry: {e}")))?;
        Ok(to_hex(&hmac_sha256(&self.key, &bytes)))
    }
}
