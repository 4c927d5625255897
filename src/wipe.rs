//! Multi-pass overwrite before delete.
//!
//! Each pass rewrites the whole file with a pattern cycling through
//! all-zero, all-one and random bytes, then syncs it to storage. This only
//! defeats simple recovery on media that rewrite blocks in place (rotating
//! disks). Flash and SSD controllers remap writes through wear levelling,
//! and journaling or copy-on-write filesystems may keep older copies, so
//! none of this guarantees the old bytes are gone on those devices.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::crypto::random::fill_random;
use crate::error::{Error, Result};

const CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    Zeros,
    Ones,
    Random,
}

impl Pattern {
    fn for_pass(pass: usize) -> Self {
        match pass % 3 {
            0 => Pattern::Zeros,
            1 => Pattern::Ones,
            _ => Pattern::Random,
        }
    }

    fn fill(self, buf: &mut [u8]) -> Result<()> {
        match self {
            Pattern::Zeros => buf.fill(0x00),
            Pattern::Ones => buf.fill(0xFF),
            Pattern::Random => fill_random(buf)?,
        }
        Ok(())
    }
}

/// Overwrite `path` `passes` times, syncing after each pass, then unlink it.
///
/// A path that does not exist is already gone and counts as success. An
/// empty file is simply removed.
pub fn wipe(path: &Path, passes: usize) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(path, e)),
    };

    // never follow a link into someone else's file
    if meta.is_file() && meta.len() > 0 {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        for pass in 0..passes {
            overwrite(&mut file, path, meta.len(), Pattern::for_pass(pass))?;
        }
    }

    fs::remove_file(path).map_err(|e| Error::io(path, e))?;
    info!(path = %path.display(), passes, "securely deleted file");
    Ok(())
}

fn overwrite(file: &mut File, path: &Path, len: u64, pattern: Pattern) -> Result<()> {
    let io = |e| Error::io(path, e);
    file.seek(SeekFrom::Start(0)).map_err(io)?;

    let mut buf = vec![0u8; CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(CHUNK as u64) as usize;
        pattern.fill(&mut buf[..n])?;
        file.write_all(&buf[..n]).map_err(io)?;
        remaining -= n as u64;
    }

    file.flush().map_err(io)?;
    file.sync_all().map_err(io)
}

/// Outcome of a recursive wipe. A non-empty `failures` list means the wipe
/// was partial.
#[derive(Debug, Default)]
pub struct WipeReport {
    pub wiped: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, Error)>,
}

impl WipeReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Wipe every regular file under `dir`, then remove the directories
/// bottom-up. Symlinks are unlinked, never followed.
///
/// Failures are collected per path rather than aborting the walk. A
/// missing `dir` yields an empty, complete report. A `dir` that is itself
/// a symlink or a plain file is handed to [`wipe`], so a link is unlinked
/// and its target left alone.
pub fn wipe_tree(dir: &Path, passes: usize) -> WipeReport {
    let mut report = WipeReport::default();
    let Ok(meta) = fs::symlink_metadata(dir) else {
        return report;
    };

    if meta.is_dir() {
        walk(dir, passes, &mut report);
    } else {
        match wipe(dir, passes) {
            Ok(()) => report.wiped.push(dir.to_path_buf()),
            Err(e) => report.failures.push((dir.to_path_buf(), e)),
        }
    }

    if !report.is_complete() {
        warn!(dir = %dir.display(), failures = report.failures.len(), "partial wipe");
    }
    report
}

fn walk(dir: &Path, passes: usize, report: &mut WipeReport) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            report.failures.push((dir.to_path_buf(), Error::io(dir, e)));
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report.failures.push((dir.to_path_buf(), Error::io(dir, e)));
                continue;
            }
        };
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

        if is_dir {
            walk(&path, passes, report);
        } else {
            match wipe(&path, passes) {
                Ok(()) => report.wiped.push(path),
                Err(e) => report.failures.push((path, e)),
            }
        }
    }

    if let Err(e) = fs::remove_dir(dir) {
        report.failures.push((dir.to_path_buf(), Error::io(dir, e)));
    }
}
