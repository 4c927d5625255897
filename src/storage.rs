//! Crash-safe file replacement.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use crate::crypto::mac::to_hex;
use crate::crypto::random::{random_array, random_bytes};
use crate::error::{Error, Result};

/// A file target that is only ever replaced as a whole.
///
/// `Storage` writes new content to a sibling temporary file and renames it
/// over the target, so readers see either the old bytes or the new bytes.
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    /// Creates a new Storage instance with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns `true` if the target file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns the path to the target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the entire file into memory. The handle is closed on return.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    pub fn load(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| Error::io(&self.path, e))
    }

    /// Replaces the target with `data` atomically.
    ///
    /// Equivalent to [`Storage::stage`] followed by [`StagedFile::commit`].
    /// If a crash occurs during save, either the old or new file will be
    /// present, never a partial write.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save(&self, data: &[u8]) -> Result<()> {
        self.stage(data)?.commit()
    }

    /// First phase of a replace: write `data` to a fresh temporary file in
    /// the target's directory and force it to stable storage.
    ///
    /// The target is not touched. Dropping the returned [`StagedFile`]
    /// without committing deletes the temporary file.
    pub fn stage(&self, data: &[u8]) -> Result<StagedFile> {
        let parent = self.parent_dir();
        fs::create_dir_all(&parent).map_err(|e| Error::io(&parent, e))?;

        let tmp_path = self.random_tmp_path()?;

        // securely create temp file (fail if exists)
        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(|e| Error::io(&tmp_path, e))?;

        let staged = StagedFile {
            tmp_path,
            target: self.path.clone(),
            committed: false,
        };

        let written = tmp_file.write_all(data).and_then(|_| tmp_file.sync_all());
        drop(tmp_file);
        written.map_err(|e| Error::io(&staged.tmp_path, e))?;

        Ok(staged)
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Generates a unique temporary file path in the same directory.
    ///
    /// Format: `.filename.tmp.<randomhex>`
    fn random_tmp_path(&self) -> Result<PathBuf> {
        let rand_string = to_hex(&random_array::<8>()?); // 64 bit entropy

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let tmp_name = format!(".{file_name}.tmp.{rand_string}");

        Ok(self.parent_dir().join(tmp_name))
    }
}

/// Content written and synced, waiting for the atomic rename.
#[derive(Debug)]
#[must_use = "a staged file is discarded unless committed"]
pub struct StagedFile {
    tmp_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedFile {
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Second phase: rename the temporary file over the target and sync the
    /// directory so the rename itself is durable.
    pub fn commit(mut self) -> Result<()> {
        atomic_replace(&self.tmp_path, &self.target).map_err(|e| Error::io(&self.target, e))?;
        self.committed = true;

        // fsync directory
        #[cfg(unix)]
        if let Some(parent) = self.target.parent().filter(|p| !p.as_os_str().is_empty()) {
            let dir = File::open(parent).map_err(|e| Error::io(parent, e))?;
            dir.sync_all().map_err(|e| Error::io(parent, e))?;
        }

        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Read a raw secret file, creating it with `len` random bytes if absent.
///
/// Used for the install salt and the chain and token keys. A file of the
/// wrong length is reported as corrupt, never regenerated.
pub(crate) fn load_or_create_secret(path: &Path, len: usize) -> Result<Zeroizing<Vec<u8>>> {
    if path.exists() {
        let bytes = Zeroizing::new(fs::read(path).map_err(|e| Error::io(path, e))?);
        if bytes.len() != len {
            return Err(Error::corrupt(
                path,
                format!("secret file has {} bytes, expected {len}", bytes.len()),
            ));
        }
        return Ok(bytes);
    }

    let secret = Zeroizing::new(random_bytes(len)?);
    Storage::new(path).save(&secret)?;
    restrict_permissions(path)?;
    tracing::info!(path = %path.display(), "generated secret file");
    Ok(secret)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| Error::io(path, e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Atomically replaces the target file with the temporary file.
///
/// Uses Windows `ReplaceFileW` API with `REPLACEFILE_WRITE_THROUGH` flag
/// when the target exists; a plain rename otherwise.
#[cfg(target_os = "windows")]
fn atomic_replace(tmp_path: &Path, target: &Path) -> std::io::Result<()> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::{REPLACEFILE_WRITE_THROUGH, ReplaceFileW};

    if !target.exists() {
        return fs::rename(tmp_path, target);
    }

    fn to_wide(s: &OsStr) -> Vec<u16> {
        s.encode_wide().chain(std::iter::once(0)).collect()
    }

    let target_w = to_wide(target.as_os_str());
    let tmp_w = to_wide(tmp_path.as_os_str());

    // SAFETY:
    // - Strings are valid UTF-16 and null-terminated
    // - Pointers remain valid during the call
    // - Windows does not retain the pointers after return
    let result = unsafe {
        ReplaceFileW(
            target_w.as_ptr(),
            tmp_w.as_ptr(),
            std::ptr::null(),
            REPLACEFILE_WRITE_THROUGH,
            std::ptr::null(),
            std::ptr::null(),
        )
    };

    if result == 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}

/// Atomically replaces the target file with the temporary file.
///
/// On Unix, `rename()` is atomic when both paths are on the same filesystem.
#[cfg(not(target_os = "windows"))]
fn atomic_replace(tmp_path: &Path, target: &Path) -> std::io::Result<()> {
    fs::rename(tmp_path, target)
}
