//! Whole-file encryption and decryption.
//!
//! Every write goes through [`Storage`], so a target path only ever holds
//! the complete old content or the complete new content.

use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};
use crate::crypto::{KdfParams, decrypt_cbc, derive_key, encrypt_cbc, generate_iv, generate_salt};
use crate::error::{Error, Result};
use crate::format::{self, CipherContainer, FIXED_HEADER_LEN, HiddenMetadata};
use crate::storage::Storage;

const ENC_EXT: &str = "enc";
const DEC_EXT: &str = "dec";

#[derive(Debug, Clone, Default)]
pub struct EncryptOptions {
    /// Mark the container for one-time decryption.
    pub one_time_decrypt: bool,
    /// Embed `{owner, ts}` in the clear header.
    pub owner: Option<String>,
}

impl EncryptOptions {
    pub fn one_time(mut self) -> Self {
        self.one_time_decrypt = true;
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Result of decrypting a container in memory.
pub struct Opened {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub one_time_decrypt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptOutcome {
    pub output_path: PathBuf,
    /// The container was flagged one-time-decrypt. What to do with the
    /// output is left to the caller.
    pub one_time_decrypt: bool,
}

pub struct FileCipher {
    kdf: KdfParams,
    clock: Arc<dyn Clock>,
}

impl FileCipher {
    pub fn new(kdf: KdfParams) -> Self {
        Self::with_clock(kdf, Arc::new(SystemClock))
    }

    pub fn with_clock(kdf: KdfParams, clock: Arc<dyn Clock>) -> Self {
        Self { kdf, clock }
    }

    /// Encrypt `plaintext` into container bytes under a fresh salt and IV.
    pub fn seal(&self, plaintext: &[u8], password: &str, options: &EncryptOptions) -> Result<Vec<u8>> {
        if password.is_empty() {
            return Err(Error::EmptyPassword);
        }

        let salt = generate_salt()?;
        let iv = generate_iv()?;
        let key = derive_key(password, &salt, self.kdf)?;

        let steg_payload = match &options.owner {
            Some(owner) => HiddenMetadata::new(owner.clone(), self.clock.unix())
                .encode()
                .map_err(|_| Error::MalformedContainer("unencodable owner metadata"))?,
            None => Vec::new(),
        };

        let ciphertext = encrypt_cbc(&key, &iv, plaintext);
        drop(key);

        let container =
            CipherContainer::new(salt, iv, options.one_time_decrypt, steg_payload, ciphertext);
        format::serialize(&container)
    }

    /// Decrypt container bytes.
    pub fn open(&self, data: &[u8], password: &str) -> Result<Opened> {
        if password.is_empty() {
            return Err(Error::EmptyPassword);
        }

        let container = format::parse(data)?;
        let key = derive_key(password, container.salt(), self.kdf)?;
        let plaintext = decrypt_cbc(&key, container.iv(), container.ciphertext())?;

        Ok(Opened {
            plaintext,
            one_time_decrypt: container.one_time_decrypt(),
        })
    }

    /// Encrypt `src` into a new file `src.enc`, leaving `src` untouched.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyFile`] if `src` has no bytes
    /// - [`Error::Io`] if reading `src` or writing the output fails
    pub fn encrypt_to_new_file(
        &self,
        src: &Path,
        password: &str,
        options: &EncryptOptions,
    ) -> Result<PathBuf> {
        let plaintext = read_plaintext(src)?;
        let sealed = self.seal(&plaintext, password, options)?;
        drop(plaintext);

        let dest = append_extension(src, ENC_EXT);
        Storage::new(&dest).save(&sealed)?;

        info!(src = %src.display(), dest = %dest.display(), otd = options.one_time_decrypt, "encrypted file");
        Ok(dest)
    }

    /// Replace the content of `path` with its encrypted container.
    ///
    /// The source is read fully and closed, encrypted in memory, written to
    /// a synced temporary file beside it and renamed over it. A failure at
    /// any step before the rename leaves `path` byte-identical.
    pub fn encrypt_in_place(&self, path: &Path, password: &str, options: &EncryptOptions) -> Result<()> {
        let plaintext = read_plaintext(path)?;
        let sealed = self.seal(&plaintext, password, options)?;
        drop(plaintext);

        let staged = Storage::new(path).stage(&sealed)?;
        debug!(tmp = %staged.tmp_path().display(), "staged encrypted content");
        staged.commit()?;

        info!(path = %path.display(), otd = options.one_time_decrypt, "encrypted file in place");
        Ok(())
    }

    /// Decrypt `path` and write the plaintext to `output`, or to the
    /// default output path when `None`: `path` minus a trailing `.enc`,
    /// otherwise `path.dec`.
    ///
    /// Never deletes or rewrites the source, even for one-time-decrypt
    /// containers.
    pub fn decrypt_file(
        &self,
        path: &Path,
        password: &str,
        output: Option<&Path>,
    ) -> Result<DecryptOutcome> {
        let data = Storage::new(path).load()?;
        let opened = self.open(&data, password)?;

        let output_path = match output {
            Some(p) => p.to_path_buf(),
            None => default_output_path(path),
        };
        Storage::new(&output_path).save(&opened.plaintext)?;

        info!(src = %path.display(), dest = %output_path.display(), otd = opened.one_time_decrypt, "decrypted file");
        Ok(DecryptOutcome {
            output_path,
            one_time_decrypt: opened.one_time_decrypt,
        })
    }
}

/// Read the owner metadata from the clear header of `path`.
///
/// Reads only the header; no password involved. Any problem, including a
/// missing marker, yields `None`.
pub fn read_hidden_metadata(path: &Path) -> Option<HiddenMetadata> {
    let mut file = File::open(path).ok()?;

    let mut fixed = [0u8; FIXED_HEADER_LEN];
    file.read_exact(&mut fixed).ok()?;
    let steg_len = u16::from_be_bytes([fixed[FIXED_HEADER_LEN - 2], fixed[FIXED_HEADER_LEN - 1]]);

    let mut header = fixed.to_vec();
    header.resize(FIXED_HEADER_LEN + steg_len as usize, 0);
    file.read_exact(&mut header[FIXED_HEADER_LEN..]).ok()?;

    let raw = format::parse_header(&header).ok()?;
    HiddenMetadata::decode(raw.steg_payload)
}

fn read_plaintext(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let data = Zeroizing::new(std::fs::read(path).map_err(|e| Error::io(path, e))?);
    if data.is_empty() {
        return Err(Error::EmptyFile(path.to_path_buf()));
    }
    Ok(data)
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

pub fn default_output_path(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == ENC_EXT => path.with_extension(""),
        _ => append_extension(path, DEC_EXT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::kdf::test_params;
    use std::fs;
    use tempfile::tempdir;

    fn cipher() -> FileCipher {
        FileCipher::with_clock(test_params(), Arc::new(ManualClock::at(1_700_000_000)))
    }

    #[test]
    fn ten_byte_file_roundtrip_and_wrong_password() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("notes.txt");
        fs::write(&src, b"0123456789").unwrap();

        let fc = cipher();
        let enc = fc
            .encrypt_to_new_file(&src, "correct-horse", &EncryptOptions::default())
            .unwrap();
        assert_eq!(enc, dir.path().join("notes.txt.enc"));
        assert_eq!(fs::read(&src).unwrap(), b"0123456789");

        let out = dir.path().join("recovered.txt");
        let outcome = fc.decrypt_file(&enc, "correct-horse", Some(&out)).unwrap();
        assert_eq!(fs::read(&outcome.output_path).unwrap(), b"0123456789");
        assert!(!outcome.one_time_decrypt);

        assert!(matches!(
            fc.decrypt_file(&enc, "wrong-horse", Some(&out)),
            Err(Error::BadPassword)
        ));
    }

    #[test]
    fn default_output_strips_enc() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"hello").unwrap();

        let fc = cipher();
        let enc = fc.encrypt_to_new_file(&src, "pw", &EncryptOptions::default()).unwrap();
        fs::remove_file(&src).unwrap();

        let outcome = fc.decrypt_file(&enc, "pw", None).unwrap();
        assert_eq!(outcome.output_path, src);
        assert_eq!(fs::read(&src).unwrap(), b"hello");
    }

    #[test]
    fn default_output_paths() {
        assert_eq!(default_output_path(Path::new("x/a.txt.enc")), PathBuf::from("x/a.txt"));
        assert_eq!(default_output_path(Path::new("x/a.txt")), PathBuf::from("x/a.txt.dec"));
        assert_eq!(default_output_path(Path::new("blob")), PathBuf::from("blob.dec"));
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("empty");
        fs::write(&src, b"").unwrap();

        let fc = cipher();
        assert!(matches!(
            fc.encrypt_to_new_file(&src, "pw", &EncryptOptions::default()),
            Err(Error::EmptyFile(_))
        ));
        assert!(matches!(
            fc.encrypt_in_place(&src, "pw", &EncryptOptions::default()),
            Err(Error::EmptyFile(_))
        ));
        assert!(!dir.path().join("empty.enc").exists());
    }

    #[test]
    fn empty_password_is_rejected_before_derivation() {
        let fc = cipher();
        assert!(matches!(
            fc.seal(b"data", "", &EncryptOptions::default()),
            Err(Error::EmptyPassword)
        ));
    }

    #[test]
    fn missing_source_is_io_error() {
        let dir = tempdir().unwrap();
        let fc = cipher();
        assert!(matches!(
            fc.encrypt_to_new_file(&dir.path().join("nope"), "pw", &EncryptOptions::default()),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn in_place_replaces_content_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        fs::write(&path, b"%PDF-1.7 body").unwrap();

        let fc = cipher();
        fc.encrypt_in_place(&path, "pw", &EncryptOptions::default()).unwrap();

        let sealed = fs::read(&path).unwrap();
        assert_ne!(sealed, b"%PDF-1.7 body");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        let opened = fc.open(&sealed, "pw").unwrap();
        assert_eq!(&opened.plaintext[..], b"%PDF-1.7 body");
    }

    #[test]
    fn in_place_failure_before_rename_keeps_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keep.txt");
        fs::write(&path, b"precious").unwrap();

        // run the first half of encrypt_in_place and abandon it
        let fc = cipher();
        let sealed = fc.seal(b"precious", "pw", &EncryptOptions::default()).unwrap();
        let staged = Storage::new(&path).stage(&sealed).unwrap();
        drop(staged);

        assert_eq!(fs::read(&path).unwrap(), b"precious");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn salt_and_iv_are_fresh_per_encryption() {
        let fc = cipher();
        let a = format::parse(&fc.seal(b"same", "pw", &EncryptOptions::default()).unwrap()).unwrap();
        let b = format::parse(&fc.seal(b"same", "pw", &EncryptOptions::default()).unwrap()).unwrap();

        assert_ne!(a.salt(), b.salt());
        assert_ne!(a.iv(), b.iv());
        assert_ne!(a.ciphertext(), b.ciphertext());
    }

    #[test]
    fn one_time_flag_is_reported_not_acted_on() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("once.txt");
        fs::write(&src, b"burn after reading").unwrap();

        let fc = cipher();
        let enc = fc
            .encrypt_to_new_file(&src, "pw", &EncryptOptions::default().one_time())
            .unwrap();
        let outcome = fc.decrypt_file(&enc, "pw", None).unwrap();

        assert!(outcome.one_time_decrypt);
        // the engine itself deletes nothing
        assert!(enc.exists());
        assert!(outcome.output_path.exists());
    }

    #[test]
    fn hidden_metadata_readable_without_password() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("owned.txt");
        fs::write(&src, b"content").unwrap();

        let fc = cipher();
        let enc = fc
            .encrypt_to_new_file(&src, "pw", &EncryptOptions::default().owner("alice"))
            .unwrap();

        assert_eq!(
            read_hidden_metadata(&enc),
            Some(HiddenMetadata::new("alice", 1_700_000_000))
        );
        // still decrypts normally
        assert!(fc.decrypt_file(&enc, "pw", Some(&dir.path().join("o"))).is_ok());
    }

    #[test]
    fn hidden_metadata_absent_is_none() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("plain.txt");
        fs::write(&src, b"content").unwrap();

        let fc = cipher();
        let enc = fc.encrypt_to_new_file(&src, "pw", &EncryptOptions::default()).unwrap();

        assert_eq!(read_hidden_metadata(&enc), None);
        assert_eq!(read_hidden_metadata(&src), None);
        assert_eq!(read_hidden_metadata(&dir.path().join("missing")), None);
    }

    #[test]
    fn truncated_container_is_malformed() {
        let fc = cipher();
        let sealed = fc.seal(b"some data", "pw", &EncryptOptions::default()).unwrap();

        assert!(matches!(
            fc.open(&sealed[..20], "pw"),
            Err(Error::MalformedContainer(_))
        ));
        assert!(matches!(
            fc.open(&sealed[..sealed.len() - 3], "pw"),
            Err(Error::MalformedContainer(_))
        ));
    }
}
