use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use zeroize::Zeroizing;

use super::{BLOCK_LEN, IV_LEN, KEY_LEN};
use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Encrypt plaintext with AES-256-CBC.
///
/// PKCS#7 padding always appends 1..=16 bytes, each equal to the count
/// appended, so the output is never empty and always block aligned.
pub fn encrypt_cbc(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt AES-256-CBC ciphertext and strip its padding.
///
/// The last byte `n` must lie in `1..=16` and the final `n` bytes must all
/// equal `n`. Any deviation is reported as [`Error::BadPassword`], the
/// usual symptom of decrypting under the wrong key.
pub fn decrypt_cbc(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(Error::MalformedContainer(
            "ciphertext is not a whole number of blocks",
        ));
    }

    let plaintext = Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::BadPassword)?;

    Ok(Zeroizing::new(plaintext))
}
