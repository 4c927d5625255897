//! On-disk container format for encrypted files.
//!
//! ```text
//! SALT (16) | IV (16) | OTD_FLAG (1) | STEG_LEN (2, big-endian) | STEG_PAYLOAD (STEG_LEN) | CIPHERTEXT
//! ```
//!
//! The layout carries no magic or version; it is fixed for interoperability.
//! The stego payload sits in the clear and must never hold secrets.

use crate::crypto::{IV_LEN, SALT_LEN};
use crate::error::{Error, Result};

pub mod hidden;

pub use hidden::HiddenMetadata;

const OTD_LEN: usize = 1;
const STEG_LEN_LEN: usize = 2;

/// Bytes before the variable-length stego payload.
pub const FIXED_HEADER_LEN: usize = SALT_LEN + IV_LEN + OTD_LEN + STEG_LEN_LEN;

const OTD_OFF: u8 = 0x00;
const OTD_ON: u8 = 0x01;

/// One encrypted file, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherContainer {
    salt: [u8; SALT_LEN],
    iv: [u8; IV_LEN],
    one_time_decrypt: bool,
    steg_payload: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl CipherContainer {
    pub fn new(
        salt: [u8; SALT_LEN],
        iv: [u8; IV_LEN],
        one_time_decrypt: bool,
        steg_payload: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            salt,
            iv,
            one_time_decrypt,
            steg_payload,
            ciphertext,
        }
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn one_time_decrypt(&self) -> bool {
        self.one_time_decrypt
    }

    /// Raw stego payload (magic marker included), possibly empty.
    pub fn steg_payload(&self) -> &[u8] {
        &self.steg_payload
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Decoded hidden metadata, if the payload carries a valid marker.
    pub fn hidden_metadata(&self) -> Option<HiddenMetadata> {
        HiddenMetadata::decode(&self.steg_payload)
    }
}

/// Serializes a container to its on-disk bytes.
///
/// # Errors
///
/// Returns [`Error::MalformedContainer`] if the stego payload does not fit
/// in the 16-bit length field.
pub fn serialize(container: &CipherContainer) -> Result<Vec<u8>> {
    let steg_len = u16::try_from(container.steg_payload.len())
        .map_err(|_| Error::MalformedContainer("stego payload longer than 65535 bytes"))?;

    let mut buf = Vec::with_capacity(
        FIXED_HEADER_LEN + container.steg_payload.len() + container.ciphertext.len(),
    );

    buf.extend_from_slice(&container.salt);
    buf.extend_from_slice(&container.iv);
    buf.push(if container.one_time_decrypt {
        OTD_ON
    } else {
        OTD_OFF
    });
    buf.extend_from_slice(&steg_len.to_be_bytes());
    buf.extend_from_slice(&container.steg_payload);
    buf.extend_from_slice(&container.ciphertext);

    Ok(buf)
}

/// Header fields, borrowed from the input. Shared by [`parse`] and the
/// metadata-only reader, which must never look past the header.
pub(crate) struct RawHeader<'a> {
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    pub one_time_decrypt: bool,
    pub steg_payload: &'a [u8],
    pub body_offset: usize,
}

pub(crate) fn parse_header(data: &[u8]) -> Result<RawHeader<'_>> {
    if data.len() < FIXED_HEADER_LEN {
        return Err(Error::MalformedContainer("file too short"));
    }

    let mut offset = 0;

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&data[offset..offset + SALT_LEN]);
    offset += SALT_LEN;

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&data[offset..offset + IV_LEN]);
    offset += IV_LEN;

    let one_time_decrypt = match data[offset] {
        OTD_OFF => false,
        OTD_ON => true,
        _ => return Err(Error::MalformedContainer("invalid one-time-decrypt flag")),
    };
    offset += OTD_LEN;

    let steg_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
    offset += STEG_LEN_LEN;

    let steg_payload = data
        .get(offset..offset + steg_len)
        .ok_or(Error::MalformedContainer(
            "declared stego length exceeds file size",
        ))?;
    offset += steg_len;

    Ok(RawHeader {
        salt,
        iv,
        one_time_decrypt,
        steg_payload,
        body_offset: offset,
    })
}

/// Parses container bytes.
///
/// # Errors
///
/// Returns [`Error::MalformedContainer`] if:
/// - the input is shorter than the fixed header
/// - the one-time-decrypt flag is neither 0 nor 1
/// - the declared stego length runs past the end of the input
/// - there is no ciphertext after the header
pub fn parse(data: &[u8]) -> Result<CipherContainer> {
    let header = parse_header(data)?;

    let ciphertext = &data[header.body_offset..];
    if ciphertext.is_empty() {
        return Err(Error::MalformedContainer("missing ciphertext"));
    }

    Ok(CipherContainer {
        salt: header.salt,
        iv: header.iv,
        one_time_decrypt: header.one_time_decrypt,
        steg_payload: header.steg_payload.to_vec(),
        ciphertext: ciphertext.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(steg: Vec<u8>) -> CipherContainer {
        CipherContainer::new([1u8; 16], [2u8; 16], true, steg, vec![7u8; 32])
    }

    #[test]
    fn layout_is_bit_exact() {
        let bytes = serialize(&sample(vec![0xAC, 0xCE, b'{', b'}'])).unwrap();

        assert_eq!(&bytes[..16], &[1u8; 16]);
        assert_eq!(&bytes[16..32], &[2u8; 16]);
        assert_eq!(bytes[32], 0x01);
        assert_eq!(&bytes[33..35], &[0x00, 0x04]);
        assert_eq!(&bytes[35..39], &[0xAC, 0xCE, b'{', b'}']);
        assert_eq!(&bytes[39..], &[7u8; 32]);
    }

    #[test]
    fn parse_reads_back_fields() {
        let original = sample(Vec::new());
        let parsed = parse(&serialize(&original).unwrap()).unwrap();

        assert_eq!(parsed, original);
        assert!(parsed.one_time_decrypt());
        assert!(parsed.steg_payload().is_empty());
        assert!(parsed.hidden_metadata().is_none());
    }

    #[test]
    fn too_short_fails() {
        let data = vec![0u8; FIXED_HEADER_LEN - 1];
        assert!(matches!(parse(&data), Err(Error::MalformedContainer(_))));
    }

    #[test]
    fn oversized_steg_len_does_not_over_read() {
        let mut data = serialize(&sample(Vec::new())).unwrap();
        // claim 0xFFFF bytes of stego payload
        data[33] = 0xFF;
        data[34] = 0xFF;
        assert!(matches!(parse(&data), Err(Error::MalformedContainer(_))));
    }

    #[test]
    fn bad_flag_fails() {
        let mut data = serialize(&sample(Vec::new())).unwrap();
        data[32] = 7;
        assert!(matches!(parse(&data), Err(Error::MalformedContainer(_))));
    }

    #[test]
    fn missing_ciphertext_fails() {
        let container = CipherContainer::new([0u8; 16], [0u8; 16], false, vec![1, 2], Vec::new());
        let data = serialize(&container).unwrap();
        assert!(matches!(parse(&data), Err(Error::MalformedContainer(_))));
    }

    #[test]
    fn oversized_steg_payload_cannot_serialize() {
        let container = sample(vec![0u8; u16::MAX as usize + 1]);
        assert!(serialize(&container).is_err());
    }
}
