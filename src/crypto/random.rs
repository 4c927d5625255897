use getrandom::fill;

use super::{IV_LEN, SALT_LEN};
use crate::error::{Error, Result};

/// Fill buffer with cryptographically secure random bytes
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    fill(buf).map_err(|_| Error::Random)
}

pub fn random_bytes(n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    fill_random(&mut buf)?;
    Ok(buf)
}

pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate salt
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    random_array()
}

/// Generate CBC initialization vector
pub fn generate_iv() -> Result<[u8; IV_LEN]> {
    random_array()
}

/// Uniform random integer in `0..bound` (rejection sampling, no modulo bias).
pub fn random_below(bound: u32) -> Result<u32> {
    if bound == 0 {
        return Err(Error::Validation("random bound must be positive"));
    }
    let zone = u32::MAX - (u32::MAX % bound);
    loop {
        let v = u32::from_be_bytes(random_array()?);
        if v < zone {
            return Ok(v % bound);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salts_are_unique() {
        assert_ne!(generate_salt().unwrap(), generate_salt().unwrap());
        assert_ne!(generate_iv().unwrap(), generate_iv().unwrap());
    }

    #[test]
    fn random_bytes_has_requested_len() {
        assert_eq!(random_bytes(0).unwrap().len(), 0);
        assert_eq!(random_bytes(33).unwrap().len(), 33);
    }

    #[test]
    fn random_below_stays_in_range() {
        for _ in 0..1000 {
            assert!(random_below(10).unwrap() < 10);
        }
        assert_eq!(random_below(1).unwrap(), 0);
    }

    #[test]
    fn zero_bound_is_an_error() {
        assert!(matches!(random_below(0), Err(Error::Validation(_))));
    }
}
