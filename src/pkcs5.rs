use blake2::Blake2s256;
use hmac::{Hmac, SimpleHmac};
use pbkdf2::pbkdf2;
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use streebog::Streebog512;
use whirlpool::Whirlpool;

use crate::error::{CryptoError, Result};

/// Hash functions usable as the PBKDF2 PRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prf {
    Ripemd160,
    Sha512,
    Sha256,
    Whirlpool,
    Blake2s,
    Streebog,
    /// Deprecated, TrueCrypt volumes only.
    Sha1,
}

impl Prf {
    /// Order in which header trial decryption tries the PRFs.
    pub const ALL: [Prf; 7] = [
        Prf::Ripemd160,
        Prf::Sha512,
        Prf::Sha256,
        Prf::Whirlpool,
        Prf::Blake2s,
        Prf::Streebog,
        Prf::Sha1,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Prf::Ripemd160 => "RIPEMD-160",
            Prf::Sha512 => "SHA-512",
            Prf::Sha256 => "SHA-256",
            Prf::Whirlpool => "Whirlpool",
            Prf::Blake2s => "BLAKE2s-256",
            Prf::Streebog => "Streebog",
            Prf::Sha1 => "SHA-1",
        }
    }

    pub fn from_name(name: &str) -> Option<Prf> {
        Prf::ALL.into_iter().find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn is_deprecated(self) -> bool {
        self == Prf::Sha1
    }

    /// PBKDF2 iteration count, or 0 when the PRF cannot be used with these
    /// settings. A `pim` of zero or less selects the default count.
    pub fn iteration_count(self, pim: i32, truecrypt_mode: bool, boot: bool) -> u32 {
        if truecrypt_mode {
            return match self {
                Prf::Ripemd160 if boot => 1000,
                Prf::Ripemd160 => 2000,
                Prf::Sha512 | Prf::Whirlpool | Prf::Sha1 => 1000,
                _ => 0,
            };
        }

        let pim = pim.max(0) as u32;
        let custom = 15_000u32.saturating_add(pim.saturating_mul(1000));
        let custom_boot = pim.saturating_mul(2048);
        match self {
            Prf::Sha1 => 0,
            Prf::Ripemd160 => match (pim, boot) {
                (0, true) => 327_661,
                (0, false) => 655_331,
                (_, true) => custom_boot,
                (_, false) => custom,
            },
            Prf::Sha512 | Prf::Whirlpool => {
                if pim == 0 {
                    500_000
                } else {
                    custom
                }
            }
            Prf::Sha256 | Prf::Blake2s | Prf::Streebog => match (pim, boot) {
                (0, true) => 200_000,
                (0, false) => 500_000,
                (_, true) => custom_boot,
                (_, false) => custom,
            },
        }
    }

    /// PRFs to try, in order, when the caller did not pick one.
    pub fn trial_order(truecrypt_mode: bool, boot: bool) -> Vec<Prf> {
        Prf::ALL
            .into_iter()
            .filter(|p| p.iteration_count(0, truecrypt_mode, boot) != 0)
            .collect()
    }
}

/// Fills `out` with PBKDF2-`prf` output.
pub fn derive_key(prf: Prf, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) -> Result<()> {
    if iterations == 0 {
        return Err(CryptoError::ParameterIncorrect("PRF not available for this volume type"));
    }
    match prf {
        Prf::Ripemd160 => pbkdf2::<Hmac<Ripemd160>>(password, salt, iterations, out),
        Prf::Sha512 => pbkdf2::<Hmac<Sha512>>(password, salt, iterations, out),
        Prf::Sha256 => pbkdf2::<Hmac<Sha256>>(password, salt, iterations, out),
        Prf::Whirlpool => pbkdf2::<Hmac<Whirlpool>>(password, salt, iterations, out),
        Prf::Blake2s => pbkdf2::<SimpleHmac<Blake2s256>>(password, salt, iterations, out),
        Prf::Streebog => pbkdf2::<SimpleHmac<Streebog512>>(password, salt, iterations, out),
        Prf::Sha1 => pbkdf2::<Hmac<Sha1>>(password, salt, iterations, out),
    }
    .map_err(|_| CryptoError::ParameterIncorrect("invalid PBKDF2 output length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_matches_rfc_6070() {
        let mut out = [0u8; 20];
        derive_key(Prf::Sha1, b"password", b"salt", 1, &mut out).unwrap();
        assert_eq!(hex::encode(out), "0c60c80f961f0e71f3a9b524af6012062fe037a6");
    }

    #[test]
    fn sha256_matches_known_vector() {
        let mut out = [0u8; 32];
        derive_key(Prf::Sha256, b"password", b"salt", 1, &mut out).unwrap();
        assert_eq!(
            hex::encode(out),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b"
        );
    }

    #[test]
    fn every_prf_derives_distinct_keys() {
        let mut seen = Vec::new();
        for prf in Prf::ALL {
            let mut out = [0u8; 64];
            derive_key(prf, b"secret", &[7u8; 64], 3, &mut out).unwrap();
            assert!(!seen.contains(&out.to_vec()), "{}", prf.name());
            seen.push(out.to_vec());
        }
    }

    #[test]
    fn iteration_counts_follow_pim() {
        assert_eq!(Prf::Sha512.iteration_count(0, false, false), 500_000);
        assert_eq!(Prf::Sha512.iteration_count(-1, false, false), 500_000);
        assert_eq!(Prf::Sha512.iteration_count(1, false, false), 16_000);
        assert_eq!(Prf::Ripemd160.iteration_count(0, false, false), 655_331);
        assert_eq!(Prf::Ripemd160.iteration_count(0, false, true), 327_661);
        assert_eq!(Prf::Ripemd160.iteration_count(10, false, true), 20_480);
        assert_eq!(Prf::Sha256.iteration_count(0, false, true), 200_000);
        assert_eq!(Prf::Sha1.iteration_count(0, false, false), 0);
        assert_eq!(Prf::Ripemd160.iteration_count(5, true, false), 2000);
        assert_eq!(Prf::Sha256.iteration_count(0, true, false), 0);
    }

    #[test]
    fn sha1_is_only_tried_for_truecrypt_volumes() {
        assert!(!Prf::trial_order(false, false).contains(&Prf::Sha1));
        assert_eq!(
            Prf::trial_order(true, false),
            vec![Prf::Ripemd160, Prf::Sha512, Prf::Whirlpool, Prf::Sha1]
        );
        assert_eq!(Prf::trial_order(false, false)[0], Prf::Ripemd160);
    }

    #[test]
    fn zero_iterations_are_refused() {
        let mut out = [0u8; 32];
        assert!(derive_key(Prf::Sha512, b"pw", b"salt", 0, &mut out).is_err());
    }
}
