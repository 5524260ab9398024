use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

pub const MAX_PASSWORD: usize = 128;
/// Limit for TrueCrypt-format and boot volumes.
pub const MAX_LEGACY_PASSWORD: usize = 64;

/// Password bytes, wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Password {
    text: Vec<u8>,
}

impl Password {
    pub fn new(text: &[u8]) -> Result<Self> {
        if text.len() > MAX_PASSWORD {
            return Err(CryptoError::ParameterIncorrect("password too long"));
        }
        Ok(Password { text: text.to_vec() })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password(<{} bytes redacted>)", self.text.len())
    }
}
