//! Static cipher, mode and algorithm tables.
//!
//! Nothing here is mutable. An [`EaId`] can only be obtained from this
//! module, so every id handed around the crate refers to a real table row.

use std::mem::size_of;

use crate::crypto::KuznyechikCipher;
use crate::error::{CryptoError, Result};

/// Size of the tweak key (LRW) or IV seed (CBC variants) stored in front of
/// the primary keys by legacy volumes.
pub const LEGACY_VOL_IV_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CipherId {
    Aes = 1,
    Serpent = 2,
    Twofish = 3,
    Camellia = 4,
    Kuznyechik = 5,
    Blowfish = 6,
    Cast = 7,
    TripleDes = 8,
}

#[derive(Debug)]
pub struct Cipher {
    pub id: CipherId,
    pub name: &'static str,
    pub block_size: usize,
    pub key_size: usize,
    pub key_schedule_size: usize,
}

static CIPHERS: [Cipher; 8] = [
    Cipher {
        id: CipherId::Aes,
        name: "AES",
        block_size: 16,
        key_size: 32,
        key_schedule_size: size_of::<aes::Aes256>(),
    },
    Cipher {
        id: CipherId::Serpent,
        name: "Serpent",
        block_size: 16,
        key_size: 32,
        key_schedule_size: size_of::<serpent::Serpent>(),
    },
    Cipher {
        id: CipherId::Twofish,
        name: "Twofish",
        block_size: 16,
        key_size: 32,
        key_schedule_size: size_of::<twofish::Twofish>(),
    },
    Cipher {
        id: CipherId::Camellia,
        name: "Camellia",
        block_size: 16,
        key_size: 32,
        key_schedule_size: size_of::<camellia::Camellia256>(),
    },
    Cipher {
        id: CipherId::Kuznyechik,
        name: "Kuznyechik",
        block_size: 16,
        key_size: 32,
        key_schedule_size: size_of::<KuznyechikCipher>(),
    },
    Cipher {
        id: CipherId::Blowfish,
        name: "Blowfish",
        block_size: 8,
        key_size: 56,
        key_schedule_size: size_of::<blowfish::BlowfishLE>(),
    },
    Cipher {
        id: CipherId::Cast,
        name: "CAST5",
        block_size: 8,
        key_size: 16,
        key_schedule_size: size_of::<cast5::Cast5>(),
    },
    Cipher {
        id: CipherId::TripleDes,
        name: "Triple DES",
        block_size: 8,
        key_size: 24,
        key_schedule_size: size_of::<des::TdesEde3>(),
    },
];

impl CipherId {
    pub fn cipher(self) -> &'static Cipher {
        // Rows are stored in id order starting at 1.
        &CIPHERS[self as usize - 1]
    }

    pub fn name(self) -> &'static str {
        self.cipher().name
    }

    pub fn block_size(self) -> usize {
        self.cipher().block_size
    }

    pub fn key_size(self) -> usize {
        self.cipher().key_size
    }

    pub fn key_schedule_size(self) -> usize {
        self.cipher().key_schedule_size
    }
}

impl TryFrom<u8> for CipherId {
    type Error = CryptoError;

    fn try_from(raw: u8) -> Result<Self> {
        CIPHERS
            .iter()
            .map(|c| c.id)
            .find(|id| *id as u8 == raw)
            .ok_or(CryptoError::UnknownCipher(raw))
    }
}

pub fn cipher_by_id(id: u8) -> Result<&'static Cipher> {
    Ok(CipherId::try_from(id)?.cipher())
}

pub fn ciphers() -> impl Iterator<Item = &'static Cipher> {
    CIPHERS.iter()
}

/// Mode of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mode {
    Xts = 1,
    /// Deprecated.
    Lrw = 2,
    /// Deprecated.
    Cbc = 3,
    /// Deprecated.
    OuterCbc = 4,
    /// Deprecated.
    InnerCbc = 5,
}

impl Mode {
    /// Order in which header trial decryption tries modes.
    pub const ALL: [Mode; 5] = [Mode::Xts, Mode::Lrw, Mode::Cbc, Mode::OuterCbc, Mode::InnerCbc];

    pub fn name(self) -> &'static str {
        match self {
            Mode::Xts => "XTS",
            Mode::Lrw => "LRW",
            Mode::Cbc => "CBC",
            Mode::OuterCbc => "outer-CBC",
            Mode::InnerCbc => "inner-CBC",
        }
    }

    pub fn is_legacy(self) -> bool {
        self != Mode::Xts
    }

    /// Offset of the primary keys inside derived or master key material.
    pub fn primary_key_offset(self) -> usize {
        if self.is_legacy() {
            LEGACY_VOL_IV_SIZE
        } else {
            0
        }
    }

    /// Bytes of key material a context in this mode consumes for an
    /// algorithm whose primary keys take `ea_key_size` bytes.
    pub fn key_material_size(self, ea_key_size: usize) -> usize {
        match self {
            Mode::Xts => ea_key_size * 2,
            _ => LEGACY_VOL_IV_SIZE + ea_key_size,
        }
    }
}

struct EncryptionAlgorithm {
    ciphers: &'static [CipherId],
    modes: &'static [Mode],
    format_enabled: bool,
}

use CipherId::*;

const XTS_LRW_CBC: &[Mode] = &[Mode::Xts, Mode::Lrw, Mode::Cbc];
const XTS_LRW_OUTER_CBC: &[Mode] = &[Mode::Xts, Mode::Lrw, Mode::OuterCbc];
const XTS_ONLY: &[Mode] = &[Mode::Xts];
const LRW_CBC: &[Mode] = &[Mode::Lrw, Mode::Cbc];
const INNER_CBC: &[Mode] = &[Mode::InnerCbc];

// Ciphers are listed in encryption order.
static ALGORITHMS: [EncryptionAlgorithm; 20] = [
    EncryptionAlgorithm { ciphers: &[Aes], modes: XTS_LRW_CBC, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Serpent], modes: XTS_LRW_CBC, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Twofish], modes: XTS_LRW_CBC, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Camellia], modes: XTS_ONLY, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Kuznyechik], modes: XTS_ONLY, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Twofish, Aes], modes: XTS_LRW_OUTER_CBC, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Serpent, Twofish, Aes], modes: XTS_LRW_OUTER_CBC, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Aes, Serpent], modes: XTS_LRW_OUTER_CBC, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Aes, Twofish, Serpent], modes: XTS_LRW_OUTER_CBC, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Serpent, Twofish], modes: XTS_LRW_OUTER_CBC, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Kuznyechik, Camellia], modes: XTS_ONLY, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Twofish, Kuznyechik], modes: XTS_ONLY, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Serpent, Camellia], modes: XTS_ONLY, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Aes, Kuznyechik], modes: XTS_ONLY, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Camellia, Serpent, Kuznyechik], modes: XTS_ONLY, format_enabled: true },
    EncryptionAlgorithm { ciphers: &[Blowfish], modes: LRW_CBC, format_enabled: false },
    EncryptionAlgorithm { ciphers: &[Cast], modes: LRW_CBC, format_enabled: false },
    EncryptionAlgorithm { ciphers: &[TripleDes], modes: LRW_CBC, format_enabled: false },
    EncryptionAlgorithm { ciphers: &[Blowfish, Aes], modes: INNER_CBC, format_enabled: false },
    EncryptionAlgorithm { ciphers: &[Serpent, Blowfish, Aes], modes: INNER_CBC, format_enabled: false },
];

/// Identifier of an encryption algorithm (a cascade of 1 to 3 ciphers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EaId(u8);

impl EaId {
    pub fn from_raw(raw: u8) -> Result<Self> {
        if raw == 0 || raw as usize > ALGORITHMS.len() {
            return Err(CryptoError::CipherInitFailure);
        }
        Ok(EaId(raw))
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    fn row(self) -> &'static EncryptionAlgorithm {
        &ALGORITHMS[self.0 as usize - 1]
    }

    /// Cascade members in encryption order.
    pub fn ciphers(self) -> &'static [CipherId] {
        self.row().ciphers
    }

    pub fn modes(self) -> &'static [Mode] {
        self.row().modes
    }

    pub fn cipher_count(self) -> usize {
        self.ciphers().len()
    }

    /// Combined primary key size of the cascade.
    pub fn key_size(self) -> usize {
        self.ciphers().iter().map(|c| c.key_size()).sum()
    }

    pub fn key_schedule_size(self) -> usize {
        self.ciphers().iter().map(|c| c.key_schedule_size()).sum()
    }

    /// Largest block size among the cascade members. Buffers handed to
    /// legacy modes must be a multiple of it.
    pub fn largest_block_size(self) -> usize {
        self.ciphers().iter().map(|c| c.block_size()).max().unwrap_or(16)
    }

    pub fn is_mode_supported(self, mode: Mode) -> bool {
        self.modes().contains(&mode)
    }

    pub fn is_format_enabled(self) -> bool {
        self.row().format_enabled
    }

    pub fn name(self) -> String {
        algorithm_name(self)
    }
}

pub fn first_algorithm() -> EaId {
    EaId(1)
}

pub fn next_algorithm(ea: EaId) -> Option<EaId> {
    if (ea.0 as usize) < ALGORITHMS.len() {
        Some(EaId(ea.0 + 1))
    } else {
        None
    }
}

pub fn algorithms() -> impl Iterator<Item = EaId> {
    std::iter::successors(Some(first_algorithm()), |ea| next_algorithm(*ea))
}

pub fn first_cipher(ea: EaId) -> CipherId {
    ea.ciphers()[0]
}

pub fn last_cipher(ea: EaId) -> CipherId {
    let ciphers = ea.ciphers();
    ciphers[ciphers.len() - 1]
}

pub fn next_cipher(ea: EaId, previous: CipherId) -> Option<CipherId> {
    let ciphers = ea.ciphers();
    let pos = ciphers.iter().position(|c| *c == previous)?;
    ciphers.get(pos + 1).copied()
}

pub fn previous_cipher(ea: EaId, next: CipherId) -> Option<CipherId> {
    let ciphers = ea.ciphers();
    let pos = ciphers.iter().position(|c| *c == next)?;
    pos.checked_sub(1).map(|p| ciphers[p])
}

/// Display name, listing ciphers from the last one applied to the first,
/// e.g. "AES-Twofish-Serpent".
pub fn algorithm_name(ea: EaId) -> String {
    let mut names = Vec::with_capacity(ea.cipher_count());
    let mut cipher = Some(last_cipher(ea));
    while let Some(c) = cipher {
        names.push(c.name());
        cipher = previous_cipher(ea, c);
    }
    names.join("-")
}

pub fn algorithm_by_name(name: &str) -> Option<EaId> {
    algorithms().find(|ea| algorithm_name(*ea).eq_ignore_ascii_case(name))
}

pub fn largest_key_for_mode(mode: Mode) -> usize {
    algorithms()
        .filter(|ea| ea.is_mode_supported(mode))
        .map(|ea| ea.key_size())
        .max()
        .unwrap_or(0)
}

/// Number of bytes PBKDF2 must produce so every (mode, algorithm) pair can
/// be tried against one derived key.
pub fn max_pkcs5_out_size() -> usize {
    Mode::ALL
        .iter()
        .map(|mode| mode.key_material_size(largest_key_for_mode(*mode)))
        .fold(32, usize::max)
}
