//! The open crypto handle of a volume.

use std::fmt;

use zeroize::Zeroize;

use crate::crypto::{schedule_key, KeySchedule};
use crate::error::{CryptoError, Result};
use crate::gf::GfContext;
use crate::legacy;
use crate::pkcs5::Prf;
use crate::registry::{EaId, Mode, LEGACY_VOL_IV_SIZE};
use crate::xts::{self, ENCRYPTION_DATA_UNIT_SIZE};

pub const MASTER_KEYDATA_SIZE: usize = 256;

/// State each mode of operation needs on top of the primary schedules.
enum ModeState {
    Xts { ks2: Vec<KeySchedule> },
    Lrw { gf: GfContext },
    Cbc { outer: bool, iv_seed: [u8; LEGACY_VOL_IV_SIZE] },
}

/// Key schedules plus the volume parameters decoded from (or written to) a
/// header.
///
/// All key material is wiped when the context is dropped.
pub struct CryptoContext {
    ea: EaId,
    mode: Mode,
    ks: Vec<KeySchedule>,
    state: ModeState,
    /// Secondary key bytes: XTS secondary keys, LRW tweak key or CBC IV seed.
    k2: [u8; MASTER_KEYDATA_SIZE],
    master_key_data: [u8; MASTER_KEYDATA_SIZE],

    pub prf: Option<Prf>,
    pub iterations: u32,
    pub pim: i32,
    pub header_version: u16,
    pub required_program_version: u16,
    pub legacy_volume: bool,
    pub volume_creation_time: u64,
    pub header_creation_time: u64,
    pub volume_size: u64,
    pub hidden_volume: bool,
    pub hidden_volume_size: u64,
    /// Byte offset of the hidden volume inside its host. Needed by LRW.
    /// Header decoding leaves it at zero; whoever opens a hidden volume
    /// must set it before transforming data units.
    pub hidden_volume_offset: u64,
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    pub header_flags: u32,
    pub sector_size: u32,
    /// A cascade member was scheduled with a key known to be weak.
    pub weak_key: bool,
    /// The XTS primary and secondary master keys are identical.
    pub vulnerable_master_key: bool,
}

fn init_cascade(ea: EaId, keys: &[u8]) -> Result<(Vec<KeySchedule>, bool)> {
    let mut schedules = Vec::with_capacity(ea.cipher_count());
    let mut weak = false;
    let mut offset = 0;
    for cipher in ea.ciphers() {
        let key = keys
            .get(offset..offset + cipher.key_size())
            .ok_or(CryptoError::CipherInitFailure)?;
        let (schedule, is_weak) = schedule_key(*cipher, key)?;
        weak |= is_weak;
        schedules.push(schedule);
        offset += cipher.key_size();
    }
    Ok((schedules, weak))
}

impl CryptoContext {
    /// Schedules `key_material` for `ea` in `mode`.
    ///
    /// For XTS the material is the primary keys in cascade order followed by
    /// the secondary keys at offset `ea.key_size()`. Legacy modes expect the
    /// 32-byte tweak key or IV seed first, then the primary keys.
    pub fn new(ea: EaId, mode: Mode, key_material: &[u8]) -> Result<Self> {
        if !ea.is_mode_supported(mode) {
            return Err(CryptoError::ParameterIncorrect("mode not supported by algorithm"));
        }
        let key_size = ea.key_size();
        if key_material.len() < mode.key_material_size(key_size) {
            return Err(CryptoError::CipherInitFailure);
        }

        let primary = mode.primary_key_offset();
        let (ks, weak_key) = init_cascade(ea, &key_material[primary..primary + key_size])?;

        let mut k2 = [0u8; MASTER_KEYDATA_SIZE];
        let state = match mode {
            Mode::Xts => {
                let secondary = &key_material[key_size..key_size * 2];
                k2[..key_size].copy_from_slice(secondary);
                // A weak secondary key is not tolerated.
                let (ks2, weak) = init_cascade(ea, secondary).map_err(|_| CryptoError::ModeInitFailed)?;
                if weak {
                    return Err(CryptoError::ModeInitFailed);
                }
                ModeState::Xts { ks2 }
            }
            Mode::Lrw => {
                k2[..LEGACY_VOL_IV_SIZE].copy_from_slice(&key_material[..LEGACY_VOL_IV_SIZE]);
                let block_size = ea.ciphers()[0].block_size();
                ModeState::Lrw { gf: GfContext::new(block_size, &k2[..LEGACY_VOL_IV_SIZE])? }
            }
            Mode::Cbc | Mode::InnerCbc | Mode::OuterCbc => {
                let mut iv_seed = [0u8; LEGACY_VOL_IV_SIZE];
                iv_seed.copy_from_slice(&key_material[..LEGACY_VOL_IV_SIZE]);
                k2[..LEGACY_VOL_IV_SIZE].copy_from_slice(&iv_seed);
                ModeState::Cbc { outer: mode == Mode::OuterCbc, iv_seed }
            }
        };

        let mut master_key_data = [0u8; MASTER_KEYDATA_SIZE];
        let used = mode.key_material_size(key_size).min(MASTER_KEYDATA_SIZE);
        master_key_data[..used].copy_from_slice(&key_material[..used]);

        Ok(CryptoContext {
            ea,
            mode,
            ks,
            state,
            k2,
            master_key_data,
            prf: None,
            iterations: 0,
            pim: 0,
            header_version: 0,
            required_program_version: 0,
            legacy_volume: false,
            volume_creation_time: 0,
            header_creation_time: 0,
            volume_size: 0,
            hidden_volume: false,
            hidden_volume_size: 0,
            hidden_volume_offset: 0,
            encrypted_area_start: 0,
            encrypted_area_length: 0,
            header_flags: 0,
            sector_size: ENCRYPTION_DATA_UNIT_SIZE as u32,
            weak_key,
            vulnerable_master_key: false,
        })
    }

    pub fn ea(&self) -> EaId {
        self.ea
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Key material the context was scheduled from, laid out as described
    /// in [`CryptoContext::new`].
    pub fn master_key_data(&self) -> &[u8] {
        &self.master_key_data[..self.mode.key_material_size(self.ea.key_size())]
    }

    pub fn secondary_key(&self) -> &[u8] {
        match self.mode {
            Mode::Xts => &self.k2[..self.ea.key_size()],
            _ => &self.k2[..LEGACY_VOL_IV_SIZE],
        }
    }

    fn lrw_hidden_offset(&self) -> Option<u64> {
        self.hidden_volume.then_some(self.hidden_volume_offset)
    }

    /// Encrypts a header region in place. XTS treats it as data unit 0 and
    /// LRW starts at block index 1.
    pub fn encrypt_buffer(&self, buf: &mut [u8]) {
        match &self.state {
            ModeState::Xts { ks2 } => {
                for (ks, ks2) in self.ks.iter().zip(ks2) {
                    xts::encrypt_buffer_xts(buf, 0, 0, ks, ks2);
                }
            }
            ModeState::Lrw { gf } => legacy::encrypt_buffer_lrw(buf, 1, &self.ks, gf),
            ModeState::Cbc { outer, iv_seed } => legacy::encrypt_header_cbc(buf, &self.ks, iv_seed, *outer),
        }
    }

    pub fn decrypt_buffer(&self, buf: &mut [u8]) {
        match &self.state {
            ModeState::Xts { ks2 } => {
                for (ks, ks2) in self.ks.iter().zip(ks2).rev() {
                    xts::decrypt_buffer_xts(buf, 0, 0, ks, ks2);
                }
            }
            ModeState::Lrw { gf } => legacy::decrypt_buffer_lrw(buf, 1, &self.ks, gf),
            ModeState::Cbc { outer, iv_seed } => legacy::decrypt_header_cbc(buf, &self.ks, iv_seed, *outer),
        }
    }

    /// Encrypts whole data units on the calling thread.
    ///
    /// # Panics
    ///
    /// If `buf` is not a whole number of data units.
    pub fn encrypt_data_units_current_thread(&self, buf: &mut [u8], start_unit: u64) {
        assert_data_units(buf);
        match &self.state {
            ModeState::Xts { ks2 } => {
                for (ks, ks2) in self.ks.iter().zip(ks2) {
                    xts::encrypt_buffer_xts(buf, start_unit, 0, ks, ks2);
                }
            }
            ModeState::Lrw { gf } => {
                let index = legacy::lrw_block_index(start_unit, gf.block_size(), self.lrw_hidden_offset());
                legacy::encrypt_buffer_lrw(buf, index, &self.ks, gf);
            }
            ModeState::Cbc { outer, iv_seed } => {
                legacy::encrypt_data_units_cbc(buf, start_unit, &self.ks, iv_seed, *outer)
            }
        }
    }

    pub fn decrypt_data_units_current_thread(&self, buf: &mut [u8], start_unit: u64) {
        assert_data_units(buf);
        match &self.state {
            ModeState::Xts { ks2 } => {
                for (ks, ks2) in self.ks.iter().zip(ks2).rev() {
                    xts::decrypt_buffer_xts(buf, start_unit, 0, ks, ks2);
                }
            }
            ModeState::Lrw { gf } => {
                let index = legacy::lrw_block_index(start_unit, gf.block_size(), self.lrw_hidden_offset());
                legacy::decrypt_buffer_lrw(buf, index, &self.ks, gf);
            }
            ModeState::Cbc { outer, iv_seed } => {
                legacy::decrypt_data_units_cbc(buf, start_unit, &self.ks, iv_seed, *outer)
            }
        }
    }
}

fn assert_data_units(buf: &[u8]) {
    assert!(
        buf.len() % ENCRYPTION_DATA_UNIT_SIZE == 0,
        "buffer length {} is not a whole number of data units",
        buf.len()
    );
}

impl Drop for CryptoContext {
    fn drop(&mut self) {
        self.k2.zeroize();
        self.master_key_data.zeroize();
        if let ModeState::Cbc { iv_seed, .. } = &mut self.state {
            iv_seed.zeroize();
        }
        // Schedules and GF tables wipe themselves when dropped.
        self.ks.clear();
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("ea", &self.ea.name())
            .field("mode", &self.mode)
            .field("prf", &self.prf)
            .field("header_version", &self.header_version)
            .field("volume_size", &self.volume_size)
            .field("sector_size", &self.sector_size)
            .field("keys", &"<redacted>")
            .finish()
    }
}
