//! Binary field arithmetic for LRW.
//!
//! Elements use LRW's big-endian convention: the 16 (or 8) byte block read
//! as a big-endian integer, bit `n` being the coefficient of `x^n`.

use zeroize::Zeroize;

use crate::error::{CryptoError, Result};

const GF128_REDUCTION: u128 = 0x87;
const GF64_REDUCTION: u64 = 0x1B;

fn mul_x_128(a: u128) -> u128 {
    (a << 1) ^ if a >> 127 == 1 { GF128_REDUCTION } else { 0 }
}

fn mul_x_64(a: u64) -> u64 {
    (a << 1) ^ if a >> 63 == 1 { GF64_REDUCTION } else { 0 }
}

/// Precomputed products of a fixed 128-bit key with every byte value at
/// every byte position of a 64-bit multiplier.
pub struct Gf128Table {
    entries: Vec<[u128; 256]>,
}

impl Gf128Table {
    pub fn new(key: &[u8; 16]) -> Self {
        let mut power = u128::from_be_bytes(*key);
        let mut powers = [0u128; 64];
        for p in powers.iter_mut() {
            *p = power;
            power = mul_x_128(power);
        }

        let mut entries = vec![[0u128; 256]; 8];
        for (pos, row) in entries.iter_mut().enumerate() {
            for b in 1..256usize {
                let low_bit = b.trailing_zeros() as usize;
                row[b] = row[b & (b - 1)] ^ powers[pos * 8 + low_bit];
            }
        }
        powers.zeroize();
        power.zeroize();

        Gf128Table { entries }
    }

    /// `key ⊗ x`, with `x` zero-extended to 128 bits.
    pub fn mul_u64(&self, x: u64) -> [u8; 16] {
        let mut acc = 0u128;
        for (pos, row) in self.entries.iter().enumerate() {
            acc ^= row[((x >> (pos * 8)) & 0xff) as usize];
        }
        acc.to_be_bytes()
    }
}

impl Drop for Gf128Table {
    fn drop(&mut self) {
        for row in self.entries.iter_mut() {
            row.zeroize();
        }
    }
}

pub struct Gf64Table {
    entries: Vec<[u64; 256]>,
}

impl Gf64Table {
    pub fn new(key: &[u8; 8]) -> Self {
        let mut power = u64::from_be_bytes(*key);
        let mut powers = [0u64; 64];
        for p in powers.iter_mut() {
            *p = power;
            power = mul_x_64(power);
        }

        let mut entries = vec![[0u64; 256]; 8];
        for (pos, row) in entries.iter_mut().enumerate() {
            for b in 1..256usize {
                let low_bit = b.trailing_zeros() as usize;
                row[b] = row[b & (b - 1)] ^ powers[pos * 8 + low_bit];
            }
        }
        powers.zeroize();
        power.zeroize();

        Gf64Table { entries }
    }

    pub fn mul_u64(&self, x: u64) -> [u8; 8] {
        let mut acc = 0u64;
        for (pos, row) in self.entries.iter().enumerate() {
            acc ^= row[((x >> (pos * 8)) & 0xff) as usize];
        }
        acc.to_be_bytes()
    }
}

impl Drop for Gf64Table {
    fn drop(&mut self) {
        for row in self.entries.iter_mut() {
            row.zeroize();
        }
    }
}

/// Multiplication context for LRW, sized to the cipher block.
pub enum GfContext {
    Gf64(Gf64Table),
    Gf128(Gf128Table),
}

impl GfContext {
    /// Builds the table for `tweak_key`, of which the first `block_size`
    /// bytes are used.
    pub fn new(block_size: usize, tweak_key: &[u8]) -> Result<Self> {
        if tweak_key.len() < block_size {
            return Err(CryptoError::ModeInitFailed);
        }
        match block_size {
            8 => {
                let mut key = [0u8; 8];
                key.copy_from_slice(&tweak_key[..8]);
                let table = Gf64Table::new(&key);
                key.zeroize();
                Ok(GfContext::Gf64(table))
            }
            16 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(&tweak_key[..16]);
                let table = Gf128Table::new(&key);
                key.zeroize();
                Ok(GfContext::Gf128(table))
            }
            _ => Err(CryptoError::ModeInitFailed),
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            GfContext::Gf64(_) => 8,
            GfContext::Gf128(_) => 16,
        }
    }

    /// Writes `key ⊗ index` into `out`, which must be one block long.
    pub fn mul_index(&self, index: u64, out: &mut [u8]) {
        match self {
            GfContext::Gf64(t) => out.copy_from_slice(&t.mul_u64(index)),
            GfContext::Gf128(t) => out.copy_from_slice(&t.mul_u64(index)),
        }
    }
}
