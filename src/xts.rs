//! XTS over 512-byte data units.
//!
//! The tweak for block `i` of data unit `u` is `E_k2(u) · 2^i`. Two code
//! paths exist: a table path that whitens a whole data unit and hands it to
//! the cipher's bulk call, and a serial path that walks one block at a
//! time. They produce identical output.

use std::ops::BitXor;

use zeroize::Zeroize;

use crate::crypto::{supports_intra_data_unit_parallelization, KeySchedule};

pub const ENCRYPTION_DATA_UNIT_SIZE: usize = 512;

/// Blocks per data unit for 16-byte ciphers.
pub const BLOCKS_PER_DATA_UNIT: usize = ENCRYPTION_DATA_UNIT_SIZE / 16;

/// A tweak held as a little-endian integer of the cipher block width.
trait TweakWord: Copy + BitXor<Output = Self> {
    const BYTES: usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
    fn double(self) -> Self;
}

impl TweakWord for u128 {
    const BYTES: usize = 16;

    fn load(bytes: &[u8]) -> Self {
        let mut b = [0u8; 16];
        b.copy_from_slice(bytes);
        u128::from_le_bytes(b)
    }

    fn store(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_le_bytes());
    }

    fn double(self) -> Self {
        (self << 1) ^ if self >> 127 == 1 { 0x87 } else { 0 }
    }
}

impl TweakWord for u64 {
    const BYTES: usize = 8;

    fn load(bytes: &[u8]) -> Self {
        let mut b = [0u8; 8];
        b.copy_from_slice(bytes);
        u64::from_le_bytes(b)
    }

    fn store(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_le_bytes());
    }

    fn double(self) -> Self {
        (self << 1) ^ if self >> 63 == 1 { 0x1B } else { 0 }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// Encrypts `buffer` in place, starting at block `start_block` of data unit
/// `start_unit`.
///
/// # Panics
///
/// If the buffer length is not a multiple of the cipher block size, or the
/// two schedules belong to different ciphers.
pub fn encrypt_buffer_xts(
    buffer: &mut [u8],
    start_unit: u64,
    start_block: usize,
    ks: &KeySchedule,
    ks2: &KeySchedule,
) {
    transform(buffer, start_unit, start_block, ks, ks2, Direction::Encrypt);
}

pub fn decrypt_buffer_xts(
    buffer: &mut [u8],
    start_unit: u64,
    start_block: usize,
    ks: &KeySchedule,
    ks2: &KeySchedule,
) {
    transform(buffer, start_unit, start_block, ks, ks2, Direction::Decrypt);
}

fn transform(
    buffer: &mut [u8],
    start_unit: u64,
    start_block: usize,
    ks: &KeySchedule,
    ks2: &KeySchedule,
    direction: Direction,
) {
    let parallel = supports_intra_data_unit_parallelization(ks.cipher());
    match ks.block_size() {
        16 if parallel => {
            transform_table::<u128>(buffer, start_unit, start_block, ks, ks2, direction)
        }
        16 => transform_serial::<u128>(buffer, start_unit, start_block, ks, ks2, direction),
        8 if parallel => transform_table::<u64>(buffer, start_unit, start_block, ks, ks2, direction),
        8 => transform_serial::<u64>(buffer, start_unit, start_block, ks, ks2, direction),
        other => panic!("unsupported XTS block size {other}"),
    }
}

fn check_invariants<W: TweakWord>(buffer: &[u8], start_block: usize, ks: &KeySchedule, ks2: &KeySchedule) {
    assert!(
        buffer.len() % W::BYTES == 0,
        "XTS buffer length {} is not a multiple of the block size",
        buffer.len()
    );
    assert_eq!(ks.cipher(), ks2.cipher(), "XTS key schedules belong to different ciphers");
    assert!(start_block < ENCRYPTION_DATA_UNIT_SIZE / W::BYTES);
}

/// `E_k2(unit)`, the tweak of block 0.
fn unit_tweak<W: TweakWord>(unit: u64, ks2: &KeySchedule) -> W {
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(&unit.to_le_bytes());
    ks2.encrypt_block(&mut block[..W::BYTES]);
    let tweak = W::load(&block[..W::BYTES]);
    block.zeroize();
    tweak
}

fn xor_block<W: TweakWord>(block: &mut [u8], tweak: W) {
    (W::load(block) ^ tweak).store(block);
}

fn transform_serial<W: TweakWord>(
    buffer: &mut [u8],
    start_unit: u64,
    start_block: usize,
    ks: &KeySchedule,
    ks2: &KeySchedule,
    direction: Direction,
) {
    check_invariants::<W>(buffer, start_block, ks, ks2);
    let blocks_per_unit = ENCRYPTION_DATA_UNIT_SIZE / W::BYTES;

    let mut blocks = buffer.chunks_exact_mut(W::BYTES);
    let mut unit = start_unit;
    let mut first_block = start_block;
    'units: while blocks.len() > 0 {
        let mut tweak = unit_tweak::<W>(unit, ks2);
        // Blocks before the requested start still advance the tweak.
        for _ in 0..first_block {
            tweak = tweak.double();
        }
        for _ in first_block..blocks_per_unit {
            let Some(block) = blocks.next() else {
                break 'units;
            };
            xor_block(block, tweak);
            match direction {
                Direction::Encrypt => ks.encrypt_block(block),
                Direction::Decrypt => ks.decrypt_block(block),
            }
            xor_block(block, tweak);
            tweak = tweak.double();
        }
        first_block = 0;
        unit = unit.wrapping_add(1);
    }
}

fn transform_table<W: TweakWord>(
    buffer: &mut [u8],
    start_unit: u64,
    start_block: usize,
    ks: &KeySchedule,
    ks2: &KeySchedule,
    direction: Direction,
) {
    check_invariants::<W>(buffer, start_block, ks, ks2);
    let blocks_per_unit = ENCRYPTION_DATA_UNIT_SIZE / W::BYTES;
    let mut whitening = [0u8; ENCRYPTION_DATA_UNIT_SIZE];

    let mut offset = 0;
    let mut unit = start_unit;
    let mut first_block = start_block;
    while offset < buffer.len() {
        let block_count = (blocks_per_unit - first_block).min((buffer.len() - offset) / W::BYTES);
        let len = block_count * W::BYTES;
        let table = &mut whitening[..len];
        fill_whitening::<W>(table, unit, first_block, ks2);

        let chunk = &mut buffer[offset..offset + len];
        xor_in_place(chunk, table);
        match direction {
            Direction::Encrypt => ks.encrypt_blocks(chunk),
            Direction::Decrypt => ks.decrypt_blocks(chunk),
        }
        xor_in_place(chunk, table);

        offset += len;
        first_block = 0;
        unit = unit.wrapping_add(1);
    }
    whitening.zeroize();
}

/// Writes the tweaks of blocks `first_block..` of `unit` into `table`, one
/// block-sized entry per block.
fn fill_whitening<W: TweakWord>(table: &mut [u8], unit: u64, first_block: usize, ks2: &KeySchedule) {
    let mut tweak = unit_tweak::<W>(unit, ks2);
    for _ in 0..first_block {
        tweak = tweak.double();
    }
    for entry in table.chunks_exact_mut(W::BYTES) {
        tweak.store(entry);
        tweak = tweak.double();
    }
}

fn xor_in_place(data: &mut [u8], mask: &[u8]) {
    for (d, m) in data.iter_mut().zip(mask) {
        *d ^= m;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::init_key;
    use crate::registry::CipherId;

    fn key(cipher: CipherId, seed: u8) -> KeySchedule {
        let bytes: Vec<u8> = (0..cipher.key_size()).map(|i| seed.wrapping_add(i as u8 * 3)).collect();
        init_key(cipher, &bytes).unwrap()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn table_and_serial_paths_agree() {
        for cipher in [CipherId::Aes, CipherId::Serpent, CipherId::Twofish, CipherId::Blowfish] {
            let (ks, ks2) = (key(cipher, 1), key(cipher, 99));
            for (start_block, len) in [(0, 512 * 3), (5, 512 * 2), (0, 64)] {
                let start_block = start_block * 16 / cipher.block_size();
                let original = sample(len);

                let mut serial = original.clone();
                let mut table = original.clone();
                if cipher.block_size() == 16 {
                    transform_serial::<u128>(&mut serial, 7, start_block, &ks, &ks2, Direction::Encrypt);
                    transform_table::<u128>(&mut table, 7, start_block, &ks, &ks2, Direction::Encrypt);
                } else {
                    transform_serial::<u64>(&mut serial, 7, start_block, &ks, &ks2, Direction::Encrypt);
                    transform_table::<u64>(&mut table, 7, start_block, &ks, &ks2, Direction::Encrypt);
                }
                assert_eq!(serial, table, "{}", cipher.name());

                decrypt_buffer_xts(&mut table, 7, start_block, &ks, &ks2);
                assert_eq!(table, original, "{}", cipher.name());
            }
        }
    }

    #[test]
    fn tweaks_double_within_a_unit_and_reset_across_units() {
        let ks2 = key(CipherId::Aes, 42);
        let mut table = [0u8; ENCRYPTION_DATA_UNIT_SIZE];
        fill_whitening::<u128>(&mut table, 9, 0, &ks2);

        let tweaks: Vec<u128> = table.chunks_exact(16).map(u128::load).collect();
        assert_eq!(tweaks.len(), BLOCKS_PER_DATA_UNIT);
        assert_eq!(tweaks[0], unit_tweak::<u128>(9, &ks2));
        for pair in tweaks.windows(2) {
            assert_eq!(pair[1], pair[0].double());
        }

        let next_unit = unit_tweak::<u128>(10, &ks2);
        assert_eq!(fill_first(&ks2, 10), next_unit);
        assert_ne!(next_unit, tweaks[BLOCKS_PER_DATA_UNIT - 1].double());
    }

    fn fill_first(ks2: &KeySchedule, unit: u64) -> u128 {
        let mut entry = [0u8; 16];
        fill_whitening::<u128>(&mut entry, unit, 0, ks2);
        u128::load(&entry)
    }

    #[test]
    fn doubling_reduces_on_carry() {
        assert_eq!(1u128.double(), 2);
        assert_eq!((1u128 << 127).double(), 0x87);
        assert_eq!((1u64 << 63).double(), 0x1B);
    }

    #[test]
    fn multi_unit_buffer_equals_units_done_separately() {
        let (ks, ks2) = (key(CipherId::Serpent, 5), key(CipherId::Serpent, 6));
        let original = sample(512 * 4);

        let mut whole = original.clone();
        encrypt_buffer_xts(&mut whole, 1000, 0, &ks, &ks2);

        let mut pieces = original.clone();
        for (i, unit) in pieces.chunks_exact_mut(512).enumerate() {
            encrypt_buffer_xts(unit, 1000 + i as u64, 0, &ks, &ks2);
        }
        assert_eq!(whole, pieces);
    }

    #[test]
    fn partial_unit_start_matches_full_unit_tail() {
        let (ks, ks2) = (key(CipherId::Twofish, 5), key(CipherId::Twofish, 6));
        let original = sample(512);

        let mut full = original.clone();
        encrypt_buffer_xts(&mut full, 3, 0, &ks, &ks2);

        let mut tail = original[160..].to_vec();
        encrypt_buffer_xts(&mut tail, 3, 10, &ks, &ks2);
        assert_eq!(&full[160..], &tail[..]);
    }

    #[test]
    #[should_panic]
    fn misaligned_buffer_is_fatal() {
        let (ks, ks2) = (key(CipherId::Aes, 1), key(CipherId::Aes, 2));
        let mut data = vec![0u8; 100];
        encrypt_buffer_xts(&mut data, 0, 0, &ks, &ks2);
    }
}
