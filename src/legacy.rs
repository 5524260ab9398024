//! Deprecated LRW and CBC modes.
//!
//! Only kept so old volumes keep opening. New headers are never written with
//! these modes.

use byteorder::{ByteOrder, LittleEndian};
use zeroize::Zeroize;

use crate::crypto::KeySchedule;
use crate::gf::GfContext;
use crate::registry::LEGACY_VOL_IV_SIZE;
use crate::xts::ENCRYPTION_DATA_UNIT_SIZE;

/// Byte offset inside the IV seed of the two header whitening words.
const WHITENING_IV_OFFSET: usize = 8;

/// Legacy volumes store a single 512-byte header in front of the data area.
const LEGACY_HEADER_UNITS: u64 = 1;

fn xor_into(data: &mut [u8], mask: &[u8]) {
    for (d, m) in data.iter_mut().zip(mask) {
        *d ^= m;
    }
}

fn encrypt_cascade(block: &mut [u8], ks: &[KeySchedule]) {
    for schedule in ks {
        schedule.encrypt_block(block);
    }
}

fn decrypt_cascade(block: &mut [u8], ks: &[KeySchedule]) {
    for schedule in ks.iter().rev() {
        schedule.decrypt_block(block);
    }
}

/// LRW over `buffer` with the whole cascade used as one block cipher.
/// `block_index` is the index of the first block.
pub fn encrypt_buffer_lrw(buffer: &mut [u8], block_index: u64, ks: &[KeySchedule], gf: &GfContext) {
    lrw(buffer, block_index, ks, gf, true)
}

pub fn decrypt_buffer_lrw(buffer: &mut [u8], block_index: u64, ks: &[KeySchedule], gf: &GfContext) {
    lrw(buffer, block_index, ks, gf, false)
}

fn lrw(buffer: &mut [u8], block_index: u64, ks: &[KeySchedule], gf: &GfContext, encrypt: bool) {
    let block_size = gf.block_size();
    assert!(
        buffer.len() % block_size == 0,
        "LRW buffer length {} is not a multiple of the block size",
        buffer.len()
    );
    assert!(ks.iter().all(|k| k.block_size() == block_size));

    let mut tweak = [0u8; 16];
    let t = &mut tweak[..block_size];
    let mut index = block_index;
    for block in buffer.chunks_exact_mut(block_size) {
        gf.mul_index(index, t);
        xor_into(block, t);
        if encrypt {
            encrypt_cascade(block, ks);
        } else {
            decrypt_cascade(block, ks);
        }
        xor_into(block, t);
        index = index.wrapping_add(1);
    }
    tweak.zeroize();
}

/// Index of the first LRW block of `unit`. Units are counted from the start
/// of the host, so the header (or the hidden volume offset) is subtracted.
pub fn lrw_block_index(unit: u64, block_size: usize, hidden_volume_offset: Option<u64>) -> u64 {
    let first_unit = match hidden_volume_offset {
        Some(offset) => offset / ENCRYPTION_DATA_UNIT_SIZE as u64,
        None => LEGACY_HEADER_UNITS,
    };
    let unit = unit.wrapping_sub(first_unit);
    match block_size {
        8 => (unit << 6) | 1,
        _ => (unit << 5) | 1,
    }
}

/// Which cipher (or cipher chain) one CBC pass runs through.
#[derive(Clone, Copy)]
pub enum CbcChain<'a> {
    /// CBC and inner-CBC: one cipher per pass.
    Single(&'a KeySchedule),
    /// Outer-CBC: the whole cascade chained as a single block cipher.
    Outer(&'a [KeySchedule]),
}

impl CbcChain<'_> {
    fn block_size(&self) -> usize {
        match self {
            CbcChain::Single(ks) => ks.block_size(),
            CbcChain::Outer(ks) => ks.first().map_or(16, |k| k.block_size()),
        }
    }

    fn encrypt(&self, block: &mut [u8]) {
        match self {
            CbcChain::Single(ks) => ks.encrypt_block(block),
            CbcChain::Outer(ks) => encrypt_cascade(block, ks),
        }
    }

    fn decrypt(&self, block: &mut [u8]) {
        match self {
            CbcChain::Single(ks) => ks.decrypt_block(block),
            CbcChain::Outer(ks) => decrypt_cascade(block, ks),
        }
    }
}

// The two 32-bit whitening words cover one 8-byte block and are repeated
// for 16-byte blocks.
fn apply_whitening(block: &mut [u8], whitening: &[u8; 8]) {
    for half in block.chunks_exact_mut(8) {
        xor_into(half, whitening);
    }
}

/// One CBC pass over `data`.
pub fn encrypt_buffer_cbc(data: &mut [u8], chain: CbcChain<'_>, iv: &[u8], whitening: &[u8; 8]) {
    let block_size = chain.block_size();
    assert!(data.len() % block_size == 0, "CBC buffer is not block aligned");

    let mut previous = [0u8; 16];
    previous[..block_size].copy_from_slice(&iv[..block_size]);
    for block in data.chunks_exact_mut(block_size) {
        xor_into(block, &previous[..block_size]);
        chain.encrypt(block);
        previous[..block_size].copy_from_slice(block);
        apply_whitening(block, whitening);
    }
    previous.zeroize();
}

pub fn decrypt_buffer_cbc(data: &mut [u8], chain: CbcChain<'_>, iv: &[u8], whitening: &[u8; 8]) {
    let block_size = chain.block_size();
    assert!(data.len() % block_size == 0, "CBC buffer is not block aligned");

    let mut previous = [0u8; 16];
    let mut ciphertext = [0u8; 16];
    previous[..block_size].copy_from_slice(&iv[..block_size]);
    for block in data.chunks_exact_mut(block_size) {
        apply_whitening(block, whitening);
        ciphertext[..block_size].copy_from_slice(block);
        chain.decrypt(block);
        xor_into(block, &previous[..block_size]);
        previous[..block_size].copy_from_slice(&ciphertext[..block_size]);
    }
    previous.zeroize();
    ciphertext.zeroize();
}

/// Per-sector IV and whitening derived from the IV seed.
pub fn sector_iv_and_whitening(
    unit: u64,
    block_size: usize,
    iv_seed: &[u8; LEGACY_VOL_IV_SIZE],
) -> ([u8; 16], [u8; 8]) {
    let mut mixed = [0u8; 32];
    let words = if block_size == 16 { 4 } else { 3 };
    let unit_bytes = unit.to_le_bytes();
    for w in 0..words {
        for (i, b) in unit_bytes.iter().enumerate() {
            mixed[w * 8 + i] = iv_seed[w * 8 + i] ^ b;
        }
    }

    let crc = |word: usize| crc32fast::hash(&mixed[word * 4..word * 4 + 4]);
    let (w0, w1) = if block_size == 16 {
        (crc(4) ^ crc(7), crc(5) ^ crc(6))
    } else {
        (crc(2) ^ crc(5), crc(3) ^ crc(4))
    };

    let mut iv = [0u8; 16];
    iv[..block_size].copy_from_slice(&mixed[..block_size]);
    let mut whitening = [0u8; 8];
    LittleEndian::write_u32(&mut whitening[0..4], w0);
    LittleEndian::write_u32(&mut whitening[4..8], w1);
    mixed.zeroize();
    (iv, whitening)
}

fn header_whitening(iv_seed: &[u8; LEGACY_VOL_IV_SIZE]) -> [u8; 8] {
    let mut whitening = [0u8; 8];
    whitening.copy_from_slice(&iv_seed[WHITENING_IV_OFFSET..WHITENING_IV_OFFSET + 8]);
    whitening
}

/// Header region encryption for the CBC family. The seed doubles as IV and
/// supplies the whitening words.
pub fn encrypt_header_cbc(data: &mut [u8], ks: &[KeySchedule], iv_seed: &[u8; LEGACY_VOL_IV_SIZE], outer: bool) {
    let mut whitening = header_whitening(iv_seed);
    if outer {
        encrypt_buffer_cbc(data, CbcChain::Outer(ks), iv_seed, &whitening);
    } else {
        for schedule in ks {
            encrypt_buffer_cbc(data, CbcChain::Single(schedule), iv_seed, &whitening);
        }
    }
    whitening.zeroize();
}

pub fn decrypt_header_cbc(data: &mut [u8], ks: &[KeySchedule], iv_seed: &[u8; LEGACY_VOL_IV_SIZE], outer: bool) {
    let mut whitening = header_whitening(iv_seed);
    if outer {
        decrypt_buffer_cbc(data, CbcChain::Outer(ks), iv_seed, &whitening);
    } else {
        for schedule in ks.iter().rev() {
            decrypt_buffer_cbc(data, CbcChain::Single(schedule), iv_seed, &whitening);
        }
    }
    whitening.zeroize();
}

/// Sector-wise CBC over whole data units starting at `start_unit`.
pub fn encrypt_data_units_cbc(
    data: &mut [u8],
    start_unit: u64,
    ks: &[KeySchedule],
    iv_seed: &[u8; LEGACY_VOL_IV_SIZE],
    outer: bool,
) {
    for (unit, sector) in (start_unit..).zip(data.chunks_exact_mut(ENCRYPTION_DATA_UNIT_SIZE)) {
        if outer {
            let block_size = ks.first().map_or(16, |k| k.block_size());
            let (mut iv, mut whitening) = sector_iv_and_whitening(unit, block_size, iv_seed);
            encrypt_buffer_cbc(sector, CbcChain::Outer(ks), &iv, &whitening);
            iv.zeroize();
            whitening.zeroize();
        } else {
            for schedule in ks {
                let (mut iv, mut whitening) =
                    sector_iv_and_whitening(unit, schedule.block_size(), iv_seed);
                encrypt_buffer_cbc(sector, CbcChain::Single(schedule), &iv, &whitening);
                iv.zeroize();
                whitening.zeroize();
            }
        }
    }
}

pub fn decrypt_data_units_cbc(
    data: &mut [u8],
    start_unit: u64,
    ks: &[KeySchedule],
    iv_seed: &[u8; LEGACY_VOL_IV_SIZE],
    outer: bool,
) {
    for (unit, sector) in (start_unit..).zip(data.chunks_exact_mut(ENCRYPTION_DATA_UNIT_SIZE)) {
        if outer {
            let block_size = ks.first().map_or(16, |k| k.block_size());
            let (mut iv, mut whitening) = sector_iv_and_whitening(unit, block_size, iv_seed);
            decrypt_buffer_cbc(sector, CbcChain::Outer(ks), &iv, &whitening);
            iv.zeroize();
            whitening.zeroize();
        } else {
            for schedule in ks.iter().rev() {
                let (mut iv, mut whitening) =
                    sector_iv_and_whitening(unit, schedule.block_size(), iv_seed);
                decrypt_buffer_cbc(sector, CbcChain::Single(schedule), &iv, &whitening);
                iv.zeroize();
                whitening.zeroize();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::init_key;
    use crate::registry::CipherId;

    fn schedule(cipher: CipherId, seed: u8) -> KeySchedule {
        let key: Vec<u8> = (0..cipher.key_size()).map(|i| seed ^ (i as u8).wrapping_mul(29)).collect();
        init_key(cipher, &key).unwrap()
    }

    fn seed() -> [u8; LEGACY_VOL_IV_SIZE] {
        core::array::from_fn(|i| (i as u8).wrapping_mul(11).wrapping_add(1))
    }

    #[test]
    fn lrw_round_trips_for_both_block_sizes() {
        for (ciphers, block_size) in [
            (vec![CipherId::Aes], 16),
            (vec![CipherId::Serpent, CipherId::Twofish, CipherId::Aes], 16),
            (vec![CipherId::Cast], 8),
        ] {
            let ks: Vec<KeySchedule> = ciphers.iter().map(|c| schedule(*c, 3)).collect();
            let gf = GfContext::new(block_size, &seed()).unwrap();
            let original: Vec<u8> = (0..1024).map(|i| (i % 7) as u8).collect();

            let mut data = original.clone();
            let index = lrw_block_index(12, block_size, None);
            encrypt_buffer_lrw(&mut data, index, &ks, &gf);
            assert_ne!(data, original);
            decrypt_buffer_lrw(&mut data, index, &ks, &gf);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn lrw_identical_blocks_encrypt_differently() {
        let ks = vec![schedule(CipherId::Aes, 1)];
        let gf = GfContext::new(16, &seed()).unwrap();
        let mut data = vec![0u8; 64];
        encrypt_buffer_lrw(&mut data, 1, &ks, &gf);
        assert_ne!(data[0..16], data[16..32]);
    }

    #[test]
    fn lrw_index_accounts_for_header_and_hidden_offset() {
        assert_eq!(lrw_block_index(1, 16, None), 1);
        assert_eq!(lrw_block_index(2, 16, None), (1 << 5) | 1);
        assert_eq!(lrw_block_index(2, 8, None), (1 << 6) | 1);
        assert_eq!(lrw_block_index(130, 16, Some(65536)), (2 << 5) | 1);
    }

    #[test]
    fn cbc_variants_round_trip() {
        let seed = seed();
        let original: Vec<u8> = (0..ENCRYPTION_DATA_UNIT_SIZE * 3).map(|i| (i * 5) as u8).collect();

        let cases: [(Vec<CipherId>, bool); 3] = [
            (vec![CipherId::TripleDes], false),
            (vec![CipherId::Serpent, CipherId::Blowfish, CipherId::Aes], false),
            (vec![CipherId::Twofish, CipherId::Aes], true),
        ];
        for (ciphers, outer) in cases {
            let ks: Vec<KeySchedule> = ciphers.iter().map(|c| schedule(*c, 9)).collect();

            let mut data = original.clone();
            encrypt_data_units_cbc(&mut data, 40, &ks, &seed, outer);
            assert_ne!(data, original);
            decrypt_data_units_cbc(&mut data, 40, &ks, &seed, outer);
            assert_eq!(data, original);

            let mut header = original[..448].to_vec();
            encrypt_header_cbc(&mut header, &ks, &seed, outer);
            decrypt_header_cbc(&mut header, &ks, &seed, outer);
            assert_eq!(header, &original[..448]);
        }
    }

    #[test]
    fn cbc_chains_previous_ciphertext() {
        let ks = schedule(CipherId::Aes, 4);
        let iv = [0u8; 16];
        let no_whitening = [0u8; 8];

        let mut data = vec![0x42u8; 32];
        encrypt_buffer_cbc(&mut data, CbcChain::Single(&ks), &iv, &no_whitening);

        let mut first = [0x42u8; 16];
        ks.encrypt_block(&mut first);
        let mut second = [0x42u8; 16];
        xor_into(&mut second, &first);
        ks.encrypt_block(&mut second);

        assert_eq!(&data[..16], &first);
        assert_eq!(&data[16..], &second);
    }

    #[test]
    fn sector_ivs_differ_per_unit() {
        let seed = seed();
        let (iv_a, w_a) = sector_iv_and_whitening(1, 16, &seed);
        let (iv_b, w_b) = sector_iv_and_whitening(2, 16, &seed);
        assert_ne!(iv_a, iv_b);
        assert_ne!(w_a, w_b);

        let (iv_short, _) = sector_iv_and_whitening(1, 8, &seed);
        assert_eq!(iv_short[..8], iv_a[..8]);
        assert_eq!(iv_short[8..], [0u8; 8]);
    }
}
