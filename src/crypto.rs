use std::sync::atomic::{AtomicBool, Ordering};

use aes::Aes256;
use blowfish::BlowfishLE;
use byteorder::{ByteOrder, LittleEndian};
use camellia::Camellia256;
use cast5::Cast5;
use cipher::consts::{U1, U16, U32};
use cipher::generic_array::GenericArray;
use cipher::inout::InOut;
use cipher::{
    Block, BlockBackend, BlockCipher, BlockDecrypt, BlockEncrypt, BlockSizeUser, InvalidLength, Key,
    KeyInit, KeySizeUser, ParBlocksSizeUser,
};
use des::TdesEde3;
use serpent::Serpent;
use twofish::Twofish;
use zeroize::Zeroize;

use crate::error::{CryptoError, Result};
use crate::registry::CipherId;

/// Blocks handed to the hardware AES path in one call.
pub const HW_BATCH_BLOCKS: usize = 32;

// The kuznyechik crate still exposes the older block-cipher API; this adapts
// it to the `cipher` 0.4 traits the rest of the engine is written against.
pub struct KuznyechikCipher(kuznyechik::Kuznyechik);

impl KeySizeUser for KuznyechikCipher {
    type KeySize = U32;
}

impl KeyInit for KuznyechikCipher {
    fn new(key: &Key<Self>) -> Self {
        use kuznyechik::block_cipher::NewBlockCipher;
        KuznyechikCipher(kuznyechik::Kuznyechik::new(key))
    }
}

impl BlockSizeUser for KuznyechikCipher {
    type BlockSize = U16;
}

impl BlockCipher for KuznyechikCipher {}

struct KuznyechikBackend<'a> {
    inner: &'a kuznyechik::Kuznyechik,
    decrypt: bool,
}

impl BlockSizeUser for KuznyechikBackend<'_> {
    type BlockSize = U16;
}

impl ParBlocksSizeUser for KuznyechikBackend<'_> {
    type ParBlocksSize = U1;
}

impl BlockBackend for KuznyechikBackend<'_> {
    fn proc_block(&mut self, mut block: InOut<'_, '_, Block<Self>>) {
        use kuznyechik::block_cipher::BlockCipher as _;
        let mut buf = block.clone_in();
        if self.decrypt {
            self.inner.decrypt_block(&mut buf);
        } else {
            self.inner.encrypt_block(&mut buf);
        }
        *block.get_out() = buf;
        buf.as_mut_slice().zeroize();
    }
}

impl BlockEncrypt for KuznyechikCipher {
    fn encrypt_with_backend(&self, f: impl cipher::BlockClosure<BlockSize = Self::BlockSize>) {
        f.call(&mut KuznyechikBackend { inner: &self.0, decrypt: false });
    }
}

impl BlockDecrypt for KuznyechikCipher {
    fn decrypt_with_backend(&self, f: impl cipher::BlockClosure<BlockSize = Self::BlockSize>) {
        f.call(&mut KuznyechikBackend { inner: &self.0, decrypt: true });
    }
}

/// A scheduled key for one cipher.
///
/// The wrapped primitives are built with their `zeroize` feature, so the
/// round keys are wiped when the schedule is dropped. Kuznyechik is the
/// exception: its crate offers no wiping.
pub enum KeySchedule {
    Aes(Box<Aes256>),
    Serpent(Box<Serpent>),
    Twofish(Box<Twofish>),
    Camellia(Box<Camellia256>),
    Kuznyechik(Box<KuznyechikCipher>),
    Blowfish(Box<BlowfishLE>),
    Cast(Box<Cast5>),
    TripleDes(Box<TdesEde3>),
}

macro_rules! with_primitive {
    ($schedule:expr, $c:ident => $body:expr) => {
        match $schedule {
            KeySchedule::Aes($c) => $body,
            KeySchedule::Serpent($c) => $body,
            KeySchedule::Twofish($c) => $body,
            KeySchedule::Camellia($c) => $body,
            KeySchedule::Kuznyechik($c) => $body,
            KeySchedule::Blowfish($c) => $body,
            KeySchedule::Cast($c) => $body,
            KeySchedule::TripleDes($c) => $body,
        }
    };
}

impl KeySchedule {
    pub fn cipher(&self) -> CipherId {
        match self {
            KeySchedule::Aes(_) => CipherId::Aes,
            KeySchedule::Serpent(_) => CipherId::Serpent,
            KeySchedule::Twofish(_) => CipherId::Twofish,
            KeySchedule::Camellia(_) => CipherId::Camellia,
            KeySchedule::Kuznyechik(_) => CipherId::Kuznyechik,
            KeySchedule::Blowfish(_) => CipherId::Blowfish,
            KeySchedule::Cast(_) => CipherId::Cast,
            KeySchedule::TripleDes(_) => CipherId::TripleDes,
        }
    }

    pub fn block_size(&self) -> usize {
        self.cipher().block_size()
    }

    /// Encrypts exactly one block in place.
    pub fn encrypt_block(&self, block: &mut [u8]) {
        with_primitive!(self, c => c.encrypt_block(GenericArray::from_mut_slice(block)))
    }

    /// Decrypts exactly one block in place.
    pub fn decrypt_block(&self, block: &mut [u8]) {
        with_primitive!(self, c => c.decrypt_block(GenericArray::from_mut_slice(block)))
    }

    /// Encrypts contiguous blocks. AES goes through the hardware batch path
    /// when it is available and the block count is a multiple of
    /// [`HW_BATCH_BLOCKS`]; everything else is processed block by block.
    pub fn encrypt_blocks(&self, data: &mut [u8]) {
        self.process_blocks(data, false)
    }

    pub fn decrypt_blocks(&self, data: &mut [u8]) {
        self.process_blocks(data, true)
    }

    fn process_blocks(&self, data: &mut [u8], decrypt: bool) {
        let block_size = self.block_size();
        assert!(
            data.len() % block_size == 0,
            "buffer length {} is not a multiple of the block size",
            data.len()
        );

        if let KeySchedule::Aes(aes) = self {
            if is_hw_encryption_enabled() && data.len() % (HW_BATCH_BLOCKS * 16) == 0 {
                for chunk in data.chunks_exact_mut(HW_BATCH_BLOCKS * 16) {
                    aes_batch(aes, chunk, decrypt);
                }
                return;
            }
        }

        for block in data.chunks_exact_mut(block_size) {
            if decrypt {
                self.decrypt_block(block);
            } else {
                self.encrypt_block(block);
            }
        }
    }
}

fn aes_batch(aes: &Aes256, chunk: &mut [u8], decrypt: bool) {
    let mut batch: [Block<Aes256>; HW_BATCH_BLOCKS] = Default::default();
    for (dst, src) in batch.iter_mut().zip(chunk.chunks_exact(16)) {
        dst.copy_from_slice(src);
    }
    if decrypt {
        aes.decrypt_blocks(&mut batch);
    } else {
        aes.encrypt_blocks(&mut batch);
    }
    for (dst, src) in chunk.chunks_exact_mut(16).zip(batch.iter_mut()) {
        dst.copy_from_slice(src);
        src.as_mut_slice().zeroize();
    }
}

/// Schedules `key` for `cipher`, failing with [`CryptoError::WeakKey`] when
/// the key is known to be weak.
pub fn init_key(cipher: CipherId, key: &[u8]) -> Result<KeySchedule> {
    let (schedule, weak) = schedule_key(cipher, key)?;
    if weak {
        return Err(CryptoError::WeakKey);
    }
    Ok(schedule)
}

/// Like [`init_key`] but reports weakness as a flag next to a usable
/// schedule, since legacy volumes with weak keys must still open.
pub(crate) fn schedule_key(cipher: CipherId, key: &[u8]) -> Result<(KeySchedule, bool)> {
    if key.len() != cipher.key_size() {
        return Err(CryptoError::CipherInitFailure);
    }

    let schedule = match cipher {
        CipherId::Aes => KeySchedule::Aes(Box::new(Aes256::new_from_slice(key).map_err(rejected)?)),
        CipherId::Serpent => {
            KeySchedule::Serpent(Box::new(Serpent::new_from_slice(key).map_err(rejected)?))
        }
        CipherId::Twofish => {
            KeySchedule::Twofish(Box::new(Twofish::new_from_slice(key).map_err(rejected)?))
        }
        CipherId::Camellia => {
            KeySchedule::Camellia(Box::new(Camellia256::new_from_slice(key).map_err(rejected)?))
        }
        CipherId::Kuznyechik => KeySchedule::Kuznyechik(Box::new(
            KuznyechikCipher::new_from_slice(key).map_err(rejected)?,
        )),
        CipherId::Blowfish => {
            KeySchedule::Blowfish(Box::new(BlowfishLE::new_from_slice(key).map_err(rejected)?))
        }
        CipherId::Cast => KeySchedule::Cast(Box::new(Cast5::new_from_slice(key).map_err(rejected)?)),
        CipherId::TripleDes => {
            KeySchedule::TripleDes(Box::new(TdesEde3::new_from_slice(key).map_err(rejected)?))
        }
    };

    let weak = cipher == CipherId::TripleDes && is_weak_triple_des_key(key);
    Ok((schedule, weak))
}

fn rejected(_: InvalidLength) -> CryptoError {
    CryptoError::CipherInitFailure
}

// Two equal DES subkeys collapse EDE3 into something weaker. Parity bits
// are ignored in the comparison.
fn is_weak_triple_des_key(key: &[u8]) -> bool {
    const PARITY_MASK: u64 = 0xFEFE_FEFE_FEFE_FEFE;
    let k1 = LittleEndian::read_u64(&key[0..8]);
    let k2 = LittleEndian::read_u64(&key[8..16]);
    let k3 = LittleEndian::read_u64(&key[16..24]);
    (k1 ^ k2) & PARITY_MASK == 0 || (k2 ^ k3) & PARITY_MASK == 0 || (k1 ^ k3) & PARITY_MASK == 0
}

lazy_static::lazy_static! {
    static ref AES_HW_SUPPORTED: bool = detect_aes_hw();
}

static HW_ENCRYPTION_DISABLED: AtomicBool = AtomicBool::new(false);

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn detect_aes_hw() -> bool {
    std::is_x86_feature_detected!("aes") && std::is_x86_feature_detected!("sse2")
}

#[cfg(target_arch = "aarch64")]
fn detect_aes_hw() -> bool {
    std::arch::is_aarch64_feature_detected!("aes")
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_aes_hw() -> bool {
    false
}

/// Whether the CPU has AES instructions. Probed once.
pub fn is_aes_hw_cpu_supported() -> bool {
    *AES_HW_SUPPORTED
}

pub fn enable_hw_encryption(enable: bool) {
    HW_ENCRYPTION_DISABLED.store(!enable, Ordering::SeqCst);
}

pub fn is_hw_encryption_enabled() -> bool {
    !HW_ENCRYPTION_DISABLED.load(Ordering::SeqCst) && is_aes_hw_cpu_supported()
}

/// Whether all blocks of a data unit can be handed to the cipher in one
/// bulk call. AES qualifies only with hardware support; the 64-bit legacy
/// ciphers never do.
pub fn supports_intra_data_unit_parallelization(cipher: CipherId) -> bool {
    match cipher {
        CipherId::Aes => is_hw_encryption_enabled(),
        CipherId::Serpent | CipherId::Twofish | CipherId::Camellia | CipherId::Kuznyechik => true,
        CipherId::Blowfish | CipherId::Cast | CipherId::TripleDes => false,
    }
}
