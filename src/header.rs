// Import the ByteOrder trait and BigEndian struct from the byteorder crate.
// Every multi-byte header field is stored big-endian.
use byteorder::{BigEndian, ByteOrder};
// Zeroize and ZeroizeOnDrop wipe the decoded header (it carries the master keys).
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::context::{CryptoContext, MASTER_KEYDATA_SIZE};
use crate::error::{CryptoError, Result};
use crate::password::{Password, MAX_LEGACY_PASSWORD};
use crate::pkcs5::{derive_key, Prf};
use crate::random::RandomSource;
use crate::registry::{algorithms, max_pkcs5_out_size, EaId, Mode};
use crate::thread_pool::{DerivationBatch, EncryptionThreadPool};
use crate::xts::ENCRYPTION_DATA_UNIT_SIZE;

/// Total size of an on-disk header.
pub const VOLUME_HEADER_SIZE: usize = 512;
/// Plaintext salt in front of the encrypted region.
pub const PKCS5_SALT_SIZE: usize = 64;
pub const HEADER_ENCRYPTED_DATA_OFFSET: usize = PKCS5_SALT_SIZE;
pub const HEADER_ENCRYPTED_DATA_SIZE: usize = VOLUME_HEADER_SIZE - HEADER_ENCRYPTED_DATA_OFFSET;

/// Newest header layout this build reads and the only one it writes.
pub const VOLUME_HEADER_VERSION: u16 = 5;
/// Program version written into new headers as the minimum required.
pub const MIN_REQUIRED_PROGRAM_VERSION: u16 = 0x010b;
/// Program version of this build.
pub const PROGRAM_VERSION: u16 = 0x0126;
/// Last TrueCrypt release, the limit when opening TrueCrypt volumes.
pub const TRUECRYPT_PROGRAM_VERSION: u16 = 0x071a;

pub const MIN_VOLUME_SECTOR_SIZE: u32 = 512;
pub const MAX_VOLUME_SECTOR_SIZE: u32 = 4096;

/// Headers are grouped at the start (and end) of the host in 128 KiB.
pub const VOLUME_HEADER_GROUP_SIZE: u64 = 131_072;
pub const HIDDEN_VOLUME_HEADER_OFFSET: u64 = 65_536;
/// Where data starts in a regular (non-hidden) volume.
pub const VOLUME_DATA_OFFSET: u64 = VOLUME_HEADER_GROUP_SIZE;

const MAGIC_VERA: &[u8; 4] = b"VERA";
const MAGIC_TRUE: &[u8; 4] = b"TRUE";

// Field offsets inside the decrypted region (absolute offset minus the salt).
const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_REQUIRED_VERSION: usize = 6;
const OFFSET_KEY_AREA_CRC: usize = 8;
const OFFSET_VOLUME_CREATION_TIME: usize = 12;
const OFFSET_MODIFICATION_TIME: usize = 20;
const OFFSET_HIDDEN_VOLUME_SIZE: usize = 28;
const OFFSET_VOLUME_SIZE: usize = 36;
const OFFSET_ENCRYPTED_AREA_START: usize = 44;
const OFFSET_ENCRYPTED_AREA_LENGTH: usize = 52;
const OFFSET_FLAGS: usize = 60;
const OFFSET_SECTOR_SIZE: usize = 64;
const OFFSET_HEADER_CRC: usize = 188;
const OFFSET_MASTER_KEYDATA: usize = 192;

/// Which of the four header copies a volume host carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLocation {
    Primary,
    Hidden,
    PrimaryBackup,
    HiddenBackup,
}

impl HeaderLocation {
    /// Byte offset of this header inside a host of `host_size` bytes.
    pub fn offset(self, host_size: u64) -> Option<u64> {
        match self {
            HeaderLocation::Primary => Some(0),
            HeaderLocation::Hidden => Some(HIDDEN_VOLUME_HEADER_OFFSET),
            HeaderLocation::PrimaryBackup => host_size.checked_sub(VOLUME_HEADER_GROUP_SIZE),
            HeaderLocation::HiddenBackup => host_size.checked_sub(HIDDEN_VOLUME_HEADER_OFFSET),
        }
    }
}

/// Why a decrypted header candidate was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    // The magic bytes ("VERA", or "TRUE" for TrueCrypt volumes) were not found.
    #[error("invalid magic")]
    InvalidMagic,
    // A stored CRC32 does not match the computed one.
    #[error("header CRC mismatch")]
    InvalidCrc,
    // The header layout is newer than this build understands.
    #[error("unsupported header version")]
    UnsupportedVersion,
    // The volume requires a newer program.
    #[error("unsupported required program version")]
    UnsupportedProgramVersion,
    // The sector size is outside 512..=4096 or not a multiple of 512.
    #[error("invalid sector size")]
    InvalidSectorSize,
}

impl HeaderError {
    /// Maps a rejection onto the search outcome: `None` means try the next
    /// candidate, `Some` ends the search with that error.
    pub fn search_outcome(self) -> Option<CryptoError> {
        match self {
            HeaderError::InvalidMagic | HeaderError::InvalidCrc => None,
            HeaderError::UnsupportedVersion | HeaderError::UnsupportedProgramVersion => {
                Some(CryptoError::NewVersionRequired)
            }
            HeaderError::InvalidSectorSize => Some(CryptoError::ParameterIncorrect("invalid sector size")),
        }
    }
}

/// Validation switches for [`VolumeHeader::deserialize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderChecks {
    pub truecrypt_mode: bool,
    /// Skip both CRCs to get at the fields of a damaged header.
    pub recovery_mode: bool,
}

// The decrypted volume header.
// Zeroize and ZeroizeOnDrop make sure the master keys are wiped when it goes out of scope.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct VolumeHeader {
    // The version of the volume header layout (2 bytes).
    pub version: u16,
    // The minimum program version required to mount this volume (2 bytes).
    pub required_program_version: u16,
    // The CRC32 of the header fields (4 bytes). Not sensitive.
    #[zeroize(skip)]
    pub header_crc: u32,
    // The timestamp when the volume was created (8 bytes).
    pub volume_creation_time: u64,
    // The timestamp when the header was last written (8 bytes).
    pub header_creation_time: u64,
    // The size of the hidden volume, zero for a regular volume (8 bytes).
    pub hidden_volume_size: u64,
    // The size of the volume data area (8 bytes).
    pub volume_size: u64,
    // The starting offset of the encrypted area (8 bytes).
    pub encrypted_area_start: u64,
    // The length of the encrypted area (8 bytes).
    pub encrypted_area_length: u64,
    // Volume option flags (4 bytes).
    pub flags: u32,
    // The sector size of the volume (4 bytes, version 5 onwards).
    pub sector_size: u32,
    // The CRC32 of the key area (4 bytes). Not sensitive.
    #[zeroize(skip)]
    pub key_area_crc: u32,
    // The master key data, fixed at 256 bytes.
    // Layout depends on the mode; see `CryptoContext::new`.
    pub master_key_data: [u8; MASTER_KEYDATA_SIZE],
}

impl VolumeHeader {
    // Decodes and validates a decrypted header region (the 448 bytes after the salt).
    // Checks run in a fixed order: magic, version, header CRC, key area CRC,
    // required program version and finally sector size.
    pub fn deserialize(decrypted: &[u8], checks: &HeaderChecks) -> std::result::Result<Self, HeaderError> {
        // A region shorter than 448 bytes cannot hold a header.
        if decrypted.len() < HEADER_ENCRYPTED_DATA_SIZE {
            return Err(HeaderError::InvalidMagic);
        }

        // Verify the magic signature for the volume family being opened.
        let magic = if checks.truecrypt_mode { MAGIC_TRUE } else { MAGIC_VERA };
        if &decrypted[OFFSET_MAGIC..OFFSET_MAGIC + 4] != magic {
            return Err(HeaderError::InvalidMagic);
        }

        // Anything newer than our layout cannot be interpreted safely.
        let version = BigEndian::read_u16(&decrypted[OFFSET_VERSION..]);
        if version > VOLUME_HEADER_VERSION {
            return Err(HeaderError::UnsupportedVersion);
        }

        // The header CRC exists from version 4 onwards and covers everything before it.
        let header_crc = BigEndian::read_u32(&decrypted[OFFSET_HEADER_CRC..]);
        if !checks.recovery_mode
            && version >= 4
            && header_crc != crc32fast::hash(&decrypted[OFFSET_MAGIC..OFFSET_HEADER_CRC])
        {
            return Err(HeaderError::InvalidCrc);
        }

        // The key area CRC covers the full 256-byte master key area.
        let key_area_crc = BigEndian::read_u32(&decrypted[OFFSET_KEY_AREA_CRC..]);
        let key_area = &decrypted[OFFSET_MASTER_KEYDATA..OFFSET_MASTER_KEYDATA + MASTER_KEYDATA_SIZE];
        if !checks.recovery_mode && key_area_crc != crc32fast::hash(key_area) {
            return Err(HeaderError::InvalidCrc);
        }

        // From here on the password is known to be right.
        let required_program_version = BigEndian::read_u16(&decrypted[OFFSET_REQUIRED_VERSION..]);
        let supported = if checks.truecrypt_mode { TRUECRYPT_PROGRAM_VERSION } else { PROGRAM_VERSION };
        if required_program_version > supported {
            return Err(HeaderError::UnsupportedProgramVersion);
        }

        // Headers older than version 5 have no sector size field.
        let sector_size = if version >= 5 {
            BigEndian::read_u32(&decrypted[OFFSET_SECTOR_SIZE..])
        } else {
            ENCRYPTION_DATA_UNIT_SIZE as u32
        };
        if !is_valid_sector_size(sector_size) {
            return Err(HeaderError::InvalidSectorSize);
        }

        let mut master_key_data = [0u8; MASTER_KEYDATA_SIZE];
        master_key_data.copy_from_slice(key_area);

        Ok(VolumeHeader {
            version,
            required_program_version,
            header_crc,
            volume_creation_time: BigEndian::read_u64(&decrypted[OFFSET_VOLUME_CREATION_TIME..]),
            header_creation_time: BigEndian::read_u64(&decrypted[OFFSET_MODIFICATION_TIME..]),
            hidden_volume_size: BigEndian::read_u64(&decrypted[OFFSET_HIDDEN_VOLUME_SIZE..]),
            volume_size: BigEndian::read_u64(&decrypted[OFFSET_VOLUME_SIZE..]),
            encrypted_area_start: BigEndian::read_u64(&decrypted[OFFSET_ENCRYPTED_AREA_START..]),
            encrypted_area_length: BigEndian::read_u64(&decrypted[OFFSET_ENCRYPTED_AREA_LENGTH..]),
            flags: BigEndian::read_u32(&decrypted[OFFSET_FLAGS..]),
            sector_size,
            key_area_crc,
            master_key_data,
        })
    }

    // Encodes the header into a plaintext region of 448 bytes, filling in both CRCs.
    // The stored CRC fields of `self` are ignored and recomputed.
    pub fn serialize(&self, magic: &[u8; 4], out: &mut [u8]) {
        assert!(out.len() >= HEADER_ENCRYPTED_DATA_SIZE, "header region too small");
        out[..HEADER_ENCRYPTED_DATA_SIZE].fill(0);

        out[OFFSET_MAGIC..OFFSET_MAGIC + 4].copy_from_slice(magic);
        BigEndian::write_u16(&mut out[OFFSET_VERSION..], self.version);
        BigEndian::write_u16(&mut out[OFFSET_REQUIRED_VERSION..], self.required_program_version);
        BigEndian::write_u64(&mut out[OFFSET_VOLUME_CREATION_TIME..], self.volume_creation_time);
        BigEndian::write_u64(&mut out[OFFSET_MODIFICATION_TIME..], self.header_creation_time);
        BigEndian::write_u64(&mut out[OFFSET_HIDDEN_VOLUME_SIZE..], self.hidden_volume_size);
        BigEndian::write_u64(&mut out[OFFSET_VOLUME_SIZE..], self.volume_size);
        BigEndian::write_u64(&mut out[OFFSET_ENCRYPTED_AREA_START..], self.encrypted_area_start);
        BigEndian::write_u64(&mut out[OFFSET_ENCRYPTED_AREA_LENGTH..], self.encrypted_area_length);
        BigEndian::write_u32(&mut out[OFFSET_FLAGS..], self.flags);
        BigEndian::write_u32(&mut out[OFFSET_SECTOR_SIZE..], self.sector_size);

        let key_area = OFFSET_MASTER_KEYDATA..OFFSET_MASTER_KEYDATA + MASTER_KEYDATA_SIZE;
        out[key_area.clone()].copy_from_slice(&self.master_key_data);
        let key_area_crc = crc32fast::hash(&out[key_area]);
        BigEndian::write_u32(&mut out[OFFSET_KEY_AREA_CRC..], key_area_crc);

        // The header CRC covers the key area CRC, so it goes last.
        let header_crc = crc32fast::hash(&out[OFFSET_MAGIC..OFFSET_HEADER_CRC]);
        BigEndian::write_u32(&mut out[OFFSET_HEADER_CRC..], header_crc);
    }

    // XTS master keys are vulnerable if the primary and secondary halves are identical.
    pub fn is_key_vulnerable(&self, key_size: usize) -> bool {
        // A key size that does not fit twice in the key area is treated as vulnerable.
        if key_size * 2 > self.master_key_data.len() {
            return true;
        }
        self.master_key_data[..key_size] == self.master_key_data[key_size..key_size * 2]
    }
}

pub fn is_valid_sector_size(sector_size: u32) -> bool {
    (MIN_VOLUME_SECTOR_SIZE..=MAX_VOLUME_SECTOR_SIZE).contains(&sector_size)
        && sector_size % ENCRYPTION_DATA_UNIT_SIZE as u32 == 0
}

/// How [`read_volume_header`] searches for the header parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderOpenOptions {
    /// Limit the search to one PRF. Also disables parallel derivation.
    pub prf: Option<Prf>,
    /// Personal iterations multiplier; zero or negative selects the default.
    pub pim: i32,
    /// Use the boot-loader iteration counts.
    pub boot: bool,
    /// Open a TrueCrypt volume ("TRUE" magic, TrueCrypt iteration counts).
    pub truecrypt_mode: bool,
    /// Skip CRC validation to recover fields from a damaged header.
    pub recovery_mode: bool,
}

impl HeaderOpenOptions {
    fn checks(&self) -> HeaderChecks {
        HeaderChecks {
            truecrypt_mode: self.truecrypt_mode,
            recovery_mode: self.recovery_mode,
        }
    }
}

/// Finds the PRF, mode and cascade that decrypt `encrypted_header` with
/// `password` and returns a context scheduled with the volume master key.
///
/// Derivations run on `pool` when it is running with more than one thread
/// and no PRF was selected; otherwise they run one by one on this thread.
/// A wrong password and a non-volume are indistinguishable: both end with
/// [`CryptoError::PasswordWrong`].
pub fn read_volume_header(
    encrypted_header: &[u8],
    password: &Password,
    opts: &HeaderOpenOptions,
    pool: Option<&EncryptionThreadPool>,
) -> Result<CryptoContext> {
    if encrypted_header.len() < VOLUME_HEADER_SIZE {
        return Err(CryptoError::ParameterIncorrect("volume header too short"));
    }
    if (opts.truecrypt_mode || opts.boot) && password.len() > MAX_LEGACY_PASSWORD {
        return Err(CryptoError::PasswordWrong);
    }

    let pim = if opts.truecrypt_mode { 0 } else { opts.pim.max(0) };
    let salt = &encrypted_header[..PKCS5_SALT_SIZE];
    let prfs = match opts.prf {
        Some(prf) => vec![prf],
        None => Prf::trial_order(opts.truecrypt_mode, opts.boot),
    };

    let parallel = pool.filter(|p| opts.prf.is_none() && p.is_running() && p.thread_count() > 1);
    match parallel {
        Some(pool) => read_parallel(encrypted_header, password, &prfs, pim, opts, pool),
        None => {
            for prf in prfs {
                let iterations = prf.iteration_count(pim, opts.truecrypt_mode, opts.boot);
                if iterations == 0 {
                    continue;
                }
                let mut dk = Zeroizing::new(vec![0u8; max_pkcs5_out_size()]);
                derive_key(prf, password.as_bytes(), salt, iterations, &mut dk)?;
                if let Some(ctx) = try_derived_key(encrypted_header, &dk, prf, iterations, pim, opts)? {
                    return Ok(ctx);
                }
            }
            Err(CryptoError::PasswordWrong)
        }
    }
}

// Keeps at most `thread_count` derivations in flight and tests each key as soon
// as it is ready.
fn read_parallel(
    encrypted_header: &[u8],
    password: &Password,
    prfs: &[Prf],
    pim: i32,
    opts: &HeaderOpenOptions,
    pool: &EncryptionThreadPool,
) -> Result<CryptoContext> {
    let salt = &encrypted_header[..PKCS5_SALT_SIZE];
    let jobs: Vec<(Prf, u32)> = prfs
        .iter()
        .map(|prf| (*prf, prf.iteration_count(pim, opts.truecrypt_mode, opts.boot)))
        .filter(|(_, iterations)| *iterations != 0)
        .collect();

    let batch = DerivationBatch::new(jobs.len());
    let mut next = 0;
    loop {
        while next < jobs.len() && batch.in_flight() < pool.thread_count() {
            let (prf, iterations) = jobs[next];
            pool.begin_key_derivation(
                &batch,
                next,
                prf,
                password.as_bytes(),
                salt,
                iterations,
                max_pkcs5_out_size(),
            );
            next += 1;
        }

        let Some((index, dk)) = batch.wait_next() else {
            return Err(CryptoError::PasswordWrong);
        };
        let (prf, iterations) = jobs[index];
        let dk = dk?;
        if let Some(ctx) = try_derived_key(encrypted_header, &dk, prf, iterations, pim, opts)? {
            return Ok(ctx);
        }
    }
}

// Tries every mode and algorithm against one derived header key.
fn try_derived_key(
    encrypted_header: &[u8],
    dk: &[u8],
    prf: Prf,
    iterations: u32,
    pim: i32,
    opts: &HeaderOpenOptions,
) -> Result<Option<CryptoContext>> {
    let checks = opts.checks();
    let mut region = Zeroizing::new([0u8; HEADER_ENCRYPTED_DATA_SIZE]);

    for mode in Mode::ALL {
        for ea in algorithms().filter(|ea| ea.is_mode_supported(mode)) {
            let header_ctx = CryptoContext::new(ea, mode, dk)?;

            region.copy_from_slice(&encrypted_header[HEADER_ENCRYPTED_DATA_OFFSET..VOLUME_HEADER_SIZE]);
            header_ctx.decrypt_buffer(&mut region[..]);

            let header = match VolumeHeader::deserialize(&region[..], &checks) {
                Ok(header) => header,
                Err(e) => match e.search_outcome() {
                    None => continue,
                    Some(fatal) => return Err(fatal),
                },
            };

            log::debug!("Header accepted: {} {} {}", prf.name(), ea.name(), mode.name());
            return accept(ea, mode, &header, prf, iterations, pim).map(Some);
        }
    }
    Ok(None)
}

fn accept(ea: EaId, mode: Mode, header: &VolumeHeader, prf: Prf, iterations: u32, pim: i32) -> Result<CryptoContext> {
    let mut ctx = CryptoContext::new(ea, mode, &header.master_key_data)?;
    ctx.prf = Some(prf);
    ctx.iterations = iterations;
    ctx.pim = pim;
    ctx.header_version = header.version;
    ctx.required_program_version = header.required_program_version;
    ctx.legacy_volume = header.required_program_version < MIN_REQUIRED_PROGRAM_VERSION;
    ctx.volume_creation_time = header.volume_creation_time;
    ctx.header_creation_time = header.header_creation_time;
    ctx.volume_size = header.volume_size;
    ctx.hidden_volume_size = header.hidden_volume_size;
    ctx.hidden_volume = header.hidden_volume_size != 0;
    ctx.encrypted_area_start = header.encrypted_area_start;
    ctx.encrypted_area_length = header.encrypted_area_length;
    ctx.header_flags = header.flags;
    ctx.sector_size = header.sector_size;

    if header.is_key_vulnerable(ea.key_size()) {
        log::warn!("Volume master key halves are identical");
        ctx.vulnerable_master_key = true;
    }
    if ctx.weak_key {
        log::warn!("Volume master key is a known weak key");
    }
    Ok(ctx)
}

/// Parameters of a header to be written.
#[derive(Clone)]
pub struct HeaderCreateParams<'a> {
    pub ea: EaId,
    pub mode: Mode,
    pub prf: Prf,
    pub pim: i32,
    pub boot: bool,
    pub volume_size: u64,
    pub hidden_volume_size: u64,
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    pub required_program_version: u16,
    pub header_flags: u32,
    pub sector_size: u32,
    /// Existing master key to keep (password change); a fresh random key
    /// is generated when `None`.
    pub master_key_data: Option<&'a [u8]>,
}

impl<'a> HeaderCreateParams<'a> {
    /// XTS header for a regular volume whose data area directly follows the
    /// header group.
    pub fn new(ea: EaId, prf: Prf, volume_size: u64) -> Self {
        HeaderCreateParams {
            ea,
            mode: Mode::Xts,
            prf,
            pim: 0,
            boot: false,
            volume_size,
            hidden_volume_size: 0,
            encrypted_area_start: VOLUME_DATA_OFFSET,
            encrypted_area_length: volume_size,
            required_program_version: MIN_REQUIRED_PROGRAM_VERSION,
            header_flags: 0,
            sector_size: ENCRYPTION_DATA_UNIT_SIZE as u32,
            master_key_data: None,
        }
    }

    /// Parameters that rewrite the header of an open volume under a new
    /// PRF and PIM, keeping its master key and layout.
    pub fn from_context(ctx: &'a CryptoContext, prf: Prf, pim: i32) -> Self {
        HeaderCreateParams {
            ea: ctx.ea(),
            mode: ctx.mode(),
            prf,
            pim,
            boot: false,
            volume_size: ctx.volume_size,
            hidden_volume_size: ctx.hidden_volume_size,
            encrypted_area_start: ctx.encrypted_area_start,
            encrypted_area_length: ctx.encrypted_area_length,
            required_program_version: ctx.required_program_version.max(MIN_REQUIRED_PROGRAM_VERSION),
            header_flags: ctx.header_flags,
            sector_size: ctx.sector_size,
            master_key_data: Some(ctx.master_key_data()),
        }
    }
}

/// Builds and encrypts a version 5 header.
///
/// Returns the 512 on-disk bytes and a context scheduled with the master key.
pub fn create_volume_header(
    password: &Password,
    params: &HeaderCreateParams<'_>,
    rng: &dyn RandomSource,
) -> Result<([u8; VOLUME_HEADER_SIZE], CryptoContext)> {
    let ea = params.ea;
    if params.mode != Mode::Xts || !ea.is_format_enabled() {
        return Err(CryptoError::ParameterIncorrect("algorithm cannot be used for new volumes"));
    }
    if !is_valid_sector_size(params.sector_size) {
        return Err(CryptoError::ParameterIncorrect("invalid sector size"));
    }
    if params.boot && password.len() > MAX_LEGACY_PASSWORD {
        return Err(CryptoError::ParameterIncorrect("password too long for boot volume"));
    }
    let iterations = params.prf.iteration_count(params.pim, false, params.boot);
    if iterations == 0 {
        return Err(CryptoError::ParameterIncorrect("PRF cannot be used for new volumes"));
    }

    let key_size = ea.key_size();
    let mut master_key_data = Zeroizing::new([0u8; MASTER_KEYDATA_SIZE]);
    match params.master_key_data {
        Some(existing) => {
            let existing = existing
                .get(..key_size * 2)
                .ok_or(CryptoError::ParameterIncorrect("master key too short"))?;
            master_key_data[..key_size * 2].copy_from_slice(existing);
        }
        None => {
            if !rng.get_random_bytes(&mut master_key_data[..key_size * 2]) {
                return Err(CryptoError::RandomFailure);
            }
        }
    }
    if master_key_data[..key_size] == master_key_data[key_size..key_size * 2] {
        return Err(CryptoError::WeakKey);
    }

    let mut header = [0u8; VOLUME_HEADER_SIZE];
    if !rng.get_random_bytes(&mut header[..PKCS5_SALT_SIZE]) {
        return Err(CryptoError::RandomFailure);
    }

    let mut dk = Zeroizing::new(vec![0u8; max_pkcs5_out_size()]);
    derive_key(params.prf, password.as_bytes(), &header[..PKCS5_SALT_SIZE], iterations, &mut dk)?;
    let header_ctx = CryptoContext::new(ea, Mode::Xts, &dk)?;

    let fields = VolumeHeader {
        version: VOLUME_HEADER_VERSION,
        required_program_version: params.required_program_version,
        header_crc: 0,
        volume_creation_time: 0,
        header_creation_time: 0,
        hidden_volume_size: params.hidden_volume_size,
        volume_size: params.volume_size,
        encrypted_area_start: params.encrypted_area_start,
        encrypted_area_length: params.encrypted_area_length,
        flags: params.header_flags,
        sector_size: params.sector_size,
        key_area_crc: 0,
        master_key_data: *master_key_data,
    };
    fields.serialize(MAGIC_VERA, &mut header[HEADER_ENCRYPTED_DATA_OFFSET..]);
    header_ctx.encrypt_buffer(&mut header[HEADER_ENCRYPTED_DATA_OFFSET..]);

    let ctx = accept(ea, Mode::Xts, &fields, params.prf, iterations, params.pim.max(0))?;
    log::info!("Created volume header ({}, {})", ea.name(), params.prf.name());
    Ok((header, ctx))
}

/// Re-encrypts an existing header under a new password, PRF and PIM while
/// keeping the volume master key.
pub fn change_password(
    encrypted_header: &[u8],
    old_password: &Password,
    opts: &HeaderOpenOptions,
    new_password: &Password,
    new_prf: Prf,
    new_pim: i32,
    rng: &dyn RandomSource,
) -> Result<[u8; VOLUME_HEADER_SIZE]> {
    let ctx = read_volume_header(encrypted_header, old_password, opts, None)?;
    let params = HeaderCreateParams::from_context(&ctx, new_prf, new_pim);
    let (header, _) = create_volume_header(new_password, &params, rng)?;
    Ok(header)
}
