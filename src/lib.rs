//! Volume encryption core: cipher cascades, XTS and legacy modes, header
//! trial decryption, a worker pool for bulk data-unit transforms and a
//! small password cache.
//!
//! The library logs through the `log` facade and installs no backend.

pub mod cache;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod gf;
pub mod header;
pub mod legacy;
pub mod password;
pub mod pkcs5;
pub mod random;
pub mod registry;
pub mod sync;
pub mod thread_pool;
pub mod xts;

pub use cache::{global_cache, read_volume_header_with_cache, PasswordCache};
pub use config::EngineConfig;
pub use context::CryptoContext;
pub use error::{CryptoError, Result};
pub use header::{
    change_password, create_volume_header, read_volume_header, HeaderCreateParams, HeaderLocation,
    HeaderOpenOptions,
};
pub use password::Password;
pub use pkcs5::Prf;
pub use random::{OsRandom, RandomSource};
pub use registry::{algorithm_by_name, algorithm_name, algorithms, EaId, Mode};
pub use thread_pool::{decrypt_data_units, encrypt_data_units, EncryptionThreadPool};
pub use xts::ENCRYPTION_DATA_UNIT_SIZE;

/// Applies `config` process-wide and starts the global thread pool.
///
/// Returns whether a pool is running; on single-CPU setups everything
/// stays on the calling thread.
pub fn init(config: &EngineConfig) -> Result<bool> {
    crypto::enable_hw_encryption(config.hardware_acceleration);
    log::info!(
        "Hardware AES {} (CPU support: {})",
        if crypto::is_hw_encryption_enabled() { "enabled" } else { "disabled" },
        crypto::is_aes_hw_cpu_supported()
    );
    thread_pool::start_global(config)
}

/// Stops the global pool and wipes the global password cache.
pub fn shutdown() {
    thread_pool::stop_global();
    sync::lock(cache::global_cache()).wipe();
}
