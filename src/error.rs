use thiserror::Error;

/// Failures surfaced by the engine.
///
/// Magic and CRC mismatches seen while searching for the right header
/// parameters never show up here individually; the search either accepts a
/// candidate or ends with [`CryptoError::PasswordWrong`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("unknown cipher id {0}")]
    UnknownCipher(u8),

    #[error("cipher initialization failed")]
    CipherInitFailure,

    /// Advisory. The key was scheduled but is known to be weak.
    #[error("weak key")]
    WeakKey,

    #[error("incorrect password or not a valid volume")]
    PasswordWrong,

    #[error("volume was created by a newer program version")]
    NewVersionRequired,

    #[error("mode of operation initialization failed")]
    ModeInitFailed,

    #[error("out of memory")]
    OutOfMemory,

    #[error("parameter incorrect: {0}")]
    ParameterIncorrect(&'static str),

    #[error("random number generator failure")]
    RandomFailure,
}

impl CryptoError {
    /// Whether the error ends every further attempt, as opposed to the
    /// expected outcome of a wrong password or an advisory.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CryptoError::PasswordWrong | CryptoError::WeakKey)
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
