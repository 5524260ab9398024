use rand::rngs::OsRng;
use rand::RngCore;

/// Source of salts and master keys for new headers.
pub trait RandomSource {
    /// Fills `buf` completely, or returns false.
    fn get_random_bytes(&self, buf: &mut [u8]) -> bool;
}

/// The operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn get_random_bytes(&self, buf: &mut [u8]) -> bool {
        match OsRng.try_fill_bytes(buf) {
            Ok(()) => true,
            Err(e) => {
                log::error!("OS random source failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_whole_buffer() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        assert!(OsRandom.get_random_bytes(&mut a));
        assert!(OsRandom.get_random_bytes(&mut b));
        assert_ne!(a, b);
    }
}
