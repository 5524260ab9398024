//! Small in-memory store of passwords that opened a volume before.

use std::sync::Mutex;

use lazy_static::lazy_static;
use zeroize::Zeroize;

use crate::context::CryptoContext;
use crate::error::{CryptoError, Result};
use crate::header::{read_volume_header, HeaderOpenOptions};
use crate::password::Password;
use crate::thread_pool::EncryptionThreadPool;

pub const CACHE_SIZE: usize = 4;

#[derive(Clone, PartialEq, Eq)]
struct CachedPassword {
    password: Password,
    /// PIM the password was accepted with; `None` means the default.
    pim: Option<i32>,
}

/// Round-robin cache of accepted passwords.
///
/// Not synchronized; share it behind a mutex such as [`global_cache`].
pub struct PasswordCache {
    slots: [Option<CachedPassword>; CACHE_SIZE],
    next_slot: usize,
    empty: bool,
}

impl Default for PasswordCache {
    fn default() -> Self {
        PasswordCache {
            slots: Default::default(),
            next_slot: 0,
            empty: true,
        }
    }
}

impl PasswordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `password`, evicting the oldest slot when full. A password
    /// that is already cached keeps its slot and only takes the new PIM.
    pub fn remember(&mut self, password: &Password, pim: Option<i32>) {
        let pim = pim.filter(|p| *p > 0);
        if let Some(cached) = self.slots.iter_mut().flatten().find(|cached| cached.password == *password) {
            cached.pim = pim;
            return;
        }
        self.slots[self.next_slot] = Some(CachedPassword { password: password.clone(), pim });
        self.next_slot = (self.next_slot + 1) % CACHE_SIZE;
        self.empty = false;
    }

    pub fn contains(&self, password: &Password) -> bool {
        self.slots.iter().flatten().any(|cached| cached.password == *password)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Tries every cached password, in slot order, against `header`.
    ///
    /// Returns `Ok(None)` when the cache is empty or no entry matches. Any
    /// error other than a wrong password ends the search.
    pub fn try_cached(
        &self,
        header: &[u8],
        opts: &HeaderOpenOptions,
        pool: Option<&EncryptionThreadPool>,
    ) -> Result<Option<CryptoContext>> {
        if self.empty {
            return Ok(None);
        }
        for cached in self.slots.iter().flatten() {
            let mut attempt = *opts;
            attempt.pim = effective_pim(opts, cached.pim);
            match read_volume_header(header, &cached.password, &attempt, pool) {
                Ok(ctx) => return Ok(Some(ctx)),
                Err(CryptoError::PasswordWrong) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Zeroes every slot.
    pub fn wipe(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(cached) = slot.as_mut() {
                cached.password.zeroize();
                cached.pim = None;
            }
            *slot = None;
        }
        self.next_slot = 0;
        self.empty = true;
    }
}

fn effective_pim(opts: &HeaderOpenOptions, cached: Option<i32>) -> i32 {
    if opts.truecrypt_mode {
        0
    } else if opts.pim < 0 {
        cached.unwrap_or(0)
    } else {
        opts.pim
    }
}

impl Drop for PasswordCache {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Opens `header` with `password`, remembering it on success. An empty
/// password only tries the cached ones and derives nothing itself.
pub fn read_volume_header_with_cache(
    cache: &mut PasswordCache,
    header: &[u8],
    password: &Password,
    opts: &HeaderOpenOptions,
    pool: Option<&EncryptionThreadPool>,
    remember: bool,
) -> Result<CryptoContext> {
    if password.is_empty() {
        return cache.try_cached(header, opts, pool)?.ok_or(CryptoError::PasswordWrong);
    }

    let ctx = read_volume_header(header, password, opts, pool)?;
    if remember && !password.is_empty() {
        cache.remember(password, Some(opts.pim));
    }
    Ok(ctx)
}

lazy_static! {
    static ref GLOBAL_CACHE: Mutex<PasswordCache> = Mutex::new(PasswordCache::new());
}

/// The process-wide cache.
pub fn global_cache() -> &'static Mutex<PasswordCache> {
    &GLOBAL_CACHE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pw(text: &str) -> Password {
        Password::new(text.as_bytes()).unwrap()
    }

    #[test]
    fn remember_skips_duplicates() {
        let mut cache = PasswordCache::new();
        cache.remember(&pw("a"), None);
        cache.remember(&pw("a"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remembering_again_only_updates_the_pim() {
        let mut cache = PasswordCache::new();
        cache.remember(&pw("a"), Some(1));
        cache.remember(&pw("b"), None);
        cache.remember(&pw("a"), Some(7));
        assert_eq!(cache.len(), 2);

        let cached: Vec<_> = cache.slots.iter().flatten().filter(|c| c.password == pw("a")).collect();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].pim, Some(7));

        // The re-remembered entry must not push anything else out early.
        for name in ["c", "d"] {
            cache.remember(&pw(name), None);
        }
        assert!(cache.contains(&pw("a")));
        assert!(cache.contains(&pw("b")));
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let mut cache = PasswordCache::new();
        for name in ["a", "b", "c", "d", "e"] {
            cache.remember(&pw(name), None);
        }
        assert_eq!(cache.len(), CACHE_SIZE);
        assert!(!cache.contains(&pw("a")));
        assert!(cache.contains(&pw("e")));
        assert!(cache.contains(&pw("b")));
    }

    #[test]
    fn wipe_empties_everything() {
        let mut cache = PasswordCache::new();
        cache.remember(&pw("secret"), Some(3));
        assert!(!cache.is_empty());
        cache.wipe();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
        assert!(!cache.contains(&pw("secret")));
    }

    #[test]
    fn empty_cache_makes_no_attempt() {
        let cache = PasswordCache::new();
        // A real attempt would run the default-count PBKDF2 for every PRF.
        let opts = HeaderOpenOptions { pim: i32::MAX, ..Default::default() };
        assert!(cache.try_cached(&[0u8; 512], &opts, None).unwrap().is_none());
    }

    #[test]
    fn cached_pim_applies_only_without_explicit_pim() {
        let default = HeaderOpenOptions { pim: -1, ..Default::default() };
        assert_eq!(effective_pim(&default, Some(5)), 5);
        assert_eq!(effective_pim(&default, None), 0);

        let explicit = HeaderOpenOptions { pim: 2, ..Default::default() };
        assert_eq!(effective_pim(&explicit, Some(5)), 2);

        let truecrypt = HeaderOpenOptions { pim: 2, truecrypt_mode: true, ..Default::default() };
        assert_eq!(effective_pim(&truecrypt, Some(5)), 0);
    }
}
