// Bulk transforms through the worker pool must match the single-threaded result.
// To run: cargo test --test thread_pool

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use noxcipher_core::thread_pool::{global, start_global, stop_global};
    use noxcipher_core::{
        algorithm_by_name, decrypt_data_units, encrypt_data_units, CryptoContext, EncryptionThreadPool,
        EngineConfig, Mode, ENCRYPTION_DATA_UNIT_SIZE,
    };

    const THREADS: usize = 4;

    fn context(name: &str, mode: Mode) -> CryptoContext {
        let keys: Vec<u8> = (0..192u32).map(|i| (i * 37 % 256) as u8).collect();
        CryptoContext::new(algorithm_by_name(name).unwrap(), mode, &keys).unwrap()
    }

    fn units(count: usize, seed: u8) -> Vec<u8> {
        (0..count * ENCRYPTION_DATA_UNIT_SIZE)
            .map(|i| (i as u8).wrapping_mul(seed).wrapping_add(i as u8 >> 3))
            .collect()
    }

    fn serial(ctx: &CryptoContext, data: &[u8], start: u64) -> Vec<u8> {
        let mut out = data.to_vec();
        ctx.encrypt_data_units_current_thread(&mut out, start);
        out
    }

    #[test]
    fn fragment_boundaries_do_not_change_ciphertext() {
        let pool = EncryptionThreadPool::with_threads(THREADS).unwrap();
        let ctx = context("AES-Twofish", Mode::Xts);

        for count in [1, THREADS - 1, THREADS, 1000 * THREADS + 7] {
            let original = units(count, 3);
            let mut data = original.clone();
            pool.encrypt_data_units(&mut data, 1234, &ctx);
            assert_eq!(data, serial(&ctx, &original, 1234), "{count} units");

            pool.decrypt_data_units(&mut data, 1234, &ctx);
            assert_eq!(data, original, "{count} units");
        }
    }

    #[test]
    fn legacy_modes_split_the_same_way() {
        let pool = EncryptionThreadPool::with_threads(THREADS).unwrap();
        for (name, mode) in [("AES", Mode::Lrw), ("Blowfish", Mode::Cbc), ("AES-Blowfish", Mode::InnerCbc)] {
            let ctx = context(name, mode);
            let original = units(3 * THREADS + 1, 5);
            let mut data = original.clone();
            pool.encrypt_data_units(&mut data, 77, &ctx);
            assert_eq!(data, serial(&ctx, &original, 77), "{name} {mode:?}");
            pool.decrypt_data_units(&mut data, 77, &ctx);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn concurrent_callers_share_the_pool() {
        let pool = Arc::new(EncryptionThreadPool::with_threads(THREADS).unwrap());
        let ctx = Arc::new(context("Serpent", Mode::Xts));

        let handles: Vec<_> = (0..6u8)
            .map(|caller| {
                let pool = Arc::clone(&pool);
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || {
                    for round in 0..10u64 {
                        let original = units(2 * THREADS + caller as usize, caller + 1);
                        let mut data = original.clone();
                        pool.encrypt_data_units(&mut data, round * 100, &ctx);
                        assert_eq!(data, serial(&ctx, &original, round * 100));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn stopping_mid_flight_still_completes_requests() {
        let pool = Arc::new(EncryptionThreadPool::with_threads(THREADS).unwrap());
        let ctx = Arc::new(context("AES", Mode::Xts));

        let handles: Vec<_> = (0..4u8)
            .map(|caller| {
                let pool = Arc::clone(&pool);
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || {
                    for round in 0..20u64 {
                        let original = units(64, caller + 2);
                        let mut data = original.clone();
                        pool.encrypt_data_units(&mut data, round, &ctx);
                        assert_eq!(data, serial(&ctx, &original, round));
                    }
                })
            })
            .collect();

        thread::sleep(std::time::Duration::from_millis(5));
        pool.stop();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!pool.is_running());
    }

    #[test]
    fn global_pool_lifecycle() {
        let ctx = context("AES", Mode::Xts);
        let original = units(40, 9);
        let expected = serial(&ctx, &original, 0);

        let started = start_global(&EngineConfig::default().with_thread_count(THREADS)).unwrap();
        assert!(started);
        assert_eq!(global().map(|p| p.thread_count()), Some(THREADS));

        let mut data = original.clone();
        encrypt_data_units(&mut data, 0, &ctx);
        assert_eq!(data, expected);

        stop_global();
        assert!(global().is_none());

        // Without a pool the same call runs on this thread.
        decrypt_data_units(&mut data, 0, &ctx);
        assert_eq!(data, original);
    }
}
