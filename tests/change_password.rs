// End-to-end volume file: create, write data, change the password, reopen.
// To run: cargo test --test change_password

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};

    use noxcipher_core::header::{HeaderLocation, VOLUME_DATA_OFFSET, VOLUME_HEADER_SIZE};
    use noxcipher_core::{
        algorithm_by_name, change_password, create_volume_header, decrypt_data_units, encrypt_data_units,
        read_volume_header, CryptoError, HeaderCreateParams, HeaderOpenOptions, OsRandom, Password, Prf,
        ENCRYPTION_DATA_UNIT_SIZE,
    };
    use tempfile::NamedTempFile;

    const DATA_SIZE: u64 = 256 * 1024;
    const HOST_SIZE: u64 = VOLUME_DATA_OFFSET * 2 + DATA_SIZE;

    fn read_at(file: &mut std::fs::File, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut buf).unwrap();
        buf
    }

    fn write_at(file: &mut std::fs::File, offset: u64, data: &[u8]) {
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(data).unwrap();
    }

    fn opts(prf: Prf, pim: i32) -> HeaderOpenOptions {
        HeaderOpenOptions { prf: Some(prf), pim, ..Default::default() }
    }

    #[test]
    fn test_change_password_flow() {
        let temp = NamedTempFile::new().unwrap();
        let mut file = temp.reopen().unwrap();
        file.set_len(HOST_SIZE).unwrap();

        let old_password = Password::new(b"password123").unwrap();
        let new_password = Password::new(b"newpassword456").unwrap();
        let ea = algorithm_by_name("AES-Twofish-Serpent").unwrap();

        // 1. Create the volume: primary and backup header, then some data.
        let mut params = HeaderCreateParams::new(ea, Prf::Sha512, DATA_SIZE);
        params.pim = 1;
        let (header, ctx) = create_volume_header(&old_password, &params, &OsRandom).unwrap();
        let backup = HeaderLocation::PrimaryBackup.offset(HOST_SIZE).unwrap();
        write_at(&mut file, 0, &header);
        write_at(&mut file, backup, &header);

        let plaintext: Vec<u8> = (0..16 * ENCRYPTION_DATA_UNIT_SIZE).map(|i| (i % 253) as u8).collect();
        let first_unit = VOLUME_DATA_OFFSET / ENCRYPTION_DATA_UNIT_SIZE as u64;
        let mut sectors = plaintext.clone();
        encrypt_data_units(&mut sectors, first_unit, &ctx);
        write_at(&mut file, VOLUME_DATA_OFFSET, &sectors);
        drop(ctx);

        // 2. Change the password on both header copies.
        for offset in [0, backup] {
            let current = read_at(&mut file, offset, VOLUME_HEADER_SIZE);
            let updated = change_password(
                &current,
                &old_password,
                &opts(Prf::Sha512, 1),
                &new_password,
                Prf::Sha256,
                2,
                &OsRandom,
            )
            .unwrap();
            assert_ne!(&current[..64], &updated[..64], "salt must be fresh");
            write_at(&mut file, offset, &updated);
        }
        file.sync_all().unwrap();

        // 3. The new password opens both copies, the old one neither.
        let mut reopened = std::fs::File::open(temp.path()).unwrap();
        for offset in [0, backup] {
            let header = read_at(&mut reopened, offset, VOLUME_HEADER_SIZE);
            let err = read_volume_header(&header, &old_password, &opts(Prf::Sha512, 1), None).unwrap_err();
            assert_eq!(err, CryptoError::PasswordWrong);

            let ctx = read_volume_header(&header, &new_password, &opts(Prf::Sha256, 2), None).unwrap();
            assert_eq!(ctx.ea(), ea);
            assert_eq!(ctx.volume_size, DATA_SIZE);

            // 4. Data written under the old header still decrypts.
            let mut data = read_at(&mut reopened, VOLUME_DATA_OFFSET, plaintext.len());
            decrypt_data_units(&mut data, first_unit, &ctx);
            assert_eq!(data, plaintext);
        }
    }

    #[test]
    fn wrong_old_password_leaves_header_untouched() {
        let password = Password::new(b"right").unwrap();
        let mut params = HeaderCreateParams::new(algorithm_by_name("Serpent").unwrap(), Prf::Sha256, DATA_SIZE);
        params.pim = 1;
        let (header, _) = create_volume_header(&password, &params, &OsRandom).unwrap();

        let err = change_password(
            &header,
            &Password::new(b"wrong").unwrap(),
            &opts(Prf::Sha256, 1),
            &Password::new(b"new").unwrap(),
            Prf::Sha256,
            1,
            &OsRandom,
        )
        .unwrap_err();
        assert_eq!(err, CryptoError::PasswordWrong);
    }
}
