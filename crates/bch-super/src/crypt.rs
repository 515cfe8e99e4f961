//! Encryption key material.
//!
//! The filesystem's master key never changes once formatted; the crypt
//! section stores it sealed under a key-encryption key derived from the
//! user passphrase. Changing the passphrase rewraps the same master
//! key, so data written under the old passphrase stays readable.

use bch_error::{Error, Result};
use bch_ondisk::sb::CryptSection;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

/// KDF identifier persisted in the crypt section.
pub const KDF_BLAKE3: u32 = 1;

const KDF_CONTEXT: &str = "bch-super 2026-01 passphrase kek v1";

/// Derive the key-encryption key from a passphrase and per-filesystem
/// salt.
fn derive_kek(passphrase: &str, salt: &[u8; 16]) -> [u8; 32] {
    let mut material = Vec::with_capacity(passphrase.len() + salt.len());
    material.extend_from_slice(salt);
    material.extend_from_slice(passphrase.as_bytes());
    blake3::derive_key(KDF_CONTEXT, &material)
}

/// Seal `master_key` under `passphrase`, producing a crypt section.
///
/// `salt` and `nonce` must be fresh random bytes from the caller (the
/// format driver sources them from the OS RNG via UUID generation).
pub fn wrap_master_key(
    master_key: &[u8; 32],
    passphrase: &str,
    salt: [u8; 16],
    nonce: [u8; 12],
) -> Result<CryptSection> {
    let kek = derive_kek(passphrase, &salt);
    let cipher = ChaCha20Poly1305::new_from_slice(&kek)
        .map_err(|_| Error::InvalidArgument("bad key-encryption key length".into()))?;
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: master_key,
                aad: b"bch-master-key",
            },
        )
        .map_err(|_| Error::InvalidArgument("master key seal failed".into()))?;

    let mut wrapped_key = [0_u8; 48];
    if sealed.len() != wrapped_key.len() {
        return Err(Error::InvalidArgument(
            "unexpected sealed master key length".into(),
        ));
    }
    wrapped_key.copy_from_slice(&sealed);

    Ok(CryptSection {
        kdf_type: KDF_BLAKE3,
        salt,
        nonce,
        wrapped_key,
    })
}

/// Unseal the master key with `passphrase`. A wrong passphrase fails
/// AEAD verification and is indistinguishable from corruption of the
/// crypt section.
pub fn unlock_master_key(crypt: &CryptSection, passphrase: &str) -> Result<[u8; 32]> {
    if crypt.kdf_type != KDF_BLAKE3 {
        return Err(Error::UnknownRequiredFeature {
            bits: u64::from(crypt.kdf_type),
        });
    }
    let kek = derive_kek(passphrase, &crypt.salt);
    let cipher = ChaCha20Poly1305::new_from_slice(&kek)
        .map_err(|_| Error::InvalidArgument("bad key-encryption key length".into()))?;
    let opened = cipher
        .decrypt(
            Nonce::from_slice(&crypt.nonce),
            Payload {
                msg: &crypt.wrapped_key,
                aad: b"bch-master-key",
            },
        )
        .map_err(|_| Error::BadChecksum {
            what: "encryption key (wrong passphrase?)",
        })?;

    let mut master = [0_u8; 32];
    if opened.len() != master.len() {
        return Err(Error::InvalidArgument("unexpected master key length".into()));
    }
    master.copy_from_slice(&opened);
    Ok(master)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unlock_round_trip() {
        let master = [0x42_u8; 32];
        let crypt = wrap_master_key(&master, "hunter2", [1; 16], [2; 12]).unwrap();
        assert_eq!(crypt.kdf_type, KDF_BLAKE3);
        let opened = unlock_master_key(&crypt, "hunter2").unwrap();
        assert_eq!(opened, master);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let master = [0x42_u8; 32];
        let crypt = wrap_master_key(&master, "hunter2", [1; 16], [2; 12]).unwrap();
        assert!(unlock_master_key(&crypt, "hunter3").is_err());
    }

    #[test]
    fn rewrap_preserves_master_key() {
        let master = [7_u8; 32];
        let old = wrap_master_key(&master, "old-pass", [1; 16], [2; 12]).unwrap();
        let opened = unlock_master_key(&old, "old-pass").unwrap();
        let new = wrap_master_key(&opened, "new-pass", [3; 16], [4; 12]).unwrap();
        assert_eq!(unlock_master_key(&new, "new-pass").unwrap(), master);
        assert_ne!(old.wrapped_key, new.wrapped_key);
    }

    #[test]
    fn salt_separates_identical_passphrases() {
        let master = [9_u8; 32];
        let a = wrap_master_key(&master, "same", [1; 16], [2; 12]).unwrap();
        let b = wrap_master_key(&master, "same", [5; 16], [2; 12]).unwrap();
        assert_ne!(a.wrapped_key, b.wrapped_key);
    }

    #[test]
    fn tampered_section_fails() {
        let master = [1_u8; 32];
        let mut crypt = wrap_master_key(&master, "p", [1; 16], [2; 12]).unwrap();
        crypt.wrapped_key[10] ^= 1;
        assert!(unlock_master_key(&crypt, "p").is_err());
    }
}
