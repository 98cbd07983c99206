//! Passphrase-sealed box for the backup format: AES-256-GCM with a PBKDF2
//! (SHA-256) derived key.
//!
//! The salt travels separately from the ciphertext so that the backup JSON
//! can carry `SaltB64` and `CipherB64` as distinct fields; the ciphertext is
//! `nonce || ct || tag`, base64-encoded.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Version tag recorded in sealed payload envelopes.
pub const SEAL_VERSION: u32 = 1;

/// Seal `plaintext` under `passphrase` with a fresh salt and nonce,
/// returning `(salt_b64, cipher_b64)`.
pub fn seal(plaintext: &[u8], passphrase: &str) -> Result<(String, String)> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).context("failed to build AES-256-GCM cipher")?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|error| anyhow!("sealing failed: {:?}", error))?;

    let mut body = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    body.extend_from_slice(&nonce_bytes);
    body.extend_from_slice(&ciphertext);

    Ok((BASE64.encode(salt), BASE64.encode(body)))
}

/// Open a sealed payload. Fails on a wrong passphrase or any tampering.
pub fn open(salt_b64: &str, cipher_b64: &str, passphrase: &str) -> Result<Vec<u8>> {
    let salt = BASE64.decode(salt_b64).context("invalid salt encoding")?;
    let body = BASE64
        .decode(cipher_b64)
        .context("invalid ciphertext encoding")?;

    if salt.len() != SALT_SIZE {
        bail!("unexpected salt length {}", salt.len());
    }
    if body.len() < NONCE_SIZE + TAG_SIZE {
        bail!("sealed payload too short");
    }

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).context("failed to build AES-256-GCM cipher")?;
    let nonce = Nonce::from_slice(&body[..NONCE_SIZE]);

    cipher
        .decrypt(nonce, &body[NONCE_SIZE..])
        .map_err(|error| anyhow!("unsealing failed (wrong passphrase or corrupt data): {:?}", error))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let (salt, cipher) = seal(b"armored key export", "hunter2").unwrap();
        let opened = open(&salt, &cipher, "hunter2").unwrap();
        assert_eq!(opened, b"armored key export");
    }

    #[test]
    fn wrong_passphrase_fails() {
        let (salt, cipher) = seal(b"secret", "correct").unwrap();
        assert!(open(&salt, &cipher, "incorrect").is_err());
    }

    #[test]
    fn sealing_twice_differs_but_opens_identically() {
        let (salt_a, cipher_a) = seal(b"same plaintext", "pass").unwrap();
        let (salt_b, cipher_b) = seal(b"same plaintext", "pass").unwrap();
        assert!(salt_a != salt_b || cipher_a != cipher_b);
        assert_eq!(
            open(&salt_a, &cipher_a, "pass").unwrap(),
            open(&salt_b, &cipher_b, "pass").unwrap()
        );
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let (salt, cipher) = seal(b"payload", "pass").unwrap();
        let mut raw = BASE64.decode(&cipher).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(open(&salt, &tampered, "pass").is_err());
    }
}
