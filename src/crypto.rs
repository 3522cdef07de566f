use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use sha2::{Digest, Sha256};

const NONCE_SIZE: usize = 12;

/// Reversible encryption for student identifiers and emails.
///
/// The nonce is derived from SHA-256(key || plaintext), so equal plaintexts
/// produce equal ciphertexts. That determinism is load-bearing: the encrypted
/// email is the enrollment upsert key and the join key for review-history
/// records, and both must be stable across pipeline runs.
#[derive(Clone)]
pub struct PiiCipher {
    key: [u8; 32],
}

impl PiiCipher {
    pub fn new(encryption_key: &str) -> Self {
        let mut key = [0u8; 32];
        let bytes = encryption_key.as_bytes();
        let len = bytes.len().min(32);
        key[..len].copy_from_slice(&bytes[..len]);
        Self { key }
    }

    fn nonce_for(&self, plaintext: &str) -> [u8; NONCE_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(plaintext.as_bytes());
        let digest = hasher.finalize();
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        nonce
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).context("failed to create cipher from key")?;
        let nonce = self.nonce_for(plaintext);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("failed to encrypt identifier"))?;

        let mut envelope = nonce.to_vec();
        envelope.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(&envelope))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).context("failed to create cipher from key")?;
        let envelope = general_purpose::STANDARD
            .decode(encoded)
            .context("failed to decode base64 identifier")?;
        if envelope.len() < NONCE_SIZE {
            anyhow::bail!("encrypted identifier too short");
        }

        let nonce = Nonce::from_slice(&envelope[..NONCE_SIZE]);
        let plaintext = cipher
            .decrypt(nonce, &envelope[NONCE_SIZE..])
            .map_err(|_| anyhow::anyhow!("failed to decrypt identifier"))?;
        String::from_utf8(plaintext).context("decrypted identifier is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_emails_and_ids() {
        let cipher = PiiCipher::new("pipeline-test-key");
        for plaintext in ["avery.lee@example.edu", "482913", ""] {
            let encrypted = cipher.encrypt(plaintext).unwrap();
            assert_ne!(encrypted, plaintext);
            assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn encryption_is_deterministic_per_key() {
        let cipher = PiiCipher::new("pipeline-test-key");
        let a = cipher.encrypt("avery.lee@example.edu").unwrap();
        let b = cipher.encrypt("avery.lee@example.edu").unwrap();
        assert_eq!(a, b);

        let other = PiiCipher::new("another-key-entirely");
        assert_ne!(other.encrypt("avery.lee@example.edu").unwrap(), a);
    }

    #[test]
    fn distinct_plaintexts_do_not_collide() {
        let cipher = PiiCipher::new("pipeline-test-key");
        assert_ne!(
            cipher.encrypt("avery.lee@example.edu").unwrap(),
            cipher.encrypt("jules.moreno@example.edu").unwrap()
        );
    }

    #[test]
    fn rejects_garbage_input() {
        let cipher = PiiCipher::new("pipeline-test-key");
        assert!(cipher.decrypt("not-base64!!").is_err());
        assert!(cipher.decrypt("AAAA").is_err());
    }
}
