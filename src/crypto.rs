use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const SALT_LEN: usize = 16;

/// Salted SHA-256 of a password. Both parts are stored base64-encoded.
#[derive(Debug, Clone)]
pub struct PasswordHash {
    salt: String,
    hash: String,
}

impl PasswordHash {
    pub fn new(password: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let salt = BASE64.encode(salt);
        let hash = digest(&salt, password);
        PasswordHash { salt, hash }
    }

    pub fn verify(&self, password: &str) -> bool {
        let candidate = digest(&self.salt, password);
        // length is fixed, compare every byte regardless of where they differ
        candidate
            .bytes()
            .zip(self.hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    BASE64.encode(hasher.finalize())
}

pub fn generate_token() -> String {
    Uuid::new_v4().simple().to_string()
}
