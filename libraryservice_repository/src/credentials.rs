//! Salted digests for user secrets.
//!
//! Stored form: `sha256$<salt hex>$<digest hex>`.

use rand::RngCore;
use sha2::{Digest, Sha256};

const SCHEME: &str = "sha256";
const SALT_LEN: usize = 16;

pub fn hash_secret(secret: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    format!(
        "{}${}${}",
        SCHEME,
        hex::encode(salt),
        hex::encode(digest(&salt, secret))
    )
}

/// Returns false for anything that is not a well formed digest, including clear text values
pub fn verify_secret(secret: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(SCHEME), Some(salt_hex), Some(digest_hex)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };
    let actual = digest(&salt, secret);
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn digest(salt: &[u8], secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}
