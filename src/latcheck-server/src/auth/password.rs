//! Password hashing and verification.
//!
//! Stored credential is hex `SHA-256(password ∥ salt)` next to the opaque hex
//! salt. Verification recomputes the digest and compares constant-time so a
//! mismatch position never shows up in response timing.

use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Salt length before hex encoding.
const SALT_BYTES: usize = 16;

/// Hex SHA-256 of `password ∥ salt`.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fresh random salt, hex encoded.
pub fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Recompute the hash and compare against the stored value in constant time.
pub fn verify_password(password: &str, stored_hash: &str, salt: &str) -> bool {
    let computed = hash_password(password, salt);
    if computed.len() != stored_hash.len() {
        return false;
    }
    computed
        .as_bytes()
        .ct_eq(stored_hash.as_bytes())
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_hex_sha256() {
        let hash = hash_password("pw", "salt");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic for a fixed (password, salt) pair.
        assert_eq!(hash, hash_password("pw", "salt"));
        // The digest runs over the raw concatenation.
        assert_eq!(hash, hash_password("pws", "alt"));
    }

    #[test]
    fn verify_accepts_correct_password() {
        let salt = generate_salt();
        let hash = hash_password("hunter2", &salt);
        assert!(verify_password("hunter2", &hash, &salt));
    }

    #[test]
    fn verify_rejects_wrong_password_or_salt() {
        let salt = generate_salt();
        let hash = hash_password("hunter2", &salt);
        assert!(!verify_password("hunter3", &hash, &salt));
        assert!(!verify_password("hunter2", &hash, "othersalt"));
        assert!(!verify_password("hunter2", "deadbeef", &salt));
    }

    #[test]
    fn salt_is_unique_and_hex() {
        let a = generate_salt();
        let b = generate_salt();
        assert_ne!(a, b);
        assert_eq!(a.len(), SALT_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn salt_changes_hash() {
        assert_ne!(hash_password("pw", "salt1"), hash_password("pw", "salt2"));
    }
}
