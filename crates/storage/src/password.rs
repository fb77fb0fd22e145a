//! Password digesting shared by the Postgres and in-memory stores.
//!
//! Digests are PHC strings produced by argon2. The PHC algorithm identifier
//! doubles as the user's declared pattern: verification refuses a digest
//! whose algorithm does not match the pattern stored on the user record, so
//! a swapped or downgraded digest never verifies.

use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use pwhash::rand_core::OsRng;
use thiserror::Error;

/// Pattern recorded on freshly created users.
pub const DEFAULT_PATTERN: &str = "argon2id";

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("hashing password failed: {0}")]
    Hash(String),
    #[error("stored digest is malformed: {0}")]
    MalformedDigest(String),
    #[error("digest algorithm '{actual}' does not match declared pattern '{declared}'")]
    PatternMismatch { declared: String, actual: String },
    #[error("password verification failed")]
    Mismatch,
}

/// Digest a plaintext password under a fresh random salt.
pub fn hash_password(plaintext: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let digest = Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map_err(|err| PasswordError::Hash(err.to_string()))?
        .to_string();
    Ok(digest)
}

/// Verify a plaintext password against a stored digest.
///
/// `declared_pattern` is the algorithm the user record claims; it must match
/// the digest's own PHC identifier before the password is even compared.
pub fn verify_password(
    plaintext: &str,
    digest: &str,
    declared_pattern: &str,
) -> Result<(), PasswordError> {
    let parsed =
        PasswordHash::new(digest).map_err(|err| PasswordError::MalformedDigest(err.to_string()))?;

    if parsed.algorithm.as_str() != declared_pattern {
        return Err(PasswordError::PatternMismatch {
            declared: declared_pattern.to_string(),
            actual: parsed.algorithm.as_str().to_string(),
        });
    }

    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .map_err(|_| PasswordError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_password_verifies() {
        let digest = hash_password("secret").expect("hash");
        verify_password("secret", &digest, DEFAULT_PATTERN).expect("verifies");
    }

    #[test]
    fn wrong_password_is_rejected() {
        let digest = hash_password("secret").expect("hash");
        let err = verify_password("not-secret", &digest, DEFAULT_PATTERN).unwrap_err();
        assert!(matches!(err, PasswordError::Mismatch));
    }

    #[test]
    fn pattern_mismatch_is_rejected_before_comparison() {
        let digest = hash_password("secret").expect("hash");
        let err = verify_password("secret", &digest, "scrypt").unwrap_err();
        assert!(matches!(err, PasswordError::PatternMismatch { .. }));
    }

    #[test]
    fn malformed_digest_is_rejected() {
        let err = verify_password("secret", "not-a-phc-string", DEFAULT_PATTERN).unwrap_err();
        assert!(matches!(err, PasswordError::MalformedDigest(_)));
    }
}
