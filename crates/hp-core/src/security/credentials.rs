//! Panel login passwords and generated secrets.
//!
//! Login passwords are stored as bcrypt hashes; nothing here ever logs or
//! persists a plaintext value.

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

pub const LOGIN_HASH_COST: u32 = bcrypt::DEFAULT_COST;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

pub fn hash_login_password(password: &str) -> Result<String, CredentialError> {
    hash_login_password_with_cost(password, LOGIN_HASH_COST)
}

pub fn hash_login_password_with_cost(password: &str, cost: u32) -> Result<String, CredentialError> {
    Ok(bcrypt::hash(password, cost)?)
}

/// A malformed hash verifies as false rather than erroring.
pub fn verify_login_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Random alphanumeric secret from the thread-local CSPRNG.
pub fn generate_secret(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_login_password_with_cost("Str0ng!Pass#2024", 4).unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_login_password("Str0ng!Pass#2024", &hash));
        assert!(!verify_login_password("wrong", &hash));
        assert!(!verify_login_password("Str0ng!Pass#2024", "not-a-hash"));
    }

    #[test]
    fn test_generated_secrets() {
        let a = generate_secret(48);
        let b = generate_secret(48);
        assert_eq!(a.len(), 48);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
