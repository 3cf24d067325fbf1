//! Dovecot `{SHA512-CRYPT}` hashes for mailbox passwords, computed
//! in-process so the secret never appears on a command line.

use sha_crypt::{sha512_check, sha512_simple, Sha512Params};
use thiserror::Error;

const SCHEME_PREFIX: &str = "{SHA512-CRYPT}";
const ROUNDS: usize = 5000;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("Hashing failed: {0}")]
    HashFailed(String),
}

/// Same format as `doveadm pw -s SHA512-CRYPT`.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let params = Sha512Params::new(ROUNDS)
        .map_err(|e| PasswordError::HashFailed(format!("Invalid params: {:?}", e)))?;
    let hash =
        sha512_simple(password, &params).map_err(|e| PasswordError::HashFailed(format!("{:?}", e)))?;
    Ok(format!("{}{}", SCHEME_PREFIX, hash))
}

/// Check a password against a `{SHA512-CRYPT}` hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let hash = hash.strip_prefix(SCHEME_PREFIX).unwrap_or(hash);
    sha512_check(password, hash).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_verifies() {
        let hash = hash_password("Mailb0x!Secret").unwrap();
        assert!(hash.starts_with("{SHA512-CRYPT}$6$"));
        assert!(verify_password("Mailb0x!Secret", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn test_salts_differ() {
        let h1 = hash_password("password1").unwrap();
        let h2 = hash_password("password1").unwrap();
        assert_ne!(h1, h2);
    }
}
