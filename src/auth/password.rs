//! Password hashing

use crate::error::{Error, Result};

const BCRYPT_COST: u32 = 10;

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, BCRYPT_COST).map_err(|e| Error::Auth(format!("Hashing failed: {}", e)))
}

/// Check a password against a stored hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match bcrypt::verify(password, hash) {
        Ok(valid) => valid,
        Err(err) => {
            tracing::error!("Password verification failed: {}", err);
            false
        }
    }
}
