//! Argon2 password hashing in PHC string format.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use snafu::Snafu;

pub type Result<T, E = PasswordError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum PasswordError {
    #[snafu(display("failed to hash password"))]
    Hash { message: String },

    #[snafu(display("stored password hash is malformed"))]
    MalformedHash { message: String },
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PasswordError::Hash {
            message: e.to_string(),
        })
}

pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(stored_hash).map_err(|e| PasswordError::MalformedHash {
        message: e.to_string(),
    })?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
