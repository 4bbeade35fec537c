use anyhow::Result;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::{distributions::Alphanumeric, Rng};
use tracing::warn;

/// Length of generated secret ids.
pub const SECRET_ID_LEN: usize = 10;

/// Hash `password` with Argon2id and a fresh random salt.
/// Returns a PHC string (`$argon2id$v=19$...`) that embeds the salt and parameters.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;
    Ok(hash.to_string())
}

/// Check `password` against a stored PHC string.
/// A corrupt stored hash never verifies.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let parsed = match PasswordHash::new(stored_hash) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "stored password hash is not a valid PHC string");
            return false;
        }
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Generate a short URL-safe secret id (`[0-9A-Za-z]{10}`).
pub fn generate_secret_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter2", &hash));
    }

    #[test]
    fn wrong_password_fails() {
        let hash = hash_password("right").unwrap();
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        let a = hash_password("same").unwrap();
        let b = hash_password("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn corrupt_hash_never_verifies() {
        assert!(!verify_password("anything", "salt$notaphcstring"));
    }

    #[test]
    fn secret_id_format() {
        let id = generate_secret_id();
        assert_eq!(id.len(), SECRET_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_secret_id());
    }
}
