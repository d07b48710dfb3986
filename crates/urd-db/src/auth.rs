use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use urd_types::UrdError;

/// Argon2id password hashing. Hashing runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct Credentials {
    params: Params,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials { params: Params::DEFAULT }
    }
}

impl Credentials {
    /// Custom cost parameters: memory in KiB, iterations, parallelism.
    pub fn with_cost(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, UrdError> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| UrdError::InvalidArgument(format!("argon2 params: {e}")))?;
        Ok(Credentials { params })
    }

    pub async fn hash(&self, password: &str) -> Result<String, UrdError> {
        let params = self.params.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
                .map_err(|e| UrdError::InvalidArgument(format!("salt: {e}")))?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password(password.as_bytes(), &salt)
                .map(|h| h.to_string())
                .map_err(|e| UrdError::InvalidArgument(format!("hash password: {e}")))
        })
        .await
        .map_err(|e| UrdError::Storage(format!("hash task: {e}")))?
    }

    /// `false` for a wrong password or an unparsable hash.
    pub async fn verify(&self, password: &str, hash: &str) -> bool {
        let password = password.to_owned();
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || {
            PasswordHash::new(&hash)
                .map(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_then_verify() {
        let creds = Credentials::with_cost(64, 1, 1).unwrap();
        let hash = creds.hash("pass").await.unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(creds.verify("pass", &hash).await);
        assert!(!creds.verify("nope", &hash).await);
        assert!(!creds.verify("pass", "not a hash").await);
        assert_ne!(hash, creds.hash("pass").await.unwrap());
    }
}
