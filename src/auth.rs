//! Handshake token verification boundary.
//!
//! Authentication is external to the engine: the gateway hands a token to an
//! [`AuthVerifier`] and trusts the verified user identity it returns, with no
//! further credential checks. The bundled [`TokenAuth`] issues and verifies
//! `userId:digest` tokens keyed on a shared secret.

use sha2::{Digest, Sha256};

use crate::session::UserId;

/// Verifies a handshake token and yields the authenticated user identity.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<UserId>;
}

/// Shared-secret token issuer/verifier.
pub struct TokenAuth {
    secret: String,
}

impl TokenAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Read the secret from `ENGINE_AUTH_SECRET`, generating a random one if unset.
    pub fn from_env() -> Self {
        let secret = std::env::var("ENGINE_AUTH_SECRET").unwrap_or_else(|_| {
            let random_bytes: [u8; 32] = rand::random();
            hex::encode(random_bytes)
        });
        Self::new(secret)
    }

    /// Issue a handshake token for a user.
    pub fn issue(&self, user_id: &str) -> String {
        format!("{}:{}", user_id, self.digest(user_id))
    }

    fn digest(&self, user_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(user_id.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl AuthVerifier for TokenAuth {
    fn verify(&self, token: &str) -> Option<UserId> {
        let (user_id, digest) = token.rsplit_once(':')?;
        if user_id.is_empty() {
            return None;
        }
        if self.digest(user_id) == digest {
            Some(user_id.to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let auth = TokenAuth::new("test-secret");
        let token = auth.issue("user-1");

        assert_eq!(auth.verify(&token), Some("user-1".to_string()));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let auth = TokenAuth::new("test-secret");
        let token = auth.issue("user-1");
        let forged = token.replace("user-1", "user-2");

        assert_eq!(auth.verify(&forged), None);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = TokenAuth::new("secret-a");
        let verifier = TokenAuth::new("secret-b");

        let token = issuer.issue("user-1");
        assert_eq!(verifier.verify(&token), None);
    }

    #[test]
    fn test_malformed_token_rejected() {
        let auth = TokenAuth::new("test-secret");
        assert_eq!(auth.verify("no-separator"), None);
        assert_eq!(auth.verify(":only-digest"), None);
        assert_eq!(auth.verify(""), None);
    }

    #[test]
    fn test_user_id_with_colon() {
        let auth = TokenAuth::new("test-secret");
        let token = auth.issue("org:user-1");
        assert_eq!(auth.verify(&token), Some("org:user-1".to_string()));
    }
}
