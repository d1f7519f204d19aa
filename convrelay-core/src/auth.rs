//! Session token issuance and verification
//!
//! Front-end clients exchange their platform credential for a short-lived
//! HS256 token via `/register`; the same token is checked again when the
//! WebSocket session connects, before any routing state is touched.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::JwtConfig;
use crate::{Error, Result};

/// Claims carried by a session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Project this token grants access to
    pub project: String,
    /// Opaque user handle supplied at registration, if any
    #[serde(default)]
    pub user: String,
}

/// Token service for signing and verifying session tokens
#[derive(Clone)]
pub struct TokenService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    project_id: String,
    lifetime: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("project_id", &self.project_id)
            .finish()
    }
}

impl TokenService {
    /// Create a token service from a raw secret
    #[must_use]
    pub fn new(secret: &[u8], project_id: String, lifetime_minutes: i64) -> Self {
        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            project_id,
            lifetime: Duration::minutes(lifetime_minutes),
        }
    }

    /// Create a token service, loading the secret from the configured key
    /// file (typically a mounted secret volume)
    pub fn from_config(config: &JwtConfig) -> Result<Self> {
        let secret = std::fs::read(&config.secret_key_path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read JWT secret key from {}: {e}",
                config.secret_key_path
            ))
        })?;
        if secret.is_empty() {
            return Err(Error::Configuration(format!(
                "JWT secret key file {} is empty",
                config.secret_key_path
            )));
        }

        Ok(Self::new(
            &secret,
            config.project_id.clone(),
            config.token_lifetime_minutes,
        ))
    }

    /// Issue a session token for an optional user handle
    pub fn issue(&self, user: Option<&str>) -> Result<String> {
        let claims = Claims {
            exp: (Utc::now() + self.lifetime).timestamp(),
            project: self.project_id.clone(),
            user: user.unwrap_or_default().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }

    /// Verify a session token and extract its claims.
    ///
    /// Checks the signature, the expiration time and that the token was
    /// issued for this project.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 60; // seconds, for clock skew

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::Authentication("Token expired".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidToken => {
                    Error::Authentication("Invalid token".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    Error::Authentication("Invalid token signature".to_string())
                }
                _ => Error::Authentication(format!("Token verification failed: {e}")),
            }
        })?;

        let claims = token_data.claims;
        if claims.project != self.project_id {
            return Err(Error::Authentication(
                "Token was issued for a different project".to_string(),
            ));
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn service() -> TokenService {
        TokenService::new(b"test-secret", "proj-1".to_string(), 60)
    }

    #[test]
    fn test_issue_and_verify_roundtrip() {
        let svc = service();
        let token = svc.issue(Some("agent-7")).unwrap();

        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.project, "proj-1");
        assert_eq!(claims.user, "agent-7");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_issue_without_user() {
        let svc = service();
        let token = svc.issue(None).unwrap();

        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.user, "");
    }

    #[test]
    fn test_verify_rejects_other_project() {
        let svc = service();
        let other = TokenService::new(b"test-secret", "proj-2".to_string(), 60);

        let token = other.issue(None).unwrap();
        let err = svc.verify(&token).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let svc = service();
        let forged = TokenService::new(b"other-secret", "proj-1".to_string(), 60);

        let token = forged.issue(None).unwrap();
        assert!(svc.verify(&token).is_err());
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let svc = service();
        assert!(svc.verify("not-a-token").is_err());
    }

    #[test]
    fn test_from_config_reads_key_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"file-secret").unwrap();

        let config = JwtConfig {
            secret_key_path: file.path().to_string_lossy().to_string(),
            token_lifetime_minutes: 30,
            project_id: "proj-1".to_string(),
        };

        let svc = TokenService::from_config(&config).unwrap();
        let token = svc.issue(None).unwrap();
        assert!(svc.verify(&token).is_ok());
    }

    #[test]
    fn test_from_config_missing_key_file() {
        let config = JwtConfig {
            secret_key_path: "/nonexistent/jwt_secret_key".to_string(),
            token_lifetime_minutes: 30,
            project_id: "proj-1".to_string(),
        };

        assert!(matches!(
            TokenService::from_config(&config),
            Err(Error::Configuration(_))
        ));
    }
}
