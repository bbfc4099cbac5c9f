use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::GatewayError;

/// Claims carried by gateway-issued bearer tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub iss: String,
    pub iat: u64,
    pub nbf: u64,
    pub exp: u64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    MalformedToken,
    #[error("signature verification failed")]
    BadSignature,
    #[error("issuer mismatch")]
    WrongIssuer,
    #[error("token has expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MalformedToken => GatewayError::AuthMalformed,
            AuthError::Expired => GatewayError::AuthExpired,
            other => GatewayError::AuthInvalid(other.to_string()),
        }
    }
}

/// HMAC-only JWT authenticator. Tokens are issued with HS256; verification
/// accepts the HS family and rejects every other algorithm.
pub struct JwtAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    expiration: Duration,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str, issuer: &str, expiration: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.set_issuer(&[issuer]);
        validation.validate_nbf = true;
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.to_string(),
            expiration,
            validation,
        }
    }

    /// Issue a token for the given subject and roles.
    pub fn generate(&self, subject: &str, roles: &[String]) -> Result<String, GatewayError> {
        if subject.is_empty() {
            return Err(GatewayError::Internal("a subject is required to issue a token".into()));
        }

        let now = epoch_seconds();
        let claims = Claims {
            sub: subject.to_string(),
            roles: roles.to_vec(),
            iss: self.issuer.clone(),
            iat: now,
            nbf: now,
            exp: now + self.expiration.as_secs(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(format!("failed to sign token: {}", e)))
    }

    /// Verify a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidAlgorithmName => AuthError::BadSignature,
                ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::ImmatureSignature => AuthError::NotYetValid,
                _ => AuthError::MalformedToken,
            }
        })?;

        Ok(data.claims)
    }
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> JwtAuthenticator {
        JwtAuthenticator::new("test-secret", "api-gateway", Duration::from_secs(3600))
    }

    #[test]
    fn issued_token_verifies() {
        let auth = authenticator();
        let token = auth.generate("user-1", &["admin".to_string()]).unwrap();
        let claims = auth.verify(&token).unwrap();

        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.roles, vec!["admin"]);
        assert_eq!(claims.iss, "api-gateway");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn rejects_wrong_issuer() {
        let issuer_a = authenticator();
        let issuer_b = JwtAuthenticator::new("test-secret", "other", Duration::from_secs(3600));

        let token = issuer_b.generate("user-1", &[]).unwrap();
        assert_eq!(issuer_a.verify(&token), Err(AuthError::WrongIssuer));
    }

    #[test]
    fn rejects_tampered_signature() {
        let auth = authenticator();
        let other = JwtAuthenticator::new("other-secret", "api-gateway", Duration::from_secs(3600));

        let token = other.generate("user-1", &[]).unwrap();
        assert_eq!(auth.verify(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn rejects_expired_token() {
        let auth = JwtAuthenticator::new("test-secret", "api-gateway", Duration::from_secs(0));
        let token = auth.generate("user-1", &[]).unwrap();

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(auth.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn rejects_garbage() {
        let auth = authenticator();
        assert_eq!(auth.verify("not-a-jwt"), Err(AuthError::MalformedToken));
    }

    #[test]
    fn empty_subject_is_rejected() {
        let auth = authenticator();
        assert!(auth.generate("", &[]).is_err());
    }
}
