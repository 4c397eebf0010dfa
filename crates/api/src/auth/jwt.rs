//! Bearer tokens for chat sessions
//!
//! Tokens are HS256 JWTs minted by the help-desk application and presented
//! once, when a websocket or notification stream is opened. A valid token
//! resolves to the [`Principal`] the session is admitted under; nothing is
//! re-checked for the life of the session.

use deskline_shared::{Role, UserId};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// `iss` claim on every token this service accepts
pub const ISSUER: &str = "deskline";

/// Tolerated clock skew between issuer and server
const LEEWAY_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub role: Role,
    pub email: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique per token, for audit trails
    pub jti: String,
}

/// Identity a connection is admitted under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub role: Role,
    pub email: String,
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            role: claims.role,
            email: claims.email,
        }
    }
}

/// A freshly minted token
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    lifetime: Duration,
}

impl JwtManager {
    pub fn new(secret: &str, lifetime_hours: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            lifetime: Duration::hours(lifetime_hours),
        }
    }

    /// Mint a token for `user_id` acting as `role`
    pub fn issue(&self, user_id: UserId, role: Role, email: &str) -> Result<IssuedToken, JwtError> {
        self.issue_for(user_id, role, email, self.lifetime)
    }

    fn issue_for(
        &self,
        user_id: UserId,
        role: Role,
        email: &str,
        lifetime: Duration,
    ) -> Result<IssuedToken, JwtError> {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + lifetime;
        let jti = Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user_id,
            role,
            email: email.to_string(),
            iss: ISSUER.to_string(),
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            jti: jti.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))?;

        Ok(IssuedToken {
            token,
            jti,
            expires_at,
        })
    }

    /// Resolve a bearer credential to the identity a connection is admitted under
    pub fn authenticate(&self, token: &str) -> Result<Principal, JwtError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(Principal::from(data.claims))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Token signature does not verify")]
    BadSignature,
    #[error("Token was not issued by this service")]
    WrongIssuer,
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("Token encoding failed: {0}")]
    Encoding(String),
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => JwtError::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => JwtError::BadSignature,
            ErrorKind::InvalidIssuer => JwtError::WrongIssuer,
            _ => JwtError::Malformed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    #[test]
    fn test_issue_and_authenticate() {
        let jwt = JwtManager::new(SECRET, 24);
        let user_id = UserId::new();

        let issued = jwt.issue(user_id, Role::Staff, "agent@example.com").unwrap();
        assert!(issued.expires_at > OffsetDateTime::now_utc() + Duration::hours(23));

        let principal = jwt.authenticate(&issued.token).unwrap();
        assert_eq!(principal.user_id, user_id);
        assert_eq!(principal.role, Role::Staff);
        assert_eq!(principal.email, "agent@example.com");
    }

    #[test]
    fn test_each_token_gets_its_own_jti() {
        let jwt = JwtManager::new(SECRET, 24);
        let user_id = UserId::new();
        let a = jwt.issue(user_id, Role::Customer, "c@example.com").unwrap();
        let b = jwt.issue(user_id, Role::Customer, "c@example.com").unwrap();
        assert_ne!(a.jti, b.jti);
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtManager::new(SECRET, 24);
        let issued = jwt
            .issue_for(UserId::new(), Role::Customer, "c@example.com", Duration::hours(-2))
            .unwrap();

        assert!(matches!(jwt.authenticate(&issued.token), Err(JwtError::Expired)));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let issuer = JwtManager::new("issuer-secret-key-at-least-32-chars", 24);
        let verifier = JwtManager::new("another-secret-key-at-least-32-chars", 24);

        let issued = issuer.issue(UserId::new(), Role::Admin, "a@example.com").unwrap();

        assert!(matches!(
            verifier.authenticate(&issued.token),
            Err(JwtError::BadSignature)
        ));
        assert!(matches!(
            verifier.authenticate("not-a-jwt"),
            Err(JwtError::Malformed(_))
        ));
    }

    #[test]
    fn test_other_issuer_rejected() {
        let jwt = JwtManager::new(SECRET, 24);
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: UserId::new(),
            role: Role::Staff,
            email: "s@example.com".to_string(),
            iss: "someone-else".to_string(),
            iat: now.unix_timestamp(),
            exp: (now + Duration::hours(1)).unix_timestamp(),
            jti: "x".to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        assert!(matches!(jwt.authenticate(&token), Err(JwtError::WrongIssuer)));
    }
}
