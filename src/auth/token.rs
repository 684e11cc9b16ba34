//! Bearer token issuance/verification and one-time account tokens.

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::auth::error::AuthError;
use crate::auth::{Principal, Role};
use crate::config::Config;

/// Claims embedded in every bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub id: String,
    pub school_id: String,
    pub role: Role,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issue an HS256 token signed with the secret of `principal.role`.
pub fn issue_token(principal: &Principal, config: &Config) -> Result<String, AuthError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        id: principal.id.clone(),
        school_id: principal.school_id.clone(),
        role: principal.role,
        email: principal.email.clone(),
        iat: now,
        exp: now + config.token_ttl_secs,
    };
    let key = EncodingKey::from_secret(config.jwt_secret(principal.role).as_bytes());
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
        .map_err(|e| AuthError::Crypto(format!("token encode: {e}")))
}

/// Verify a bearer token against the per-role secrets.
///
/// A token is accepted only under the secret of the role it claims.
pub fn verify_token(token: &str, config: &Config) -> Result<Principal, AuthError> {
    let token = token.trim();
    let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.set_required_spec_claims(&["exp"]);

    let mut expired = false;
    for role in Role::ALL {
        let key = DecodingKey::from_secret(config.jwt_secret(role).as_bytes());
        match jsonwebtoken::decode::<Claims>(token, &key, &validation) {
            Ok(data) if data.claims.role == role => {
                return Ok(Principal {
                    id: data.claims.id,
                    school_id: data.claims.school_id,
                    role,
                    email: data.claims.email,
                });
            }
            Ok(_) => continue,
            Err(e) => {
                if matches!(e.kind(), ErrorKind::ExpiredSignature) {
                    expired = true;
                }
            }
        }
    }
    if expired {
        Err(AuthError::TokenExpired)
    } else {
        Err(AuthError::TokenInvalid)
    }
}

/// Random one-time token handed out by mail (verification, password reset).
pub fn generate_account_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// SHA-256 hex digest of an account token; this is what gets stored.
pub fn hash_account_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.trim().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: Role) -> Principal {
        Principal {
            id: "actor-1".into(),
            school_id: "school-1".into(),
            role,
            email: "a@example.com".into(),
        }
    }

    #[test]
    fn token_roundtrip_keeps_claims() {
        let config = Config::default();
        let token = issue_token(&principal(Role::Teacher), &config).unwrap();
        let p = verify_token(&token, &config).unwrap();
        assert_eq!(p.id, "actor-1");
        assert_eq!(p.school_id, "school-1");
        assert_eq!(p.role, Role::Teacher);
    }

    #[test]
    fn bearer_prefix_is_accepted() {
        let config = Config::default();
        let token = issue_token(&principal(Role::Student), &config).unwrap();
        let p = verify_token(&format!("Bearer {token}"), &config).unwrap();
        assert_eq!(p.role, Role::Student);
    }

    #[test]
    fn role_claim_must_match_signing_secret() {
        let config = Config::default();
        // Sign a claim of SCHOOL with the student secret.
        let now = Utc::now().timestamp();
        let forged = Claims {
            id: "x".into(),
            school_id: "s".into(),
            role: Role::School,
            email: "x@example.com".into(),
            iat: now,
            exp: now + 60,
        };
        let key = EncodingKey::from_secret(config.jwt_secret_student.as_bytes());
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &forged, &key).unwrap();
        assert!(matches!(
            verify_token(&token, &config),
            Err(AuthError::TokenInvalid)
        ));
    }

    #[test]
    fn expired_token_is_reported_as_expired() {
        let config = Config {
            token_ttl_secs: -120,
            ..Config::default()
        };
        let token = issue_token(&principal(Role::School), &config).unwrap();
        assert!(matches!(
            verify_token(&token, &config),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn garbage_and_empty_tokens() {
        let config = Config::default();
        assert!(matches!(
            verify_token("not.a.jwt", &config),
            Err(AuthError::TokenInvalid)
        ));
        assert!(matches!(
            verify_token("  ", &config),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn account_token_hash_is_deterministic() {
        let raw = generate_account_token();
        assert_eq!(raw.len(), 64);
        assert_eq!(hash_account_token(&raw), hash_account_token(&raw));
        assert_ne!(hash_account_token(&raw), hash_account_token("other"));
    }
}
