//! Authentication error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization token missing")]
    MissingToken,

    #[error("token has expired")]
    TokenExpired,

    #[error("invalid token")]
    TokenInvalid,

    #[error("role not permitted for this operation")]
    InsufficientRole,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("cryptography error: {0}")]
    Crypto(String),
}

impl AuthError {
    /// Stable error code carried in the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenInvalid => "invalid_token",
            AuthError::InsufficientRole => "forbidden",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::Crypto(_) => "internal",
        }
    }
}
