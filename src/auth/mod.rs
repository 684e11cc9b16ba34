//! Actor roles, authenticated principals and the token/password primitives.

pub mod error;
pub mod password;
pub mod token;

use serde::{Deserialize, Serialize};

pub use error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    School,
    Teacher,
    Student,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::School, Role::Teacher, Role::Student];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::School => "SCHOOL",
            Role::Teacher => "TEACHER",
            Role::Student => "STUDENT",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SCHOOL" => Some(Role::School),
            "TEACHER" => Some(Role::Teacher),
            "STUDENT" => Some(Role::Student),
            _ => None,
        }
    }

    /// Table holding accounts of this role.
    pub fn table(self) -> &'static str {
        match self {
            Role::School => "schools",
            Role::Teacher => "teachers",
            Role::Student => "students",
        }
    }
}

/// Verified caller identity attached to every protected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub school_id: String,
    pub role: Role,
    pub email: String,
}

/// Verify `token` and check its role against `allowed`.
pub fn authorize(
    token: Option<&str>,
    allowed: &[Role],
    config: &crate::config::Config,
) -> Result<Principal, AuthError> {
    let raw = token.ok_or(AuthError::MissingToken)?;
    let principal = token::verify_token(raw, config)?;
    if !allowed.contains(&principal.role) {
        return Err(AuthError::InsufficientRole);
    }
    Ok(principal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn role_strings_roundtrip() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("teacher"), Some(Role::Teacher));
        assert_eq!(Role::parse("admin"), None);
    }

    #[test]
    fn authorize_rejects_role_outside_allowed_set() {
        let config = Config::default();
        let p = Principal {
            id: "t1".into(),
            school_id: "s1".into(),
            role: Role::Student,
            email: "s@example.com".into(),
        };
        let tok = token::issue_token(&p, &config).unwrap();
        assert!(matches!(
            authorize(Some(&tok), &[Role::School, Role::Teacher], &config),
            Err(AuthError::InsufficientRole)
        ));
        assert_eq!(
            authorize(Some(&tok), &[Role::Student], &config).unwrap(),
            p
        );
        assert!(matches!(
            authorize(None, &[Role::Student], &config),
            Err(AuthError::MissingToken)
        ));
    }
}
