//! Login and token payloads.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::UserId;
use crate::user::Role;

/// Body of `POST /auth/login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Validate)]
pub struct LoginRequest {
    /// Email or matricule, depending on the role.
    #[validate(length(min = 1, message = "identifier is required"))]
    pub identifier: String,
    #[validate(length(min = 1, message = "password is required"))]
    pub password: String,
    pub role: Role,
}

/// User summary returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginUser {
    pub user_id: UserId,
    pub role: Role,
}

/// Response of `POST /auth/login`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(default)]
    pub success: bool,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub message: String,
    pub user: LoginUser,
}

/// Access/refresh pair, as returned by `POST /auth/refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Persisted client session: two tokens plus the role flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub is_super_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl Credentials {
    /// Session established by a login.
    #[must_use]
    pub fn from_login(response: &LoginResponse) -> Self {
        Self {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            is_super_admin: response.user.role == Role::SuperAdmin,
            role: Some(response.user.role),
        }
    }

    /// Same session with rotated tokens.
    #[must_use]
    pub fn rotated(&self, pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_login_response() {
        let response: LoginResponse = serde_json::from_value(json!({
            "success": true,
            "accessToken": "a1",
            "refreshToken": "r1",
            "message": "Login successful",
            "user": { "userId": 3, "role": "SuperAdmin" }
        }))
        .unwrap();

        let creds = Credentials::from_login(&response);
        assert!(creds.is_super_admin);
        assert_eq!(creds.role, Some(Role::SuperAdmin));

        let rotated = creds.rotated(TokenPair {
            access_token: "a2".to_string(),
            refresh_token: "r2".to_string(),
        });
        assert_eq!(rotated.access_token, "a2");
        assert!(rotated.is_super_admin);
    }

    #[test]
    fn test_credentials_wire_names() {
        let creds = Credentials {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            is_super_admin: false,
            role: Some(Role::Teacher),
        };
        assert_eq!(
            serde_json::to_value(&creds).unwrap(),
            json!({ "accessToken": "a", "refreshToken": "r", "isSuperAdmin": false, "role": "Teacher" })
        );
    }
}
