//! Roles and user-management payloads.

use std::fmt;

use noticeboard_common::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::UserId;

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Student,
    Teacher,
    Admin,
    SuperAdmin,
}

impl Role {
    /// Admins and super-admins may post and manage announcements.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Student => "Student",
            Self::Teacher => "Teacher",
            Self::Admin => "Admin",
            Self::SuperAdmin => "SuperAdmin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Managed account collection under `/admin/{kind}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserKind {
    Students,
    Teachers,
    Admins,
}

impl UserKind {
    /// Path segment and cache key prefix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Students => "students",
            Self::Teachers => "teachers",
            Self::Admins => "admins",
        }
    }

    /// Whether an account with `role` belongs to this collection.
    #[must_use]
    pub const fn accepts(self, role: Role) -> bool {
        match self {
            Self::Students => matches!(role, Role::Student),
            Self::Teachers => matches!(role, Role::Teacher),
            Self::Admins => role.is_admin(),
        }
    }
}

impl fmt::Display for UserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account as listed in the management screens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedUser {
    #[serde(alias = "id")]
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matricule_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institutional_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

/// Student-only fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct StudentFields {
    #[validate(length(min = 1, message = "matricule is required"))]
    pub matricule_number: String,
    #[validate(length(min = 1, message = "level is required"))]
    pub level: String,
    #[validate(email)]
    pub institutional_email: String,
}

/// Body of `POST /admin/{kind}` and an element of the bulk variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct NewUser {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, message = "password must be at least 8 characters"))]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub role: Role,
    #[serde(flatten)]
    #[validate(nested)]
    pub student: Option<StudentFields>,
}

impl NewUser {
    /// Validate the payload for a given collection.
    pub fn check_for(&self, kind: UserKind) -> AppResult<()> {
        self.validate()?;
        if !kind.accepts(self.role) {
            return Err(AppError::Validation(format!(
                "role {} cannot be added to {kind}",
                self.role
            )));
        }
        match (self.role, &self.student) {
            (Role::Student, None) => Err(AppError::Validation(
                "students need matricule, level and institutional email".to_string(),
            )),
            (Role::Student, Some(_)) | (_, None) => Ok(()),
            (_, Some(_)) => Err(AppError::Validation(
                "only students carry matricule fields".to_string(),
            )),
        }
    }
}

/// Partial body of `PUT /admin/{kind}/:id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Validate)]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(email)]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 8))]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matricule_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(email)]
    pub institutional_email: Option<String>,
}

impl UserUpdate {
    /// Validate the payload for a given collection.
    pub fn check_for(&self, kind: UserKind) -> AppResult<()> {
        self.validate()?;
        if let Some(role) = self.role
            && !kind.accepts(role)
        {
            return Err(AppError::Validation(format!(
                "role {role} cannot be assigned in {kind}"
            )));
        }
        Ok(())
    }

    /// Whether the update changes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn teacher() -> NewUser {
        NewUser {
            name: "Grace".to_string(),
            email: "grace@uni.example".to_string(),
            password: "correct horse".to_string(),
            phone_number: None,
            role: Role::Teacher,
            student: None,
        }
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(serde_json::to_value(Role::SuperAdmin).unwrap(), json!("SuperAdmin"));
        assert!(Role::SuperAdmin.is_admin());
        assert!(!Role::Teacher.is_admin());
    }

    #[test]
    fn test_new_user_kind_checks() {
        assert!(teacher().check_for(UserKind::Teachers).is_ok());
        assert!(teacher().check_for(UserKind::Admins).is_err());

        let mut student = teacher();
        student.role = Role::Student;
        assert!(student.check_for(UserKind::Students).is_err());

        student.student = Some(StudentFields {
            matricule_number: "FE21A001".to_string(),
            level: "300".to_string(),
            institutional_email: "ada@students.uni.example".to_string(),
        });
        assert!(student.check_for(UserKind::Students).is_ok());

        let body = serde_json::to_value(&student).unwrap();
        assert_eq!(body["matricule_number"], "FE21A001");
        assert!(body.get("student").is_none());
    }

    #[test]
    fn test_invalid_email_rejected() {
        let mut user = teacher();
        user.email = "not-an-email".to_string();
        assert!(matches!(
            user.check_for(UserKind::Teachers),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_update() {
        let update = UserUpdate {
            role: Some(Role::SuperAdmin),
            ..UserUpdate::default()
        };
        assert!(update.check_for(UserKind::Admins).is_ok());
        assert!(update.check_for(UserKind::Teachers).is_err());
        assert!(UserUpdate::default().is_empty());
        assert_eq!(serde_json::to_value(&update).unwrap(), json!({ "role": "SuperAdmin" }));
    }
}
