//! Comments and their targets.

use std::fmt;

use chrono::{DateTime, Utc};
use noticeboard_common::AppResult;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::UserId;
use crate::user::Role;

/// Comment identity.
pub type CommentId = i64;

/// What a comment is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetKind {
    Assignment,
    GeneralAnnouncement,
    CourseAnnouncement,
}

impl TargetKind {
    /// Wire name, also used as the room prefix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Assignment => "assignment",
            Self::GeneralAnnouncement => "generalAnnouncement",
            Self::CourseAnnouncement => "courseAnnouncement",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comment thread address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommentTarget {
    pub kind: TargetKind,
    pub id: i64,
}

impl CommentTarget {
    /// Thread of a general announcement.
    #[must_use]
    pub const fn general_announcement(id: i64) -> Self {
        Self {
            kind: TargetKind::GeneralAnnouncement,
            id,
        }
    }
}

impl fmt::Display for CommentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind, self.id)
    }
}

/// Comment author as embedded in comment payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentAuthor {
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub name: String,
    pub role: Role,
}

/// Append-only comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(rename = "comment_id")]
    pub id: CommentId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub user: CommentAuthor,
    /// Absent when the server relies on the room to scope the event.
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub target_type: Option<TargetKind>,
    #[serde(default, alias = "targetId", skip_serializing_if = "Option::is_none")]
    pub target_id: Option<i64>,
}

impl Comment {
    /// Thread address, when the payload carries one.
    #[must_use]
    pub fn target(&self) -> Option<CommentTarget> {
        Some(CommentTarget {
            kind: self.target_type?,
            id: self.target_id?,
        })
    }

    /// Fill in the thread address from the room the comment arrived on.
    #[must_use]
    pub fn with_target(mut self, target: CommentTarget) -> Self {
        self.target_type.get_or_insert(target.kind);
        self.target_id.get_or_insert(target.id);
        self
    }
}

/// Body of `POST /comments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Validate)]
pub struct CommentDraft {
    #[serde(rename = "type")]
    pub target_type: TargetKind,
    #[serde(rename = "targetId")]
    pub target_id: i64,
    #[validate(length(min = 1, max = 2000, message = "comment must be 1-2000 characters"))]
    pub content: String,
}

impl CommentDraft {
    /// Trim and validate a new comment.
    pub fn new(target: CommentTarget, content: impl Into<String>) -> AppResult<Self> {
        let draft = Self {
            target_type: target.kind,
            target_id: target.id,
            content: content.into().trim().to_string(),
        };
        draft.validate()?;
        Ok(draft)
    }

    /// Thread the comment is posted to.
    #[must_use]
    pub const fn target(&self) -> CommentTarget {
        CommentTarget {
            kind: self.target_type,
            id: self.target_id,
        }
    }
}
