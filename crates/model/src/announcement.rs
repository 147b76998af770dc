//! Announcement entity and its create/update payloads.

use chrono::{DateTime, Utc};
use noticeboard_common::{AppError, AppResult};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;
use validator::Validate;

use crate::UserId;
use crate::poll::{CreatePollPayload, Poll};
use crate::user::Role;

/// Announcement identity.
pub type AnnouncementId = i64;

/// A general announcement, optionally carrying a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(rename = "announcement_id")]
    pub id: AnnouncementId,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Posting admin, with denormalized profile fields.
    pub admin: AuthorRef,
    #[serde(default)]
    pub is_poll: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<Poll>,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub attachments: Vec<Attachment>,
    /// Advisory comment count; may lag the comment thread until refetched.
    #[serde(rename = "_count", default)]
    pub count: CommentCount,
}

impl Announcement {
    /// Advisory number of comments.
    #[must_use]
    pub const fn comment_count(&self) -> u32 {
        self.count.comments
    }

    /// Attach a freshly created poll.
    ///
    /// A poll for a different announcement is ignored.
    pub fn attach_poll(&mut self, poll: Poll) -> bool {
        if poll.announcement_id != self.id {
            return false;
        }
        self.is_poll = true;
        self.poll = Some(poll);
        true
    }
}

/// Reference to the admin who posted an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRef {
    pub user_id: UserId,
    pub user: AuthorProfile,
}

/// Denormalized author profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub name: String,
    pub email: String,
    pub role: Role,
}

/// `_count` block returned with announcements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentCount {
    #[serde(default)]
    pub comments: u32,
}

/// Uploaded file descriptor.
///
/// The API has returned both bare URL strings and `{url, original_name}`
/// objects; both decode into this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AttachmentRepr")]
pub struct Attachment {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AttachmentRepr {
    Url(String),
    Descriptor {
        url: String,
        #[serde(default, alias = "originalName")]
        original_name: Option<String>,
    },
}

impl From<AttachmentRepr> for Attachment {
    fn from(repr: AttachmentRepr) -> Self {
        match repr {
            AttachmentRepr::Url(url) => Self {
                url,
                original_name: None,
            },
            AttachmentRepr::Descriptor { url, original_name } => Self { url, original_name },
        }
    }
}

impl Attachment {
    /// Create a descriptor for an already uploaded file.
    pub fn new(url: impl Into<String>, original_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            original_name: Some(original_name.into()),
        }
    }

    /// Reject anything that is not an absolute http(s) URL.
    pub fn check(&self) -> AppResult<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| AppError::Validation(format!("invalid attachment url {}: {e}", self.url)))?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(AppError::Validation(format!(
                "attachment url must be http(s), got {other}"
            ))),
        }
    }
}

fn nullable_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// What kind of announcement a draft creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementKind {
    /// Plain announcement with optional uploaded files.
    Regular { attachments: Vec<Attachment> },
    /// Poll announcement; the poll is created together with it.
    Poll {
        options: Vec<String>,
        allow_multiple: bool,
    },
}

/// Form input for a new announcement, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncementDraft {
    pub title: String,
    pub content: String,
    pub kind: AnnouncementKind,
}

impl AnnouncementDraft {
    /// Draft a regular announcement.
    pub fn regular(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            kind: AnnouncementKind::Regular {
                attachments: Vec::new(),
            },
        }
    }

    /// Draft a poll announcement.
    pub fn poll<I, S>(
        title: impl Into<String>,
        content: impl Into<String>,
        options: I,
        allow_multiple: bool,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            title: title.into(),
            content: content.into(),
            kind: AnnouncementKind::Poll {
                options: options.into_iter().map(Into::into).collect(),
                allow_multiple,
            },
        }
    }

    /// Add an uploaded file. Poll drafts cannot carry attachments.
    pub fn with_attachment(mut self, attachment: Attachment) -> AppResult<Self> {
        match &mut self.kind {
            AnnouncementKind::Regular { attachments } => {
                attachments.push(attachment);
                Ok(self)
            }
            AnnouncementKind::Poll { .. } => Err(AppError::Validation(
                "poll announcements cannot carry attachments".to_string(),
            )),
        }
    }

    /// Validate the draft and assemble the request body.
    pub fn into_payload(self) -> AppResult<CreateAnnouncementPayload> {
        let (is_poll, poll, attachments) = match self.kind {
            AnnouncementKind::Regular { attachments } => {
                for attachment in &attachments {
                    attachment.check()?;
                }
                (false, None, attachments)
            }
            AnnouncementKind::Poll {
                options,
                allow_multiple,
            } => {
                let poll = CreatePollPayload::new(None, options, allow_multiple)?;
                (true, Some(poll), Vec::new())
            }
        };

        let payload = CreateAnnouncementPayload {
            title: self.title.trim().to_string(),
            content: self.content.trim().to_string(),
            is_poll,
            poll,
            attachments,
        };
        payload.validate()?;
        Ok(payload)
    }
}

/// Body of `POST /announcements/general`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Validate)]
pub struct CreateAnnouncementPayload {
    #[validate(length(min = 1, max = 200, message = "title must be 1-200 characters"))]
    pub title: String,
    #[validate(length(min = 1, message = "content must not be empty"))]
    pub content: String,
    pub is_poll: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<CreatePollPayload>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// Full replacement body of `PUT /announcements/general/:id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Validate)]
pub struct AnnouncementUpdate {
    #[validate(length(min = 1, max = 200, message = "title must be 1-200 characters"))]
    pub title: String,
    #[validate(length(min = 1, message = "content must not be empty"))]
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl AnnouncementUpdate {
    /// Start an update from the currently cached announcement.
    #[must_use]
    pub fn from_announcement(announcement: &Announcement) -> Self {
        Self {
            title: announcement.title.clone(),
            content: announcement.content.clone(),
            attachments: announcement.attachments.clone(),
        }
    }

    /// Trim and validate before sending.
    pub fn validated(self) -> AppResult<Self> {
        let update = Self {
            title: self.title.trim().to_string(),
            content: self.content.trim().to_string(),
            attachments: self.attachments,
        };
        for attachment in &update.attachments {
            attachment.check()?;
        }
        update.validate()?;
        Ok(update)
    }
}
