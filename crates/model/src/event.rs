//! Push-channel events and rooms.

use std::fmt;

use noticeboard_common::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::announcement::{Announcement, AnnouncementId};
use crate::comment::{Comment, CommentTarget};
use crate::poll::{Poll, PollId};

/// Event names as sent by the server.
pub mod event_names {
    pub const NEW_ANNOUNCEMENT: &str = "newAnnouncement";
    pub const UPDATE_ANNOUNCEMENT: &str = "updateAnnouncement";
    pub const DELETE_ANNOUNCEMENT: &str = "deleteAnnouncement";
    pub const NEW_POLL: &str = "newPoll";
    pub const NEW_COMMENT: &str = "newComment";
    pub const POLL_RESPONSE: &str = "pollResponse";

    /// Events delivered on the announcements room.
    pub const ANNOUNCEMENT_FEED: [&str; 5] = [
        NEW_ANNOUNCEMENT,
        UPDATE_ANNOUNCEMENT,
        DELETE_ANNOUNCEMENT,
        NEW_POLL,
        POLL_RESPONSE,
    ];
}

#[derive(Deserialize)]
struct DeletedRef {
    #[serde(rename = "announcementId", alias = "announcement_id")]
    announcement_id: AnnouncementId,
}

#[derive(Deserialize)]
struct PollRef {
    #[serde(rename = "pollId", alias = "poll_id")]
    poll_id: PollId,
}

/// Decoded server-pushed change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    NewAnnouncement(Announcement),
    UpdateAnnouncement(Announcement),
    DeleteAnnouncement { announcement_id: AnnouncementId },
    NewPoll(Poll),
    NewComment(Comment),
    PollResponse { poll_id: PollId },
}

impl PushEvent {
    /// Decode a named payload.
    pub fn decode(name: &str, payload: Value) -> AppResult<Self> {
        use event_names as n;

        let event = match name {
            n::NEW_ANNOUNCEMENT => Self::NewAnnouncement(serde_json::from_value(payload)?),
            n::UPDATE_ANNOUNCEMENT => Self::UpdateAnnouncement(serde_json::from_value(payload)?),
            n::DELETE_ANNOUNCEMENT => {
                let r: DeletedRef = serde_json::from_value(payload)?;
                Self::DeleteAnnouncement {
                    announcement_id: r.announcement_id,
                }
            }
            n::NEW_POLL => Self::NewPoll(serde_json::from_value(payload)?),
            n::NEW_COMMENT => Self::NewComment(serde_json::from_value(payload)?),
            n::POLL_RESPONSE => {
                let r: PollRef = serde_json::from_value(payload)?;
                Self::PollResponse { poll_id: r.poll_id }
            }
            other => return Err(AppError::Decode(format!("unknown push event: {other}"))),
        };
        Ok(event)
    }

    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NewAnnouncement(_) => event_names::NEW_ANNOUNCEMENT,
            Self::UpdateAnnouncement(_) => event_names::UPDATE_ANNOUNCEMENT,
            Self::DeleteAnnouncement { .. } => event_names::DELETE_ANNOUNCEMENT,
            Self::NewPoll(_) => event_names::NEW_POLL,
            Self::NewComment(_) => event_names::NEW_COMMENT,
            Self::PollResponse { .. } => event_names::POLL_RESPONSE,
        }
    }
}

/// Server-defined channel scoping which events a connection receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Room(String);

impl Room {
    pub const GENERAL_ANNOUNCEMENTS: &str = "generalAnnouncements";

    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Room carrying announcement and poll changes.
    #[must_use]
    pub fn general_announcements() -> Self {
        Self::new(Self::GENERAL_ANNOUNCEMENTS)
    }

    /// Room carrying new comments for one thread.
    #[must_use]
    pub fn for_target(target: CommentTarget) -> Self {
        Self(target.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Room {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_reference_events() {
        assert_eq!(
            PushEvent::decode("deleteAnnouncement", json!({ "announcementId": 7 })).unwrap(),
            PushEvent::DeleteAnnouncement { announcement_id: 7 }
        );
        assert_eq!(
            PushEvent::decode("pollResponse", json!({ "pollId": 3, "userId": 9 })).unwrap(),
            PushEvent::PollResponse { poll_id: 3 }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_and_malformed() {
        assert!(matches!(
            PushEvent::decode("newThing", json!({})),
            Err(AppError::Decode(_))
        ));
        assert!(matches!(
            PushEvent::decode("deleteAnnouncement", json!({ "id": "x" })),
            Err(AppError::Decode(_))
        ));
    }

    #[test]
    fn test_rooms() {
        assert_eq!(Room::general_announcements().as_str(), "generalAnnouncements");
        assert_eq!(
            Room::for_target(CommentTarget::general_announcement(42)).as_str(),
            "generalAnnouncement_42"
        );
    }
}
