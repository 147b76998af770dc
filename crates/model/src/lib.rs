//! Domain entities and wire payloads for the noticeboard dashboard.
//!
//! Entities mirror what the dashboard API returns; drafts and payloads are
//! what the client sends. Validation happens where a draft becomes a
//! payload, so malformed shapes never reach the network layer.

pub mod announcement;
pub mod auth;
pub mod comment;
pub mod event;
pub mod poll;
pub mod user;

pub use announcement::{
    Announcement, AnnouncementDraft, AnnouncementId, AnnouncementKind, AnnouncementUpdate,
    Attachment, AuthorProfile, AuthorRef, CommentCount, CreateAnnouncementPayload,
};
pub use auth::{Credentials, LoginRequest, LoginResponse, LoginUser, TokenPair};
pub use comment::{
    Comment, CommentAuthor, CommentDraft, CommentId, CommentTarget, TargetKind,
};
pub use event::{PushEvent, Room, event_names};
pub use poll::{
    CreatePollPayload, OptionId, OptionTally, Poll, PollId, PollKind, PollOption, PollResponse,
    PollTally, ResponseId, ToggleVote, has_voted, toggle_response,
};
pub use user::{ManagedUser, NewUser, Role, StudentFields, UserKind, UserUpdate};

/// Numeric user identity as issued by the dashboard API.
pub type UserId = i64;
