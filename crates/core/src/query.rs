//! Query identities and cached values.

use std::fmt;

use noticeboard_model::{
    Announcement, AnnouncementId, Comment, CommentTarget, ManagedUser, PollId, PollResponse,
    UserKind,
};

/// One segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Name(String),
    Id(i64),
}

impl From<&str> for KeyPart {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<i64> for KeyPart {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<u32> for KeyPart {
    fn from(n: u32) -> Self {
        Self::Id(i64::from(n))
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Segment path used for prefix invalidation.
///
/// `["comments", "generalAnnouncement", 7]` starts with `["comments"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    #[must_use]
    pub fn root(name: &str) -> Self {
        Self(vec![KeyPart::from(name)])
    }

    #[must_use]
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    #[must_use]
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    // --- common prefixes ---

    /// The announcements list.
    #[must_use]
    pub fn announcements() -> Self {
        Self::root("announcements")
    }

    /// Every single-announcement entry.
    #[must_use]
    pub fn announcement_details() -> Self {
        Self::root("announcement")
    }

    /// Every comment thread.
    #[must_use]
    pub fn comments() -> Self {
        Self::root("comments")
    }

    /// Every poll-responses entry.
    #[must_use]
    pub fn poll_responses() -> Self {
        Self::root("pollResponses")
    }

    /// List pages and searches for one kind of managed user.
    #[must_use]
    pub fn users(kind: UserKind) -> Self {
        Self::root(kind.as_str())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// A named, parameterized query the cache stores results for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    Announcements,
    Announcement(AnnouncementId),
    Comments(CommentTarget),
    PollResponses(PollId),
    Users { kind: UserKind, page: u32, limit: u32 },
    UserSearch { kind: UserKind, query: String },
}

impl Query {
    #[must_use]
    pub fn key(&self) -> QueryKey {
        match self {
            Self::Announcements => QueryKey::announcements(),
            Self::Announcement(id) => QueryKey::announcement_details().with(*id),
            Self::Comments(target) => QueryKey::comments()
                .with(target.kind.as_str())
                .with(target.id),
            Self::PollResponses(poll_id) => QueryKey::poll_responses().with(*poll_id),
            Self::Users { kind, page, limit } => QueryKey::users(*kind).with(*page).with(*limit),
            Self::UserSearch { kind, query } => QueryKey::users(*kind)
                .with("search")
                .with(query.as_str()),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Result of a query, typed per query kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Announcements(Vec<Announcement>),
    Announcement(Box<Announcement>),
    Comments(Vec<Comment>),
    PollResponses(Vec<PollResponse>),
    Users(Vec<ManagedUser>),
}

impl CacheValue {
    #[must_use]
    pub fn announcements(&self) -> Option<&[Announcement]> {
        match self {
            Self::Announcements(list) => Some(list),
            _ => None,
        }
    }

    #[must_use]
    pub fn announcement(&self) -> Option<&Announcement> {
        match self {
            Self::Announcement(announcement) => Some(announcement),
            _ => None,
        }
    }

    #[must_use]
    pub fn comments(&self) -> Option<&[Comment]> {
        match self {
            Self::Comments(list) => Some(list),
            _ => None,
        }
    }

    #[must_use]
    pub fn poll_responses(&self) -> Option<&[PollResponse]> {
        match self {
            Self::PollResponses(list) => Some(list),
            _ => None,
        }
    }

    #[must_use]
    pub fn users(&self) -> Option<&[ManagedUser]> {
        match self {
            Self::Users(list) => Some(list),
            _ => None,
        }
    }

    /// Number of items in a list value; `1` for a single announcement.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Announcements(list) => list.len(),
            Self::Announcement(_) => 1,
            Self::Comments(list) => list.len(),
            Self::PollResponses(list) => list.len(),
            Self::Users(list) => list.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_nest_under_prefixes() {
        let thread = Query::Comments(CommentTarget::general_announcement(7)).key();
        assert_eq!(thread.to_string(), "comments/generalAnnouncement/7");
        assert!(thread.starts_with(&QueryKey::comments()));
        assert!(!thread.starts_with(&QueryKey::announcements()));

        let page = Query::Users {
            kind: UserKind::Students,
            page: 1,
            limit: 10,
        };
        let search = Query::UserSearch {
            kind: UserKind::Students,
            query: "ann".to_string(),
        };
        let prefix = QueryKey::users(UserKind::Students);
        assert!(page.key().starts_with(&prefix));
        assert!(search.key().starts_with(&prefix));
        assert!(!search.key().starts_with(&QueryKey::users(UserKind::Teachers)));
    }

    #[test]
    fn test_list_prefix_does_not_cover_details() {
        let detail = Query::Announcement(7).key();
        assert!(!detail.starts_with(&QueryKey::announcements()));
        assert!(detail.starts_with(&QueryKey::announcement_details()));
        assert!(detail.starts_with(&detail));
    }
}
