//! Announcement edit modal state.
//!
//! `closed → editing → submitting → closed` on success, or back to
//! `editing` with the error and the entered text on failure. A session holds
//! at most one announcement; opening another force-closes the current one
//! without saving.

use noticeboard_common::{AppError, AppResult};
use noticeboard_model::{Announcement, AnnouncementId, AnnouncementUpdate, Attachment};
use tracing::debug;

/// Text being edited for one announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct EditDraft {
    pub announcement_id: AnnouncementId,
    pub title: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Failure of the last submit attempt.
    pub error: Option<AppError>,
}

impl EditDraft {
    fn from_announcement(announcement: &Announcement) -> Self {
        Self {
            announcement_id: announcement.id,
            title: announcement.title.clone(),
            content: announcement.content.clone(),
            attachments: announcement.attachments.clone(),
            error: None,
        }
    }

    fn update(&self) -> AnnouncementUpdate {
        AnnouncementUpdate {
            title: self.title.clone(),
            content: self.content.clone(),
            attachments: self.attachments.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum EditState {
    #[default]
    Closed,
    Editing(EditDraft),
    Submitting(EditDraft),
}

/// Edit modal of one view.
#[derive(Debug, Default)]
pub struct EditSession {
    state: EditState,
}

impl EditSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn state(&self) -> &EditState {
        &self.state
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        !matches!(self.state, EditState::Closed)
    }

    #[must_use]
    pub const fn is_submitting(&self) -> bool {
        matches!(self.state, EditState::Submitting(_))
    }

    /// Announcement currently being edited or submitted.
    #[must_use]
    pub const fn announcement_id(&self) -> Option<AnnouncementId> {
        match &self.state {
            EditState::Closed => None,
            EditState::Editing(draft) | EditState::Submitting(draft) => {
                Some(draft.announcement_id)
            }
        }
    }

    #[must_use]
    pub const fn draft(&self) -> Option<&EditDraft> {
        match &self.state {
            EditState::Closed => None,
            EditState::Editing(draft) | EditState::Submitting(draft) => Some(draft),
        }
    }

    /// The draft, while it may be changed.
    pub const fn draft_mut(&mut self) -> Option<&mut EditDraft> {
        match &mut self.state {
            EditState::Editing(draft) => Some(draft),
            _ => None,
        }
    }

    /// Start editing `announcement`.
    ///
    /// Returns the id of a draft that was force-closed to make room.
    pub fn open(&mut self, announcement: &Announcement) -> Option<AnnouncementId> {
        let closed = self
            .announcement_id()
            .filter(|id| *id != announcement.id);
        if let Some(id) = closed {
            debug!(announcement_id = id, "Discarding open edit");
        }
        if closed.is_some() || !self.is_open() {
            self.state = EditState::Editing(EditDraft::from_announcement(announcement));
        }
        closed
    }

    /// Discard the draft. A submit in flight cannot be cancelled.
    pub fn cancel(&mut self) -> bool {
        if matches!(self.state, EditState::Editing(_)) {
            self.state = EditState::Closed;
            return true;
        }
        false
    }

    /// Move `editing → submitting` and hand out the validated update.
    ///
    /// A validation failure stays in `editing` with the error recorded.
    pub fn begin_submit(&mut self) -> AppResult<(AnnouncementId, AnnouncementUpdate)> {
        let EditState::Editing(draft) = &mut self.state else {
            return Err(AppError::Conflict("no announcement is being edited".to_string()));
        };

        match draft.update().validated() {
            Ok(update) => {
                draft.error = None;
                let id = draft.announcement_id;
                let draft = draft.clone();
                self.state = EditState::Submitting(draft);
                Ok((id, update))
            }
            Err(e) => {
                draft.error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Resolve the submit of `announcement_id`.
    ///
    /// Ignored when the session moved on to another announcement meanwhile.
    pub fn finish(&mut self, announcement_id: AnnouncementId, result: &AppResult<Announcement>) {
        let EditState::Submitting(draft) = &self.state else {
            return;
        };
        if draft.announcement_id != announcement_id {
            return;
        }

        self.state = match result {
            Ok(_) => EditState::Closed,
            Err(e) => EditState::Editing(EditDraft {
                error: Some(e.clone()),
                ..draft.clone()
            }),
        };
    }
}
