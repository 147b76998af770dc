//! Synchronization Layer.
//!
//! Turns push events and mutation outcomes into cache changes:
//!
//! - [`Synchronizer::apply`] maps one push event onto the cache. Every
//!   mapping is idempotent, so at-least-once delivery is safe.
//! - [`Synchronizer::attach`] binds a view scope to the push channel and
//!   returns a [`LiveSync`] that unbinds on drop.
//! - Mutations call the API, then invalidate what the change touched. None
//!   of them inserts into the cache ahead of the server's answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use noticeboard_client::{
    CampusApi, HandlerGuard, PushClient, PushMessage, RoomGuard, SessionEvent,
};
use noticeboard_common::config::CacheConfig;
use noticeboard_common::{AppError, AppResult};
use noticeboard_model::{
    Announcement, AnnouncementDraft, AnnouncementId, AnnouncementUpdate, Comment, CommentDraft,
    CommentTarget, CreatePollPayload, ManagedUser, NewUser, OptionId, Poll, PollId, PollTally,
    PushEvent, Room, TargetKind, ToggleVote, UserId, UserKind, UserUpdate, event_names,
    has_voted,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{EntityCache, QuerySubscription};
use crate::edit::EditSession;
use crate::fetcher::ApiFetcher;
use crate::query::{CacheValue, Query, QueryKey};
use crate::search::UserSearch;

/// Vote toggles sent but not yet answered, counted per `(poll, option)`.
pub type PendingVotes = HashMap<(PollId, OptionId), usize>;

/// What part of the push channel a view listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    /// Announcement list and details, polls and vote changes.
    AnnouncementFeed,
    /// Comments on one target.
    Thread(CommentTarget),
}

impl SyncScope {
    #[must_use]
    pub fn room(&self) -> Room {
        match self {
            Self::AnnouncementFeed => Room::general_announcements(),
            Self::Thread(target) => Room::for_target(*target),
        }
    }

    /// Push events handled in this scope.
    #[must_use]
    pub const fn events(&self) -> &'static [&'static str] {
        match self {
            Self::AnnouncementFeed => &event_names::ANNOUNCEMENT_FEED,
            Self::Thread(_) => &[event_names::NEW_COMMENT],
        }
    }

    /// Cache prefixes fed by this scope; refreshed after a reconnect.
    #[must_use]
    pub fn keys(&self) -> Vec<QueryKey> {
        match self {
            Self::AnnouncementFeed => vec![
                QueryKey::announcements(),
                QueryKey::announcement_details(),
                QueryKey::poll_responses(),
            ],
            Self::Thread(target) => vec![Query::Comments(*target).key()],
        }
    }
}

/// A scope bound to the push channel. Dropping it leaves the room and
/// unregisters its handlers.
pub struct LiveSync {
    scope: SyncScope,
    room: RoomGuard,
    _handlers: Vec<HandlerGuard>,
}

impl LiveSync {
    #[must_use]
    pub const fn scope(&self) -> SyncScope {
        self.scope
    }

    #[must_use]
    pub const fn room(&self) -> &Room {
        self.room.room()
    }
}

struct Inner {
    api: Arc<dyn CampusApi>,
    cache: EntityCache,
    config: CacheConfig,
    pending: watch::Sender<PendingVotes>,
    /// Bumped by every reset; only read or written under the `pending` lock.
    pending_epoch: AtomicU64,
}

/// Bridges the API, the push channel and the [`EntityCache`].
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

/// Marks a toggle as pending until dropped.
///
/// A mark taken before a reset no longer counts once the reset happened.
struct PendingVote<'a> {
    inner: &'a Inner,
    key: (PollId, OptionId),
    epoch: u64,
}

impl<'a> PendingVote<'a> {
    fn mark(inner: &'a Inner, key: (PollId, OptionId)) -> Self {
        let mut epoch = 0;
        inner.pending.send_modify(|votes| {
            epoch = inner.pending_epoch.load(Ordering::Relaxed);
            *votes.entry(key).or_insert(0) += 1;
        });
        Self { inner, key, epoch }
    }
}

impl Drop for PendingVote<'_> {
    fn drop(&mut self) {
        self.inner.pending.send_if_modified(|votes| {
            if self.inner.pending_epoch.load(Ordering::Relaxed) != self.epoch {
                return false;
            }
            let Some(count) = votes.get_mut(&self.key) else {
                return false;
            };
            *count -= 1;
            if *count == 0 {
                votes.remove(&self.key);
            }
            true
        });
    }
}

impl Synchronizer {
    /// Synchronizer with a fresh cache fetching through `api`.
    #[must_use]
    pub fn new(api: Arc<dyn CampusApi>, config: CacheConfig) -> Self {
        let fetcher = Arc::new(ApiFetcher::new(api.clone(), config.clone()));
        Self::with_cache(api, EntityCache::new(fetcher), config)
    }

    #[must_use]
    pub fn with_cache(api: Arc<dyn CampusApi>, cache: EntityCache, config: CacheConfig) -> Self {
        let (pending, _) = watch::channel(PendingVotes::new());
        Self {
            inner: Arc::new(Inner {
                api,
                cache,
                config,
                pending,
                pending_epoch: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &EntityCache {
        &self.inner.cache
    }

    // === Push events ===

    /// Apply one push event to the cache.
    pub fn apply(&self, event: &PushEvent) {
        debug!(event = event.name(), "Applying push event");
        match event {
            PushEvent::NewAnnouncement(announcement) => self.prepend_announcement(announcement),
            PushEvent::UpdateAnnouncement(announcement) => {
                self.replace_announcement(announcement);
            }
            PushEvent::DeleteAnnouncement { announcement_id } => {
                self.drop_announcement(*announcement_id);
            }
            PushEvent::NewPoll(poll) => self.attach_poll(poll),
            PushEvent::NewComment(comment) => self.append_comment(comment),
            PushEvent::PollResponse { poll_id } => {
                self.cache().invalidate(&Query::PollResponses(*poll_id).key());
            }
        }
    }

    fn prepend_announcement(&self, announcement: &Announcement) {
        self.cache().patch(&Query::Announcements, |current| {
            let list = current
                .and_then(CacheValue::announcements)
                .unwrap_or_default();
            if list.iter().any(|a| a.id == announcement.id) {
                return None;
            }
            let mut next = Vec::with_capacity(list.len() + 1);
            next.push(announcement.clone());
            next.extend_from_slice(list);
            Some(CacheValue::Announcements(next))
        });
    }

    fn replace_announcement(&self, incoming: &Announcement) {
        self.cache()
            .patch(&Query::Announcement(incoming.id), |current| {
                let current = current.and_then(CacheValue::announcement);
                let next = current.map_or_else(|| incoming.clone(), |c| merged(c, incoming));
                if current == Some(&next) {
                    return None;
                }
                Some(CacheValue::Announcement(Box::new(next)))
            });

        self.cache().patch(&Query::Announcements, |current| {
            let list = current.and_then(CacheValue::announcements)?;
            let index = list.iter().position(|a| a.id == incoming.id)?;
            let next = merged(&list[index], incoming);
            if list[index] == next {
                return None;
            }
            let mut list = list.to_vec();
            list[index] = next;
            Some(CacheValue::Announcements(list))
        });
    }

    fn drop_announcement(&self, id: AnnouncementId) {
        let poll_id = self.cached_poll_id(id);

        self.cache().patch(&Query::Announcements, |current| {
            let list = current.and_then(CacheValue::announcements)?;
            if !list.iter().any(|a| a.id == id) {
                return None;
            }
            Some(CacheValue::Announcements(
                list.iter().filter(|a| a.id != id).cloned().collect(),
            ))
        });
        self.cache().remove(&Query::Announcement(id));
        self.cache()
            .remove(&Query::Comments(CommentTarget::general_announcement(id)));
        if let Some(poll_id) = poll_id {
            self.cache().remove(&Query::PollResponses(poll_id));
        }
    }

    fn cached_poll_id(&self, id: AnnouncementId) -> Option<PollId> {
        let poll_of = |value: Option<CacheValue>| -> Option<PollId> {
            match value? {
                CacheValue::Announcement(a) => a.poll.map(|p| p.id),
                CacheValue::Announcements(list) => list
                    .into_iter()
                    .find(|a| a.id == id)
                    .and_then(|a| a.poll)
                    .map(|p| p.id),
                _ => None,
            }
        };
        let detail = self.cache().snapshot(&Query::Announcement(id));
        poll_of(detail.and_then(|s| s.data)).or_else(|| {
            let list = self.cache().snapshot(&Query::Announcements);
            poll_of(list.and_then(|s| s.data))
        })
    }

    fn attach_poll(&self, poll: &Poll) {
        self.patch_cached_announcement(poll.announcement_id, |announcement| {
            if announcement.poll.as_ref() == Some(poll) {
                return None;
            }
            let mut next = announcement.clone();
            next.attach_poll(poll.clone());
            Some(next)
        });
    }

    /// Rewrite announcement `id` wherever it is already cached: its detail
    /// entry and every announcement list holding it. `change` returns `None`
    /// to leave a copy as is.
    fn patch_cached_announcement<F>(&self, id: AnnouncementId, change: F) -> usize
    where
        F: Fn(&Announcement) -> Option<Announcement>,
    {
        let details = self
            .cache()
            .patch_matching(&Query::Announcement(id).key(), |_, value| {
                let next = change(value.announcement()?)?;
                Some(CacheValue::Announcement(Box::new(next)))
            });
        let lists = self
            .cache()
            .patch_matching(&QueryKey::announcements(), |_, value| {
                let list = value.announcements()?;
                let index = list.iter().position(|a| a.id == id)?;
                let next = change(&list[index])?;
                let mut list = list.to_vec();
                list[index] = next;
                Some(CacheValue::Announcements(list))
            });
        details + lists
    }

    fn append_comment(&self, comment: &Comment) {
        let Some(target) = comment.target() else {
            warn!(comment_id = comment.id, "Comment without a target, ignoring");
            return;
        };

        // Comments only enter the cache with a server id, so the id alone
        // identifies a redelivery.
        let appended = self.cache().patch(&Query::Comments(target), |current| {
            let list = current.and_then(CacheValue::comments).unwrap_or_default();
            if list.iter().any(|c| c.id == comment.id) {
                return None;
            }
            let mut next = list.to_vec();
            next.push(comment.clone());
            Some(CacheValue::Comments(next))
        });

        if appended && target.kind == TargetKind::GeneralAnnouncement {
            self.bump_comment_count(target.id);
        }
    }

    fn bump_comment_count(&self, id: AnnouncementId) {
        self.patch_cached_announcement(id, |announcement| {
            let mut next = announcement.clone();
            next.count.comments = next.count.comments.saturating_add(1);
            Some(next)
        });
    }

    /// Listen to `scope` on the push channel.
    ///
    /// Events are applied in receipt order. After a reconnect, once the room
    /// is rejoined, the scope's cache keys are invalidated to recover
    /// anything missed while offline.
    #[must_use = "the scope stops syncing when dropped"]
    pub fn attach(&self, push: &PushClient, scope: SyncScope) -> LiveSync {
        let room = push.join(scope.room());

        let mut handlers: Vec<HandlerGuard> = scope
            .events()
            .iter()
            .map(|event| {
                let sync = self.clone();
                push.on(event, move |message| sync.on_message(scope, message))
            })
            .collect();

        let sync = self.clone();
        handlers.push(push.on_reconnect(move || {
            info!(room = %scope.room(), "Reconnected, refreshing scope");
            for key in scope.keys() {
                sync.cache().invalidate(&key);
            }
        }));

        info!(room = %room.room(), "Scope attached");
        LiveSync {
            scope,
            room,
            _handlers: handlers,
        }
    }

    fn on_message(&self, scope: SyncScope, message: &PushMessage) {
        let room = scope.room();
        if let Some(from) = &message.room
            && *from != room
        {
            debug!(event = %message.event, from = %from, room = %room, "Event for another room");
            return;
        }

        let event = match PushEvent::decode(&message.event, message.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                warn!(event = %message.event, error = %e, "Undecodable push payload");
                return;
            }
        };

        let event = match (scope, event) {
            (SyncScope::Thread(target), PushEvent::NewComment(comment)) => {
                let comment = comment.with_target(target);
                if comment.target() != Some(target) {
                    return;
                }
                PushEvent::NewComment(comment)
            }
            (_, event) => event,
        };
        self.apply(&event);
    }

    // === Queries ===

    /// Observe the announcements list.
    pub fn announcements(&self) -> QuerySubscription {
        self.cache().subscribe(Query::Announcements)
    }

    pub fn announcement(&self, id: AnnouncementId) -> QuerySubscription {
        self.cache().subscribe(Query::Announcement(id))
    }

    pub fn comments(&self, target: CommentTarget) -> QuerySubscription {
        self.cache().subscribe(Query::Comments(target))
    }

    pub fn poll_responses(&self, poll_id: PollId) -> QuerySubscription {
        self.cache().subscribe(Query::PollResponses(poll_id))
    }

    /// Observe one page of managed users.
    pub fn users(&self, kind: UserKind, page: u32) -> QuerySubscription {
        self.cache().subscribe(Query::Users {
            kind,
            page: page.max(1),
            limit: self.inner.config.users_page_size,
        })
    }

    /// Debounced search over one user collection.
    #[must_use]
    pub fn search_users(&self, kind: UserKind) -> UserSearch {
        UserSearch::spawn(
            self.cache().clone(),
            kind,
            self.inner.config.search_debounce(),
        )
    }

    // === Polls ===

    /// Vote counts and `user_id`'s vote presence, computed from the cached
    /// responses. `None` until responses are loaded; reading starts the load.
    #[must_use]
    pub fn poll_tally(&self, poll: &Poll, user_id: UserId) -> Option<PollTally> {
        let state = self.cache().read(&Query::PollResponses(poll.id));
        let responses = state.data.as_ref().and_then(CacheValue::poll_responses)?;
        let pending = self.inner.pending.borrow();
        Some(PollTally::compute(poll, responses, user_id, |option| {
            pending.contains_key(&(poll.id, option))
        }))
    }

    /// Whether `user_id` holds a vote for the option, per the cached responses.
    #[must_use]
    pub fn has_voted(&self, poll_id: PollId, user_id: UserId, option_id: OptionId) -> bool {
        self.cache()
            .snapshot(&Query::PollResponses(poll_id))
            .and_then(|state| state.data)
            .and_then(|data| {
                data.poll_responses()
                    .map(|responses| has_voted(responses, user_id, option_id))
            })
            .unwrap_or(false)
    }

    #[must_use]
    pub fn is_vote_pending(&self, poll_id: PollId, option_id: OptionId) -> bool {
        self.inner
            .pending
            .borrow()
            .contains_key(&(poll_id, option_id))
    }

    #[must_use]
    pub fn pending_votes(&self) -> watch::Receiver<PendingVotes> {
        self.inner.pending.subscribe()
    }

    /// Toggle the current user's vote for an option.
    ///
    /// The vote reads as pending until the server answers; the responses
    /// and the list are then refetched.
    pub async fn toggle_vote(&self, poll_id: PollId, option_id: OptionId) -> AppResult<()> {
        let _pending = PendingVote::mark(&self.inner, (poll_id, option_id));

        self.inner
            .api
            .toggle_vote(ToggleVote { poll_id, option_id })
            .await?;
        info!(poll_id, option_id, "Vote toggled");

        self.cache()
            .invalidate(&Query::PollResponses(poll_id).key());
        self.cache().invalidate(&QueryKey::announcements());
        Ok(())
    }

    /// Attach a poll to an existing announcement.
    pub async fn create_poll(
        &self,
        announcement_id: AnnouncementId,
        options: Vec<String>,
        allow_multiple: bool,
    ) -> AppResult<Poll> {
        let payload = CreatePollPayload::new(Some(announcement_id), options, allow_multiple)?;
        let poll = self.inner.api.create_poll(&payload).await?;
        info!(poll_id = poll.id, announcement_id, "Poll created");

        self.cache().invalidate(&QueryKey::announcements());
        self.cache()
            .invalidate(&Query::Announcement(announcement_id).key());
        Ok(poll)
    }

    // === Comments ===

    /// Post a comment.
    ///
    /// The push event normally inserts it; the invalidation covers a push
    /// that is late or lost.
    pub async fn create_comment(&self, target: CommentTarget, content: &str) -> AppResult<Comment> {
        let draft = CommentDraft::new(target, content)?;
        let created = self.inner.api.create_comment(&draft).await?;
        info!(comment_id = created.id, target = %target, "Comment created");

        self.cache().invalidate(&Query::Comments(target).key());
        if target.kind == TargetKind::GeneralAnnouncement {
            self.cache().invalidate(&Query::Announcement(target.id).key());
            self.cache().invalidate(&QueryKey::announcements());
        }
        Ok(created.with_target(target))
    }

    // === Announcements ===

    pub async fn create_announcement(&self, draft: AnnouncementDraft) -> AppResult<Announcement> {
        let payload = draft.into_payload()?;
        let created = self.inner.api.create_announcement(&payload).await?;
        info!(announcement_id = created.id, is_poll = created.is_poll, "Announcement created");

        self.cache().invalidate(&QueryKey::announcements());
        Ok(created)
    }

    /// Replace title, content and attachments of an announcement.
    ///
    /// The cache is refetched rather than patched with the local copy, so a
    /// newer pushed update is never overwritten.
    pub async fn update_announcement(
        &self,
        id: AnnouncementId,
        update: AnnouncementUpdate,
    ) -> AppResult<Announcement> {
        let update = update.validated()?;
        let updated = self.inner.api.update_announcement(id, &update).await?;
        info!(announcement_id = id, "Announcement updated");

        self.cache().invalidate(&Query::Announcement(id).key());
        self.cache().invalidate(&QueryKey::announcements());
        Ok(updated)
    }

    /// Submit the open edit of `session`.
    pub async fn submit_edit(&self, session: &mut EditSession) -> AppResult<Announcement> {
        let (id, update) = session.begin_submit()?;
        let result = self.update_announcement(id, update).await;
        session.finish(id, &result);
        result
    }

    /// Delete an announcement. Failures, including not-found, are returned
    /// as is.
    pub async fn delete_announcement(&self, id: AnnouncementId) -> AppResult<()> {
        if let Err(e) = self.inner.api.delete_announcement(id).await {
            warn!(announcement_id = id, error = %e, "Delete failed");
            return Err(e);
        }
        info!(announcement_id = id, "Announcement deleted");

        self.cache().invalidate(&QueryKey::announcements());
        Ok(())
    }

    // === User management ===

    pub async fn add_user(&self, kind: UserKind, user: NewUser) -> AppResult<ManagedUser> {
        user.check_for(kind)?;
        let created = self.inner.api.add_user(kind, &user).await?;
        info!(kind = %kind, user_id = created.user_id, "User added");

        self.cache().invalidate(&QueryKey::users(kind));
        Ok(created)
    }

    /// Add several users at once; nothing is sent if any row is invalid.
    pub async fn add_users(
        &self,
        kind: UserKind,
        users: Vec<NewUser>,
    ) -> AppResult<Vec<ManagedUser>> {
        if users.is_empty() {
            return Err(AppError::Validation("no users to add".to_string()));
        }
        for (row, user) in users.iter().enumerate() {
            user.check_for(kind)
                .map_err(|e| AppError::Validation(format!("row {}: {e}", row + 1)))?;
        }

        let created = self.inner.api.add_users(kind, &users).await?;
        info!(kind = %kind, count = created.len(), "Users added");

        self.cache().invalidate(&QueryKey::users(kind));
        Ok(created)
    }

    pub async fn edit_user(
        &self,
        kind: UserKind,
        id: UserId,
        update: UserUpdate,
    ) -> AppResult<ManagedUser> {
        if update.is_empty() {
            return Err(AppError::Validation("nothing to update".to_string()));
        }
        update.check_for(kind)?;
        let updated = self.inner.api.edit_user(kind, id, &update).await?;
        info!(kind = %kind, user_id = id, "User updated");

        self.cache().invalidate(&QueryKey::users(kind));
        Ok(updated)
    }

    pub async fn delete_user(&self, kind: UserKind, id: UserId) -> AppResult<()> {
        self.inner.api.delete_user(kind, id).await?;
        info!(kind = %kind, user_id = id, "User deleted");

        self.cache().invalidate(&QueryKey::users(kind));
        Ok(())
    }

    // === Session ===

    /// Drop all cached state, as on logout.
    pub fn reset(&self) {
        self.cache().clear();
        self.inner.pending.send_modify(|votes| {
            self.inner.pending_epoch.fetch_add(1, Ordering::Relaxed);
            votes.clear();
        });
        info!("Synchronizer reset");
    }

    /// Reset whenever the session ends.
    pub fn watch_session(&self, mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::LoggedOut) => sync.reset(),
                    Ok(SessionEvent::LoginRequired { reason }) => {
                        warn!(reason = %reason, "Session lost");
                        sync.reset();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session events lagged, resetting");
                        sync.reset();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Incoming update over the cached copy; a payload without its poll keeps
/// the cached one.
fn merged(current: &Announcement, incoming: &Announcement) -> Announcement {
    let mut next = incoming.clone();
    if next.poll.is_none() && current.poll.is_some() {
        next.poll.clone_from(&current.poll);
        next.is_poll = true;
    }
    next
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use noticeboard_client::test_utils::{MemoryBackend, endpoints};
    use noticeboard_model::{CommentAuthor, Role};

    use super::*;

    fn sync_over(backend: &Arc<MemoryBackend>) -> Synchronizer {
        let api: Arc<dyn CampusApi> = backend.clone();
        Synchronizer::new(api, CacheConfig::default())
    }

    fn list_ids(sync: &Synchronizer) -> Vec<AnnouncementId> {
        sync.cache()
            .snapshot(&Query::Announcements)
            .and_then(|s| s.data)
            .and_then(|d| d.announcements().map(|l| l.iter().map(|a| a.id).collect()))
            .unwrap_or_default()
    }

    fn comment(id: i64, content: &str, target: CommentTarget) -> Comment {
        Comment {
            id,
            content: content.to_string(),
            created_at: Utc::now(),
            user: CommentAuthor {
                user_id: Some(5),
                name: "Ada".to_string(),
                role: Role::Student,
            },
            target_type: Some(target.kind),
            target_id: Some(target.id),
        }
    }

    #[tokio::test]
    async fn test_new_announcement_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let sync = sync_over(&backend);
        let first = backend.seed_announcement("Exams", "Timetable is out");
        sync.cache().fetch(&Query::Announcements).await.unwrap();

        let pushed = backend.seed_announcement("Library", "Open late");
        let event = PushEvent::NewAnnouncement(pushed.clone());
        sync.apply(&event);
        sync.apply(&event);

        assert_eq!(list_ids(&sync), vec![pushed.id, first.id]);
    }

    #[tokio::test]
    async fn test_new_announcement_on_empty_cache() {
        let backend = Arc::new(MemoryBackend::new());
        let sync = sync_over(&backend);
        let pushed = backend.seed_announcement("Library", "Open late");

        sync.apply(&PushEvent::NewAnnouncement(pushed.clone()));
        sync.apply(&PushEvent::NewAnnouncement(pushed.clone()));

        assert_eq!(list_ids(&sync), vec![pushed.id]);
    }

    #[tokio::test]
    async fn test_update_replaces_in_place_and_keeps_poll() {
        let backend = Arc::new(MemoryBackend::new());
        let poll = backend.seed_poll("Venue", &["Hall A", "Hall B"], false);
        let regular = backend.seed_announcement("Exams", "Timetable is out");
        let sync = sync_over(&backend);
        sync.cache().fetch(&Query::Announcements).await.unwrap();
        sync.cache().fetch(&Query::Announcement(poll.id)).await.unwrap();

        let mut edited = poll.clone();
        edited.title = "Venue (final)".to_string();
        edited.poll = None;
        sync.apply(&PushEvent::UpdateAnnouncement(edited));

        assert_eq!(list_ids(&sync), vec![regular.id, poll.id]);
        let detail = sync
            .cache()
            .snapshot(&Query::Announcement(poll.id))
            .and_then(|s| s.data)
            .unwrap();
        let detail = detail.announcement().unwrap();
        assert_eq!(detail.title, "Venue (final)");
        assert_eq!(detail.poll, poll.poll);
    }

    #[tokio::test]
    async fn test_delete_removes_everywhere() {
        let backend = Arc::new(MemoryBackend::new());
        let doomed = backend.seed_poll("Venue", &["Hall A", "Hall B"], false);
        let kept = backend.seed_announcement("Exams", "Timetable is out");
        let poll_id = doomed.poll.as_ref().unwrap().id;
        let sync = sync_over(&backend);
        sync.cache().fetch(&Query::Announcements).await.unwrap();
        sync.cache().fetch(&Query::Announcement(doomed.id)).await.unwrap();
        sync.cache().fetch(&Query::PollResponses(poll_id)).await.unwrap();

        let event = PushEvent::DeleteAnnouncement {
            announcement_id: doomed.id,
        };
        sync.apply(&event);
        sync.apply(&event);

        assert_eq!(list_ids(&sync), vec![kept.id]);
        assert!(sync.cache().snapshot(&Query::Announcement(doomed.id)).is_none());
        assert!(sync.cache().snapshot(&Query::PollResponses(poll_id)).is_none());
    }

    #[tokio::test]
    async fn test_new_poll_attaches_once() {
        let backend = Arc::new(MemoryBackend::new());
        let announcement = backend.seed_announcement("Venue", "Where should we meet?");
        let sync = sync_over(&backend);
        sync.cache()
            .fetch(&Query::Announcement(announcement.id))
            .await
            .unwrap();

        let poll = backend
            .create_poll(
                &CreatePollPayload::new(
                    Some(announcement.id),
                    vec!["Hall A".to_string(), "Hall B".to_string()],
                    false,
                )
                .unwrap(),
            )
            .await
            .unwrap();
        sync.apply(&PushEvent::NewPoll(poll.clone()));
        sync.apply(&PushEvent::NewPoll(poll.clone()));

        let state = sync
            .cache()
            .snapshot(&Query::Announcement(announcement.id))
            .unwrap();
        let cached = state.data.as_ref().and_then(CacheValue::announcement).unwrap();
        assert!(cached.is_poll);
        assert_eq!(cached.poll.as_ref(), Some(&poll));
    }

    #[tokio::test]
    async fn test_pushed_comments_dedupe_by_id() {
        let backend = Arc::new(MemoryBackend::new());
        let announcement = backend.seed_announcement("Exams", "Timetable is out");
        let target = CommentTarget::general_announcement(announcement.id);
        let sync = sync_over(&backend);
        sync.cache()
            .fetch(&Query::Announcement(announcement.id))
            .await
            .unwrap();
        sync.cache().fetch(&Query::Announcements).await.unwrap();

        let first = comment(40, "ok", target);
        sync.apply(&PushEvent::NewComment(first.clone()));
        sync.apply(&PushEvent::NewComment(first.clone()));

        // Same author, target and text a moment later, but its own comment.
        let mut second = first.clone();
        second.id = 41;
        second.created_at = first.created_at + Duration::seconds(2);
        sync.apply(&PushEvent::NewComment(second.clone()));

        let state = sync.cache().snapshot(&Query::Comments(target)).unwrap();
        let comments = state.data.as_ref().and_then(CacheValue::comments).unwrap();
        assert_eq!(comments, &[first, second]);

        let detail = sync
            .cache()
            .snapshot(&Query::Announcement(announcement.id))
            .and_then(|s| s.data)
            .unwrap();
        assert_eq!(detail.announcement().unwrap().comment_count(), 2);
        let list = sync
            .cache()
            .snapshot(&Query::Announcements)
            .and_then(|s| s.data)
            .unwrap();
        assert_eq!(list.announcements().unwrap()[0].comment_count(), 2);
    }

    #[tokio::test]
    async fn test_vote_marked_before_reset_does_not_clear_newer_mark() {
        let backend = Arc::new(MemoryBackend::new());
        let announcement = backend.seed_poll("Venue", &["Hall A", "Hall B"], true);
        let poll = announcement.poll.unwrap();
        let (poll_id, option) = (poll.id, poll.options[0].id);
        let sync = sync_over(&backend);
        let gate = backend.hold(endpoints::TOGGLE_VOTE);

        let before_reset = tokio::spawn({
            let sync = sync.clone();
            async move { sync.toggle_vote(poll_id, option).await }
        });
        tokio::task::yield_now().await;
        assert!(sync.is_vote_pending(poll_id, option));

        sync.reset();
        assert!(!sync.is_vote_pending(poll_id, option));

        let after_reset = tokio::spawn({
            let sync = sync.clone();
            async move { sync.toggle_vote(poll_id, option).await }
        });
        tokio::task::yield_now().await;
        assert!(sync.is_vote_pending(poll_id, option));

        gate.release();
        before_reset.await.unwrap().unwrap();
        assert!(sync.is_vote_pending(poll_id, option));

        gate.release();
        after_reset.await.unwrap().unwrap();
        assert!(!sync.is_vote_pending(poll_id, option));
    }

    #[tokio::test]
    async fn test_toggle_vote_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        let announcement = backend.seed_poll("Venue", &["Hall A", "Hall B"], false);
        let poll = announcement.poll.clone().unwrap();
        let option = poll.options[0].id;
        let sync = sync_over(&backend);
        let user = 1;

        sync.cache().fetch(&Query::PollResponses(poll.id)).await.unwrap();
        let before = sync.poll_tally(&poll, user).unwrap();
        assert_eq!(before.total_votes, 0);

        let gate = backend.hold(endpoints::TOGGLE_VOTE);
        let voting = tokio::spawn({
            let sync = sync.clone();
            let poll_id = poll.id;
            async move { sync.toggle_vote(poll_id, option).await }
        });
        tokio::task::yield_now().await;
        assert!(sync.is_vote_pending(poll.id, option));
        gate.release();
        voting.await.unwrap().unwrap();
        assert!(!sync.is_vote_pending(poll.id, option));

        sync.cache().fetch(&Query::PollResponses(poll.id)).await.unwrap();
        assert!(sync.has_voted(poll.id, user, option));

        gate.release();
        sync.toggle_vote(poll.id, option).await.unwrap();
        sync.cache().fetch(&Query::PollResponses(poll.id)).await.unwrap();

        let after = sync.poll_tally(&poll, user).unwrap();
        assert!(!sync.has_voted(poll.id, user, option));
        assert!(!after.option(option).unwrap().voted_by_user);
        assert_eq!(after.total_votes, before.total_votes);
    }

    #[tokio::test]
    async fn test_failed_vote_clears_pending() {
        let backend = Arc::new(MemoryBackend::new());
        let announcement = backend.seed_poll("Venue", &["Hall A", "Hall B"], true);
        let poll = announcement.poll.unwrap();
        let sync = sync_over(&backend);
        backend.fail_next(
            endpoints::TOGGLE_VOTE,
            AppError::Network("offline".to_string()),
        );

        let err = sync
            .toggle_vote(poll.id, poll.options[1].id)
            .await
            .unwrap_err();

        assert!(err.is_network());
        assert!(sync.pending_votes().borrow().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_input_never_reaches_network() {
        let backend = Arc::new(MemoryBackend::new());
        let sync = sync_over(&backend);

        let err = sync
            .create_comment(CommentTarget::general_announcement(1), "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = sync
            .create_poll(1, vec!["Only one".to_string()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = sync
            .edit_user(UserKind::Students, 3, UserUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        assert_eq!(backend.calls(endpoints::CREATE_COMMENT), 0);
        assert_eq!(backend.calls(endpoints::CREATE_POLL), 0);
        assert_eq!(backend.calls(endpoints::EDIT_USER), 0);
    }

    #[tokio::test]
    async fn test_delete_not_found_is_surfaced() {
        let backend = Arc::new(MemoryBackend::new());
        let sync = sync_over(&backend);

        let err = sync.delete_announcement(99).await.unwrap_err();

        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(backend.calls(endpoints::DELETE_ANNOUNCEMENT), 1);
    }

    #[tokio::test]
    async fn test_logout_resets_cache() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_announcement("Exams", "Timetable is out");
        let sync = sync_over(&backend);
        sync.cache().fetch(&Query::Announcements).await.unwrap();

        let (events, rx) = broadcast::channel(4);
        let watcher = sync.watch_session(rx);
        events.send(SessionEvent::LoggedOut).unwrap();
        drop(events);
        watcher.await.unwrap();

        assert!(sync.cache().snapshot(&Query::Announcements).is_none());
    }
}
