//! Dashboard REST surface.

use async_trait::async_trait;
use noticeboard_common::AppResult;
use noticeboard_model::{
    Announcement, AnnouncementId, AnnouncementUpdate, Comment, CommentDraft, CommentTarget,
    CreateAnnouncementPayload, CreatePollPayload, ManagedUser, NewUser, Poll, PollId, PollResponse,
    ToggleVote, UserId, UserKind, UserUpdate,
};
use serde_json::json;
use tracing::debug;

use crate::http::{ApiRequest, RequestClient};

/// Endpoint paths.
pub mod paths {
    pub const ANNOUNCEMENTS: &str = "/announcements/general";
    pub const POLLS: &str = "/polls";
    pub const TOGGLE_VOTE: &str = "/polls/toggle-vote";
    pub const COMMENTS: &str = "/comments";

    #[must_use]
    pub fn announcement(id: i64) -> String {
        format!("{ANNOUNCEMENTS}/{id}")
    }

    #[must_use]
    pub fn poll_responses(poll_id: i64) -> String {
        format!("{POLLS}/{poll_id}/responses")
    }

    #[must_use]
    pub fn users(kind: &str) -> String {
        format!("/admin/{kind}")
    }

    #[must_use]
    pub fn user(kind: &str, id: i64) -> String {
        format!("/admin/{kind}/{id}")
    }
}

/// Operations the dashboard API offers.
#[async_trait]
pub trait CampusApi: Send + Sync {
    // === Announcements ===
    async fn list_announcements(&self, page: u32, limit: u32) -> AppResult<Vec<Announcement>>;

    async fn get_announcement(&self, id: AnnouncementId) -> AppResult<Announcement>;

    async fn create_announcement(
        &self,
        payload: &CreateAnnouncementPayload,
    ) -> AppResult<Announcement>;

    /// Full replacement of title, content and attachments.
    async fn update_announcement(
        &self,
        id: AnnouncementId,
        update: &AnnouncementUpdate,
    ) -> AppResult<Announcement>;

    async fn delete_announcement(&self, id: AnnouncementId) -> AppResult<()>;

    // === Polls ===
    async fn create_poll(&self, payload: &CreatePollPayload) -> AppResult<Poll>;

    /// Add the vote if absent, remove it if present.
    async fn toggle_vote(&self, vote: ToggleVote) -> AppResult<()>;

    async fn poll_responses(&self, poll_id: PollId) -> AppResult<Vec<PollResponse>>;

    // === Comments ===
    async fn create_comment(&self, draft: &CommentDraft) -> AppResult<Comment>;

    async fn list_comments(
        &self,
        target: CommentTarget,
        page: u32,
        limit: u32,
    ) -> AppResult<Vec<Comment>>;

    // === User management ===
    async fn list_users(&self, kind: UserKind, page: u32, limit: u32)
    -> AppResult<Vec<ManagedUser>>;

    async fn search_users(&self, kind: UserKind, query: &str) -> AppResult<Vec<ManagedUser>>;

    async fn add_user(&self, kind: UserKind, user: &NewUser) -> AppResult<ManagedUser>;

    async fn add_users(&self, kind: UserKind, users: &[NewUser]) -> AppResult<Vec<ManagedUser>>;

    async fn edit_user(
        &self,
        kind: UserKind,
        id: UserId,
        update: &UserUpdate,
    ) -> AppResult<ManagedUser>;

    async fn delete_user(&self, kind: UserKind, id: UserId) -> AppResult<()>;
}

/// [`CampusApi`] over the authenticated [`RequestClient`].
#[derive(Clone)]
pub struct HttpCampusApi {
    client: RequestClient,
}

impl HttpCampusApi {
    #[must_use]
    pub const fn new(client: RequestClient) -> Self {
        Self { client }
    }

    #[must_use]
    pub const fn client(&self) -> &RequestClient {
        &self.client
    }
}

#[async_trait]
impl CampusApi for HttpCampusApi {
    async fn list_announcements(&self, page: u32, limit: u32) -> AppResult<Vec<Announcement>> {
        let request = ApiRequest::get(paths::ANNOUNCEMENTS)
            .with_query("page", page)
            .with_query("limit", limit);
        let list: Option<Vec<Announcement>> = self.client.get(request).await?;
        Ok(list.unwrap_or_default())
    }

    async fn get_announcement(&self, id: AnnouncementId) -> AppResult<Announcement> {
        self.client
            .get(ApiRequest::get(paths::announcement(id)))
            .await
    }

    async fn create_announcement(
        &self,
        payload: &CreateAnnouncementPayload,
    ) -> AppResult<Announcement> {
        let created: Announcement = self.client.post(paths::ANNOUNCEMENTS, payload).await?;
        debug!(announcement_id = created.id, "Announcement created");
        Ok(created)
    }

    async fn update_announcement(
        &self,
        id: AnnouncementId,
        update: &AnnouncementUpdate,
    ) -> AppResult<Announcement> {
        self.client.put(&paths::announcement(id), update).await
    }

    async fn delete_announcement(&self, id: AnnouncementId) -> AppResult<()> {
        self.client.delete(&paths::announcement(id)).await
    }

    async fn create_poll(&self, payload: &CreatePollPayload) -> AppResult<Poll> {
        self.client.post(paths::POLLS, payload).await
    }

    async fn toggle_vote(&self, vote: ToggleVote) -> AppResult<()> {
        let body = serde_json::to_value(vote)?;
        self.client
            .send(&ApiRequest::post(paths::TOGGLE_VOTE, body))
            .await
            .map(|_| ())
    }

    async fn poll_responses(&self, poll_id: PollId) -> AppResult<Vec<PollResponse>> {
        self.client
            .get(ApiRequest::get(paths::poll_responses(poll_id)))
            .await
    }

    async fn create_comment(&self, draft: &CommentDraft) -> AppResult<Comment> {
        let created: Comment = self.client.post(paths::COMMENTS, draft).await?;
        Ok(created.with_target(draft.target()))
    }

    async fn list_comments(
        &self,
        target: CommentTarget,
        page: u32,
        limit: u32,
    ) -> AppResult<Vec<Comment>> {
        let request = ApiRequest::get(paths::COMMENTS)
            .with_query("type", target.kind)
            .with_query("targetId", target.id)
            .with_query("page", page)
            .with_query("limit", limit);
        let comments: Vec<Comment> = self.client.get(request).await?;
        Ok(comments
            .into_iter()
            .map(|c| c.with_target(target))
            .collect())
    }

    async fn list_users(
        &self,
        kind: UserKind,
        page: u32,
        limit: u32,
    ) -> AppResult<Vec<ManagedUser>> {
        let request = ApiRequest::get(paths::users(kind.as_str()))
            .with_query("page", page)
            .with_query("limit", limit);
        self.client.get(request).await
    }

    async fn search_users(&self, kind: UserKind, query: &str) -> AppResult<Vec<ManagedUser>> {
        let request = ApiRequest::get(format!("{}/search", paths::users(kind.as_str())))
            .with_query("query", query);
        self.client.get(request).await
    }

    async fn add_user(&self, kind: UserKind, user: &NewUser) -> AppResult<ManagedUser> {
        self.client.post(&paths::users(kind.as_str()), user).await
    }

    async fn add_users(&self, kind: UserKind, users: &[NewUser]) -> AppResult<Vec<ManagedUser>> {
        let path = format!("{}/bulk", paths::users(kind.as_str()));
        self.client.post(&path, &json!({ "users": users })).await
    }

    async fn edit_user(
        &self,
        kind: UserKind,
        id: UserId,
        update: &UserUpdate,
    ) -> AppResult<ManagedUser> {
        self.client
            .put(&paths::user(kind.as_str(), id), update)
            .await
    }

    async fn delete_user(&self, kind: UserKind, id: UserId) -> AppResult<()> {
        self.client.delete(&paths::user(kind.as_str(), id)).await
    }
}
