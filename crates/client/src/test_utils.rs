//! In-process fakes for the REST API and the push channel.
//!
//! - [`ScriptedExecutor`]: queued raw HTTP responses per path, for exercising
//!   the Request Client.
//! - [`LoopbackServer`]: a push server with room membership and forced
//!   disconnects, implementing [`PushConnector`].
//! - [`MemoryBackend`]: the dashboard API held in memory, implementing
//!   [`CampusApi`] and publishing the same push events the real server does.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use noticeboard_common::{AppError, AppResult};
use noticeboard_model::{
    Announcement, AnnouncementId, AnnouncementUpdate, AuthorProfile, AuthorRef, Comment,
    CommentAuthor, CommentCount, CommentDraft, CommentTarget, CreateAnnouncementPayload,
    CreatePollPayload, ManagedUser, NewUser, Poll, PollId, PollOption, PollResponse, Role, Room,
    TargetKind, ToggleVote, UserId, UserKind, UserUpdate, event_names, toggle_response,
};
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore, mpsc};

use crate::api::CampusApi;
use crate::http::{ApiRequest, ApiResponse, HttpExecutor};
use crate::push::{ClientFrame, PushConnection, PushConnector, ServerFrame};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// === Scripted HTTP ===

/// A request as seen by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub request: ApiRequest,
    pub bearer: Option<String>,
}

#[derive(Default)]
struct Script {
    responses: HashMap<String, VecDeque<AppResult<ApiResponse>>>,
    calls: Vec<RecordedCall>,
}

/// [`HttpExecutor`] answering from per-path FIFO queues.
///
/// Unscripted paths answer `404`.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<Script>,
}

impl ScriptedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `path`.
    pub fn respond(&self, path: &str, response: ApiResponse) {
        locked(&self.script)
            .responses
            .entry(path.to_string())
            .or_default()
            .push_back(Ok(response));
    }

    /// Queue a transport failure for `path`.
    pub fn fail(&self, path: &str, error: AppError) {
        locked(&self.script)
            .responses
            .entry(path.to_string())
            .or_default()
            .push_back(Err(error));
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        locked(&self.script).calls.clone()
    }

    /// Number of calls made to `path`.
    #[must_use]
    pub fn count(&self, path: &str) -> usize {
        locked(&self.script)
            .calls
            .iter()
            .filter(|c| c.request.path == path)
            .count()
    }
}

#[async_trait]
impl HttpExecutor for ScriptedExecutor {
    async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> AppResult<ApiResponse> {
        let mut script = locked(&self.script);
        script.calls.push(RecordedCall {
            request: request.clone(),
            bearer: bearer.map(String::from),
        });
        script
            .responses
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Ok(ApiResponse::new(
                    404,
                    json!({ "message": format!("no scripted response for {}", request.path) }),
                ))
            })
    }
}

// === Loopback push server ===

struct Peer {
    id: u64,
    rooms: HashSet<Room>,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

#[derive(Default)]
struct Hub {
    peers: Vec<Peer>,
    next_peer: u64,
    connects: usize,
    refuse: usize,
    received: Vec<ClientFrame>,
}

/// In-process push server.
#[derive(Clone, Default)]
pub struct LoopbackServer {
    hub: Arc<Mutex<Hub>>,
    changed: Arc<Notify>,
}

impl LoopbackServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to every connection in `room`; returns deliveries.
    pub fn emit(&self, room: &Room, event: &str, payload: Value) -> usize {
        let hub = locked(&self.hub);
        let mut delivered = 0;
        for peer in hub.peers.iter().filter(|p| p.rooms.contains(room)) {
            let frame = ServerFrame::Event {
                event: event.to_string(),
                room: Some(room.clone()),
                payload: payload.clone(),
            };
            if peer.tx.send(frame).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Sever every open connection.
    pub fn drop_connections(&self) {
        locked(&self.hub).peers.clear();
        self.changed.notify_waiters();
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next_connects(&self, n: usize) {
        locked(&self.hub).refuse = n;
    }

    /// Successful connections so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        locked(&self.hub).connects
    }

    /// Every frame clients have sent.
    #[must_use]
    pub fn received(&self) -> Vec<ClientFrame> {
        locked(&self.hub).received.clone()
    }

    /// Connections currently in `room`.
    #[must_use]
    pub fn members(&self, room: &Room) -> usize {
        locked(&self.hub)
            .peers
            .iter()
            .filter(|p| p.rooms.contains(room))
            .count()
    }

    /// Wait until `room` has exactly `count` members.
    pub async fn until_members(&self, room: &Room, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.members(room) == count {
                return;
            }
            notified.await;
        }
    }

    fn handle(&self, peer_id: u64, frame: &ClientFrame) -> AppResult<()> {
        let mut hub = locked(&self.hub);
        hub.received.push(frame.clone());
        let peer = hub
            .peers
            .iter_mut()
            .find(|p| p.id == peer_id)
            .ok_or_else(|| AppError::Push("connection reset".to_string()))?;

        let ack = match frame {
            ClientFrame::Join(room) => {
                peer.rooms.insert(room.clone());
                ServerFrame::Joined(room.clone())
            }
            ClientFrame::Leave(room) => {
                peer.rooms.remove(room);
                ServerFrame::Left(room.clone())
            }
        };
        let _ = peer.tx.send(ack);
        drop(hub);
        self.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl PushConnector for LoopbackServer {
    async fn connect(&self) -> AppResult<Box<dyn PushConnection>> {
        let mut hub = locked(&self.hub);
        if hub.refuse > 0 {
            hub.refuse -= 1;
            return Err(AppError::Push("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        hub.next_peer += 1;
        hub.connects += 1;
        let id = hub.next_peer;
        hub.peers.push(Peer {
            id,
            rooms: HashSet::new(),
            tx,
        });
        drop(hub);
        self.changed.notify_waiters();

        Ok(Box::new(LoopbackConnection {
            id,
            server: self.clone(),
            rx,
        }))
    }
}

struct LoopbackConnection {
    id: u64,
    server: LoopbackServer,
    rx: mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
impl PushConnection for LoopbackConnection {
    async fn send(&mut self, frame: &ClientFrame) -> AppResult<()> {
        self.server.handle(self.id, frame)
    }

    async fn next(&mut self) -> Option<AppResult<ServerFrame>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        locked(&self.server.hub).peers.retain(|p| p.id != self.id);
        self.server.changed.notify_waiters();
    }
}

// === In-memory API ===

/// Endpoint names for call counting, failure injection and gates.
pub mod endpoints {
    pub const LIST_ANNOUNCEMENTS: &str = "list_announcements";
    pub const GET_ANNOUNCEMENT: &str = "get_announcement";
    pub const CREATE_ANNOUNCEMENT: &str = "create_announcement";
    pub const UPDATE_ANNOUNCEMENT: &str = "update_announcement";
    pub const DELETE_ANNOUNCEMENT: &str = "delete_announcement";
    pub const CREATE_POLL: &str = "create_poll";
    pub const TOGGLE_VOTE: &str = "toggle_vote";
    pub const POLL_RESPONSES: &str = "poll_responses";
    pub const CREATE_COMMENT: &str = "create_comment";
    pub const LIST_COMMENTS: &str = "list_comments";
    pub const LIST_USERS: &str = "list_users";
    pub const SEARCH_USERS: &str = "search_users";
    pub const ADD_USER: &str = "add_user";
    pub const ADD_USERS: &str = "add_users";
    pub const EDIT_USER: &str = "edit_user";
    pub const DELETE_USER: &str = "delete_user";
}

/// Identity the backend attributes mutations to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl Default for Actor {
    fn default() -> Self {
        Self {
            user_id: 1,
            name: "Registrar".to_string(),
            email: "registrar@uni.example".to_string(),
            role: Role::Admin,
        }
    }
}

/// Holds an endpoint's response until released.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    /// Let one held call through.
    pub fn release(&self) {
        self.permits.add_permits(1);
    }

    /// Let every current and future call through.
    pub fn open(&self) {
        self.permits.add_permits(1 << 16);
    }
}

#[derive(Default)]
struct Store {
    announcements: Vec<Announcement>,
    responses: HashMap<PollId, Vec<PollResponse>>,
    comments: HashMap<CommentTarget, Vec<Comment>>,
    users: HashMap<UserKind, Vec<ManagedUser>>,
    next_id: i64,
    actor: Actor,
}

impl Store {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn author(&self) -> AuthorRef {
        AuthorRef {
            user_id: self.actor.user_id,
            user: AuthorProfile {
                name: self.actor.name.clone(),
                email: self.actor.email.clone(),
                role: self.actor.role,
            },
        }
    }

    fn announcement_mut(&mut self, id: AnnouncementId) -> AppResult<&mut Announcement> {
        self.announcements
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| AppError::NotFound(format!("announcement {id} not found")))
    }

    fn poll(&self, poll_id: PollId) -> AppResult<&Poll> {
        self.announcements
            .iter()
            .filter_map(|a| a.poll.as_ref())
            .find(|p| p.id == poll_id)
            .ok_or_else(|| AppError::NotFound(format!("poll {poll_id} not found")))
    }

    fn build_poll(
        &mut self,
        announcement_id: AnnouncementId,
        payload: &CreatePollPayload,
    ) -> Poll {
        let id = self.next_id();
        let options = payload
            .options
            .iter()
            .map(|text| PollOption {
                id: self.next_id(),
                poll_id: id,
                text: text.clone(),
            })
            .collect();
        Poll {
            id,
            announcement_id,
            kind: payload.kind,
            allow_multiple_answers: payload.allow_multiple_answers,
            options,
        }
    }

    fn users_mut(&mut self, kind: UserKind) -> &mut Vec<ManagedUser> {
        self.users.entry(kind).or_default()
    }

    fn managed(&mut self, user: &NewUser) -> ManagedUser {
        ManagedUser {
            user_id: self.next_id(),
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
            matricule_number: user.student.as_ref().map(|s| s.matricule_number.clone()),
            level: user.student.as_ref().map(|s| s.level.clone()),
            institutional_email: user
                .student
                .as_ref()
                .map(|s| s.institutional_email.clone()),
            phone_number: user.phone_number.clone(),
        }
    }
}

struct Emission {
    room: Room,
    event: &'static str,
    payload: Value,
}

fn page_of<T: Clone>(items: &[T], page: u32, limit: u32) -> Vec<T> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let skip = usize::try_from(page.max(1) - 1)
        .unwrap_or(usize::MAX)
        .saturating_mul(limit);
    items.iter().skip(skip).take(limit).cloned().collect()
}

/// The dashboard API held in memory.
#[derive(Default)]
pub struct MemoryBackend {
    store: Mutex<Store>,
    push: Option<LoopbackServer>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, VecDeque<AppError>>>,
    gates: Mutex<HashMap<&'static str, Gate>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish push events through `server`, as the real API does.
    #[must_use]
    pub fn with_push(mut self, server: LoopbackServer) -> Self {
        self.push = Some(server);
        self
    }

    /// Attribute subsequent mutations to another user.
    pub fn act_as(&self, user_id: UserId, name: &str, role: Role) {
        let mut store = locked(&self.store);
        store.actor = Actor {
            user_id,
            name: name.to_string(),
            email: format!("{}@uni.example", name.to_lowercase()),
            role,
        };
    }

    // --- seeding and inspection (no push, not counted) ---

    pub fn seed_announcement(&self, title: &str, content: &str) -> Announcement {
        let mut store = locked(&self.store);
        let announcement = Announcement {
            id: store.next_id(),
            title: title.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            admin: store.author(),
            is_poll: false,
            poll: None,
            attachments: Vec::new(),
            count: CommentCount::default(),
        };
        store.announcements.insert(0, announcement.clone());
        announcement
    }

    pub fn seed_poll(&self, title: &str, options: &[&str], allow_multiple: bool) -> Announcement {
        let mut announcement = self.seed_announcement(title, "Cast your vote.");
        let mut store = locked(&self.store);
        let payload = CreatePollPayload {
            announcement_id: Some(announcement.id),
            kind: noticeboard_model::PollKind::General,
            allow_multiple_answers: allow_multiple,
            options: options.iter().map(|o| (*o).to_string()).collect(),
        };
        let poll = store.build_poll(announcement.id, &payload);
        announcement.attach_poll(poll);
        if let Ok(stored) = store.announcement_mut(announcement.id) {
            *stored = announcement.clone();
        }
        announcement
    }

    pub fn seed_comment(&self, target: CommentTarget, content: &str) -> Comment {
        let mut store = locked(&self.store);
        let comment = Comment {
            id: store.next_id(),
            content: content.to_string(),
            created_at: Utc::now(),
            user: CommentAuthor {
                user_id: Some(store.actor.user_id),
                name: store.actor.name.clone(),
                role: store.actor.role,
            },
            target_type: Some(target.kind),
            target_id: Some(target.id),
        };
        store.comments.entry(target).or_default().push(comment.clone());
        comment
    }

    pub fn seed_user(&self, kind: UserKind, user: &NewUser) -> ManagedUser {
        let mut store = locked(&self.store);
        let managed = store.managed(user);
        store.users_mut(kind).push(managed.clone());
        managed
    }

    #[must_use]
    pub fn announcement(&self, id: AnnouncementId) -> Option<Announcement> {
        locked(&self.store)
            .announcements
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    #[must_use]
    pub fn responses(&self, poll_id: PollId) -> Vec<PollResponse> {
        locked(&self.store)
            .responses
            .get(&poll_id)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn comments(&self, target: CommentTarget) -> Vec<Comment> {
        locked(&self.store)
            .comments
            .get(&target)
            .cloned()
            .unwrap_or_default()
    }

    // --- instrumentation ---

    /// Calls made to an endpoint (see [`endpoints`]).
    #[must_use]
    pub fn calls(&self, endpoint: &str) -> usize {
        locked(&self.calls).get(endpoint).copied().unwrap_or(0)
    }

    /// Fail the next call to `endpoint` with `error`.
    pub fn fail_next(&self, endpoint: &'static str, error: AppError) {
        locked(&self.failures)
            .entry(endpoint)
            .or_default()
            .push_back(error);
    }

    /// Hold responses of `endpoint` until the returned gate is released.
    ///
    /// Mutations apply their effects and publish push events before waiting;
    /// reads wait before reading.
    pub fn hold(&self, endpoint: &'static str) -> Gate {
        let gate = Gate {
            permits: Arc::new(Semaphore::new(0)),
        };
        locked(&self.gates).insert(endpoint, gate.clone());
        gate
    }

    fn enter(&self, endpoint: &'static str) -> AppResult<()> {
        *locked(&self.calls).entry(endpoint).or_insert(0) += 1;
        match locked(&self.failures)
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn pass(&self, endpoint: &'static str) {
        let gate = locked(&self.gates).get(endpoint).cloned();
        if let Some(gate) = gate
            && let Ok(permit) = gate.permits.acquire().await
        {
            permit.forget();
        }
    }

    async fn query<T>(
        &self,
        endpoint: &'static str,
        read: impl FnOnce(&Store) -> AppResult<T> + Send,
    ) -> AppResult<T> {
        self.enter(endpoint)?;
        self.pass(endpoint).await;
        read(&locked(&self.store))
    }

    async fn mutate<T>(
        &self,
        endpoint: &'static str,
        write: impl FnOnce(&mut Store) -> AppResult<(T, Vec<Emission>)> + Send,
    ) -> AppResult<T> {
        self.enter(endpoint)?;
        let (value, emissions) = write(&mut locked(&self.store))?;
        if let Some(push) = &self.push {
            for emission in emissions {
                push.emit(&emission.room, emission.event, emission.payload);
            }
        }
        self.pass(endpoint).await;
        Ok(value)
    }
}

fn feed(event: &'static str, payload: Value) -> Emission {
    Emission {
        room: Room::general_announcements(),
        event,
        payload,
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> AppResult<Value> {
    serde_json::to_value(value).map_err(AppError::from)
}

#[async_trait]
impl CampusApi for MemoryBackend {
    async fn list_announcements(&self, page: u32, limit: u32) -> AppResult<Vec<Announcement>> {
        self.query(endpoints::LIST_ANNOUNCEMENTS, |s| {
            Ok(page_of(&s.announcements, page, limit))
        })
        .await
    }

    async fn get_announcement(&self, id: AnnouncementId) -> AppResult<Announcement> {
        self.query(endpoints::GET_ANNOUNCEMENT, |s| {
            s.announcements
                .iter()
                .find(|a| a.id == id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("announcement {id} not found")))
        })
        .await
    }

    async fn create_announcement(
        &self,
        payload: &CreateAnnouncementPayload,
    ) -> AppResult<Announcement> {
        self.mutate(endpoints::CREATE_ANNOUNCEMENT, |s| {
            let id = s.next_id();
            let mut announcement = Announcement {
                id,
                title: payload.title.clone(),
                content: payload.content.clone(),
                created_at: Utc::now(),
                admin: s.author(),
                is_poll: payload.is_poll,
                poll: None,
                attachments: payload.attachments.clone(),
                count: CommentCount::default(),
            };
            if let Some(poll) = &payload.poll {
                let poll = s.build_poll(id, poll);
                announcement.attach_poll(poll);
            }
            s.announcements.insert(0, announcement.clone());
            let emissions = vec![feed(
                event_names::NEW_ANNOUNCEMENT,
                to_value(&announcement)?,
            )];
            Ok((announcement, emissions))
        })
        .await
    }

    async fn update_announcement(
        &self,
        id: AnnouncementId,
        update: &AnnouncementUpdate,
    ) -> AppResult<Announcement> {
        self.mutate(endpoints::UPDATE_ANNOUNCEMENT, |s| {
            let announcement = s.announcement_mut(id)?;
            announcement.title.clone_from(&update.title);
            announcement.content.clone_from(&update.content);
            announcement.attachments.clone_from(&update.attachments);
            let updated = announcement.clone();
            let emissions = vec![feed(event_names::UPDATE_ANNOUNCEMENT, to_value(&updated)?)];
            Ok((updated, emissions))
        })
        .await
    }

    async fn delete_announcement(&self, id: AnnouncementId) -> AppResult<()> {
        self.mutate(endpoints::DELETE_ANNOUNCEMENT, |s| {
            let before = s.announcements.len();
            s.announcements.retain(|a| a.id != id);
            if s.announcements.len() == before {
                return Err(AppError::NotFound(format!("announcement {id} not found")));
            }
            s.comments
                .remove(&CommentTarget::general_announcement(id));
            let emissions = vec![feed(
                event_names::DELETE_ANNOUNCEMENT,
                json!({ "announcementId": id }),
            )];
            Ok(((), emissions))
        })
        .await
    }

    async fn create_poll(&self, payload: &CreatePollPayload) -> AppResult<Poll> {
        self.mutate(endpoints::CREATE_POLL, |s| {
            let announcement_id = payload
                .announcement_id
                .ok_or_else(|| AppError::BadRequest("announcementId is required".to_string()))?;
            if s.announcement_mut(announcement_id)?.poll.is_some() {
                return Err(AppError::Conflict(format!(
                    "announcement {announcement_id} already has a poll"
                )));
            }
            let poll = s.build_poll(announcement_id, payload);
            s.announcement_mut(announcement_id)?
                .attach_poll(poll.clone());
            let emissions = vec![feed(event_names::NEW_POLL, to_value(&poll)?)];
            Ok((poll, emissions))
        })
        .await
    }

    async fn toggle_vote(&self, vote: ToggleVote) -> AppResult<()> {
        self.mutate(endpoints::TOGGLE_VOTE, |s| {
            let poll = s.poll(vote.poll_id)?.clone();
            let user_id = s.actor.user_id;
            let response_id = s.next_id();
            let current = s.responses.get(&poll.id).cloned().unwrap_or_default();
            let next = toggle_response(
                &poll,
                &current,
                user_id,
                vote.option_id,
                response_id,
                Utc::now(),
            )?;
            s.responses.insert(poll.id, next);
            let emissions = vec![feed(
                event_names::POLL_RESPONSE,
                json!({ "pollId": poll.id, "userId": user_id }),
            )];
            Ok(((), emissions))
        })
        .await
    }

    async fn poll_responses(&self, poll_id: PollId) -> AppResult<Vec<PollResponse>> {
        self.query(endpoints::POLL_RESPONSES, |s| {
            s.poll(poll_id)?;
            Ok(s.responses.get(&poll_id).cloned().unwrap_or_default())
        })
        .await
    }

    async fn create_comment(&self, draft: &CommentDraft) -> AppResult<Comment> {
        self.mutate(endpoints::CREATE_COMMENT, |s| {
            let target = draft.target();
            if target.kind == TargetKind::GeneralAnnouncement {
                s.announcement_mut(target.id)?.count.comments += 1;
            }
            let comment = Comment {
                id: s.next_id(),
                content: draft.content.clone(),
                created_at: Utc::now(),
                user: CommentAuthor {
                    user_id: Some(s.actor.user_id),
                    name: s.actor.name.clone(),
                    role: s.actor.role,
                },
                target_type: Some(target.kind),
                target_id: Some(target.id),
            };
            s.comments.entry(target).or_default().push(comment.clone());

            // The thread room scopes the event; the payload carries no target.
            let broadcast = Comment {
                target_type: None,
                target_id: None,
                ..comment.clone()
            };
            let emissions = vec![Emission {
                room: Room::for_target(target),
                event: event_names::NEW_COMMENT,
                payload: to_value(&broadcast)?,
            }];
            Ok((comment, emissions))
        })
        .await
    }

    async fn list_comments(
        &self,
        target: CommentTarget,
        page: u32,
        limit: u32,
    ) -> AppResult<Vec<Comment>> {
        self.query(endpoints::LIST_COMMENTS, |s| {
            let thread = s.comments.get(&target).map(Vec::as_slice).unwrap_or_default();
            Ok(page_of(thread, page, limit))
        })
        .await
    }

    async fn list_users(
        &self,
        kind: UserKind,
        page: u32,
        limit: u32,
    ) -> AppResult<Vec<ManagedUser>> {
        self.query(endpoints::LIST_USERS, |s| {
            let users = s.users.get(&kind).map(Vec::as_slice).unwrap_or_default();
            Ok(page_of(users, page, limit))
        })
        .await
    }

    async fn search_users(&self, kind: UserKind, query: &str) -> AppResult<Vec<ManagedUser>> {
        let needle = query.trim().to_lowercase();
        self.query(endpoints::SEARCH_USERS, |s| {
            Ok(s.users
                .get(&kind)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .filter(|u| {
                    u.name.to_lowercase().contains(&needle)
                        || u.email.to_lowercase().contains(&needle)
                        || u
                            .matricule_number
                            .as_deref()
                            .is_some_and(|m| m.to_lowercase().contains(&needle))
                })
                .cloned()
                .collect())
        })
        .await
    }

    async fn add_user(&self, kind: UserKind, user: &NewUser) -> AppResult<ManagedUser> {
        self.mutate(endpoints::ADD_USER, |s| {
            if s.users_mut(kind).iter().any(|u| u.email == user.email) {
                return Err(AppError::Conflict(format!("{} already exists", user.email)));
            }
            let managed = s.managed(user);
            s.users_mut(kind).push(managed.clone());
            Ok((managed, Vec::new()))
        })
        .await
    }

    async fn add_users(&self, kind: UserKind, users: &[NewUser]) -> AppResult<Vec<ManagedUser>> {
        self.mutate(endpoints::ADD_USERS, |s| {
            if let Some(dup) = users
                .iter()
                .find(|n| s.users_mut(kind).iter().any(|u| u.email == n.email))
            {
                return Err(AppError::Conflict(format!("{} already exists", dup.email)));
            }
            let created: Vec<ManagedUser> = users.iter().map(|u| s.managed(u)).collect();
            s.users_mut(kind).extend(created.iter().cloned());
            Ok((created, Vec::new()))
        })
        .await
    }

    async fn edit_user(
        &self,
        kind: UserKind,
        id: UserId,
        update: &UserUpdate,
    ) -> AppResult<ManagedUser> {
        self.mutate(endpoints::EDIT_USER, |s| {
            let user = s
                .users_mut(kind)
                .iter_mut()
                .find(|u| u.user_id == id)
                .ok_or_else(|| AppError::NotFound(format!("user {id} not found")))?;
            if let Some(name) = &update.name {
                user.name.clone_from(name);
            }
            if let Some(email) = &update.email {
                user.email.clone_from(email);
            }
            if let Some(role) = update.role {
                user.role = role;
            }
            if update.phone_number.is_some() {
                user.phone_number.clone_from(&update.phone_number);
            }
            if update.matricule_number.is_some() {
                user.matricule_number.clone_from(&update.matricule_number);
            }
            if update.level.is_some() {
                user.level.clone_from(&update.level);
            }
            if update.institutional_email.is_some() {
                user.institutional_email
                    .clone_from(&update.institutional_email);
            }
            Ok((user.clone(), Vec::new()))
        })
        .await
    }

    async fn delete_user(&self, kind: UserKind, id: UserId) -> AppResult<()> {
        self.mutate(endpoints::DELETE_USER, |s| {
            let users = s.users_mut(kind);
            let before = users.len();
            users.retain(|u| u.user_id != id);
            if users.len() == before {
                return Err(AppError::NotFound(format!("user {id} not found")));
            }
            Ok(((), Vec::new()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backend_toggle_semantics() {
        let backend = MemoryBackend::new();
        let announcement = backend.seed_poll("Venue", &["Hall A", "Hall B"], false);
        let poll = announcement.poll.unwrap();
        let (a, b) = (poll.options[0].id, poll.options[1].id);

        let vote = |option_id| ToggleVote {
            poll_id: poll.id,
            option_id,
        };
        backend.toggle_vote(vote(a)).await.unwrap();
        backend.toggle_vote(vote(b)).await.unwrap();

        let responses = backend.poll_responses(poll.id).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].option_id, b);

        backend.toggle_vote(vote(b)).await.unwrap();
        assert!(backend.responses(poll.id).is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_injection_and_counts() {
        let backend = MemoryBackend::new();
        backend.fail_next(
            endpoints::LIST_ANNOUNCEMENTS,
            AppError::Network("offline".to_string()),
        );

        assert!(backend.list_announcements(1, 10).await.is_err());
        assert!(backend.list_announcements(1, 10).await.is_ok());
        assert_eq!(backend.calls(endpoints::LIST_ANNOUNCEMENTS), 2);
    }

    #[tokio::test]
    async fn test_backend_publishes_comment_to_thread_room() {
        let server = LoopbackServer::new();
        let backend = MemoryBackend::new().with_push(server.clone());
        let announcement = backend.seed_announcement("Exams", "Timetable is out");
        let target = CommentTarget::general_announcement(announcement.id);

        let mut conn = server.connect().await.unwrap();
        conn.send(&ClientFrame::Join(Room::for_target(target)))
            .await
            .unwrap();
        assert!(matches!(
            conn.next().await,
            Some(Ok(ServerFrame::Joined(_)))
        ));

        backend
            .create_comment(&CommentDraft::new(target, "When?").unwrap())
            .await
            .unwrap();

        match conn.next().await {
            Some(Ok(ServerFrame::Event { event, payload, .. })) => {
                assert_eq!(event, "newComment");
                assert_eq!(payload["content"], "When?");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(
            backend.announcement(announcement.id).unwrap().comment_count(),
            1
        );
    }

    #[test]
    fn test_page_of() {
        let items: Vec<u32> = (1..=25).collect();
        assert_eq!(page_of(&items, 1, 10), (1..=10).collect::<Vec<_>>());
        assert_eq!(page_of(&items, 3, 10), vec![21, 22, 23, 24, 25]);
        assert!(page_of(&items, 4, 10).is_empty());
    }
}
