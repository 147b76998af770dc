//! Synchronization integration tests.
//!
//! These drive the push client, the synchronizer and the cache against the
//! in-memory backend, which publishes push events the way the real API does.

use std::sync::Arc;
use std::time::Duration;

use noticeboard_client::test_utils::{LoopbackServer, MemoryBackend, ScriptedExecutor, endpoints};
use noticeboard_client::{
    ApiResponse, CampusApi, CredentialStore, HttpCampusApi, MemoryCredentialStore, PushClient,
    RequestClient, SessionEvent,
};
use noticeboard_common::AppError;
use noticeboard_common::config::{CacheConfig, PushConfig};
use noticeboard_core::{CacheValue, Query, QueryState, QuerySubscription, SyncScope, Synchronizer};
use noticeboard_model::{CommentTarget, Credentials, Role, Room, ToggleVote};
use serde_json::json;

struct Harness {
    backend: Arc<MemoryBackend>,
    server: LoopbackServer,
    push: PushClient,
    sync: Synchronizer,
}

impl Harness {
    async fn new() -> Self {
        let server = LoopbackServer::new();
        let backend = Arc::new(MemoryBackend::new().with_push(server.clone()));
        let push = PushClient::connect(
            Arc::new(server.clone()),
            PushConfig {
                url: "ws://loopback".to_string(),
                reconnect_initial_ms: 10,
                reconnect_max_ms: 50,
            },
        );
        push.wait_connected().await.unwrap();
        let api: Arc<dyn CampusApi> = backend.clone();
        let sync = Synchronizer::new(api, CacheConfig::default());
        Self {
            backend,
            server,
            push,
            sync,
        }
    }
}

async fn until(
    sub: &mut QuerySubscription,
    predicate: impl FnMut(&QueryState) -> bool,
) -> QueryState {
    tokio::time::timeout(Duration::from_secs(5), sub.wait_for(predicate))
        .await
        .expect("timed out waiting for cache state")
        .expect("cache entry closed")
}

fn settled(state: &QueryState) -> bool {
    state.data.is_some() && !state.is_loading && !state.is_stale
}

fn comment_texts(state: &QueryState) -> Vec<String> {
    state
        .data
        .as_ref()
        .and_then(CacheValue::comments)
        .unwrap_or_default()
        .iter()
        .map(|c| c.content.clone())
        .collect()
}

fn announcement_ids(state: &QueryState) -> Vec<i64> {
    state
        .data
        .as_ref()
        .and_then(CacheValue::announcements)
        .unwrap_or_default()
        .iter()
        .map(|a| a.id)
        .collect()
}

#[tokio::test]
async fn test_comment_push_racing_http_response() {
    let h = Harness::new().await;
    let announcement = h.backend.seed_announcement("Exams", "Timetable is out");
    let target = CommentTarget::general_announcement(announcement.id);

    let _live = h.sync.attach(&h.push, SyncScope::Thread(target));
    h.server.until_members(&Room::for_target(target), 1).await;
    let mut comments = h.sync.comments(target);
    until(&mut comments, settled).await;

    // The server publishes the comment before answering the POST.
    let gate = h.backend.hold(endpoints::CREATE_COMMENT);
    let posting = tokio::spawn({
        let sync = h.sync.clone();
        async move { sync.create_comment(target, "Hello").await }
    });

    let pushed = until(&mut comments, |s| comment_texts(s) == ["Hello"]).await;
    assert!(!posting.is_finished());
    assert_eq!(
        pushed.data.as_ref().and_then(CacheValue::comments).unwrap()[0].target(),
        Some(target)
    );

    gate.open();
    let created = posting.await.unwrap().unwrap();
    let state = until(&mut comments, settled).await;

    assert_eq!(comment_texts(&state), vec!["Hello"]);
    assert_eq!(
        state.data.as_ref().and_then(CacheValue::comments).unwrap()[0].id,
        created.id
    );
    assert_eq!(h.backend.calls(endpoints::CREATE_COMMENT), 1);

    h.push.shutdown().await;
}

#[tokio::test]
async fn test_delete_push_removes_from_every_view() {
    let h = Harness::new().await;
    let doomed = h.backend.seed_announcement("Exams", "Timetable is out");
    let kept = h.backend.seed_announcement("Library", "Open late");

    let _live = h.sync.attach(&h.push, SyncScope::AnnouncementFeed);
    h.server
        .until_members(&Room::general_announcements(), 1)
        .await;
    let mut list = h.sync.announcements();
    let mut detail = h.sync.announcement(doomed.id);
    let before = until(&mut list, settled).await;
    until(&mut detail, settled).await;
    assert_eq!(announcement_ids(&before), vec![kept.id, doomed.id]);

    // Another admin deletes it.
    h.backend.act_as(2, "Dean", Role::SuperAdmin);
    h.backend.delete_announcement(doomed.id).await.unwrap();

    let after = until(&mut list, |s| announcement_ids(s).len() == 1).await;
    assert_eq!(announcement_ids(&after), vec![kept.id]);
    assert!(detail.current().data.is_none());

    h.push.shutdown().await;
}

#[tokio::test]
async fn test_pushed_announcement_is_prepended_once() {
    let h = Harness::new().await;
    let existing = h.backend.seed_announcement("Exams", "Timetable is out");

    // Two views on the feed register two handlers each.
    let _first = h.sync.attach(&h.push, SyncScope::AnnouncementFeed);
    let second = h.sync.attach(&h.push, SyncScope::AnnouncementFeed);
    h.server
        .until_members(&Room::general_announcements(), 1)
        .await;
    let mut list = h.sync.announcements();
    until(&mut list, settled).await;

    let created = h
        .sync
        .create_announcement(noticeboard_model::AnnouncementDraft::regular(
            "Library",
            "Open late",
        ))
        .await
        .unwrap();

    let state = until(&mut list, |s| settled(s) && announcement_ids(s).len() == 2).await;
    assert_eq!(announcement_ids(&state), vec![created.id, existing.id]);

    assert_eq!(h.push.handler_count("newAnnouncement"), 2);
    drop(second);
    assert_eq!(h.push.handler_count("newAnnouncement"), 1);
    assert_eq!(h.push.joined_rooms(), vec![Room::general_announcements()]);

    h.push.shutdown().await;
}

#[tokio::test]
async fn test_vote_from_another_session_refreshes_tally() {
    let h = Harness::new().await;
    let announcement = h.backend.seed_poll("Venue", &["Hall A", "Hall B"], false);
    let poll = announcement.poll.clone().unwrap();
    let (a, b) = (poll.options[0].id, poll.options[1].id);

    let _live = h.sync.attach(&h.push, SyncScope::AnnouncementFeed);
    h.server
        .until_members(&Room::general_announcements(), 1)
        .await;
    let mut responses = h.sync.poll_responses(poll.id);
    until(&mut responses, settled).await;

    // User 1 votes A, then B on a single-answer poll.
    h.sync.toggle_vote(poll.id, a).await.unwrap();
    h.sync.toggle_vote(poll.id, b).await.unwrap();
    until(&mut responses, |s| {
        settled(s) && s.data.as_ref().and_then(CacheValue::poll_responses).map(<[_]>::len) == Some(1)
    })
    .await;
    let tally = h.sync.poll_tally(&poll, 1).unwrap();
    assert!(!tally.option(a).unwrap().voted_by_user);
    assert!(tally.option(b).unwrap().voted_by_user);

    // User 2 votes A from another tab; only the push tells us.
    h.backend.act_as(2, "Grace", Role::Student);
    h.backend
        .toggle_vote(ToggleVote {
            poll_id: poll.id,
            option_id: a,
        })
        .await
        .unwrap();
    until(&mut responses, |s| {
        settled(s) && s.data.as_ref().and_then(CacheValue::poll_responses).map(<[_]>::len) == Some(2)
    })
    .await;

    let tally = h.sync.poll_tally(&poll, 1).unwrap();
    assert_eq!(tally.total_votes, 2);
    assert_eq!(tally.voters, 2);
    assert_eq!(tally.option(a).unwrap().votes, 1);
    assert!(!tally.option(a).unwrap().voted_by_user);
    assert!(h.sync.has_voted(poll.id, 2, a));

    h.push.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_rejoins_and_recovers_missed_changes() {
    let h = Harness::new().await;
    h.backend.seed_announcement("Exams", "Timetable is out");

    let _live = h.sync.attach(&h.push, SyncScope::AnnouncementFeed);
    let room = Room::general_announcements();
    h.server.until_members(&room, 1).await;
    let mut list = h.sync.announcements();
    until(&mut list, settled).await;

    h.server.drop_connections();
    // Posted while the connection is down: no push reaches us.
    let missed = h.backend.seed_announcement("Library", "Open late");

    let state = until(&mut list, |s| {
        settled(s) && announcement_ids(s).first() == Some(&missed.id)
    })
    .await;
    assert_eq!(announcement_ids(&state).len(), 2);
    assert_eq!(h.server.members(&room), 1);
    assert_eq!(h.server.connect_count(), 2);

    h.push.shutdown().await;
}

#[tokio::test]
async fn test_user_mutations_refresh_pages_and_searches() {
    let h = Harness::new().await;
    let mut page = h.sync.users(noticeboard_model::UserKind::Teachers, 1);
    until(&mut page, settled).await;

    let teacher = noticeboard_model::NewUser {
        name: "Grace".to_string(),
        email: "grace@uni.example".to_string(),
        password: "correct horse".to_string(),
        phone_number: None,
        role: Role::Teacher,
        student: None,
    };
    let created = h
        .sync
        .add_user(noticeboard_model::UserKind::Teachers, teacher)
        .await
        .unwrap();

    let state = until(&mut page, |s| {
        settled(s) && s.data.as_ref().and_then(CacheValue::users).map(<[_]>::len) == Some(1)
    })
    .await;
    assert_eq!(
        state.data.as_ref().and_then(CacheValue::users).unwrap()[0].user_id,
        created.user_id
    );

    let err = h
        .sync
        .add_user(
            noticeboard_model::UserKind::Students,
            noticeboard_model::NewUser {
                name: "Ada".to_string(),
                email: "ada@uni.example".to_string(),
                password: "correct horse".to_string(),
                phone_number: None,
                role: Role::Teacher,
                student: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(h.backend.calls(endpoints::ADD_USER), 1);

    h.push.shutdown().await;
}

#[tokio::test]
async fn test_unrecoverable_session_resets_cache() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.respond(
        "/announcements/general",
        ApiResponse::ok(json!([{
            "announcement_id": 7,
            "title": "Exams",
            "content": "Timetable is out",
            "created_at": "2024-03-01T08:00:00Z",
            "admin": {
                "user_id": 1,
                "user": { "name": "Registrar", "email": "registrar@uni.example", "role": "Admin" }
            },
            "_count": { "comments": 0 }
        }])),
    );
    executor.respond("/announcements/general", ApiResponse::expired());
    executor.respond("/announcements/general", ApiResponse::expired());
    executor.respond(
        "/auth/refresh",
        ApiResponse::ok(json!({ "accessToken": "access-2", "refreshToken": "refresh-2" })),
    );

    let store = Arc::new(MemoryCredentialStore::with(Credentials {
        access_token: "access-1".to_string(),
        refresh_token: "refresh-1".to_string(),
        is_super_admin: false,
        role: Some(Role::Admin),
    }));
    let client = RequestClient::new(executor.clone(), store.clone());
    let mut events = client.session_events();
    let api: Arc<dyn CampusApi> = Arc::new(HttpCampusApi::new(client.clone()));
    let sync = Synchronizer::new(api, CacheConfig::default());
    let watcher = sync.watch_session(client.session_events());

    let mut list = sync.announcements();
    until(&mut list, settled).await;

    let err = sync.cache().refetch(&Query::Announcements).await.unwrap_err();
    assert!(err.is_session_fatal());
    assert_eq!(executor.count("/auth/refresh"), 1);
    assert_eq!(executor.count("/announcements/general"), 3);

    loop {
        match events.recv().await.unwrap() {
            SessionEvent::LoginRequired { .. } => break,
            _ => continue,
        }
    }
    assert!(store.load().await.unwrap().is_none());

    until(&mut list, |s| s.data.is_none()).await;
    watcher.abort();
}
