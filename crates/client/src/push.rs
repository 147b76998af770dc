//! Transport Client: one push connection shared by every view.
//!
//! A single driver task owns the connection. Views express interest through
//! guards: [`PushClient::join`] returns a [`RoomGuard`] and [`PushClient::on`]
//! returns a [`HandlerGuard`]; dropping a guard releases the room or handler.
//! Rooms are reference-counted, so joining a room twice sends one `join`
//! frame and delivers each event once.
//!
//! After a reconnect the driver rejoins every room still held before it runs
//! the reconnect hooks, and only then resumes dispatching events.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use noticeboard_common::config::PushConfig;
use noticeboard_common::{AppError, AppResult, IdGenerator};
use noticeboard_model::Room;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::http::RequestClient;

/// Client-to-server frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum ClientFrame {
    Join(Room),
    Leave(Room),
}

/// Server-to-client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Named event, optionally tagged with the room it was published to.
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<Room>,
        payload: Value,
    },
    Joined(Room),
    Left(Room),
}

/// Inbound event as handed to handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub event: String,
    pub room: Option<Room>,
    pub payload: Value,
}

/// Opens push connections.
#[async_trait]
pub trait PushConnector: Send + Sync + 'static {
    async fn connect(&self) -> AppResult<Box<dyn PushConnection>>;
}

/// One open push connection.
#[async_trait]
pub trait PushConnection: Send {
    async fn send(&mut self, frame: &ClientFrame) -> AppResult<()>;

    /// Next inbound frame; `None` once the connection is closed.
    ///
    /// Must be cancel-safe.
    async fn next(&mut self) -> Option<AppResult<ServerFrame>>;

    async fn close(&mut self);
}

/// WebSocket connector; the access token travels as the `token` query
/// parameter and is read fresh on every (re)connect.
#[derive(Clone)]
pub struct WsConnector {
    url: Url,
    session: RequestClient,
    ids: IdGenerator,
}

impl WsConnector {
    pub fn new(url: &str, session: RequestClient) -> AppResult<Self> {
        Ok(Self {
            url: Url::parse(url)?,
            session,
            ids: IdGenerator::new(),
        })
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self) -> AppResult<Box<dyn PushConnection>> {
        let mut url = self.url.clone();
        if let Some(token) = self.session.access_token().await? {
            url.query_pairs_mut().append_pair("token", &token);
        }

        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| AppError::Push(format!("connect failed: {e}")))?;

        let connection_id = self.ids.connection_id();
        debug!(host = ?self.url.host_str(), connection_id = %connection_id, "WebSocket connected");
        Ok(Box::new(WsConnection {
            stream,
            connection_id,
        }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    connection_id: String,
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn send(&mut self, frame: &ClientFrame) -> AppResult<()> {
        let json = serde_json::to_string(frame)?;
        self.stream
            .send(Message::Text(json))
            .await
            .map_err(|e| AppError::Push(e.to_string()))
    }

    async fn next(&mut self) -> Option<AppResult<ServerFrame>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).map_err(AppError::from));
                }
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return Some(Err(AppError::Push(e.to_string())));
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(connection_id = %self.connection_id, "Server closed connection");
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(AppError::Push(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Connection lifecycle as observed by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

type Handler = Arc<dyn Fn(&PushMessage) + Send + Sync>;
type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    rooms: HashMap<Room, usize>,
    handlers: HashMap<String, Vec<(u64, Handler)>>,
    reconnect_hooks: Vec<(u64, ReconnectHook)>,
    next_id: u64,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

enum Command {
    Join(Room),
    Leave(Room),
    Shutdown,
}

struct Shared {
    registry: Mutex<Registry>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn holds(&self, room: &Room) -> bool {
        self.registry().rooms.contains_key(room)
    }

    fn rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.registry().rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    fn dispatch(&self, message: &PushMessage) {
        let handlers: Vec<Handler> = self
            .registry()
            .handlers
            .get(&message.event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        debug!(event = %message.event, room = ?message.room, handlers = handlers.len(), "Dispatching push event");
        for handler in handlers {
            handler(message);
        }
    }

    fn run_reconnect_hooks(&self) {
        let hooks: Vec<ReconnectHook> = self
            .registry()
            .reconnect_hooks
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for hook in hooks {
            hook();
        }
    }
}

/// Handle to the push connection. Cheap to clone.
#[derive(Clone)]
pub struct PushClient {
    shared: Arc<Shared>,
    driver: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl PushClient {
    /// Spawn the driver task and start connecting.
    pub fn connect(connector: Arc<dyn PushConnector>, config: PushConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            commands,
            state,
        });

        let driver = tokio::spawn(drive(connector, config, shared.clone(), rx));
        Self {
            shared,
            driver: Arc::new(tokio::sync::Mutex::new(Some(driver))),
        }
    }

    /// Express interest in a room.
    #[must_use = "the room is left when the guard is dropped"]
    pub fn join(&self, room: Room) -> RoomGuard {
        let first = {
            let mut registry = self.shared.registry();
            let count = registry.rooms.entry(room.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            let _ = self.shared.commands.send(Command::Join(room.clone()));
        }
        RoomGuard {
            shared: self.shared.clone(),
            room,
        }
    }

    /// Register a handler for an event name.
    #[must_use = "the handler is removed when the guard is dropped"]
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerGuard
    where
        F: Fn(&PushMessage) + Send + Sync + 'static,
    {
        let mut registry = self.shared.registry();
        let id = registry.next_id();
        registry
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        HandlerGuard {
            shared: self.shared.clone(),
            slot: Slot::Event(event.to_string(), id),
        }
    }

    /// Register a hook that runs after every reconnect, once rooms are rejoined.
    #[must_use = "the hook is removed when the guard is dropped"]
    pub fn on_reconnect<F>(&self, hook: F) -> HandlerGuard
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut registry = self.shared.registry();
        let id = registry.next_id();
        registry.reconnect_hooks.push((id, Arc::new(hook)));
        HandlerGuard {
            shared: self.shared.clone(),
            slot: Slot::Reconnect(id),
        }
    }

    /// Rooms currently held by at least one guard.
    #[must_use]
    pub fn joined_rooms(&self) -> Vec<Room> {
        self.shared.rooms()
    }

    /// Number of handlers registered for an event.
    #[must_use]
    pub fn handler_count(&self, event: &str) -> usize {
        self.shared
            .registry()
            .handlers
            .get(event)
            .map_or(0, Vec::len)
    }

    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the connection is up.
    pub async fn wait_connected(&self) -> AppResult<()> {
        let mut state = self.connection_state();
        let reached = state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
            .await
            .map_err(|_| AppError::Push("push driver stopped".to_string()))?;
        if *reached == ConnectionState::Closed {
            return Err(AppError::Push("push client is closed".to_string()));
        }
        Ok(())
    }

    /// Close the connection and stop the driver.
    pub async fn shutdown(&self) {
        let _ = self.shared.commands.send(Command::Shutdown);
        let driver = self.driver.lock().await.take();
        if let Some(driver) = driver
            && let Err(e) = driver.await
        {
            warn!(error = %e, "Push driver ended abnormally");
        }
    }
}

/// Room membership; leaves the room when the last guard drops.
pub struct RoomGuard {
    shared: Arc<Shared>,
    room: Room,
}

impl RoomGuard {
    #[must_use]
    pub const fn room(&self) -> &Room {
        &self.room
    }
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        let last = {
            let mut registry = self.shared.registry();
            match registry.rooms.get_mut(&self.room) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    registry.rooms.remove(&self.room);
                    true
                }
                None => false,
            }
        };
        if last {
            let _ = self.shared.commands.send(Command::Leave(self.room.clone()));
        }
    }
}

enum Slot {
    Event(String, u64),
    Reconnect(u64),
}

/// Registered handler; unregisters on drop.
pub struct HandlerGuard {
    shared: Arc<Shared>,
    slot: Slot,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        let mut registry = self.shared.registry();
        match &self.slot {
            Slot::Event(event, id) => {
                if let Some(list) = registry.handlers.get_mut(event) {
                    list.retain(|(h, _)| h != id);
                    if list.is_empty() {
                        registry.handlers.remove(event);
                    }
                }
            }
            Slot::Reconnect(id) => registry.reconnect_hooks.retain(|(h, _)| h != id),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

enum Step {
    Command(Option<Command>),
    Frame(Option<AppResult<ServerFrame>>),
}

async fn drive(
    connector: Arc<dyn PushConnector>,
    config: PushConfig,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut failures: u32 = 0;
    let mut connected_before = false;

    loop {
        if connected_before || failures > 0 {
            shared
                .state
                .send_replace(ConnectionState::Reconnecting { attempt: failures });
        }

        let mut conn = match connector.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, attempt = failures, "Push connection failed");
                let delay = config.backoff(failures);
                failures = failures.saturating_add(1);
                if wait_or_shutdown(&mut commands, Instant::now() + delay).await {
                    break;
                }
                continue;
            }
        };

        let mut on_wire = HashSet::new();
        let end = match rejoin(&mut *conn, &shared, &mut on_wire).await {
            Err(e) => SessionEnd::Lost(e.to_string()),
            Ok(()) => {
                failures = 0;
                shared.state.send_replace(ConnectionState::Connected);
                info!(rooms = on_wire.len(), reconnect = connected_before, "Push channel connected");
                if connected_before {
                    shared.run_reconnect_hooks();
                }
                connected_before = true;
                session(&mut *conn, &shared, &mut commands, &mut on_wire).await
            }
        };

        match end {
            SessionEnd::Shutdown => {
                conn.close().await;
                break;
            }
            SessionEnd::Lost(reason) => {
                warn!(reason = %reason, "Push channel lost");
                let delay = config.backoff(failures);
                failures = failures.saturating_add(1);
                if wait_or_shutdown(&mut commands, Instant::now() + delay).await {
                    break;
                }
            }
        }
    }

    shared.state.send_replace(ConnectionState::Closed);
    info!("Push channel closed");
}

async fn rejoin(
    conn: &mut dyn PushConnection,
    shared: &Shared,
    on_wire: &mut HashSet<Room>,
) -> AppResult<()> {
    for room in shared.rooms() {
        conn.send(&ClientFrame::Join(room.clone())).await?;
        on_wire.insert(room);
    }
    Ok(())
}

async fn session(
    conn: &mut dyn PushConnection,
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    on_wire: &mut HashSet<Room>,
) -> SessionEnd {
    loop {
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            frame = conn.next() => Step::Frame(frame),
        };

        match step {
            Step::Command(None | Some(Command::Shutdown)) => return SessionEnd::Shutdown,
            Step::Command(Some(Command::Join(room))) => {
                if shared.holds(&room) && !on_wire.contains(&room) {
                    if let Err(e) = conn.send(&ClientFrame::Join(room.clone())).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    debug!(room = %room, "Joined room");
                    on_wire.insert(room);
                }
            }
            Step::Command(Some(Command::Leave(room))) => {
                if !shared.holds(&room) && on_wire.remove(&room) {
                    if let Err(e) = conn.send(&ClientFrame::Leave(room.clone())).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    debug!(room = %room, "Left room");
                }
            }
            Step::Frame(None) => return SessionEnd::Lost("closed by server".to_string()),
            Step::Frame(Some(Err(AppError::Decode(e)))) => {
                warn!(error = %e, "Ignoring undecodable push frame");
            }
            Step::Frame(Some(Err(e))) => return SessionEnd::Lost(e.to_string()),
            Step::Frame(Some(Ok(ServerFrame::Event {
                event,
                room,
                payload,
            }))) => shared.dispatch(&PushMessage {
                event,
                room,
                payload,
            }),
            Step::Frame(Some(Ok(ServerFrame::Joined(room)))) => {
                debug!(room = %room, "Server acknowledged join");
            }
            Step::Frame(Some(Ok(ServerFrame::Left(room)))) => {
                debug!(room = %room, "Server acknowledged leave");
            }
        }
    }
}

/// Sleep until `deadline`; returns `true` if shutdown was requested meanwhile.
///
/// Room changes during the wait need no action: rooms are rejoined from the
/// registry on the next connect.
async fn wait_or_shutdown(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    deadline: Instant,
) -> bool {
    loop {
        tokio::select! {
            () = sleep_until(deadline) => return false,
            command = commands.recv() => {
                if matches!(command, None | Some(Command::Shutdown)) {
                    return true;
                }
            }
        }
    }
}
