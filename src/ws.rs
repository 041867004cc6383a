//! Pub/sub transport pool.
//!
//! Up to `MAX_WEBSOCKETS` subscriber connections, each limited to
//! `WS_TOPICS_LIMIT` topics, with ping/pong liveness, LISTEN/UNLISTEN topic
//! diffing, reconnect with backoff, and topic compaction on removal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::auth::AuthState;
use crate::constants::{
    BACKOFF_MAX, MAX_WEBSOCKETS, PING_INTERVAL, PING_TIMEOUT, PUBSUB_URL, WS_TOPICS_LIMIT,
};
use crate::error::{MinerError, Result};
use crate::ui::CloseSignal;
use crate::utils::{create_nonce, ExponentialBackoff, CHARS_ASCII};

// =============================================================================
// Topics
// =============================================================================

/// The topic kinds the miner subscribes to. Dispatch is a match on this
/// variant, not a string lookup at handling time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    UserDrops,
    UserCommunityPoints,
    UserNotifications,
    ChannelStreamState,
    ChannelStreamUpdate,
}

impl TopicKind {
    /// The platform's wire name for this topic kind.
    pub fn platform_name(self) -> &'static str {
        match self {
            Self::UserDrops => "user-drop-events",
            Self::UserCommunityPoints => "community-points-user-v1",
            Self::UserNotifications => "onsite-notifications",
            Self::ChannelStreamState => "video-playback-by-id",
            Self::ChannelStreamUpdate => "broadcast-settings-update",
        }
    }

    pub fn from_platform_name(name: &str) -> Option<Self> {
        match name {
            "user-drop-events" => Some(Self::UserDrops),
            "community-points-user-v1" => Some(Self::UserCommunityPoints),
            "onsite-notifications" => Some(Self::UserNotifications),
            "video-playback-by-id" => Some(Self::ChannelStreamState),
            "broadcast-settings-update" => Some(Self::ChannelStreamUpdate),
            _ => None,
        }
    }
}

/// A pub/sub topic. Equality and hashing use `(kind, target_id)` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WsTopic {
    pub kind: TopicKind,
    pub target_id: u64,
}

impl WsTopic {
    pub fn new(kind: TopicKind, target_id: u64) -> Self {
        Self { kind, target_id }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (name, target) = s.rsplit_once('.')?;
        Some(Self {
            kind: TopicKind::from_platform_name(name)?,
            target_id: target.parse().ok()?,
        })
    }
}

impl fmt::Display for WsTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.platform_name(), self.target_id)
    }
}

// =============================================================================
// Events
// =============================================================================

/// A decoded pub/sub event, dispatched to the orchestrator.
#[derive(Debug, Clone)]
pub enum WsEvent {
    DropProgress {
        drop_id: String,
        current_minutes: u32,
    },
    DropClaim {
        drop_id: String,
        drop_instance_id: String,
    },
    PointsEarned {
        channel_id: u64,
        points: u64,
        balance: u64,
    },
    PointsClaimAvailable {
        channel_id: u64,
        claim_id: String,
    },
    DropReminderNotification {
        notification_id: String,
    },
    StreamUp {
        channel_id: u64,
    },
    StreamDown {
        channel_id: u64,
    },
    ViewCount {
        channel_id: u64,
        viewers: u64,
    },
    StreamUpdate {
        channel_id: u64,
    },
}

/// Decode the inner payload of a MESSAGE frame for the given topic.
/// Unknown or irrelevant payloads decode to `None`.
pub fn decode_event(topic: &WsTopic, payload: &Value) -> Option<WsEvent> {
    let msg_type = payload.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match topic.kind {
        TopicKind::UserDrops => match msg_type {
            "drop-progress" => Some(WsEvent::DropProgress {
                drop_id: payload.pointer("/data/drop_id")?.as_str()?.to_string(),
                current_minutes: payload
                    .pointer("/data/current_progress_min")?
                    .as_u64()? as u32,
            }),
            "drop-claim" => Some(WsEvent::DropClaim {
                drop_id: payload.pointer("/data/drop_id")?.as_str()?.to_string(),
                drop_instance_id: payload
                    .pointer("/data/drop_instance_id")?
                    .as_str()?
                    .to_string(),
            }),
            _ => None,
        },
        TopicKind::UserCommunityPoints => match msg_type {
            "points-earned" => Some(WsEvent::PointsEarned {
                channel_id: parse_id(payload.pointer("/data/channel_id")?)?,
                points: payload.pointer("/data/point_gain/total_points")?.as_u64()?,
                balance: payload.pointer("/data/balance/balance")?.as_u64()?,
            }),
            "claim-available" => Some(WsEvent::PointsClaimAvailable {
                channel_id: parse_id(payload.pointer("/data/claim/channel_id")?)?,
                claim_id: payload.pointer("/data/claim/id")?.as_str()?.to_string(),
            }),
            _ => None,
        },
        TopicKind::UserNotifications => {
            if msg_type != "create-notification" {
                return None;
            }
            let notification = payload.pointer("/data/notification")?;
            if notification.get("type")?.as_str()? != "user_drop_reward_reminder_notification" {
                return None;
            }
            Some(WsEvent::DropReminderNotification {
                notification_id: notification.get("id")?.as_str()?.to_string(),
            })
        }
        TopicKind::ChannelStreamState => match msg_type {
            "stream-up" => Some(WsEvent::StreamUp {
                channel_id: topic.target_id,
            }),
            "stream-down" => Some(WsEvent::StreamDown {
                channel_id: topic.target_id,
            }),
            "viewcount" => Some(WsEvent::ViewCount {
                channel_id: topic.target_id,
                viewers: payload.get("viewers")?.as_u64()?,
            }),
            // "commercial" and friends are intentionally ignored
            _ => None,
        },
        TopicKind::ChannelStreamUpdate => Some(WsEvent::StreamUpdate {
            channel_id: topic.target_id,
        }),
    }
}

fn parse_id(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

// =============================================================================
// Wire messages
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum OutgoingMessage {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "LISTEN")]
    Listen { nonce: String, data: TopicsData },
    #[serde(rename = "UNLISTEN")]
    Unlisten { nonce: String, data: TopicsData },
}

#[derive(Debug, Clone, Serialize)]
struct TopicsData {
    topics: Vec<String>,
    auth_token: String,
}

// =============================================================================
// Connection
// =============================================================================

/// Per-connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

/// State shared between the pool and a connection's task.
struct ConnShared {
    idx: usize,
    /// Topics assigned to this connection, keyed by wire string.
    topics: Mutex<HashMap<String, WsTopic>>,
    topics_changed: Notify,
    state: Mutex<ConnState>,
    stop: watch::Sender<bool>,
    has_task: std::sync::atomic::AtomicBool,
}

impl ConnShared {
    fn new(idx: usize) -> Self {
        let (stop, _rx) = watch::channel(false);
        Self {
            idx,
            topics: Mutex::new(HashMap::new()),
            topics_changed: Notify::new(),
            state: Mutex::new(ConnState::Disconnected),
            stop,
            has_task: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn topic_count(&self) -> usize {
        self.topics.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn set_state(&self, state: ConnState) {
        if let Ok(mut current) = self.state.lock() {
            if *current != state {
                tracing::info!("Websocket[{}]: {:?} -> {:?}", self.idx, *current, state);
                *current = state;
            }
        }
    }

    /// Take topics into this connection up to the per-connection limit.
    /// Drains from `pending`; returns true when the set changed.
    fn take_topics(&self, pending: &mut Vec<WsTopic>) -> bool {
        let Ok(mut topics) = self.topics.lock() else {
            return false;
        };
        let mut changed = false;
        while topics.len() < WS_TOPICS_LIMIT {
            let Some(topic) = pending.pop() else {
                break;
            };
            topics.insert(topic.to_string(), topic);
            changed = true;
        }
        changed
    }

    fn remove_topics(&self, names: &HashSet<String>) -> bool {
        let Ok(mut topics) = self.topics.lock() else {
            return false;
        };
        let before = topics.len();
        topics.retain(|name, _| !names.contains(name));
        topics.len() != before
    }
}

async fn run_connection(
    shared: Arc<ConnShared>,
    auth: Arc<AuthState>,
    close: CloseSignal,
    event_tx: mpsc::UnboundedSender<WsEvent>,
) {
    let mut backoff = ExponentialBackoff::new(BACKOFF_MAX);
    let mut stop_rx = shared.stop.subscribe();
    loop {
        if *stop_rx.borrow_and_update() || close.is_closed() {
            break;
        }
        shared.set_state(ConnState::Connecting);
        let connected = tokio::select! {
            result = connect_async(PUBSUB_URL) => result,
            _ = stop_rx.changed() => break,
            _ = close.closed() => break,
        };
        match connected {
            Ok((stream, _)) => {
                backoff.reset();
                shared.set_state(ConnState::Connected);
                tracing::info!("Websocket[{}] connected", shared.idx);
                match handle_connection(&shared, &auth, &close, &event_tx, stream).await {
                    // the local side closed it - exit
                    Ok(()) => {
                        shared.set_state(ConnState::Disconnected);
                        tracing::info!("Websocket[{}] stopped", shared.idx);
                        return;
                    }
                    Err(MinerError::WebsocketClosed { received }) => {
                        if received {
                            tracing::warn!("Websocket[{}] closed unexpectedly", shared.idx);
                        }
                        shared.set_state(ConnState::Reconnecting);
                        tracing::warn!("Websocket[{}] reconnecting...", shared.idx);
                    }
                    Err(e) => {
                        tracing::warn!("Websocket[{}] error: {e}, reconnecting...", shared.idx);
                        shared.set_state(ConnState::Reconnecting);
                    }
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::info!(
                    "Websocket[{}] connection problem (sleep: {}s): {e}",
                    shared.idx,
                    delay.as_secs()
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => break,
                    _ = close.closed() => break,
                }
            }
        }
    }
    shared.set_state(ConnState::Disconnected);
}

/// Drive one connected websocket until it stops or fails.
///
/// `Ok(())` means the local side closed it; `WebsocketClosed { received }`
/// says whether the remote closed the transport (reconnect either way).
async fn handle_connection(
    shared: &ConnShared,
    auth: &AuthState,
    close: &CloseSignal,
    event_tx: &mpsc::UnboundedSender<WsEvent>,
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Result<()> {
    let (mut write, mut read) = stream.split();
    let mut stop_rx = shared.stop.subscribe();
    // topics are re-submitted from scratch on every (re)connect
    let mut submitted: HashSet<String> = HashSet::new();
    let mut next_ping = Instant::now();
    let mut pong_deadline: Option<Instant> = None;
    // run an immediate diff to subscribe whatever is assigned
    shared.topics_changed.notify_one();

    loop {
        let ping_wake = pong_deadline.map_or(next_ping, |deadline| deadline.min(next_ping));
        tokio::select! {
            _ = sleep_until(ping_wake) => {
                let now = Instant::now();
                if let Some(deadline) = pong_deadline {
                    if now >= deadline {
                        tracing::warn!("Websocket[{}] didn't receive a PONG, reconnecting...", shared.idx);
                        return Err(MinerError::WebsocketClosed { received: false });
                    }
                }
                if now >= next_ping {
                    let ping = serde_json::to_string(&OutgoingMessage::Ping).unwrap_or_default();
                    if write.send(Message::Text(ping)).await.is_err() {
                        return Err(MinerError::WebsocketClosed { received: false });
                    }
                    next_ping = now + PING_INTERVAL;
                    pong_deadline = Some(now + PING_TIMEOUT);
                }
            }
            _ = shared.topics_changed.notified() => {
                let current: HashMap<String, WsTopic> = match shared.topics.lock() {
                    Ok(topics) => topics.clone(),
                    Err(_) => continue,
                };
                let auth_token = auth.access_token().unwrap_or_default();
                let removed: Vec<String> = submitted
                    .iter()
                    .filter(|name| !current.contains_key(*name))
                    .cloned()
                    .collect();
                if !removed.is_empty() {
                    tracing::debug!("Websocket[{}]: removing topics: {}", shared.idx, removed.join(", "));
                    let msg = OutgoingMessage::Unlisten {
                        nonce: create_nonce(CHARS_ASCII, 30),
                        data: TopicsData { topics: removed.clone(), auth_token: auth_token.clone() },
                    };
                    let json = serde_json::to_string(&msg).unwrap_or_default();
                    if write.send(Message::Text(json)).await.is_err() {
                        return Err(MinerError::WebsocketClosed { received: false });
                    }
                    for name in &removed {
                        submitted.remove(name);
                    }
                }
                let added: Vec<String> = current
                    .keys()
                    .filter(|name| !submitted.contains(*name))
                    .cloned()
                    .collect();
                if !added.is_empty() {
                    tracing::debug!("Websocket[{}]: adding topics: {}", shared.idx, added.join(", "));
                    let msg = OutgoingMessage::Listen {
                        nonce: create_nonce(CHARS_ASCII, 30),
                        data: TopicsData { topics: added.clone(), auth_token },
                    };
                    let json = serde_json::to_string(&msg).unwrap_or_default();
                    if write.send(Message::Text(json)).await.is_err() {
                        return Err(MinerError::WebsocketClosed { received: false });
                    }
                    submitted.extend(added);
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Websocket[{}] received: {text}", shared.idx);
                        match serde_json::from_str::<Value>(&text) {
                            Ok(frame) => {
                                match handle_frame(shared, event_tx, &frame, &mut pong_deadline) {
                                    FrameAction::Continue => {}
                                    FrameAction::Reconnect => {
                                        return Err(MinerError::WebsocketClosed { received: false })
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Websocket[{}] bad frame: {e}", shared.idx);
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        // server closed the connection, not us
                        tracing::debug!("Websocket[{}] close frame: {frame:?}", shared.idx);
                        return Err(MinerError::WebsocketClosed { received: true });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Websocket[{}] error: {e}", shared.idx);
                        return Err(MinerError::WebsocketClosed { received: false });
                    }
                    None => return Err(MinerError::WebsocketClosed { received: false }),
                }
            }
            _ = stop_rx.changed() => {
                shared.set_state(ConnState::Disconnecting);
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = close.closed() => {
                shared.set_state(ConnState::Disconnecting);
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

enum FrameAction {
    Continue,
    Reconnect,
}

fn handle_frame(
    shared: &ConnShared,
    event_tx: &mpsc::UnboundedSender<WsEvent>,
    frame: &Value,
    pong_deadline: &mut Option<Instant>,
) -> FrameAction {
    match frame.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "PONG" => {
            *pong_deadline = None;
        }
        "RESPONSE" => {
            if let Some(error) = frame.get("error").and_then(|v| v.as_str()) {
                if !error.is_empty() {
                    tracing::warn!("Websocket[{}] response error: {error}", shared.idx);
                }
            }
        }
        "MESSAGE" => {
            let topic_str = frame.pointer("/data/topic").and_then(|v| v.as_str());
            let message = frame.pointer("/data/message").and_then(|v| v.as_str());
            if let (Some(topic_str), Some(message)) = (topic_str, message) {
                let known = shared
                    .topics
                    .lock()
                    .ok()
                    .and_then(|topics| topics.get(topic_str).copied());
                match known {
                    Some(topic) => {
                        if let Ok(payload) = serde_json::from_str::<Value>(message) {
                            if let Some(event) = decode_event(&topic, &payload) {
                                let _ = event_tx.send(event);
                            }
                        }
                    }
                    None => {
                        tracing::warn!(
                            "Websocket[{}] message for unassigned topic: {topic_str}",
                            shared.idx
                        );
                    }
                }
            }
        }
        "RECONNECT" => {
            tracing::warn!("Websocket[{}] requested reconnect", shared.idx);
            return FrameAction::Reconnect;
        }
        other => {
            tracing::warn!("Websocket[{}] unknown payload type: {other}", shared.idx);
        }
    }
    FrameAction::Continue
}

// =============================================================================
// Pool
// =============================================================================

/// A pool of subscriber connections with automatic topic distribution.
pub struct WsPool {
    auth: Arc<AuthState>,
    close: CloseSignal,
    event_tx: mpsc::UnboundedSender<WsEvent>,
    connections: Mutex<Vec<Arc<ConnShared>>>,
    running: Mutex<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WsPool {
    pub fn new(auth: Arc<AuthState>, close: CloseSignal) -> (Self, mpsc::UnboundedReceiver<WsEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                auth,
                close,
                event_tx,
                connections: Mutex::new(Vec::new()),
                running: Mutex::new(false),
                tasks: Mutex::new(Vec::new()),
            },
            event_rx,
        )
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().map(|r| *r).unwrap_or(false)
    }

    /// Start tasks for every connection that doesn't have one yet.
    pub fn start(&self) {
        use std::sync::atomic::Ordering;
        if let Ok(mut running) = self.running.lock() {
            *running = true;
        }
        let connections = match self.connections.lock() {
            Ok(conns) => conns.clone(),
            Err(_) => return,
        };
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            for shared in connections {
                if shared.has_task.swap(true, Ordering::SeqCst) {
                    continue;
                }
                shared.stop.send_replace(false);
                let auth = self.auth.clone();
                let close = self.close.clone();
                let event_tx = self.event_tx.clone();
                tasks.push(tokio::spawn(async move {
                    run_connection(shared.clone(), auth, close, event_tx).await;
                    shared.has_task.store(false, Ordering::SeqCst);
                }));
            }
        }
    }

    /// Stop every connection; optionally forget their topics too.
    pub async fn stop(&self, clear_topics: bool) {
        if let Ok(mut running) = self.running.lock() {
            *running = false;
        }
        let connections = match self.connections.lock() {
            Ok(conns) => conns.clone(),
            Err(_) => return,
        };
        for conn in &connections {
            conn.stop.send_replace(true);
            if clear_topics {
                if let Ok(mut topics) = conn.topics.lock() {
                    topics.clear();
                }
            }
        }
        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => return,
        };
        for task in tasks {
            let _ = task.await;
        }
        if clear_topics {
            if let Ok(mut conns) = self.connections.lock() {
                conns.clear();
            }
        }
    }

    /// Insert new topics, preferring to fill partially-loaded connections;
    /// new connections spin up as needed. Fails when the pool capacity
    /// (`MAX_WEBSOCKETS x WS_TOPICS_LIMIT`) would be exceeded.
    pub fn add_topics(&self, topics: impl IntoIterator<Item = WsTopic>) -> Result<()> {
        // dedupe against every connection's assigned topics
        let existing: HashSet<WsTopic> = {
            let connections = self
                .connections
                .lock()
                .map_err(|_| MinerError::miner("websocket pool poisoned"))?;
            connections
                .iter()
                .flat_map(|c| {
                    c.topics
                        .lock()
                        .map(|t| t.values().copied().collect::<Vec<_>>())
                        .unwrap_or_default()
                })
                .collect()
        };
        let mut pending: Vec<WsTopic> = topics
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|t| !existing.contains(t))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        {
            let mut connections = self
                .connections
                .lock()
                .map_err(|_| MinerError::miner("websocket pool poisoned"))?;
            for idx in 0..MAX_WEBSOCKETS {
                if pending.is_empty() {
                    break;
                }
                if idx >= connections.len() {
                    connections.push(Arc::new(ConnShared::new(idx)));
                }
                let conn = &connections[idx];
                if conn.take_topics(&mut pending) {
                    conn.topics_changed.notify_one();
                }
            }
        }
        // newly created connections get their tasks here
        if self.is_running() {
            self.start();
        }
        if !pending.is_empty() {
            return Err(MinerError::miner("maximum topics limit has been reached"));
        }
        Ok(())
    }

    /// Delete topics by wire-string identity, then compact: while the
    /// remaining topics fit on one fewer connection, stop the last
    /// connection and redistribute its topics over the others.
    pub fn remove_topics(&self, names: impl IntoIterator<Item = String>) -> Result<()> {
        let names: HashSet<String> = names.into_iter().collect();
        if names.is_empty() {
            return Ok(());
        }
        let mut recycled: Vec<WsTopic> = Vec::new();
        {
            let mut connections = self
                .connections
                .lock()
                .map_err(|_| MinerError::miner("websocket pool poisoned"))?;
            for conn in connections.iter() {
                if conn.remove_topics(&names) {
                    conn.topics_changed.notify_one();
                }
            }
            loop {
                let total: usize = connections.iter().map(|c| c.topic_count()).sum();
                if connections.len() <= 1 || total > (connections.len() - 1) * WS_TOPICS_LIMIT {
                    break;
                }
                let conn = match connections.pop() {
                    Some(conn) => conn,
                    None => break,
                };
                if let Ok(mut topics) = conn.topics.lock() {
                    recycled.extend(topics.values().copied());
                    topics.clear();
                }
                conn.stop.send_replace(true);
            }
        }
        if !recycled.is_empty() {
            self.add_topics(recycled)?;
        }
        Ok(())
    }

    pub fn topic_count(&self) -> usize {
        self.connections
            .lock()
            .map(|conns| conns.iter().map(|c| c.topic_count()).sum())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn per_connection_counts(&self) -> Vec<usize> {
        self.connections
            .lock()
            .map(|conns| conns.iter().map(|c| c.topic_count()).collect())
            .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================
