//! WebSocket subscriber fan-out.
//!
//! Manages authenticated subscriber connections: channel subscriptions,
//! per-subscriber monotonic sequence numbers, message rate limiting with
//! strike-based disconnects, and the 30-second heartbeat sweep. Outbound
//! delivery goes through one unbounded queue per subscriber drained by its
//! writer task, so a broadcast never suspends inside the subscriber table.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::engine::analyzer::TransactionPoint;
use crate::engine::baseline::BaselineSummary;
use crate::models::PipelineStats;

/// The price update channel name.
pub const PRICE_CHANNEL: &str = "price";

/// Consecutive rate-limited messages before the connection is closed.
const MAX_RATE_STRIKES: u32 = 3;

/// Missed heartbeats before the connection is closed.
const MAX_MISSED_PONGS: u32 = 3;

/// Inactivity ceiling.
const IDLE_TIMEOUT_SECS: f64 = 90.0;

/// One sweep period of inactivity counts as a missed heartbeat.
const SWEEP_PERIOD_SECS: f64 = 30.0;

/// Messages a subscriber may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        channels: Vec<String>,
    },
    Unsubscribe {
        channels: Vec<String>,
    },
    Ping {
        sequence: u64,
    },
    /// Accepted for forward compatibility; answered with an error until a
    /// collaborator defines its semantics.
    HistoricalRequest {
        #[serde(flatten)]
        request: serde_json::Map<String, serde_json::Value>,
    },
}

/// Messages the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPayload {
    Ack {
        subscribed_channels: Vec<String>,
        server_time: i64,
        request_sequence: u64,
    },
    Pong {
        ping_sequence: u64,
        server_time: i64,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    Update {
        price: f64,
        confidence: f64,
        transactions: Vec<TransactionPoint>,
        stats: PipelineStats,
        #[serde(skip_serializing_if = "Option::is_none")]
        baseline: Option<BaselineSummary>,
    },
}

/// Common outbound envelope: payload plus sequence and server timestamp.
#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    payload: &'a ServerPayload,
    sequence: u64,
    timestamp: i64,
}

struct SubscriberState {
    subject: String,
    sender: mpsc::UnboundedSender<Message>,
    sequence: u64,
    channels: HashSet<String>,
    last_activity: f64,
    missed_pongs: u32,
    rate_strikes: u32,
}

#[derive(Default)]
struct Inner {
    subscribers: HashMap<Uuid, SubscriberState>,
    channels: HashMap<String, HashSet<Uuid>>,
}

/// Per-manager statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_connections: usize,
    pub channels: HashMap<String, usize>,
}

pub struct ConnectionManager {
    inner: Mutex<Inner>,
    accepting: AtomicBool,
    max_subscribers: usize,
}

impl ConnectionManager {
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            accepting: AtomicBool::new(true),
            max_subscribers,
        }
    }

    /// First step of shutdown: refuse new handshakes.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Register a new subscriber; the receiver feeds its writer task.
    pub fn register(
        &self,
        subject: String,
        now: f64,
    ) -> Option<(Uuid, mpsc::UnboundedReceiver<Message>)> {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }

        let mut inner = self.inner.lock();
        if inner.subscribers.len() >= self.max_subscribers {
            warn!(
                cap = self.max_subscribers,
                "Subscriber table full, refusing connection"
            );
            return None;
        }

        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();
        inner.subscribers.insert(
            id,
            SubscriberState {
                subject,
                sender,
                sequence: 0,
                channels: HashSet::new(),
                last_activity: now,
                missed_pongs: 0,
                rate_strikes: 0,
            },
        );
        Some((id, receiver))
    }

    pub fn unregister(&self, id: Uuid) {
        let mut inner = self.inner.lock();
        remove_subscriber(&mut inner, id);
    }

    /// Add channels; returns the full current subscription set.
    pub fn subscribe(&self, id: Uuid, channels: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock();
        if !inner.subscribers.contains_key(&id) {
            return Vec::new();
        }
        for channel in channels {
            inner
                .channels
                .entry(channel.clone())
                .or_default()
                .insert(id);
        }
        let Some(subscriber) = inner.subscribers.get_mut(&id) else {
            return Vec::new();
        };
        for channel in channels {
            subscriber.channels.insert(channel.clone());
        }
        subscriber.channels.iter().cloned().collect()
    }

    /// Remove channels; returns the remaining subscription set.
    pub fn unsubscribe(&self, id: Uuid, channels: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock();
        for channel in channels {
            if let Some(members) = inner.channels.get_mut(channel) {
                members.remove(&id);
                if members.is_empty() {
                    inner.channels.remove(channel);
                }
            }
        }
        let Some(subscriber) = inner.subscribers.get_mut(&id) else {
            return Vec::new();
        };
        for channel in channels {
            subscriber.channels.remove(channel);
        }
        subscriber.channels.iter().cloned().collect()
    }

    pub fn touch(&self, id: Uuid, now: f64) {
        if let Some(subscriber) = self.inner.lock().subscribers.get_mut(&id) {
            subscriber.last_activity = now;
        }
    }

    pub fn reset_missed_pongs(&self, id: Uuid) {
        if let Some(subscriber) = self.inner.lock().subscribers.get_mut(&id) {
            subscriber.missed_pongs = 0;
        }
    }

    /// Record one rate-limited message; returns the consecutive count.
    pub fn record_rate_strike(&self, id: Uuid) -> u32 {
        let mut inner = self.inner.lock();
        match inner.subscribers.get_mut(&id) {
            Some(subscriber) => {
                subscriber.rate_strikes += 1;
                subscriber.rate_strikes
            }
            None => 0,
        }
    }

    pub fn clear_rate_strikes(&self, id: Uuid) {
        if let Some(subscriber) = self.inner.lock().subscribers.get_mut(&id) {
            subscriber.rate_strikes = 0;
        }
    }

    /// Send one payload to one subscriber. Assigns the next sequence number;
    /// a dead outbound queue disconnects the subscriber.
    pub fn send_payload(&self, id: Uuid, payload: &ServerPayload) -> bool {
        let mut inner = self.inner.lock();
        if !send_locked(&mut inner, id, payload) {
            remove_subscriber(&mut inner, id);
            return false;
        }
        true
    }

    /// Enqueue one payload to every member of a channel; failed sends
    /// disconnect only the failing subscriber.
    pub fn broadcast_to_channel(&self, channel: &str, payload: &ServerPayload) -> usize {
        let mut inner = self.inner.lock();
        let Some(members) = inner.channels.get(channel) else {
            return 0;
        };
        let members: Vec<Uuid> = members.iter().copied().collect();

        let mut delivered = 0;
        for id in members {
            if send_locked(&mut inner, id, payload) {
                delivered += 1;
            } else {
                remove_subscriber(&mut inner, id);
            }
        }
        delivered
    }

    /// Close connections that went quiet: three missed heartbeats or 90
    /// seconds of silence. One sweep period without activity counts as a
    /// missed heartbeat.
    pub fn heartbeat_sweep(&self, now: f64) -> usize {
        let mut inner = self.inner.lock();

        let mut to_close = Vec::new();
        for (id, subscriber) in inner.subscribers.iter_mut() {
            let idle = now - subscriber.last_activity;
            if subscriber.missed_pongs >= MAX_MISSED_PONGS || idle > IDLE_TIMEOUT_SECS {
                to_close.push(*id);
            } else if idle >= SWEEP_PERIOD_SECS {
                subscriber.missed_pongs += 1;
            }
        }

        for id in &to_close {
            if let Some(subscriber) = inner.subscribers.get(id) {
                info!(subscriber = %id, subject = %subscriber.subject, "Heartbeat timeout");
                let _ = subscriber.sender.send(Message::Close(Some(CloseFrame {
                    code: 1000,
                    reason: "heartbeat timeout".into(),
                })));
            }
            remove_subscriber(&mut inner, *id);
        }
        to_close.len()
    }

    /// Final step of shutdown: close every connection.
    pub fn close_all(&self, reason: &str) {
        let mut inner = self.inner.lock();
        let ids: Vec<Uuid> = inner.subscribers.keys().copied().collect();
        for id in ids {
            if let Some(subscriber) = inner.subscribers.get(&id) {
                let _ = subscriber.sender.send(Message::Close(Some(CloseFrame {
                    code: 1001,
                    reason: reason.to_string().into(),
                })));
            }
            remove_subscriber(&mut inner, id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn stats(&self) -> ManagerStats {
        let inner = self.inner.lock();
        ManagerStats {
            total_connections: inner.subscribers.len(),
            channels: inner
                .channels
                .iter()
                .map(|(name, members)| (name.clone(), members.len()))
                .collect(),
        }
    }
}

fn send_locked(inner: &mut Inner, id: Uuid, payload: &ServerPayload) -> bool {
    let Some(subscriber) = inner.subscribers.get_mut(&id) else {
        return false;
    };
    subscriber.sequence += 1;
    let now = chrono::Utc::now().timestamp_millis();
    // Delivery counts as activity, like inbound messages do.
    subscriber.last_activity = now as f64 / 1000.0;
    let envelope = Envelope {
        payload,
        sequence: subscriber.sequence,
        timestamp: now,
    };
    let text = match serde_json::to_string(&envelope) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to serialize outbound message");
            return true;
        }
    };
    subscriber.sender.send(Message::Text(text)).is_ok()
}

fn remove_subscriber(inner: &mut Inner, id: Uuid) {
    if let Some(subscriber) = inner.subscribers.remove(&id) {
        for channel in subscriber.channels {
            if let Some(members) = inner.channels.get_mut(&channel) {
                members.remove(&id);
                if members.is_empty() {
                    inner.channels.remove(&channel);
                }
            }
        }
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn server_time_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

/// WebSocket endpoint: connection-attempt budget, then token validation,
/// then the upgrade.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsAuthQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let ip = addr.ip();

    if !state.rate_limiter.check_connection_attempt(ip) {
        warn!(ip = %ip, "Connection attempt budget exhausted");
        return (StatusCode::TOO_MANY_REQUESTS, "too many connection attempts").into_response();
    }

    let Some(token) = query.token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let claims = match state.jwt.validate(&token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(ip = %ip, error = %e, "WebSocket auth failed");
            return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims.sub, ip))
}

async fn handle_socket(socket: WebSocket, state: AppState, subject: String, ip: IpAddr) {
    let Some((id, mut outbound)) = state.manager.register(subject.clone(), now_seconds()) else {
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1013,
                reason: "server at capacity".into(),
            })))
            .await;
        return;
    };

    info!(subscriber = %id, subject = %subject, ip = %ip, "Subscriber connected");

    let (mut sink, mut stream) = socket.split();

    // Writer: drains the outbound queue until the manager drops the sender.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    state.manager.send_payload(
        id,
        &ServerPayload::Ack {
            subscribed_channels: Vec::new(),
            server_time: server_time_millis(),
            request_sequence: 0,
        },
    );

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let now = now_seconds();
                state.manager.touch(id, now);

                if !state.rate_limiter.check_ws_message(id) {
                    let strikes = state.manager.record_rate_strike(id);
                    state.manager.send_payload(
                        id,
                        &ServerPayload::Error {
                            code: "rate_limited".to_string(),
                            message: "Too many messages, please slow down".to_string(),
                            retry_after: Some(1),
                        },
                    );
                    if strikes >= MAX_RATE_STRIKES {
                        warn!(subscriber = %id, "Closing connection after repeated rate abuse");
                        break;
                    }
                    continue;
                }
                state.manager.clear_rate_strikes(id);

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => handle_client_message(&state, id, message),
                    Err(e) => {
                        debug!(subscriber = %id, error = %e, "Invalid client message");
                        state.manager.send_payload(
                            id,
                            &ServerPayload::Error {
                                code: "invalid_message".to_string(),
                                message: e.to_string(),
                                retry_after: None,
                            },
                        );
                    }
                }
            }
            Message::Ping(_) | Message::Pong(_) => {
                state.manager.touch(id, now_seconds());
            }
            Message::Close(_) => break,
            Message::Binary(_) => {}
        }
    }

    info!(subscriber = %id, "Subscriber disconnected");
    state.manager.unregister(id);
    state.rate_limiter.remove_ws(id);
    let _ = writer.await;
}

fn handle_client_message(state: &AppState, id: Uuid, message: ClientMessage) {
    match message {
        ClientMessage::Subscribe { channels } => {
            let subscribed = state.manager.subscribe(id, &channels);
            debug!(subscriber = %id, ?channels, "Subscribed");
            state.manager.send_payload(
                id,
                &ServerPayload::Ack {
                    subscribed_channels: subscribed,
                    server_time: server_time_millis(),
                    request_sequence: 0,
                },
            );
        }
        ClientMessage::Unsubscribe { channels } => {
            let subscribed = state.manager.unsubscribe(id, &channels);
            debug!(subscriber = %id, ?channels, "Unsubscribed");
            state.manager.send_payload(
                id,
                &ServerPayload::Ack {
                    subscribed_channels: subscribed,
                    server_time: server_time_millis(),
                    request_sequence: 0,
                },
            );
        }
        ClientMessage::Ping { sequence } => {
            state.manager.reset_missed_pongs(id);
            state.manager.send_payload(
                id,
                &ServerPayload::Pong {
                    ping_sequence: sequence,
                    server_time: server_time_millis(),
                },
            );
        }
        ClientMessage::HistoricalRequest { request } => {
            info!(subscriber = %id, keys = request.len(), "Historical request (unhandled)");
            state.manager.send_payload(
                id,
                &ServerPayload::Error {
                    code: "unsupported".to_string(),
                    message: "historical requests are not served here".to_string(),
                    retry_after: None,
                },
            );
        }
    }
}
