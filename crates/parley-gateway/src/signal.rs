use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{stream::StreamExt, SinkExt};
use parley_common::envelope_kind;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth;
use crate::db;
use crate::error::ApiError;

pub const WS_OUTBOX_CAPACITY: usize = 256;
pub const MAX_CONNECTIONS_PER_CALL: usize = 2;
const WS_MAX_TEXT_BYTES: usize = 64 * 1024;

const PEER_JOINED_FRAME: &str = r#"{"type":"peer-joined"}"#;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("call {0} already has two connections")]
    CallFull(i64),
    #[error("signaling hub is shut down")]
    ShutDown,
}

struct Peer {
    connection_id: u64,
    user_id: i64,
    outbox: mpsc::Sender<String>,
    kill: mpsc::Sender<()>,
}

/// Receiving ends handed to the connection that registered.
///
/// Both channels close when the hub drops the connection, which is how a
/// sibling's teardown reaches this side.
pub struct PeerChannels {
    pub connection_id: u64,
    pub outbox: mpsc::Receiver<String>,
    pub kill: mpsc::Receiver<()>,
}

/// Outcome of [`SignalingHub::teardown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// This call removed the registry entry; the caller ends the call.
    Removed { siblings_closed: usize },
    /// The entry was already gone (the sibling tore it down first).
    Stale,
}

/// Registry of live signaling connections, keyed by call id.
///
/// Every critical section is O(1) and uses only `try_send`.
#[derive(Default)]
pub struct SignalingHub {
    calls: Mutex<HashMap<i64, Vec<Peer>>>,
    next_connection_id: AtomicU64,
    shut_down: AtomicBool,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, Vec<Peer>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_full(&self, call_id: i64) -> bool {
        self.lock()
            .get(&call_id)
            .is_some_and(|peers| peers.len() >= MAX_CONNECTIONS_PER_CALL)
    }

    pub fn register(&self, call_id: i64, user_id: i64) -> Result<PeerChannels, SignalError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SignalError::ShutDown);
        }

        let (outbox_tx, outbox_rx) = mpsc::channel(WS_OUTBOX_CAPACITY);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;

        let mut calls = self.lock();
        let peers = calls.entry(call_id).or_default();
        if peers.len() >= MAX_CONNECTIONS_PER_CALL {
            return Err(SignalError::CallFull(call_id));
        }
        peers.push(Peer {
            connection_id,
            user_id,
            outbox: outbox_tx,
            kill: kill_tx,
        });

        if peers.len() == MAX_CONNECTIONS_PER_CALL {
            // Queued under the lock so it precedes anything forwarded later.
            for peer in peers.iter() {
                if peer.outbox.try_send(PEER_JOINED_FRAME.to_string()).is_err() {
                    warn!(call_id, connection_id = peer.connection_id, "failed to queue peer-joined");
                }
            }
            info!(call_id, "both participants connected");
        }

        Ok(PeerChannels {
            connection_id,
            outbox: outbox_rx,
            kill: kill_rx,
        })
    }

    /// Queues `frame` verbatim for every other connection of the call.
    pub fn forward(&self, call_id: i64, from: u64, frame: &str) -> usize {
        let calls = self.lock();
        let Some(peers) = calls.get(&call_id) else {
            return 0;
        };

        let mut delivered = 0;
        for peer in peers.iter().filter(|peer| peer.connection_id != from) {
            match peer.outbox.try_send(frame.to_string()) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    call_id,
                    user_id = peer.user_id,
                    "dropping signaling frame: {}",
                    err
                ),
            }
        }
        delivered
    }

    pub fn teardown(&self, call_id: i64, connection_id: u64) -> Teardown {
        let removed = {
            let mut calls = self.lock();
            let is_member = calls
                .get(&call_id)
                .is_some_and(|peers| peers.iter().any(|peer| peer.connection_id == connection_id));
            if !is_member {
                return Teardown::Stale;
            }
            calls.remove(&call_id).unwrap_or_default()
        };

        let mut siblings_closed = 0;
        for peer in removed.iter().filter(|peer| peer.connection_id != connection_id) {
            let _ = peer.kill.try_send(());
            siblings_closed += 1;
        }
        Teardown::Removed { siblings_closed }
    }

    /// Force-closes every registered connection and refuses new ones.
    ///
    /// Returns the ids of the calls that were still registered so the caller
    /// can mark them ended.
    pub fn shutdown(&self) -> Vec<i64> {
        self.shut_down.store(true, Ordering::SeqCst);
        let drained: Vec<(i64, Vec<Peer>)> = self.lock().drain().collect();
        for (_, peers) in &drained {
            for peer in peers {
                let _ = peer.kill.try_send(());
            }
        }
        if !drained.is_empty() {
            info!("signaling hub shut down, closed {} call(s)", drained.len());
        }
        drained.into_iter().map(|(call_id, _)| call_id).collect()
    }

    pub fn active_calls(&self) -> usize {
        self.lock().len()
    }

    pub fn active_connections(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}

#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    #[serde(rename = "messageId")]
    message_id: Option<String>,
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(pool): State<SqlitePool>,
    State(hub): State<Arc<SignalingHub>>,
    Query(query): Query<SignalQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = auth::bearer_token(&headers)
        .map(str::to_owned)
        .or(query.token)
        .ok_or(ApiError::Unauthorized)?;
    let user_id = auth::authenticate(&pool, &token).await?;

    let message_id = auth::parse_message_id(query.message_id.as_deref())?;
    let call = db::get_call_by_message_id(&pool, message_id)
        .await?
        .ok_or(ApiError::NotFound("call"))?;
    if !db::is_participant(&pool, call.conversation_id, user_id).await? {
        return Err(ApiError::Forbidden);
    }
    if !call.is_active() {
        return Err(ApiError::conflict("call has ended"));
    }
    if hub.is_full(call.id) {
        return Err(ApiError::conflict("call already has two participants connected"));
    }

    let call_id = call.id;
    Ok(ws
        .max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, hub, pool, call_id, user_id))
        .into_response())
}

async fn handle_socket(
    socket: WebSocket,
    hub: Arc<SignalingHub>,
    pool: SqlitePool,
    call_id: i64,
    user_id: i64,
) {
    let channels = match hub.register(call_id, user_id) {
        Ok(channels) => channels,
        Err(err) => {
            // Lost the race for the second slot after the pre-upgrade check.
            warn!(call_id, user_id, "rejecting signaling connection: {}", err);
            let _ = socket.close().await;
            return;
        }
    };
    let PeerChannels {
        connection_id,
        mut outbox,
        mut kill,
    } = channels;
    info!(call_id, user_id, connection_id, "signaling connection opened");

    // The call may have been ended between the pre-upgrade check and
    // registration, by a connection whose teardown had already run.
    match db::get_call(&pool, call_id).await {
        Ok(Some(call)) if call.is_active() => {}
        Ok(_) => {
            warn!(call_id, connection_id, "call ended before signaling started, closing");
            hub.teardown(call_id, connection_id);
            let _ = socket.close().await;
            return;
        }
        Err(err) => warn!(call_id, "failed to re-check call state: {:#}", err),
    }

    let (mut sender, mut receiver) = socket.split();
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                let _ = disconnect_tx.try_send(());
                return;
            }
        }
        // Outbox closes once the hub drops this connection.
        let _ = sender.send(Message::Close(None)).await;
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            _ = kill.recv() => {
                info!(call_id, connection_id, "closing signaling connection: peer left");
                break;
            }
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                match msg {
                    Message::Text(text) => match envelope_kind(&text) {
                        Ok(kind) => {
                            let delivered = hub.forward(call_id, connection_id, &text);
                            debug!(call_id, connection_id, kind = %kind, delivered, "forwarded signal");
                        }
                        Err(err) => {
                            warn!(call_id, connection_id, "dropping malformed signaling frame: {}", err);
                        }
                    },
                    Message::Binary(_) => {
                        warn!(call_id, connection_id, "dropping binary signaling frame");
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    // Losing either connection ends the call. The row is stamped before the
    // registry entry is released, so a connection that registers afterwards
    // sees the call as ended.
    end_call(&pool, call_id).await;
    match hub.teardown(call_id, connection_id) {
        Teardown::Removed { siblings_closed } => {
            info!(call_id, connection_id, siblings_closed, "signaling connection closed");
        }
        Teardown::Stale => {
            debug!(call_id, connection_id, "signaling connection closed after sibling teardown");
        }
    }

    let _ = writer.await;
}

/// Stamps `ended_at` if it is still open. Safe to call from every exit path.
pub async fn end_call(pool: &SqlitePool, call_id: i64) {
    match db::end_call(pool, call_id).await {
        Ok(true) => info!(call_id, "call ended"),
        Ok(false) => debug!(call_id, "call was already ended"),
        Err(err) => warn!(call_id, "failed to mark call ended: {:#}", err),
    }
}
