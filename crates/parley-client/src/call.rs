//! Joins a call: fetches relay config, builds the peer, starts the session
//! actor and connects it to the signaling socket.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use parley_common::{CallConfigResponse, CallSignal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::GatewayClient;
use crate::session::{
    self, CallSession, CallStatus, PeerConnection, SessionConfig, SessionEvent, SessionHandle,
    DEFAULT_TRICKLE_DELAY,
};
use crate::signaling;

const OUTGOING_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub message_id: i64,
    pub initiator: bool,
    pub trickle_delay: Duration,
}

impl CallOptions {
    pub fn new(message_id: i64, initiator: bool) -> Self {
        Self {
            message_id,
            initiator,
            trickle_delay: DEFAULT_TRICKLE_DELAY,
        }
    }
}

pub struct ActiveCall {
    pub handle: SessionHandle,
    pub session: JoinHandle<CallStatus>,
}

impl ActiveCall {
    pub fn hangup(&self) {
        self.handle.hangup();
    }

    /// Waits for the session actor to finish and returns its final status.
    pub async fn finished(self) -> Result<CallStatus> {
        Ok(self.session.await?)
    }
}

/// Joins the call anchored at `options.message_id`.
///
/// `make_peer` receives the relay configuration and the session's event
/// sender so the peer's callbacks can report candidates and state changes.
pub async fn join_call<P, F, Fut>(
    gateway: &GatewayClient,
    options: CallOptions,
    make_peer: F,
) -> Result<ActiveCall>
where
    P: PeerConnection,
    F: FnOnce(CallConfigResponse, mpsc::Sender<SessionEvent>) -> Fut,
    Fut: Future<Output = Result<P>>,
{
    let config = gateway
        .call_config()
        .await
        .context("failed to fetch call config")?;

    let (handle, inbox) = session::channel();
    let peer = make_peer(config, handle.events()).await?;

    let (outgoing_tx, outgoing_rx) = mpsc::channel::<CallSignal>(OUTGOING_CAPACITY);
    let session_config = SessionConfig {
        initiator: options.initiator,
        trickle_delay: options.trickle_delay,
    };
    let session = tokio::spawn(CallSession::new(peer, session_config, inbox, outgoing_tx).run());

    let url = gateway.signal_url(options.message_id)?;
    let ws = match signaling::connect(&url).await {
        Ok(ws) => ws,
        Err(err) => {
            handle.hangup();
            return Err(err.context("failed to connect signaling socket"));
        }
    };
    handle.send(SessionEvent::SocketOpened).await?;
    tokio::spawn(signaling::run(ws, outgoing_rx, handle.events()));

    info!(
        message_id = options.message_id,
        initiator = options.initiator,
        "joined call"
    );
    Ok(ActiveCall { handle, session })
}
