//! Call session state machine.
//!
//! One actor task owns the session. Incoming signals, local ICE events, peer
//! connection state changes and user actions all arrive on a single queue and
//! are processed in order, so the state needs no locks. Every in-flight
//! negotiation wait races against the hangup watch flag and against the queue
//! itself: an event that ends the call is acted on at once, any other event is
//! deferred until the wait is over.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_common::{CallSignal, IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Wait applied to renegotiation offers and answers before they are sent.
pub const DEFAULT_TRICKLE_DELAY: Duration = Duration::from_millis(250);

const EVENT_QUEUE_CAPACITY: usize = 256;

/// The media side of a call, implemented over WebRTC by [`crate::peer::WebRtcPeer`].
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    /// Resolves once ICE gathering has reached `complete`.
    async fn gathering_complete(&self);
    /// Current local description, including gathered candidates.
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn start_screen_share(&self) -> anyhow::Result<()>;
    async fn stop_screen_share(&self) -> anyhow::Result<()>;
    /// Stops every local track. Must be safe to call more than once.
    async fn release_media(&self);
    async fn close(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The signaling socket finished its handshake.
    SocketOpened,
    Signal(CallSignal),
    LocalCandidate(IceCandidate),
    PeerState(PeerState),
    StartScreenShare,
    StopScreenShare,
    TransportClosed,
    Hangup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    TransportClosed,
    PeerFailed,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Connecting,
    WaitingForPeer,
    Negotiating,
    Connected,
    Ended(EndReason),
}

impl CallStatus {
    pub fn is_ended(&self) -> bool {
        matches!(self, CallStatus::Ended(_))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("call was hung up")]
    Cancelled,

    #[error("signaling transport closed")]
    TransportClosed,

    #[error("peer connection {0:?}")]
    PeerFailed(PeerState),

    #[error(transparent)]
    Peer(#[from] anyhow::Error),
}

impl From<SessionError> for EndReason {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Cancelled => EndReason::Hangup,
            SessionError::TransportClosed => EndReason::TransportClosed,
            SessionError::PeerFailed(_) => EndReason::PeerFailed,
            SessionError::Peer(err) => EndReason::Error(format!("{err:#}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The initiator sends the first offer once both sides are connected.
    pub initiator: bool,
    pub trickle_delay: Duration,
}

impl SessionConfig {
    pub fn new(initiator: bool) -> Self {
        Self {
            initiator,
            trickle_delay: DEFAULT_TRICKLE_DELAY,
        }
    }
}

/// Each variant owns exactly the candidate buffers that are legal in it.
enum SessionState {
    Connecting {
        pending_local: Vec<IceCandidate>,
    },
    WaitingForPeer {
        pending_local: Vec<IceCandidate>,
        pending_remote: Vec<IceCandidate>,
    },
    Negotiating {
        pending_remote: Vec<IceCandidate>,
    },
    Connected,
    Ended,
}

impl SessionState {
    fn status(&self) -> Option<CallStatus> {
        match self {
            SessionState::Connecting { .. } => Some(CallStatus::Connecting),
            SessionState::WaitingForPeer { .. } => Some(CallStatus::WaitingForPeer),
            SessionState::Negotiating { .. } => Some(CallStatus::Negotiating),
            SessionState::Connected => Some(CallStatus::Connected),
            SessionState::Ended => None,
        }
    }
}

/// Cloneable control surface of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    cancel: Arc<watch::Sender<bool>>,
    status: watch::Receiver<CallStatus>,
}

impl SessionHandle {
    /// Sender for signaling and peer callbacks to feed the session.
    pub fn events(&self) -> mpsc::Sender<SessionEvent> {
        self.events.clone()
    }

    pub async fn send(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.events
            .send(event)
            .await
            .map_err(|_| SessionError::Cancelled)
    }

    pub fn hangup(&self) {
        self.cancel.send_replace(true);
        let _ = self.events.try_send(SessionEvent::Hangup);
    }

    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Waits until the session publishes `Ended`.
    pub async fn ended(&self) -> CallStatus {
        let mut status = self.status.clone();
        loop {
            let current = status.borrow_and_update().clone();
            if current.is_ended() {
                return current;
            }
            if status.changed().await.is_err() {
                return status.borrow().clone();
            }
        }
    }
}

/// Receiving half handed to [`CallSession::new`].
pub struct SessionInbox {
    events: mpsc::Receiver<SessionEvent>,
    cancel: watch::Receiver<bool>,
    status: watch::Sender<CallStatus>,
}

/// Creates the event queue before the peer connection exists, so the peer's
/// callbacks can be wired to it.
pub fn channel() -> (SessionHandle, SessionInbox) {
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(CallStatus::Idle);
    (
        SessionHandle {
            events: events_tx,
            cancel: Arc::new(cancel_tx),
            status: status_rx,
        },
        SessionInbox {
            events: events_rx,
            cancel: cancel_rx,
            status: status_tx,
        },
    )
}

pub struct CallSession<P> {
    peer: P,
    config: SessionConfig,
    state: SessionState,
    events: mpsc::Receiver<SessionEvent>,
    deferred: VecDeque<SessionEvent>,
    cancel: watch::Receiver<bool>,
    status: watch::Sender<CallStatus>,
    outgoing: Option<mpsc::Sender<CallSignal>>,
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Every handle is gone; nobody can hang up any more.
            std::future::pending::<()>().await;
        }
    }
}

/// Events that end the call no matter what the session is doing.
fn terminal_error(event: &SessionEvent) -> Option<SessionError> {
    match event {
        SessionEvent::TransportClosed => Some(SessionError::TransportClosed),
        SessionEvent::Hangup => Some(SessionError::Cancelled),
        SessionEvent::PeerState(state @ (PeerState::Failed | PeerState::Closed)) => {
            Some(SessionError::PeerFailed(*state))
        }
        _ => None,
    }
}

/// Drives `fut` while still watching for hangup and call-ending events.
/// Other events that arrive meanwhile are queued on `deferred` in order.
async fn interruptible<F: Future>(
    cancel: &mut watch::Receiver<bool>,
    events: &mut mpsc::Receiver<SessionEvent>,
    deferred: &mut VecDeque<SessionEvent>,
    fut: F,
) -> Result<F::Output, SessionError> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(SessionError::Cancelled),
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(SessionError::Cancelled);
                };
                if let Some(err) = terminal_error(&event) {
                    return Err(err);
                }
                deferred.push_back(event);
            }
            out = &mut fut => return Ok(out),
        }
    }
}

enum Step {
    Event(SessionEvent),
    Cancelled,
    Closed,
}

impl<P: PeerConnection> CallSession<P> {
    pub fn new(
        peer: P,
        config: SessionConfig,
        inbox: SessionInbox,
        outgoing: mpsc::Sender<CallSignal>,
    ) -> Self {
        Self {
            peer,
            config,
            state: SessionState::Connecting {
                pending_local: Vec::new(),
            },
            events: inbox.events,
            deferred: VecDeque::new(),
            cancel: inbox.cancel,
            status: inbox.status,
            outgoing: Some(outgoing),
        }
    }

    /// Processes events until the call ends and returns the final status.
    pub async fn run(mut self) -> CallStatus {
        self.publish();
        loop {
            let step = if *self.cancel.borrow() {
                Step::Cancelled
            } else if let Some(event) = self.deferred.pop_front() {
                Step::Event(event)
            } else {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut self.cancel) => Step::Cancelled,
                    event = self.events.recv() => match event {
                        Some(event) => Step::Event(event),
                        None => Step::Closed,
                    },
                }
            };

            let result = match step {
                Step::Event(event) => self.handle(event).await,
                Step::Cancelled => Err(SessionError::Cancelled),
                Step::Closed => Err(SessionError::Cancelled),
            };
            if let Err(err) = result {
                self.end(err.into()).await;
            }
            if matches!(self.state, SessionState::Ended) {
                break;
            }
        }
        self.status.borrow().clone()
    }

    fn publish(&self) {
        if let Some(status) = self.state.status() {
            self.status.send_replace(status);
        }
    }

    fn transition(&mut self, next: SessionState) {
        self.state = next;
        self.publish();
    }

    async fn handle(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        match event {
            SessionEvent::SocketOpened => {
                let SessionState::Connecting { pending_local } = &mut self.state else {
                    warn!("signaling socket opened twice, ignoring");
                    return Ok(());
                };
                let pending_local = std::mem::take(pending_local);
                self.transition(SessionState::WaitingForPeer {
                    pending_local,
                    pending_remote: Vec::new(),
                });
            }
            SessionEvent::LocalCandidate(candidate) => match &mut self.state {
                SessionState::Connecting { pending_local }
                | SessionState::WaitingForPeer { pending_local, .. } => {
                    pending_local.push(candidate)
                }
                SessionState::Negotiating { .. } | SessionState::Connected => {
                    self.send(CallSignal::IceCandidate(candidate)).await?
                }
                SessionState::Ended => {}
            },
            SessionEvent::Signal(signal) => self.on_signal(signal).await?,
            SessionEvent::PeerState(state) => match state {
                PeerState::Failed | PeerState::Closed => {
                    return Err(SessionError::PeerFailed(state))
                }
                PeerState::Disconnected => warn!("peer connection disconnected"),
                PeerState::Connected => info!("peer connection established"),
                PeerState::New | PeerState::Connecting => debug!(?state, "peer connection state"),
            },
            SessionEvent::StartScreenShare => {
                if self.require_connected("start screen share") {
                    self.peer.start_screen_share().await?;
                    self.renegotiate().await?;
                }
            }
            SessionEvent::StopScreenShare => {
                if self.require_connected("stop screen share") {
                    self.peer.stop_screen_share().await?;
                    self.renegotiate().await?;
                }
            }
            SessionEvent::TransportClosed => return Err(SessionError::TransportClosed),
            SessionEvent::Hangup => return Err(SessionError::Cancelled),
        }
        Ok(())
    }

    async fn on_signal(&mut self, signal: CallSignal) -> Result<(), SessionError> {
        match signal {
            CallSignal::PeerJoined => {
                let SessionState::WaitingForPeer {
                    pending_local,
                    pending_remote,
                } = &mut self.state
                else {
                    warn!("unexpected peer-joined, ignoring");
                    return Ok(());
                };
                let pending_local = std::mem::take(pending_local);
                let pending_remote = std::mem::take(pending_remote);
                self.transition(SessionState::Negotiating { pending_remote });

                for candidate in pending_local {
                    self.send(CallSignal::IceCandidate(candidate)).await?;
                }

                if self.config.initiator {
                    let offer = self.peer.create_offer().await?;
                    self.peer.set_local_description(offer.clone()).await?;
                    interruptible(
                        &mut self.cancel,
                        &mut self.events,
                        &mut self.deferred,
                        self.peer.gathering_complete(),
                    )
                    .await?;
                    let offer = self.peer.local_description().await.unwrap_or(offer);
                    self.send(CallSignal::Offer(offer)).await?;
                }
            }
            CallSignal::Offer(offer) => {
                if self.config.initiator {
                    warn!("initiator received an offer, ignoring");
                    return Ok(());
                }
                let SessionState::Negotiating { pending_remote } = &mut self.state else {
                    warn!("offer outside negotiation, ignoring");
                    return Ok(());
                };
                let pending_remote = std::mem::take(pending_remote);

                self.peer.set_remote_description(offer).await?;
                self.apply_remote_candidates(pending_remote).await;

                let answer = self.peer.create_answer().await?;
                self.peer.set_local_description(answer.clone()).await?;
                interruptible(
                    &mut self.cancel,
                    &mut self.events,
                    &mut self.deferred,
                    self.peer.gathering_complete(),
                )
                .await?;
                let answer = self.peer.local_description().await.unwrap_or(answer);
                self.send(CallSignal::Answer(answer)).await?;
                self.transition(SessionState::Connected);
            }
            CallSignal::Answer(answer) => {
                if !self.config.initiator {
                    warn!("answerer received an answer, ignoring");
                    return Ok(());
                }
                let SessionState::Negotiating { pending_remote } = &mut self.state else {
                    warn!("answer outside negotiation, ignoring");
                    return Ok(());
                };
                let pending_remote = std::mem::take(pending_remote);

                self.peer.set_remote_description(answer).await?;
                self.apply_remote_candidates(pending_remote).await;
                self.transition(SessionState::Connected);
            }
            CallSignal::Renegotiate(offer) => {
                if !self.require_connected("answer renegotiation") {
                    return Ok(());
                }
                self.peer.set_remote_description(offer).await?;
                let answer = self.peer.create_answer().await?;
                self.peer.set_local_description(answer.clone()).await?;
                self.trickle_wait().await?;
                let answer = self.peer.local_description().await.unwrap_or(answer);
                self.send(CallSignal::RenegotiateAnswer(answer)).await?;
            }
            CallSignal::RenegotiateAnswer(answer) => {
                if self.require_connected("apply renegotiation answer") {
                    self.peer.set_remote_description(answer).await?;
                }
            }
            CallSignal::IceCandidate(candidate) => match &mut self.state {
                SessionState::WaitingForPeer { pending_remote, .. }
                | SessionState::Negotiating { pending_remote } => pending_remote.push(candidate),
                SessionState::Connected => self.apply_remote_candidates(vec![candidate]).await,
                SessionState::Connecting { .. } | SessionState::Ended => {}
            },
        }
        Ok(())
    }

    fn require_connected(&self, action: &str) -> bool {
        if matches!(self.state, SessionState::Connected) {
            true
        } else {
            warn!("cannot {} before the call is connected", action);
            false
        }
    }

    async fn renegotiate(&mut self) -> Result<(), SessionError> {
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.trickle_wait().await?;
        let offer = self.peer.local_description().await.unwrap_or(offer);
        self.send(CallSignal::Renegotiate(offer)).await
    }

    async fn trickle_wait(&mut self) -> Result<(), SessionError> {
        interruptible(
            &mut self.cancel,
            &mut self.events,
            &mut self.deferred,
            tokio::time::sleep(self.config.trickle_delay),
        )
        .await
    }

    async fn apply_remote_candidates(&self, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if let Err(err) = self.peer.add_ice_candidate(candidate).await {
                warn!("failed to add remote ICE candidate: {:#}", err);
            }
        }
    }

    async fn send(&self, signal: CallSignal) -> Result<(), SessionError> {
        let Some(outgoing) = &self.outgoing else {
            return Err(SessionError::TransportClosed);
        };
        debug!(kind = signal.kind(), "sending signal");
        outgoing
            .send(signal)
            .await
            .map_err(|_| SessionError::TransportClosed)
    }

    async fn end(&mut self, reason: EndReason) {
        if matches!(self.state, SessionState::Ended) {
            return;
        }
        self.state = SessionState::Ended;

        self.peer.release_media().await;
        if let Err(err) = self.peer.close().await {
            warn!("failed to close peer connection: {:#}", err);
        }
        // Dropping the sender makes the signaling writer close the socket.
        self.outgoing = None;

        info!(?reason, "call ended");
        self.status.send_replace(CallStatus::Ended(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    #[derive(Clone)]
    struct MockPeer {
        log: Arc<Mutex<Vec<String>>>,
        gathered: watch::Receiver<bool>,
        offers: Arc<AtomicUsize>,
        fail_renegotiation: Arc<AtomicBool>,
    }

    impl MockPeer {
        fn record(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }
    }

    #[async_trait]
    impl PeerConnection for MockPeer {
        async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
            let n = self.offers.fetch_add(1, Ordering::SeqCst);
            if n > 0 && self.fail_renegotiation.load(Ordering::SeqCst) {
                anyhow::bail!("offer rejected");
            }
            self.record("create_offer");
            Ok(SessionDescription::offer(format!("offer-{n}")))
        }

        async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
            self.record("create_answer");
            Ok(SessionDescription::answer("answer"))
        }

        async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
            self.record(format!("set_local:{}", desc.sdp));
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
            self.record(format!("set_remote:{}", desc.sdp));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
            self.record(format!("add_candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn gathering_complete(&self) {
            let mut gathered = self.gathered.clone();
            let _ = gathered.wait_for(|done| *done).await;
        }

        async fn local_description(&self) -> Option<SessionDescription> {
            None
        }

        async fn start_screen_share(&self) -> anyhow::Result<()> {
            self.record("start_screen_share");
            Ok(())
        }

        async fn stop_screen_share(&self) -> anyhow::Result<()> {
            self.record("stop_screen_share");
            Ok(())
        }

        async fn release_media(&self) {
            self.record("release_media");
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.record("close");
            Ok(())
        }
    }

    struct Harness {
        handle: SessionHandle,
        outgoing: mpsc::Receiver<CallSignal>,
        peer: MockPeer,
        gathered: watch::Sender<bool>,
        task: JoinHandle<CallStatus>,
    }

    impl Harness {
        fn start(initiator: bool, gathered: bool) -> Self {
            let (gathered_tx, gathered_rx) = watch::channel(gathered);
            let peer = MockPeer {
                log: Arc::default(),
                gathered: gathered_rx,
                offers: Arc::default(),
                fail_renegotiation: Arc::default(),
            };
            let (handle, inbox) = channel();
            let (outgoing_tx, outgoing_rx) = mpsc::channel(32);
            let config = SessionConfig {
                initiator,
                trickle_delay: Duration::from_millis(10),
            };
            let session = CallSession::new(peer.clone(), config, inbox, outgoing_tx);
            Self {
                handle,
                outgoing: outgoing_rx,
                peer,
                gathered: gathered_tx,
                task: tokio::spawn(session.run()),
            }
        }

        async fn send(&self, event: SessionEvent) {
            self.handle.send(event).await.unwrap();
        }

        async fn next_signal(&mut self) -> CallSignal {
            timeout(Duration::from_secs(2), self.outgoing.recv())
                .await
                .expect("timed out waiting for signal")
                .expect("outgoing closed")
        }

        async fn assert_silent(&mut self) {
            assert!(
                timeout(Duration::from_millis(100), self.outgoing.recv())
                    .await
                    .is_err(),
                "unexpected outgoing signal"
            );
        }

        async fn wait_status(&self, expected: CallStatus) {
            let mut status = self.handle.subscribe();
            timeout(Duration::from_secs(2), status.wait_for(|s| *s == expected))
                .await
                .expect("timed out waiting for status")
                .unwrap();
        }

        fn log(&self) -> Vec<String> {
            self.peer.log.lock().unwrap().clone()
        }

        async fn connect_as_initiator(&mut self) {
            self.send(SessionEvent::SocketOpened).await;
            self.send(SessionEvent::Signal(CallSignal::PeerJoined)).await;
            assert!(matches!(self.next_signal().await, CallSignal::Offer(_)));
            self.send(SessionEvent::Signal(CallSignal::Answer(
                SessionDescription::answer("remote-answer"),
            )))
            .await;
            self.wait_status(CallStatus::Connected).await;
        }
    }

    fn candidate(name: &str) -> IceCandidate {
        IceCandidate {
            candidate: name.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_local_candidates_held_until_peer_joined() {
        let mut h = Harness::start(true, true);
        h.send(SessionEvent::LocalCandidate(candidate("c1"))).await;
        h.send(SessionEvent::SocketOpened).await;
        h.send(SessionEvent::LocalCandidate(candidate("c2"))).await;
        h.wait_status(CallStatus::WaitingForPeer).await;
        h.assert_silent().await;

        h.send(SessionEvent::Signal(CallSignal::PeerJoined)).await;
        assert_eq!(h.next_signal().await, CallSignal::IceCandidate(candidate("c1")));
        assert_eq!(h.next_signal().await, CallSignal::IceCandidate(candidate("c2")));
        assert_eq!(
            h.next_signal().await,
            CallSignal::Offer(SessionDescription::offer("offer-0"))
        );
    }

    #[tokio::test]
    async fn test_offer_waits_for_gathering_complete() {
        let mut h = Harness::start(true, false);
        h.send(SessionEvent::SocketOpened).await;
        h.send(SessionEvent::Signal(CallSignal::PeerJoined)).await;
        h.wait_status(CallStatus::Negotiating).await;
        h.assert_silent().await;
        assert!(h.log().contains(&"set_local:offer-0".to_string()));

        h.gathered.send_replace(true);
        assert!(matches!(h.next_signal().await, CallSignal::Offer(_)));
    }

    #[tokio::test]
    async fn test_non_initiator_does_not_offer() {
        let mut h = Harness::start(false, true);
        h.send(SessionEvent::SocketOpened).await;
        h.send(SessionEvent::Signal(CallSignal::PeerJoined)).await;
        h.wait_status(CallStatus::Negotiating).await;
        h.assert_silent().await;
        assert!(!h.log().iter().any(|entry| entry == "create_offer"));
    }

    #[tokio::test]
    async fn test_answerer_buffers_remote_candidates_until_offer() {
        let mut h = Harness::start(false, true);
        h.send(SessionEvent::SocketOpened).await;
        h.send(SessionEvent::Signal(CallSignal::PeerJoined)).await;
        h.send(SessionEvent::Signal(CallSignal::IceCandidate(candidate("r1"))))
            .await;
        h.send(SessionEvent::Signal(CallSignal::Offer(
            SessionDescription::offer("remote-offer"),
        )))
        .await;

        assert_eq!(
            h.next_signal().await,
            CallSignal::Answer(SessionDescription::answer("answer"))
        );
        h.wait_status(CallStatus::Connected).await;
        assert_eq!(
            h.log(),
            vec![
                "set_remote:remote-offer",
                "add_candidate:r1",
                "create_answer",
                "set_local:answer",
            ]
        );
    }

    #[tokio::test]
    async fn test_hangup_interrupts_gathering_wait() {
        let mut h = Harness::start(true, false);
        h.send(SessionEvent::SocketOpened).await;
        h.send(SessionEvent::Signal(CallSignal::PeerJoined)).await;
        h.wait_status(CallStatus::Negotiating).await;

        h.handle.hangup();
        let status = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert_eq!(status, CallStatus::Ended(EndReason::Hangup));

        let log = h.peer.log.lock().unwrap().clone();
        assert!(log.contains(&"release_media".to_string()));
        assert!(log.contains(&"close".to_string()));
        assert_eq!(h.outgoing.recv().await, None);
    }

    #[tokio::test]
    async fn test_transport_close_interrupts_gathering_wait() {
        let mut h = Harness::start(true, false);
        h.send(SessionEvent::SocketOpened).await;
        h.send(SessionEvent::Signal(CallSignal::PeerJoined)).await;
        h.wait_status(CallStatus::Negotiating).await;

        h.send(SessionEvent::TransportClosed).await;
        let status = timeout(Duration::from_secs(2), h.handle.ended())
            .await
            .expect("session should end while gathering");
        assert_eq!(status, CallStatus::Ended(EndReason::TransportClosed));

        let log = h.log();
        assert!(log.contains(&"close".to_string()));
        assert!(log.contains(&"release_media".to_string()));
        assert_eq!(h.outgoing.recv().await, None);
    }

    #[tokio::test]
    async fn test_peer_failure_interrupts_gathering_wait() {
        let h = Harness::start(false, false);
        h.send(SessionEvent::SocketOpened).await;
        h.send(SessionEvent::Signal(CallSignal::PeerJoined)).await;
        h.send(SessionEvent::Signal(CallSignal::Offer(
            SessionDescription::offer("remote-offer"),
        )))
        .await;
        h.send(SessionEvent::PeerState(PeerState::Failed)).await;

        let status = timeout(Duration::from_secs(2), h.handle.ended())
            .await
            .expect("session should end while gathering");
        assert_eq!(status, CallStatus::Ended(EndReason::PeerFailed));
    }

    #[tokio::test]
    async fn test_events_during_gathering_are_applied_afterwards() {
        let mut h = Harness::start(false, false);
        h.send(SessionEvent::SocketOpened).await;
        h.send(SessionEvent::Signal(CallSignal::PeerJoined)).await;
        h.send(SessionEvent::Signal(CallSignal::Offer(
            SessionDescription::offer("remote-offer"),
        )))
        .await;
        h.send(SessionEvent::PeerState(PeerState::Connecting)).await;
        h.send(SessionEvent::Signal(CallSignal::IceCandidate(candidate("r2"))))
            .await;
        h.assert_silent().await;
        assert!(!h.log().contains(&"add_candidate:r2".to_string()));

        h.gathered.send_replace(true);
        assert_eq!(
            h.next_signal().await,
            CallSignal::Answer(SessionDescription::answer("answer"))
        );
        h.wait_status(CallStatus::Connected).await;
        timeout(Duration::from_secs(2), async {
            while !h.log().contains(&"add_candidate:r2".to_string()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("deferred candidate should be applied");
    }

    #[tokio::test]
    async fn test_transport_close_ends_once() {
        let mut h = Harness::start(true, true);
        h.connect_as_initiator().await;

        h.send(SessionEvent::TransportClosed).await;
        let _ = h.handle.send(SessionEvent::TransportClosed).await;
        let _ = h.handle.send(SessionEvent::Hangup).await;
        assert_eq!(
            h.handle.ended().await,
            CallStatus::Ended(EndReason::TransportClosed)
        );
        h.handle.hangup();

        let log = h.log();
        assert_eq!(log.iter().filter(|entry| *entry == "close").count(), 1);
        assert_eq!(log.iter().filter(|entry| *entry == "release_media").count(), 1);
    }

    #[tokio::test]
    async fn test_peer_failure_ends_call() {
        let mut h = Harness::start(true, true);
        h.connect_as_initiator().await;

        h.send(SessionEvent::PeerState(PeerState::Disconnected)).await;
        h.send(SessionEvent::PeerState(PeerState::Failed)).await;
        assert_eq!(h.handle.ended().await, CallStatus::Ended(EndReason::PeerFailed));
    }

    #[tokio::test]
    async fn test_screen_share_renegotiates() {
        let mut h = Harness::start(true, true);
        h.connect_as_initiator().await;

        h.send(SessionEvent::StartScreenShare).await;
        assert_eq!(
            h.next_signal().await,
            CallSignal::Renegotiate(SessionDescription::offer("offer-1"))
        );
        h.send(SessionEvent::Signal(CallSignal::RenegotiateAnswer(
            SessionDescription::answer("remote-renegotiated"),
        )))
        .await;
        h.send(SessionEvent::Signal(CallSignal::IceCandidate(candidate("late"))))
            .await;
        h.assert_silent().await;

        let log = h.log();
        assert!(log.contains(&"start_screen_share".to_string()));
        assert!(log.contains(&"set_remote:remote-renegotiated".to_string()));
        assert!(log.contains(&"add_candidate:late".to_string()));
        assert_eq!(h.handle.status(), CallStatus::Connected);
    }

    #[tokio::test]
    async fn test_failed_renegotiation_ends_call() {
        let mut h = Harness::start(true, true);
        h.connect_as_initiator().await;
        h.peer.fail_renegotiation.store(true, Ordering::SeqCst);

        h.send(SessionEvent::StartScreenShare).await;
        let status = h.handle.ended().await;
        assert!(matches!(status, CallStatus::Ended(EndReason::Error(_))));
        assert!(h.log().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn test_remote_renegotiation_is_answered() {
        let mut h = Harness::start(false, true);
        h.send(SessionEvent::SocketOpened).await;
        h.send(SessionEvent::Signal(CallSignal::PeerJoined)).await;
        h.send(SessionEvent::Signal(CallSignal::Offer(
            SessionDescription::offer("first"),
        )))
        .await;
        assert!(matches!(h.next_signal().await, CallSignal::Answer(_)));

        h.send(SessionEvent::Signal(CallSignal::Renegotiate(
            SessionDescription::offer("second"),
        )))
        .await;
        assert_eq!(
            h.next_signal().await,
            CallSignal::RenegotiateAnswer(SessionDescription::answer("answer"))
        );
    }

    #[tokio::test]
    async fn test_screen_share_before_connected_is_ignored() {
        let mut h = Harness::start(true, true);
        h.send(SessionEvent::SocketOpened).await;
        h.send(SessionEvent::StartScreenShare).await;
        h.assert_silent().await;
        assert!(h.log().is_empty());
        assert_eq!(h.handle.status(), CallStatus::WaitingForPeer);
    }
}
