//! Two participants negotiating a call through a real gateway.
//!
//! The WebRTC peer is replaced by a scripted fake so the test exercises the
//! REST client, signaling pump and session state machine end to end.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parley_client::session::PeerConnection;
use parley_client::{
    join_call, ActiveCall, CallOptions, CallStatus, EndReason, GatewayClient, SessionEvent,
};
use parley_common::{CallConfigResponse, IceCandidate, SessionDescription};
use parley_gateway::{build_cors_layer, db, router, AppState, CredentialIssuer};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const ALICE: &str = "alice-token-0000000001";
const BOB: &str = "bob-token-00000000002";

struct ScriptedPeer {
    name: &'static str,
    events: mpsc::Sender<SessionEvent>,
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPeer {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl PeerConnection for ScriptedPeer {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("offer-from-{}", self.name)))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("answer-from-{}", self.name)))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> anyhow::Result<()> {
        let candidate = IceCandidate {
            candidate: format!("host-{}", self.name),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let _ = self.events.send(SessionEvent::LocalCandidate(candidate)).await;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        self.record(format!("remote:{}", desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn gathering_complete(&self) {}

    async fn local_description(&self) -> Option<SessionDescription> {
        None
    }

    async fn start_screen_share(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop_screen_share(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn release_media(&self) {
        self.record("release".into());
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.record("close".into());
        Ok(())
    }
}

async fn spawn_gateway() -> SocketAddr {
    let pool = db::connect("sqlite::memory:", 1).await.unwrap();
    for sql in [
        "INSERT INTO users (id, username) VALUES (1, 'alice'), (2, 'bob')",
        "INSERT INTO conversations (id, kind) VALUES (42, 'dm')",
        "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (42, 1), (42, 2)",
    ] {
        sqlx::query(sql).execute(&pool).await.unwrap();
    }
    let valid = Utc::now() + chrono::Duration::hours(1);
    db::insert_access_token(&pool, ALICE, 1, valid).await.unwrap();
    db::insert_access_token(&pool, BOB, 2, valid).await.unwrap();

    let issuer = CredentialIssuer::new("parley", "parley:", Some("127.0.0.1".parse().unwrap()), 3478);
    let app = router(AppState::new(pool, issuer), build_cors_layer(&[]));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn join(
    gateway: &GatewayClient,
    name: &'static str,
    message_id: i64,
    initiator: bool,
) -> (ActiveCall, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let peer_log = log.clone();
    let mut options = CallOptions::new(message_id, initiator);
    options.trickle_delay = Duration::from_millis(10);
    let call = join_call(
        gateway,
        options,
        move |config: CallConfigResponse, events| async move {
            assert_eq!(config.credential, gateway_token(name));
            Ok(ScriptedPeer {
                name,
                events,
                log: peer_log,
            })
        },
    )
    .await
    .expect("join call");
    (call, log)
}

fn gateway_token(name: &str) -> &'static str {
    if name == "alice" {
        ALICE
    } else {
        BOB
    }
}

async fn wait_for_status(call: &ActiveCall, expected: CallStatus) {
    let mut status = call.handle.subscribe();
    timeout(Duration::from_secs(5), status.wait_for(|s| *s == expected))
        .await
        .expect("timed out waiting for call status")
        .unwrap();
}

async fn wait_for_entry(log: &Arc<Mutex<Vec<String>>>, entry: &str) {
    timeout(Duration::from_secs(5), async {
        while !log.lock().unwrap().iter().any(|e| e == entry) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("log never contained {entry}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_party_call_negotiates_and_ends() {
    let addr = spawn_gateway().await;
    let base = format!("http://{addr}");
    let alice = GatewayClient::new(&base, ALICE).unwrap();
    let bob = GatewayClient::new(&base, BOB).unwrap();

    let started = alice.start_call(42).await.unwrap();
    assert!(alice.call_status(started.message_id).await.unwrap());

    let (alice_call, alice_log) = join(&alice, "alice", started.message_id, true).await;
    wait_for_status(&alice_call, CallStatus::WaitingForPeer).await;
    let (bob_call, bob_log) = join(&bob, "bob", started.message_id, false).await;

    wait_for_status(&alice_call, CallStatus::Connected).await;
    wait_for_status(&bob_call, CallStatus::Connected).await;

    wait_for_entry(&bob_log, "remote:offer-from-alice").await;
    wait_for_entry(&alice_log, "remote:answer-from-bob").await;
    wait_for_entry(&bob_log, "candidate:host-alice").await;
    wait_for_entry(&alice_log, "candidate:host-bob").await;
    assert!(bob.call_status(started.message_id).await.unwrap());

    alice_call.hangup();
    assert_eq!(
        alice_call.finished().await.unwrap(),
        CallStatus::Ended(EndReason::Hangup)
    );
    assert_eq!(
        timeout(Duration::from_secs(5), bob_call.finished())
            .await
            .expect("bob should be closed by the gateway")
            .unwrap(),
        CallStatus::Ended(EndReason::TransportClosed)
    );
    wait_for_entry(&bob_log, "release").await;

    timeout(Duration::from_secs(5), async {
        while bob.call_status(started.message_id).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("call should be marked ended");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gateway_rejections_surface_as_errors() {
    let addr = spawn_gateway().await;
    let base = format!("http://{addr}");
    let alice = GatewayClient::new(&base, ALICE).unwrap();

    let err = alice.start_call(7).await.unwrap_err();
    assert_eq!(err.status(), Some(reqwest::StatusCode::NOT_FOUND));

    alice.start_call(42).await.unwrap();
    let err = alice.start_call(42).await.unwrap_err();
    assert_eq!(err.status(), Some(reqwest::StatusCode::CONFLICT));

    let stranger = GatewayClient::new(&base, "nobody-token-000000009").unwrap();
    let err = stranger.call_config().await.unwrap_err();
    assert_eq!(err.status(), Some(reqwest::StatusCode::UNAUTHORIZED));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_config_is_cached_per_token() {
    let addr = spawn_gateway().await;
    let alice = GatewayClient::new(&format!("http://{addr}"), ALICE).unwrap();

    let first = alice.call_config().await.unwrap();
    assert_eq!(first.username, format!("parley:{ALICE}"));
    assert_eq!(first.relay_address, "127.0.0.1");
    let second = alice.call_config().await.unwrap();
    assert_eq!(first, second);
}
