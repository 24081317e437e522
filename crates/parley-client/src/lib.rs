//! Parley call participant.
//!
//! Talks to the gateway's REST endpoints, pumps the signaling WebSocket and
//! drives a WebRTC peer connection through the call session state machine.

pub mod api;
pub mod call;
pub mod peer;
pub mod session;
pub mod signaling;

pub use api::{GatewayClient, GatewayError};
pub use call::{join_call, ActiveCall, CallOptions};
pub use peer::WebRtcPeer;
pub use session::{CallStatus, EndReason, PeerConnection, SessionEvent, SessionHandle};
