use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use parley_client::{join_call, CallOptions, CallStatus, GatewayClient, SessionEvent, WebRtcPeer};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "parley-client", about = "Headless Parley call participant")]
struct Args {
    /// Gateway base URL
    #[arg(long, env = "PARLEY_GATEWAY_URL", default_value = "http://127.0.0.1:8080")]
    gateway: String,

    /// Access token used for REST, signaling and relay credentials
    #[arg(long, env = "PARLEY_TOKEN")]
    token: String,

    /// Start a call in this direct conversation and act as the initiator
    #[arg(long, conflicts_with = "message")]
    conversation: Option<i64>,

    /// Join the call anchored at this message
    #[arg(long)]
    message: Option<i64>,

    /// Share the screen once the call is connected
    #[arg(long, default_value = "false")]
    screen_share: bool,

    /// Delay before renegotiation offers and answers are sent, in milliseconds
    #[arg(long, default_value_t = 250)]
    trickle_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    parley_common::init_tracing();
    let args = Args::parse();

    let gateway = GatewayClient::new(&args.gateway, args.token.clone())?;

    let mut options = match (args.conversation, args.message) {
        (Some(conversation_id), _) => {
            let started = gateway.start_call(conversation_id).await?;
            info!(
                call_id = started.call_id,
                message_id = started.message_id,
                "started call"
            );
            CallOptions::new(started.message_id, true)
        }
        (None, Some(message_id)) => {
            if !gateway.call_status(message_id).await? {
                bail!("call {} is not active", message_id);
            }
            CallOptions::new(message_id, false)
        }
        (None, None) => bail!("either --conversation or --message is required"),
    };
    options.trickle_delay = Duration::from_millis(args.trickle_delay_ms);

    let call = join_call(&gateway, options, |config, events| async move {
        WebRtcPeer::new(&config, events).await
    })
    .await?;

    let mut status = call.handle.subscribe();
    let mut shared = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("hanging up");
                call.hangup();
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(status = ?current, "call status");
                match current {
                    CallStatus::Ended(_) => break,
                    CallStatus::Connected if args.screen_share && !shared => {
                        shared = true;
                        if let Err(e) = call.handle.send(SessionEvent::StartScreenShare).await {
                            warn!("failed to start screen share: {}", e);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let final_status = call.finished().await?;
    info!(status = ?final_status, "call finished");
    Ok(())
}
