use anyhow::Result;
use futures::{SinkExt, StreamExt};
use parley_common::CallSignal;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::session::SessionEvent;

pub type SignalSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect(url: &Url) -> Result<SignalSocket> {
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    info!("connected to signaling endpoint {}{}", url.host_str().unwrap_or(""), url.path());
    Ok(ws_stream)
}

/// Pumps one signaling socket until either side goes away.
///
/// Signals from `outgoing` are written as text frames; when `outgoing` closes
/// the socket is closed. Inbound frames are decoded and delivered to the
/// session; frames that do not decode are logged and dropped. The session is
/// told `TransportClosed` once the socket ends.
pub async fn run(
    ws: SignalSocket,
    mut outgoing: mpsc::Receiver<CallSignal>,
    events: mpsc::Sender<SessionEvent>,
) {
    let (mut write, mut read) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(signal) = outgoing.recv().await {
            let text = match signal.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode {} signal: {}", signal.kind(), e);
                    continue;
                }
            };
            if let Err(e) = write.send(WsMessage::Text(text)).await {
                error!("failed to send signaling message: {}", e);
                return;
            }
        }
        let _ = write.send(WsMessage::Close(None)).await;
    });

    while let Some(msg) = read.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match CallSignal::decode(&text) {
                Ok(signal) => {
                    debug!(kind = signal.kind(), "received signal");
                    if events.send(SessionEvent::Signal(signal)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("dropping malformed signaling frame: {}", e),
            },
            Ok(WsMessage::Binary(_)) => warn!("dropping binary signaling frame"),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("signaling WebSocket error: {}", e);
                break;
            }
        }
    }

    writer.abort();
    let _ = events.send(SessionEvent::TransportClosed).await;
}
