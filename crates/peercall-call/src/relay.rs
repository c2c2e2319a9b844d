//! WebSocket link to the signaling relay.
//!
//! One connection per endpoint: the first frame registers the local identity,
//! after which outbound [`SignalMessage`]s are written as text frames and
//! inbound text frames are handed to the controller as [`RelayInput`].
//! Losing the connection is reported once as [`RelayInput::Closed`]; there is
//! no reconnect.

use futures_util::{SinkExt, StreamExt};
use peercall_common::{CallError, CallResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::controller::RelayInput;
use crate::signaling::{self, SignalMessage};

const INBOUND_CAPACITY: usize = 64;

/// Running relay connection. Dropping it leaves the tasks running until the
/// socket closes; call [`RelayLink::shutdown`] to stop them early.
pub struct RelayLink {
    inbound: Option<mpsc::Receiver<RelayInput>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayLink {
    /// Take the inbound stream for the controller.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<RelayInput>> {
        self.inbound.take()
    }

    pub fn shutdown(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Connect, register `local_id`, and start forwarding in both directions.
pub async fn connect(
    url: &str,
    local_id: &str,
    mut outbound: mpsc::Receiver<SignalMessage>,
) -> CallResult<RelayLink> {
    let register = signaling::encode(&SignalMessage::Register { from: local_id.to_string() })?;

    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| CallError::relay(format!("connect to {url} failed: {e}")))?;
    let (mut sink, mut stream) = ws.split();

    sink.send(Message::Text(register.into()))
        .await
        .map_err(|e| CallError::relay(format!("register failed: {e}")))?;
    tracing::info!(url = %url, local = %local_id, "Registered with relay");

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let text = match signaling::encode(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(kind = msg.kind(), error = %e, "Refusing to send invalid message");
                    continue;
                }
            };
            tracing::debug!(kind = msg.kind(), to = ?msg.to(), "Sending to relay");
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                tracing::warn!(error = %e, "Relay write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if tx.send(RelayInput::Frame(text.as_str().to_owned())).await.is_err() {
                        return;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Relay read failed");
                    break;
                }
            }
        }
        tracing::info!("Relay connection closed");
        let _ = tx.send(RelayInput::Closed).await;
    });

    Ok(RelayLink { inbound: Some(rx), reader, writer })
}
