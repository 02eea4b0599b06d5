use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};
use url::Url;

use super::{MessageChannel, MessageHandler, Subscription};
use crate::error::{Result, SessionError};
use crate::protocol::{InboundMessage, OutboundMessage, Rejection};

const INBOUND_CAPACITY: usize = 1024;

/// Channel to a host reached over a WebSocket connection.
///
/// The connection itself identifies the counterpart, so every frame that
/// decodes is accepted. Text frames carry JSON; binary frames carry CBOR.
pub struct WsChannel {
    outgoing: mpsc::UnboundedSender<OutboundMessage>,
    incoming: broadcast::Sender<InboundMessage>,
    /// Sender lives in the recv task; dropped when the host side goes away
    alive: watch::Receiver<()>,
    handle: JoinHandle<()>,
    bridges: [AbortHandle; 2],
}

impl WsChannel {
    /// Connect to `url` and start bridging frames in the background
    pub async fn connect(url: &str) -> Result<Self> {
        let url =
            Url::parse(url).map_err(|e| SessionError::Transport(format!("invalid ws url: {e}")))?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (incoming, _) = broadcast::channel(INBOUND_CAPACITY);

        // local -> remote
        let forward = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let data = message.to_wire();
                debug!(kind = %message.kind(), data = %data, "message to host");
                if ws_tx.send(Message::Text(data.to_string().into())).await.is_err() {
                    break;
                }
            }
        });

        // remote -> local
        let publish = incoming.clone();
        let (alive_tx, alive) = watch::channel(());
        let recv = tokio::spawn(async move {
            let _alive = alive_tx;
            while let Some(frame) = ws_rx.next().await {
                let decoded = match frame {
                    Ok(Message::Text(text)) => decode_text(text.as_str()),
                    Ok(Message::Binary(bin)) => decode_binary(&bin),
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Frame(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                        continue
                    }
                    Err(_) => break,
                };
                match decoded.and_then(|data| InboundMessage::from_wire(&data)) {
                    Ok(message) => {
                        debug!(kind = %message.kind(), "message from host");
                        let _ = publish.send(message);
                    }
                    Err(rejection) => trace!(%rejection, "dropping frame"),
                }
            }
            debug!("host connection closed");
        });

        let bridges = [forward.abort_handle(), recv.abort_handle()];
        let handle = tokio::spawn(async move {
            let _ = tokio::join!(forward, recv);
        });

        Ok(Self {
            outgoing,
            incoming,
            alive,
            handle,
            bridges,
        })
    }

    /// True once the host side has gone away
    pub fn is_closed(&self) -> bool {
        self.alive.has_changed().is_err()
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        for bridge in &self.bridges {
            bridge.abort();
        }
        self.handle.abort();
    }
}

impl MessageChannel for WsChannel {
    fn send(&self, message: OutboundMessage) {
        if self.outgoing.send(message).is_err() {
            trace!("host connection is gone, message dropped");
        }
    }

    fn listen(&self, handler: MessageHandler) -> Subscription {
        Subscription::spawn_listener(self.incoming.subscribe(), Some, handler)
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut alive = self.alive.clone();
        Box::pin(async move { while alive.changed().await.is_ok() {} })
    }
}

pub(crate) fn decode_text(text: &str) -> std::result::Result<Value, Rejection> {
    serde_json::from_str(text).map_err(|e| Rejection::Undecodable(e.to_string()))
}

pub(crate) fn decode_binary(bin: &[u8]) -> std::result::Result<Value, Rejection> {
    serde_cbor::from_slice(bin).map_err(|e| Rejection::Undecodable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_text_and_binary() {
        let data = json!({ "NEAType": "StateChanged", "payload": { "count": 1 } });
        assert_eq!(decode_text(&data.to_string()).unwrap(), data);

        let bin = serde_cbor::to_vec(&data).unwrap();
        assert_eq!(decode_binary(&bin).unwrap(), data);

        assert!(matches!(decode_text("{nope"), Err(Rejection::Undecodable(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let err = WsChannel::connect("not a url").await.err().unwrap();
        assert!(matches!(err, SessionError::Transport(_)));
    }
}
