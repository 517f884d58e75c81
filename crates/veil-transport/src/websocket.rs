use crate::config::TransportConfig;
use crate::connection::{Connector, Duplex, FrameReceiver, FrameSender};
use crate::TransportError;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// WebSocket connector: one binary WebSocket per relay connection.
///
/// Each connection gets two pump tasks: a writer draining the outbound
/// channel into the socket and a reader forwarding binary messages into
/// the inbound channel. The socket is closed once all senders are dropped.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: TransportConfig,
}

impl WsConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

/// Accept only `ws://` and `wss://` endpoints.
pub(crate) fn validate_endpoint(endpoint: &str) -> Result<url::Url, TransportError> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| TransportError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(TransportError::InvalidEndpoint(format!(
            "{endpoint}: unsupported scheme {other}"
        ))),
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Duplex, TransportError> {
        let url = validate_endpoint(endpoint)?;
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                source: e.into(),
            })?;

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.channel_buffer);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(self.config.channel_buffer);
        let max_frame_size = self.config.max_frame_size;

        let remote = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Binary(frame)).await {
                    tracing::debug!("ws write to {remote} failed: {e}");
                    return;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            tracing::debug!("ws writer for {remote} finished");
        });

        let remote = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        if data.len() > max_frame_size {
                            tracing::warn!(
                                "dropping {} byte frame from {remote} (max {max_frame_size})",
                                data.len()
                            );
                            continue;
                        }
                        if in_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Text(_)) => {
                        tracing::debug!("ignoring text frame from {remote}");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("ws read from {remote} failed: {e}");
                        break;
                    }
                }
            }
            tracing::debug!("ws reader for {remote} finished");
        });

        Ok(Duplex {
            endpoint: endpoint.to_string(),
            sender: FrameSender::new(out_tx, max_frame_size),
            receiver: FrameReceiver::new(in_rx),
        })
    }
}
