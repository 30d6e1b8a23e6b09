//! Push channel plumbing
//!
//! Whatever the transport, the session sees a `ChannelHandle`: an outbound
//! sender for `OutboundEvent`s and a receiver of `ChannelEvent`s
//! (connection lifecycle plus decoded inbound events). Events are delivered
//! in the order the transport received them.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{Result, SyncError};
use crate::events::{InboundEvent, OutboundEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected(String),
    ConnectError(String),
    Event(InboundEvent),
}

/// Decode one `{"event": ..., "data": ...}` frame
pub fn decode_event(text: &str) -> Result<InboundEvent> {
    Ok(serde_json::from_str(text)?)
}

pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    inbound: mpsc::Receiver<ChannelEvent>,
}

impl ChannelHandle {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundEvent>,
        inbound: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    pub fn emit(&self, event: OutboundEvent) -> Result<()> {
        self.outbound
            .send(event)
            .map_err(|e| SyncError::Network(format!("Push channel closed, dropped {:?}", e.0)))
    }

    /// Next event from the channel. Cancel safe.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.inbound.recv().await
    }
}

/// The far side of an in-memory channel, standing in for the server
pub struct MemoryPeer {
    inbound: mpsc::Sender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundEvent>,
}

impl MemoryPeer {
    pub async fn push(&self, event: InboundEvent) -> Result<()> {
        self.send(ChannelEvent::Event(event)).await
    }

    pub async fn send(&self, event: ChannelEvent) -> Result<()> {
        self.inbound
            .send(event)
            .await
            .map_err(|_| SyncError::Network("Channel receiver dropped".to_string()))
    }

    /// Outbound events emitted so far, without waiting
    pub fn drain_outbound(&mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.outbound.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn next_outbound(&mut self) -> Option<OutboundEvent> {
        self.outbound.recv().await
    }
}

pub struct MemoryChannel;

impl MemoryChannel {
    pub fn pair(buffer: usize) -> (ChannelHandle, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::channel(buffer);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            ChannelHandle::new(out_tx, in_rx),
            MemoryPeer {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

/// WebSocket transport with JSON framed events
pub struct WsChannel;

impl WsChannel {
    pub async fn connect(ws_url: &str, token: &str, buffer: usize) -> Result<ChannelHandle> {
        let mut request = ws_url.into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SyncError::Config(format!("Invalid token: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _) = connect_async(request).await?;
        info!("Push channel connected to {}", ws_url);
        let (mut write, mut read) = ws_stream.split();

        let (in_tx, in_rx) = mpsc::channel(buffer);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundEvent>();

        if in_tx.send(ChannelEvent::Connected).await.is_err() {
            warn!("Channel receiver dropped before connect notification");
        }

        // Receive task
        let reader_tx = in_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => match decode_event(&text) {
                        Ok(event) => {
                            if reader_tx.send(ChannelEvent::Event(event)).await.is_err() {
                                debug!("Channel receiver dropped, stopping reader");
                                return;
                            }
                        }
                        Err(e) => warn!("Skipping undecodable push event: {} ({})", e, text),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string()).unwrap_or_else(|| "closed".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Push channel error: {}", e);
                        break e.to_string();
                    }
                    None => break "stream ended".to_string(),
                }
            };
            let _ = reader_tx.send(ChannelEvent::Disconnected(reason)).await;
        });

        // Send task
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode {:?}: {}", event, e);
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    error!("Failed to send push event: {}", e);
                    let _ = in_tx.send(ChannelEvent::Disconnected(e.to_string())).await;
                    break;
                }
            }
            debug!("Push channel writer stopped");
        });

        Ok(ChannelHandle::new(out_tx, in_rx))
    }
}
