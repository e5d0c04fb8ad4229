//! # Socket Connectors
//!
//! The session never touches a socket directly. It asks a [`Connector`] for a
//! [`Connection`], a pair of frame channels backed by whatever transport the connector
//! owns.
//!
//! ## Connection Lifecycle:
//! - The connector's pump owns the socket exclusively
//! - The inbound receiver yields `None` once the socket has closed, for any reason
//! - Dropping every outbound sender makes the pump send a close frame and exit

use super::message::Frame;
use crate::error::ChannelResult;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

/// One established connection, seen from the session side.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Opens connections to an endpoint URL.
pub trait Connector: Send + Sync + 'static {
    /// Resolves once the connection is ready for traffic, or fails immediately.
    fn open(&self, url: &str) -> BoxFuture<'static, ChannelResult<Connection>>;
}

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str) -> BoxFuture<'static, ChannelResult<Connection>> {
        let url = url.to_string();

        Box::pin(async move {
            let (stream, _response) = connect_async(url.as_str()).await?;
            info!("WebSocket connected: {}", url);

            let (mut sink, mut source) = stream.split();
            let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
            let (inbound_tx, inbound) = mpsc::unbounded_channel::<Frame>();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        outgoing = outbound_rx.recv() => match outgoing {
                            Some(frame) => {
                                let message = match frame {
                                    Frame::Text(text) => WsMessage::Text(text),
                                    Frame::Binary(bytes) => WsMessage::Binary(bytes),
                                };
                                if let Err(e) = sink.send(message).await {
                                    warn!("WebSocket send failed: {}", e);
                                    break;
                                }
                            }
                            None => {
                                debug!("Outbound channel closed, closing socket");
                                let _ = sink.send(WsMessage::Close(None)).await;
                                let _ = sink.close().await;
                                break;
                            }
                        },
                        incoming = source.next() => match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                if inbound_tx.send(Frame::Text(text)).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Binary(bytes))) => {
                                if inbound_tx.send(Frame::Binary(bytes)).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Close(frame))) => {
                                info!("WebSocket closed by server: {:?}", frame);
                                break;
                            }
                            // Protocol-level ping/pong is answered by tungstenite itself
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("WebSocket error: {}", e);
                                break;
                            }
                            None => break,
                        },
                    }
                }
                debug!("WebSocket pump finished");
            });

            Ok(Connection { outbound, inbound })
        })
    }
}
