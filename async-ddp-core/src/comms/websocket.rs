// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! WebSocket transport on top of tokio-tungstenite.

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use log::{debug, error, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use ddp_types::Error;

use crate::messages::{self, ClientMessage};

use super::{Connector, Transport, TransportPollResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a DDP endpoint over a WebSocket, with TLS when the scheme
/// is `wss`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        endpoint: &str,
        outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    ) -> Result<Box<dyn Transport>, Error> {
        let (stream, _) = connect_async(endpoint)
            .await
            .map_err(|err| Error::Transport(format!("websocket connect failed: {err}")))?;
        let (write, read) = stream.split();
        Ok(Box::new(WebSocketTransport {
            write,
            read,
            outgoing,
            closing: false,
        }))
    }
}

/// A live WebSocket connection. Every DDP message is one text frame;
/// WebSocket-level pings are answered here, protocol-level `ping` is the
/// session's job.
pub struct WebSocketTransport {
    write: SplitSink<WsStream, WsMessage>,
    read: SplitStream<WsStream>,
    outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    closing: bool,
}

impl WebSocketTransport {
    async fn handle_incoming(
        &mut self,
        incoming: Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>,
    ) -> TransportPollResult {
        match incoming {
            None => TransportPollResult::Closed("connection closed by peer".into()),
            Some(Err(err)) => {
                TransportPollResult::Closed(format!("websocket error: {err}"))
            }
            Some(Ok(WsMessage::Text(text))) => match messages::parse_frame(&text) {
                Ok(frame) => TransportPollResult::IncomingFrame(frame),
                Err(_) => {
                    // Partial or garbage frames are dropped, the stream stays up.
                    debug!("Dropping malformed inbound frame");
                    TransportPollResult::IncomingFrame(messages::InboundFrame::Ignored)
                }
            },
            Some(Ok(WsMessage::Ping(payload))) => {
                if let Err(err) = self.write.send(WsMessage::Pong(payload)).await {
                    return TransportPollResult::Closed(format!("websocket error: {err}"));
                }
                TransportPollResult::OutgoingMessageSent
            }
            Some(Ok(WsMessage::Close(_))) => {
                TransportPollResult::Closed("connection closed by peer".into())
            }
            Some(Ok(other)) => {
                warn!("Ignoring unexpected non-text frame: {other:?}");
                TransportPollResult::IncomingFrame(messages::InboundFrame::Ignored)
            }
        }
    }

    async fn send_message(&mut self, message: ClientMessage) -> TransportPollResult {
        if self.closing {
            // A send racing the close is a no-op.
            return TransportPollResult::OutgoingMessageSent;
        }
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                error!("Failed to serialize outbound frame: {err}");
                return TransportPollResult::OutgoingMessageSent;
            }
        };
        match self.write.send(WsMessage::Text(frame)).await {
            Ok(()) => TransportPollResult::OutgoingMessageSent,
            Err(err) => TransportPollResult::Closed(format!("websocket error: {err}")),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn poll(&mut self) -> TransportPollResult {
        tokio::select! {
            incoming = self.read.next() => self.handle_incoming(incoming).await,
            outgoing = self.outgoing.recv() => match outgoing {
                Some(message) => self.send_message(message).await,
                None => {
                    // The session dropped its sender: initiate a clean close.
                    self.closing = true;
                    let _ = self.write.send(WsMessage::Close(None)).await;
                    TransportPollResult::Closed("closed by client".into())
                }
            }
        }
    }
}
