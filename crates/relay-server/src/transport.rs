//! [`Connection`] over an upgraded axum WebSocket.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::{Frame, RelayError, Result};
use tracing::trace;

use crate::connection::{Connection, FrameSink, FrameSource, Liveness};

/// An upgraded socket, not yet split.
pub struct WsConnection(WebSocket);

impl WsConnection {
    /// Wrap an upgraded socket.
    pub fn new(socket: WebSocket) -> Self {
        Self(socket)
    }
}

/// Read half of a [`WsConnection`].
pub struct WsReader {
    stream: SplitStream<WebSocket>,
    liveness: Liveness,
}

/// Write half of a [`WsConnection`].
pub struct WsWriter(SplitSink<WebSocket, Message>);

impl Connection for WsConnection {
    type Reader = WsReader;
    type Writer = WsWriter;

    fn split(self) -> (WsReader, WsWriter) {
        let (tx, rx) = self.0.split();
        let reader = WsReader {
            stream: rx,
            liveness: Liveness::new(),
        };
        (reader, WsWriter(tx))
    }
}

/// Application frame carried by `msg`, or `None` for control messages.
/// Text keeps the socket's buffer.
fn from_message(msg: Message) -> Option<Result<Frame>> {
    match msg {
        Message::Text(text) => Some(Frame::text_from_bytes(Bytes::from(text)).map_err(RelayError::transport)),
        Message::Binary(data) => Some(Ok(Frame::Binary(data))),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

fn to_message(frame: Frame) -> Result<Message> {
    match frame {
        Frame::Text(text) => Utf8Bytes::try_from(text.into_bytes())
            .map(Message::Text)
            .map_err(RelayError::transport),
        Frame::Binary(data) => Ok(Message::Binary(data)),
    }
}

#[async_trait]
impl FrameSource for WsReader {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(RelayError::transport(e))),
            };
            if let Message::Close(frame) = &msg {
                trace!(code = frame.as_ref().map(|f| f.code), "peer sent close");
                return None;
            }
            // Pings are answered by the protocol layer; both directions count.
            self.liveness.mark_alive();
            if let Some(frame) = from_message(msg) {
                return Some(frame);
            }
        }
    }

    fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let msg = to_message(frame)?;
        self.0.send(msg).await.map_err(RelayError::transport)
    }

    async fn ping(&mut self) -> Result<()> {
        self.0
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(RelayError::transport)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        self.0
            .send(Message::Close(Some(frame)))
            .await
            .map_err(RelayError::transport)?;
        let _ = self.0.close().await;
        Ok(())
    }
}
