//! Realtime WebSocket connection and frame handling

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::protocol::Frame;
use crate::api::GatewayError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct RealtimeSocket {
    stream: WsStream,
}

impl RealtimeSocket {
    /// Connect to the realtime endpoint.
    ///
    /// The project key travels in the URL; the user session is presented in
    /// each channel join.
    pub async fn connect(ws_url: &str) -> Result<Self, GatewayError> {
        tracing::info!("Connecting realtime WebSocket");
        tracing::debug!("Realtime URL {}", ws_url);

        let (stream, response) = connect_async(ws_url)
            .await
            .map_err(|e| GatewayError::Realtime(format!("WebSocket connection failed: {}", e)))?;

        tracing::info!("Realtime connected (status={})", response.status());

        Ok(Self { stream })
    }

    /// Send one Phoenix frame.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), GatewayError> {
        let text = frame.encode();
        tracing::debug!("WS send: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| GatewayError::Realtime(format!("Failed to send frame: {}", e)))
    }

    /// Receive the next Phoenix frame, answering pings and skipping undecodable text.
    ///
    /// Returns `None` once the server closes the connection.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>, GatewayError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    match Frame::decode(&text) {
                        Some(frame) => return Ok(Some(frame)),
                        None => tracing::debug!("Ignoring non-Phoenix frame"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| GatewayError::Realtime(format!("Failed to send pong: {}", e)))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(GatewayError::Realtime(format!("WebSocket receive error: {}", e)));
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    /// Best-effort close handshake.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close failed: {}", e);
        }
    }
}
