//! WebSocket connection to a relay
//!
//! The namespace is part of the URL path (`ws://host:port/<namespace>`).
//! After connecting, the client logs in once and then exchanges envelopes.

use super::{TransportError, TransportResult};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::ids::PartyId;
use crate::protocol::{self, Envelope, ErrorFrame, Login};

/// WebSocket connection to a relay server
pub struct RelayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    party: Option<PartyId>,
    connected: bool,
}

impl RelayClient {
    /// Connect to a relay server
    ///
    /// A relay that does not serve the URL's namespace refuses the
    /// handshake, which is reported as `ConnectionFailed`.
    pub async fn connect(relay_url: &str) -> TransportResult<Self> {
        let (ws, _) = connect_async(relay_url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(RelayClient {
            ws,
            party: None,
            connected: true,
        })
    }

    /// Authenticate as `party`
    ///
    /// The relay sends no acknowledgement. A refused login shows up as a
    /// `Relay` error on the next `receive`.
    pub async fn login(&mut self, party: &PartyId) -> TransportResult<()> {
        let frame = Login {
            login: party.clone(),
        };
        let text = protocol::encode(&frame).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.send_text(text).await?;
        self.party = Some(party.clone());
        debug!(%party, "Sent login");
        Ok(())
    }

    /// Party this client logged in as
    pub fn party(&self) -> Option<&PartyId> {
        self.party.as_ref()
    }

    /// Send an envelope
    pub async fn send<P: Serialize>(&mut self, envelope: &Envelope<P>) -> TransportResult<()> {
        let json = protocol::encode(envelope).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.send_text(json).await
    }

    /// Send a raw text frame
    pub async fn send_text(&mut self, text: String) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Receive the next envelope
    ///
    /// An error frame from the relay is returned as `TransportError::Relay`.
    pub async fn receive(&mut self) -> TransportResult<Envelope> {
        let text = self.receive_raw().await?;
        if let Ok(frame) = serde_json::from_str::<ErrorFrame>(&text) {
            return Err(TransportError::Relay(frame.error));
        }
        protocol::decode_envelope(&text).map_err(|e| TransportError::InvalidData(e.to_string()))
    }

    /// Receive the next text frame as-is
    pub async fn receive_raw(&mut self) -> TransportResult<String> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Close(_))) | None => {
                    self.connected = false;
                    return Err(TransportError::Disconnected);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Err(e)) => {
                    self.connected = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                _ => continue,
            }
        }
    }

    /// Whether the connection is still open
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Close the connection
    pub async fn close(&mut self) -> TransportResult<()> {
        self.connected = false;
        self.ws
            .close(None)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
