//! Store-and-forward relay
//!
//! The relay authenticates named parties over WebSocket and routes
//! envelopes between them by receiver list. Messages for parties that are
//! not connected go to an offline queue and are replayed, in order, when
//! the party logs in.
//!
//! Connection lifecycle:
//!
//! ```text
//! UNAUTHENTICATED --{"login"}--> AUTHENTICATED --close/error/timeout--> CLOSED
//! ```
//!
//! Any decode failure or protocol violation sends `{"error": ..}` to the
//! offending connection and closes it; other connections are unaffected.

pub mod config;
pub mod queue;
pub mod registry;

pub use config::{ConfigError, RelayConfig};
pub use queue::{MemoryQueue, OfflineQueue, PartyKey, QueueError, SqliteQueue};
pub use registry::{SessionHandle, SessionRegistry};

use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, error, info, warn};

use crate::ids::{DecodeError, Namespace, PartyId};
use crate::protocol::{self, ErrorFrame};
use registry::Inbox;

/// Reasons a relay connection is terminated
#[derive(Error, Debug)]
pub enum RelayError {
    /// The frame could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The party already has a live connection
    #[error("User {0} is already connected.")]
    AlreadyConnected(PartyId),

    /// An authenticated connection sent a message on behalf of someone else
    #[error("Sender {sender} does not match participant {participant}.")]
    SenderMismatch {
        /// Sender named in the envelope
        sender: PartyId,
        /// Party the connection logged in as
        participant: PartyId,
    },

    /// A routed message arrived before the login frame
    #[error("Not logged in.")]
    NotLoggedIn,

    /// The peer did not answer pings, or did not take a write, within the
    /// liveness window
    #[error("Connection timed out.")]
    Timeout,

    /// The relay configuration is unusable
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The offline queue failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The WebSocket transport failed
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// Binding or accepting failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Waiting for the login frame
    Unauthenticated,
    /// Logged in as the given party
    Authenticated(PartyKey),
}

/// Per-connection state
struct ConnectionState {
    id: u64,
    addr: SocketAddr,
    namespace: Namespace,
    phase: Phase,
    outbox: registry::Outbox,
}

/// The relay server
pub struct Relay {
    config: RelayConfig,
    registry: SessionRegistry,
    queue: Arc<dyn OfflineQueue>,
    next_conn_id: AtomicU64,
}

impl Relay {
    /// Create a relay using the given offline queue backing
    ///
    /// Fails with [`RelayError::Config`] if `config` does not validate.
    pub fn new(config: RelayConfig, queue: Arc<dyn OfflineQueue>) -> RelayResult<Self> {
        config.validate()?;
        Ok(Relay {
            config,
            registry: SessionRegistry::new(),
            queue,
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Create a relay whose queue backing is chosen by `config.queue_path`
    pub fn from_config(config: RelayConfig) -> RelayResult<Self> {
        config.validate()?;
        let queue: Arc<dyn OfflineQueue> = match &config.queue_path {
            Some(path) => Arc::new(SqliteQueue::open(path)?),
            None => Arc::new(MemoryQueue::new()),
        };
        Self::new(config, queue)
    }

    /// The relay's configuration
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The session registry
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(self: Arc<Self>) -> RelayResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener`, one task per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> RelayResult<()> {
        info!("Relay listening on ws://{}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            let relay = Arc::clone(&self);
            tokio::spawn(async move { relay.handle_connection(stream, addr).await });
        }
    }

    /// Register `key` on `outbox` and replay its offline queue
    ///
    /// The slot lock is held from the duplicate check until the session is
    /// live, so concurrent deliveries to `key` either land in the queue
    /// before the drain or on the live connection after it.
    async fn login(&self, key: &PartyKey, handle: SessionHandle, outbox: &registry::Outbox) -> RelayResult<()> {
        let mut slot = self.registry.lock(key).await;
        if slot.is_live() {
            return Err(RelayError::AlreadyConnected(key.party.clone()));
        }
        let backlog = self.queue.dequeue_all(key).await?;
        let replayed = backlog.len();
        for message in backlog {
            // The inbox is owned by the connection task running this login.
            let _ = outbox.send(message);
        }
        slot.register(handle);
        info!(%key, replayed, "Party logged in");
        Ok(())
    }

    /// Deliver a raw message to `receiver`, live or via its queue
    async fn deliver(&self, receiver: PartyKey, message: String) -> RelayResult<()> {
        let slot = self.registry.lock(&receiver).await;
        match slot.deliver(message) {
            Ok(()) => debug!(%receiver, "Delivered live"),
            Err(message) => {
                let queued = self.queue.enqueue(&receiver, message).await;
                drop(slot);
                self.registry.release(&receiver);
                queued?;
                debug!(%receiver, "Queued for offline party");
            }
        }
        Ok(())
    }

    /// Release the party's slot and requeue anything not yet written out
    async fn logout(&self, key: &PartyKey, conn_id: u64, inbox: &mut Inbox) {
        let mut slot = self.registry.lock(key).await;
        if !slot.unregister(conn_id) {
            return;
        }
        inbox.close();
        let mut requeued = 0usize;
        while let Ok(message) = inbox.try_recv() {
            if let Err(e) = self.queue.enqueue(key, message).await {
                error!(%key, "Failed to requeue unsent message: {}", e);
                continue;
            }
            requeued += 1;
        }
        drop(slot);
        self.registry.release(key);
        info!(%key, requeued, "Party logged out");
    }

    /// Process one inbound text frame
    async fn on_text(&self, conn: &mut ConnectionState, text: String) -> RelayResult<()> {
        match &conn.phase {
            Phase::Unauthenticated => {
                let login = match protocol::decode_login(&text) {
                    Ok(login) => login,
                    Err(_) if protocol::decode_envelope(&text).is_ok() => {
                        return Err(RelayError::NotLoggedIn)
                    }
                    Err(e) => return Err(e.into()),
                };
                let key = PartyKey::new(conn.namespace.clone(), login.login);
                let handle = SessionHandle::new(conn.id, conn.outbox.clone());
                self.login(&key, handle, &conn.outbox).await?;
                conn.phase = Phase::Authenticated(key);
            }
            Phase::Authenticated(key) => {
                let envelope = protocol::decode_envelope(&text)?;
                if envelope.sender != key.party {
                    return Err(RelayError::SenderMismatch {
                        sender: envelope.sender,
                        participant: key.party.clone(),
                    });
                }
                let mut receivers: Vec<PartyId> = Vec::with_capacity(envelope.receivers.len());
                for receiver in envelope.receivers {
                    if !receivers.contains(&receiver) {
                        receivers.push(receiver);
                    }
                }
                debug!(sender = %key, receivers = receivers.len(), "Routing message");
                for receiver in receivers {
                    let receiver = PartyKey::new(conn.namespace.clone(), receiver);
                    self.deliver(receiver, text.clone()).await?;
                }
            }
        }
        Ok(())
    }

    /// Handle a single WebSocket connection
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut namespace = None;
        let require_namespace = self.config.require_namespace;
        let callback = |request: &Request, response: Response| {
            match Namespace::from_path(request.uri().path()) {
                Ok(ns) if !(require_namespace && ns.is_default()) => {
                    namespace = Some(ns);
                    Ok(response)
                }
                _ => {
                    let mut refusal = ErrorResponse::new(Some("Unknown namespace".to_string()));
                    *refusal.status_mut() = StatusCode::NOT_FOUND;
                    Err(refusal)
                }
            }
        };

        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake failed for {}: {}", addr, e);
                return;
            }
        };
        let Some(namespace) = namespace else {
            return;
        };
        info!(%addr, %namespace, "New connection");

        let (mut write, mut read) = ws_stream.split();
        let (outbox, mut inbox) = mpsc::unbounded_channel::<String>();
        let mut conn = ConnectionState {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            addr,
            namespace,
            phase: Phase::Unauthenticated,
            outbox,
        };

        let mut ping = time::interval(self.config.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut last_seen = Instant::now();
        // A peer that stops reading stalls writes instead of missing pings.
        let write_limit = self.config.liveness_timeout();

        let outcome: RelayResult<()> = loop {
            tokio::select! {
                // Handle incoming WebSocket messages
                msg = read.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.on_text(&mut conn, text).await {
                                break Err(e);
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            break Err(DecodeError::Malformed("binary frames are not supported".into()).into());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = send_within(&mut write, Message::Pong(data), write_limit).await {
                                break Err(e);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(e.into()),
                    }
                }

                // Forward messages routed to this party
                Some(message) = inbox.recv() => {
                    if let Err(e) = send_within(&mut write, Message::Text(message.clone()), write_limit).await {
                        // Not written; queue it ahead of what logout requeues.
                        if let Phase::Authenticated(key) = &conn.phase {
                            if let Err(qe) = self.queue.enqueue(key, message).await {
                                error!(%key, "Failed to requeue message: {}", qe);
                            }
                        }
                        break Err(e);
                    }
                }

                // Liveness
                _ = ping.tick() => {
                    if last_seen.elapsed() > self.config.liveness_timeout() {
                        break Err(RelayError::Timeout);
                    }
                    if let Err(e) = send_within(&mut write, Message::Ping(Vec::new()), write_limit).await {
                        break Err(e);
                    }
                }
            }
        };

        match &outcome {
            Ok(()) => {}
            Err(RelayError::Transport(e)) => error!("WebSocket error from {}: {}", conn.addr, e),
            Err(e) => {
                warn!(addr = %conn.addr, "Closing connection: {}", e);
                match protocol::encode(&ErrorFrame::new(e)) {
                    Ok(frame) => {
                        let _ = send_within(&mut write, Message::Text(frame), write_limit).await;
                    }
                    Err(e) => error!(addr = %conn.addr, "Failed to encode error frame: {}", e),
                }
                let _ = time::timeout(write_limit, write.close()).await;
            }
        }

        if let Phase::Authenticated(key) = &conn.phase {
            self.logout(key, conn.id, &mut inbox).await;
        }
        info!("Client {} disconnected", conn.addr);
    }
}

/// Write one frame, giving up after `limit`
async fn send_within<S>(sink: &mut S, message: Message, limit: Duration) -> RelayResult<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match time::timeout(limit, sink.send(message)).await {
        Ok(sent) => Ok(sent?),
        Err(_) => Err(RelayError::Timeout),
    }
}
