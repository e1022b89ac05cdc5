//! Helpers shared by the integration tests: a relay on an ephemeral port
//! and clients that can tell when the relay has processed their login.

#![allow(dead_code)]

use qanban::protocol::Envelope;
use qanban::relay::{MemoryQueue, OfflineQueue, Relay, RelayConfig};
use qanban::transport::{RelayClient, TransportResult};
use qanban::PartyId;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_SYNC: AtomicU64 = AtomicU64::new(1);

pub fn party(name: &str) -> PartyId {
    PartyId::parse(name).unwrap()
}

/// Serve a relay on `127.0.0.1:0`, returning its base URL and server task
pub async fn start_relay_with(
    config: RelayConfig,
    queue: Arc<dyn OfflineQueue>,
) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = Arc::new(Relay::new(config, queue).unwrap());
    let server = tokio::spawn(async move {
        let _ = relay.serve(listener).await;
    });
    (format!("ws://{}", addr), server)
}

/// Relay with default settings and an in-process queue
pub async fn start_relay() -> String {
    start_relay_with(RelayConfig::default(), Arc::new(MemoryQueue::new()))
        .await
        .0
}

/// Next frame, failing the test if nothing arrives in time
pub async fn receive(client: &mut RelayClient) -> TransportResult<Envelope> {
    timeout(RECEIVE_TIMEOUT, client.receive())
        .await
        .expect("timed out waiting for a frame")
}

/// Send a self-addressed marker and wait for it to come back
///
/// Returns everything that arrived before the marker. Once this returns,
/// the relay has processed every frame the client sent before it.
pub async fn try_sync(client: &mut RelayClient) -> TransportResult<Vec<Envelope>> {
    let me = client.party().expect("client is not logged in").clone();
    let marker = json!({ "sync": NEXT_SYNC.fetch_add(1, Ordering::Relaxed) });
    client
        .send(&Envelope::new(me.clone(), vec![me.clone()], marker.clone()))
        .await?;

    let mut before = Vec::new();
    loop {
        let envelope = receive(client).await?;
        if envelope.sender == me && envelope.payload == marker {
            return Ok(before);
        }
        before.push(envelope);
    }
}

/// `try_sync` for clients that must not fail
pub async fn sync(client: &mut RelayClient) -> Vec<Envelope> {
    try_sync(client).await.unwrap()
}

/// Connect and log in as `name`, returning the replayed backlog
///
/// A refused login is retried for a while, so a party can rejoin right
/// after its previous connection closed.
pub async fn join(url: &str, name: &str) -> (RelayClient, Vec<Envelope>) {
    for _ in 0..100 {
        let mut client = RelayClient::connect(url).await.unwrap();
        client.login(&party(name)).await.unwrap();
        if let Ok(backlog) = try_sync(&mut client).await {
            return (client, backlog);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{name} could not log in to {url}");
}
