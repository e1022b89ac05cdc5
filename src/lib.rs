//! # Qanban
//!
//! Peer-to-peer task contracts replicated through a store-and-forward relay.
//!
//! ## Features
//!
//! - **Relay** routing JSON envelopes between named parties, with per
//!   namespace isolation and an offline queue for absent parties
//! - **Contract state machine** shared by every replica: propose, accept,
//!   start, finish, reject and approve
//! - **Ledger** persistence for each node's replicas (in memory or SQLite)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use qanban::{Command, MemoryLedger, PartyId, RelayClient, Replica};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let alice = PartyId::parse("Alice")?;
//! let mut replica = Replica::new(alice.clone(), MemoryLedger::new());
//! let mut client = RelayClient::connect("ws://localhost:7475/").await?;
//! client.login(&alice).await?;
//!
//! let envelope = replica.prepare(Command::Propose {
//!     description: "Bake a cake".into(),
//!     assignee: PartyId::parse("Bob")?,
//!     reviewers: vec![alice.clone()],
//! })?;
//! client.send(&envelope).await?;
//!
//! // The proposal is committed once the relay echoes it back.
//! let echoed = client.receive().await?;
//! replica.handle_inbound(&serde_json::to_string(&echoed)?)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   envelopes    ┌──────────────┐   envelopes    ┌──────────────┐
//! │  node Alice  │ ◄────────────► │    relay     │ ◄────────────► │   node Bob   │
//! │ Replica      │                │ registry     │                │ Replica      │
//! │ Ledger       │                │ offline queue│                │ Ledger       │
//! └──────────────┘                └──────────────┘                └──────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod contract;
pub mod ids;
pub mod ledger;
pub mod node;
pub mod protocol;
pub mod relay;
pub mod transport;

// Re-export main types at crate root
pub use contract::{Contract, ContractState, TransitionError};
pub use ids::{ContractId, DecodeError, Namespace, PartyId};
pub use ledger::{Ledger, MemoryLedger, SqliteLedger, StorageError};
pub use node::{Replica, ReplicaError};
pub use protocol::{Command, ContractMessage, Envelope};
pub use relay::{Relay, RelayConfig, RelayError};
pub use transport::{RelayClient, TransportError};
