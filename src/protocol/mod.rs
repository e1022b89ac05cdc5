//! Wire protocol
//!
//! Two layers travel over the relay connection as JSON text frames:
//!
//! - the relay envelope, which the relay itself understands
//!   (`{"login": ..}`, `{"sender", "receivers", "payload"}`, `{"error": ..}`)
//! - the contract payload carried inside `payload`, which only nodes decode
//!
//! Decoding is strict: unknown message tags, missing fields and malformed
//! identifiers are all rejected with a `DecodeError`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ContractId, DecodeError, DecodeResult, PartyId};

/// First frame a client sends: `{"login": "<PartyId>"}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Login {
    /// Party the connection authenticates as
    pub login: PartyId,
}

/// Routed message: `{"sender", "receivers", "payload"}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P = Value> {
    /// Party that sent the message
    pub sender: PartyId,
    /// Parties the relay should deliver to
    pub receivers: Vec<PartyId>,
    /// Application payload, opaque to the relay
    pub payload: P,
}

impl<P> Envelope<P> {
    /// Create an envelope
    pub fn new(sender: PartyId, receivers: Vec<PartyId>, payload: P) -> Self {
        Envelope {
            sender,
            receivers,
            payload,
        }
    }
}

/// Error frame sent by the relay right before it closes a connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Human readable description of what went wrong
    pub error: String,
}

impl ErrorFrame {
    /// Create an error frame from anything displayable
    pub fn new(error: impl ToString) -> Self {
        ErrorFrame {
            error: error.to_string(),
        }
    }
}

/// Contract replication message, keyed by `type`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContractMessage {
    /// Create a contract
    Propose {
        /// Identifier minted by the proposer
        id: ContractId,
        /// Free text
        description: String,
        /// Party proposing the contract
        proposer: PartyId,
        /// Party doing the work
        assignee: PartyId,
        /// Parties reviewing the work
        reviewers: Vec<PartyId>,
    },
    /// A stakeholder agrees to the proposal
    Accept {
        /// Contract the message applies to
        id: ContractId,
    },
    /// The assignee starts working
    Start {
        /// Contract the message applies to
        id: ContractId,
    },
    /// The assignee hands the work in for review
    Finish {
        /// Contract the message applies to
        id: ContractId,
    },
    /// A reviewer sends the work back
    Reject {
        /// Contract the message applies to
        id: ContractId,
        /// Reason for the rejection
        comment: String,
    },
    /// A reviewer signs the work off
    Approve {
        /// Contract the message applies to
        id: ContractId,
    },
}

impl ContractMessage {
    /// The contract this message refers to
    pub fn id(&self) -> &ContractId {
        match self {
            ContractMessage::Propose { id, .. }
            | ContractMessage::Accept { id }
            | ContractMessage::Start { id }
            | ContractMessage::Finish { id }
            | ContractMessage::Reject { id, .. }
            | ContractMessage::Approve { id } => id,
        }
    }

    /// The wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ContractMessage::Propose { .. } => "propose",
            ContractMessage::Accept { .. } => "accept",
            ContractMessage::Start { .. } => "start",
            ContractMessage::Finish { .. } => "finish",
            ContractMessage::Reject { .. } => "reject",
            ContractMessage::Approve { .. } => "approve",
        }
    }
}

/// Command issued by the local user of a node
///
/// Unlike `ContractMessage`, a proposal carries neither id nor proposer:
/// the node fills both in from its own identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Command {
    Propose {
        description: String,
        assignee: PartyId,
        reviewers: Vec<PartyId>,
    },
    Accept {
        id: ContractId,
    },
    Start {
        id: ContractId,
    },
    Finish {
        id: ContractId,
    },
    Reject {
        id: ContractId,
        comment: String,
    },
    Approve {
        id: ContractId,
    },
}

impl Command {
    /// Turn the command into the protocol message `participant` will send
    pub fn into_message(self, participant: &PartyId) -> ContractMessage {
        match self {
            Command::Propose {
                description,
                assignee,
                reviewers,
            } => ContractMessage::Propose {
                id: ContractId::generate(participant),
                description,
                proposer: participant.clone(),
                assignee,
                reviewers,
            },
            Command::Accept { id } => ContractMessage::Accept { id },
            Command::Start { id } => ContractMessage::Start { id },
            Command::Finish { id } => ContractMessage::Finish { id },
            Command::Reject { id, comment } => ContractMessage::Reject { id, comment },
            Command::Approve { id } => ContractMessage::Approve { id },
        }
    }
}

/// Decode a JSON text frame into `T`
pub fn decode<T: DeserializeOwned>(text: &str) -> DecodeResult<T> {
    serde_json::from_str(text).map_err(DecodeError::from)
}

/// Decode a login frame
pub fn decode_login(text: &str) -> DecodeResult<Login> {
    decode(text)
}

/// Decode a routed envelope, leaving the payload opaque
pub fn decode_envelope(text: &str) -> DecodeResult<Envelope> {
    decode(text)
}

/// Decode a routed envelope carrying a contract message
pub fn decode_contract_envelope(text: &str) -> DecodeResult<Envelope<ContractMessage>> {
    decode(text)
}

/// Encode any protocol frame as JSON text
///
/// Fails with [`DecodeError::Malformed`] if the frame has no JSON form,
/// such as a payload map with non-string keys.
pub fn encode<T: Serialize>(frame: &T) -> DecodeResult<String> {
    Ok(serde_json::to_string(frame)?)
}
