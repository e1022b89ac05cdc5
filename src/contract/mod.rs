//! Contract lifecycle
//!
//! A contract is a small task record replicated between its stakeholders.
//! Every replica applies the same protocol messages through the pure
//! functions in this module, so replicas that have seen the same messages
//! hold byte-identical contracts.
//!
//! ```text
//! PROPOSED --accept*--> ACCEPTED --start--> IN_PROGRESS --finish--> IN_REVIEW --approve*--> DONE
//!                                                ^                      |
//!                                                +-------reject---------+
//! ```
//!
//! `accept` and `approve` need a quorum (every member of the respective
//! missing set); all other transitions need a single designated actor.
//!
//! # Example
//!
//! ```rust
//! use qanban::contract::{self, ContractState};
//! use qanban::ids::{ContractId, PartyId};
//! use qanban::protocol::ContractMessage;
//!
//! let alice = PartyId::parse("Alice").unwrap();
//! let bob = PartyId::parse("Bob").unwrap();
//! let id = ContractId::generate(&alice);
//!
//! let proposal = ContractMessage::Propose {
//!     id: id.clone(),
//!     description: "Bake a cake".to_string(),
//!     proposer: alice.clone(),
//!     assignee: bob.clone(),
//!     reviewers: vec![alice.clone()],
//! };
//! let proposed = contract::propose(&alice, &proposal).unwrap();
//! assert_eq!(proposed.missing_acceptances, vec![bob.clone()]);
//!
//! let accepted = proposed.apply(&bob, &ContractMessage::Accept { id }).unwrap();
//! assert_eq!(accepted.state, ContractState::Accepted);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::ids::{ContractId, PartyId};
use crate::protocol::ContractMessage;

/// Lifecycle stage of a contract
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractState {
    /// Waiting for every stakeholder to accept
    Proposed,
    /// Everybody agreed, work has not started
    Accepted,
    /// The assignee is working
    InProgress,
    /// Waiting for the reviewers
    InReview,
    /// Approved by every reviewer
    Done,
}

impl ContractState {
    /// All states in lifecycle order
    pub const ALL: [ContractState; 5] = [
        ContractState::Proposed,
        ContractState::Accepted,
        ContractState::InProgress,
        ContractState::InReview,
        ContractState::Done,
    ];
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContractState::Proposed => "PROPOSED",
            ContractState::Accepted => "ACCEPTED",
            ContractState::InProgress => "IN_PROGRESS",
            ContractState::InReview => "IN_REVIEW",
            ContractState::Done => "DONE",
        })
    }
}

/// Why a message could not be applied
///
/// The contract the message was applied to is never modified when one of
/// these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The message type is not valid in the contract's current state
    #[error("message {message} not allowed in state {state}")]
    InvalidState {
        /// Tag of the offending message
        message: &'static str,
        /// State the contract was in
        state: ContractState,
    },

    /// The sender is not entitled to send this message right now
    #[error("sender '{sender}' of message {message} not allowed: {rule}")]
    SenderNotAllowed {
        /// Party that sent the message
        sender: PartyId,
        /// Tag of the offending message
        message: &'static str,
        /// The rule the sender violated
        rule: &'static str,
    },

    /// The contract id was not minted by the sender
    #[error("id {id} does not start with sender '{sender}'")]
    ForeignId {
        /// Offending identifier
        id: ContractId,
        /// Party that sent the proposal
        sender: PartyId,
    },

    /// The sender claims somebody else proposed the contract
    #[error("sender '{sender}' is not proposer '{proposer}'")]
    NotProposer {
        /// Party that sent the proposal
        sender: PartyId,
        /// Proposer named in the message
        proposer: PartyId,
    },

    /// A proposal reuses an identifier that is already known
    #[error("duplicate id {0}")]
    DuplicateId(ContractId),

    /// An update refers to a contract that is not known
    #[error("id {0} does not exist")]
    UnknownId(ContractId),

    /// A proposal was passed to `apply` or an update to `propose`
    #[error("message {0} cannot be used here")]
    WrongKind(&'static str),
}

/// Result type for contract transitions
pub type TransitionResult<T> = Result<T, TransitionError>;

/// The replicated record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    /// Lifecycle stage
    pub state: ContractState,
    /// Free text, fixed at creation
    pub description: String,
    /// Party that proposed the contract
    pub proposer: PartyId,
    /// Party doing the work
    pub assignee: PartyId,
    /// Parties reviewing the work, without duplicates
    pub reviewers: Vec<PartyId>,
    /// One entry per rejection, oldest first
    pub comments: Vec<String>,
    /// Stakeholders that have not accepted yet
    pub missing_acceptances: Vec<PartyId>,
    /// Reviewers that have not approved the current review round yet
    pub missing_approvals: Vec<PartyId>,
}

impl Contract {
    /// Proposer, assignee and reviewers, each once, in that order
    pub fn stakeholders(&self) -> Vec<PartyId> {
        let mut parties = Vec::with_capacity(self.reviewers.len() + 2);
        for party in [&self.proposer, &self.assignee]
            .into_iter()
            .chain(self.reviewers.iter())
        {
            if !parties.contains(party) {
                parties.push(party.clone());
            }
        }
        parties
    }

    /// Whether `party` may receive and act on this contract
    pub fn is_stakeholder(&self, party: &PartyId) -> bool {
        self.proposer == *party || self.assignee == *party || self.reviewers.contains(party)
    }

    /// Apply an update message sent by `sender`
    ///
    /// Returns the successor contract; `self` is left untouched either way.
    pub fn apply(&self, sender: &PartyId, message: &ContractMessage) -> TransitionResult<Contract> {
        let kind = message.kind();
        let expect_state = |state: ContractState| {
            if self.state == state {
                Ok(())
            } else {
                Err(TransitionError::InvalidState {
                    message: kind,
                    state: self.state,
                })
            }
        };
        let expect_sender = |allowed: bool, rule: &'static str| {
            if allowed {
                Ok(())
            } else {
                Err(TransitionError::SenderNotAllowed {
                    sender: sender.clone(),
                    message: kind,
                    rule,
                })
            }
        };

        let mut next = self.clone();
        match message {
            ContractMessage::Propose { .. } => return Err(TransitionError::WrongKind(kind)),
            ContractMessage::Accept { .. } => {
                expect_state(ContractState::Proposed)?;
                expect_sender(
                    self.missing_acceptances.contains(sender),
                    "sender has no pending acceptance",
                )?;
                next.missing_acceptances.retain(|party| party != sender);
                if next.missing_acceptances.is_empty() {
                    next.state = ContractState::Accepted;
                }
            }
            ContractMessage::Start { .. } => {
                expect_state(ContractState::Accepted)?;
                expect_sender(*sender == self.assignee, "only the assignee may start")?;
                next.state = ContractState::InProgress;
            }
            ContractMessage::Finish { .. } => {
                expect_state(ContractState::InProgress)?;
                expect_sender(*sender == self.assignee, "only the assignee may finish")?;
                next.state = ContractState::InReview;
                next.missing_approvals = self
                    .reviewers
                    .iter()
                    .filter(|reviewer| *reviewer != sender)
                    .cloned()
                    .collect();
            }
            ContractMessage::Reject { comment, .. } => {
                expect_state(ContractState::InReview)?;
                expect_sender(self.reviewers.contains(sender), "only reviewers may reject")?;
                next.state = ContractState::InProgress;
                next.comments.push(comment.clone());
                next.missing_approvals.clear();
            }
            ContractMessage::Approve { .. } => {
                expect_state(ContractState::InReview)?;
                expect_sender(
                    self.missing_approvals.contains(sender),
                    "sender has no pending approval",
                )?;
                next.missing_approvals.retain(|party| party != sender);
                if next.missing_approvals.is_empty() {
                    next.state = ContractState::Done;
                }
            }
        }
        Ok(next)
    }
}

/// Create a contract from a proposal sent by `sender`
///
/// Checks that the id was minted by the sender and that the sender is the
/// declared proposer. Whether the id is already known is up to the caller,
/// which owns the ledger.
pub fn propose(sender: &PartyId, message: &ContractMessage) -> TransitionResult<Contract> {
    let ContractMessage::Propose {
        id,
        description,
        proposer,
        assignee,
        reviewers,
    } = message
    else {
        return Err(TransitionError::WrongKind(message.kind()));
    };

    if !id.is_minted_by(sender) {
        return Err(TransitionError::ForeignId {
            id: id.clone(),
            sender: sender.clone(),
        });
    }
    if sender != proposer {
        return Err(TransitionError::NotProposer {
            sender: sender.clone(),
            proposer: proposer.clone(),
        });
    }

    let mut unique_reviewers: Vec<PartyId> = Vec::with_capacity(reviewers.len());
    for reviewer in reviewers {
        if !unique_reviewers.contains(reviewer) {
            unique_reviewers.push(reviewer.clone());
        }
    }

    let mut contract = Contract {
        state: ContractState::Proposed,
        description: description.clone(),
        proposer: proposer.clone(),
        assignee: assignee.clone(),
        reviewers: unique_reviewers,
        comments: Vec::new(),
        missing_acceptances: Vec::new(),
        missing_approvals: Vec::new(),
    };
    contract.missing_acceptances = contract
        .stakeholders()
        .into_iter()
        .filter(|party| party != sender)
        .collect();
    Ok(contract)
}

/// Apply any contract message to an optional existing replica
///
/// This is the single entry point replicas use: proposals require the
/// contract to be absent, updates require it to be present.
pub fn transition(
    existing: Option<&Contract>,
    sender: &PartyId,
    message: &ContractMessage,
) -> TransitionResult<Contract> {
    match (message, existing) {
        (ContractMessage::Propose { id, .. }, Some(_)) => Err(TransitionError::DuplicateId(id.clone())),
        (ContractMessage::Propose { .. }, None) => propose(sender, message),
        (_, Some(contract)) => contract.apply(sender, message),
        (_, None) => Err(TransitionError::UnknownId(message.id().clone())),
    }
}
