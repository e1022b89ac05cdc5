//! Replica driver
//!
//! A node never commits its own commands directly. A command is checked
//! against the local ledger (dry run), turned into a protocol message and
//! sent to every stakeholder, the node itself included. Every replica,
//! the sender's among them, then commits the transition when the relay
//! delivers the message. All replicas therefore apply the same sequence
//! through the same state machine.

use thiserror::Error;
use tracing::debug;

use crate::contract::{self, Contract, TransitionError};
use crate::ids::{ContractId, DecodeError, PartyId};
use crate::ledger::{Ledger, StorageError};
use crate::protocol::{self, Command, ContractMessage, Envelope};

/// Failures while preparing or applying contract messages
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// The inbound frame could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The state machine refused the message
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The ledger failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for replica operations
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// One party's replica of the contracts it takes part in
pub struct Replica<L> {
    party: PartyId,
    ledger: L,
}

impl<L: Ledger> Replica<L> {
    /// Create a replica for `party` on top of `ledger`
    pub fn new(party: PartyId, ledger: L) -> Self {
        Replica { party, ledger }
    }

    /// The party this replica belongs to
    pub fn party(&self) -> &PartyId {
        &self.party
    }

    /// Read access to the underlying ledger
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Validate a local command and build the envelope announcing it
    ///
    /// Nothing is persisted; the transition is committed when the message
    /// comes back through the relay.
    pub fn prepare(&self, command: Command) -> ReplicaResult<Envelope<ContractMessage>> {
        let message = command.into_message(&self.party);
        let contract = self.dry_run(&self.party, &message)?;
        debug!(id = %message.id(), kind = message.kind(), "Prepared command");
        Ok(Envelope::new(
            self.party.clone(),
            contract.stakeholders(),
            message,
        ))
    }

    /// Apply a message sent by `sender` and persist the result
    pub fn apply(&mut self, sender: &PartyId, message: &ContractMessage) -> ReplicaResult<Contract> {
        let id = message.id();
        let existing = self.ledger.fetch(id)?;
        let contract = contract::transition(existing.as_ref(), sender, message)?;
        match existing {
            None => self.ledger.create(id, &contract)?,
            Some(_) => self.ledger.update(id, &contract)?,
        }
        debug!(%id, %sender, kind = message.kind(), state = %contract.state, "Applied message");
        Ok(contract)
    }

    /// Decode a raw inbound envelope and apply its payload
    pub fn handle_inbound(&mut self, text: &str) -> ReplicaResult<(ContractId, Contract)> {
        let envelope = protocol::decode_contract_envelope(text)?;
        self.handle_envelope(&envelope)
    }

    /// Apply an already decoded envelope
    pub fn handle_envelope(
        &mut self,
        envelope: &Envelope<ContractMessage>,
    ) -> ReplicaResult<(ContractId, Contract)> {
        let contract = self.apply(&envelope.sender, &envelope.payload)?;
        Ok((envelope.payload.id().clone(), contract))
    }

    fn dry_run(&self, sender: &PartyId, message: &ContractMessage) -> ReplicaResult<Contract> {
        let existing = self.ledger.fetch(message.id())?;
        Ok(contract::transition(existing.as_ref(), sender, message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractState;
    use crate::ledger::MemoryLedger;

    fn party(name: &str) -> PartyId {
        PartyId::parse(name).unwrap()
    }

    fn propose_command() -> Command {
        Command::Propose {
            description: "Bake a cake".to_string(),
            assignee: party("Bob"),
            reviewers: vec![party("Alice")],
        }
    }

    /// Deliver an envelope to every listed replica, like the relay would
    fn deliver(envelope: &Envelope<ContractMessage>, replicas: &mut [&mut Replica<MemoryLedger>]) {
        let text = protocol::encode(envelope).unwrap();
        for replica in replicas.iter_mut() {
            if envelope.receivers.contains(replica.party()) {
                replica.handle_inbound(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_prepare_does_not_persist() {
        let alice = Replica::new(party("Alice"), MemoryLedger::new());
        let envelope = alice.prepare(propose_command()).unwrap();

        assert_eq!(envelope.sender, party("Alice"));
        assert_eq!(envelope.receivers, vec![party("Alice"), party("Bob")]);
        assert!(envelope.payload.id().is_minted_by(&party("Alice")));
        assert!(alice.ledger().list().unwrap().is_empty());
    }

    #[test]
    fn test_prepare_rejects_invalid_transition() {
        let bob = Replica::new(party("Bob"), MemoryLedger::new());
        let id = ContractId::generate(&party("Alice"));

        let err = bob.prepare(Command::Accept { id: id.clone() }).unwrap_err();
        assert!(matches!(
            err,
            ReplicaError::Transition(TransitionError::UnknownId(unknown)) if unknown == id
        ));
    }

    #[test]
    fn test_replicas_converge() {
        let mut alice = Replica::new(party("Alice"), MemoryLedger::new());
        let mut bob = Replica::new(party("Bob"), MemoryLedger::new());

        let proposal = alice.prepare(propose_command()).unwrap();
        deliver(&proposal, &mut [&mut alice, &mut bob]);
        let id = proposal.payload.id().clone();

        let steps: Vec<(bool, Command)> = vec![
            (false, Command::Accept { id: id.clone() }),
            (false, Command::Start { id: id.clone() }),
            (false, Command::Finish { id: id.clone() }),
            (
                true,
                Command::Reject {
                    id: id.clone(),
                    comment: "more icing".to_string(),
                },
            ),
            (false, Command::Finish { id: id.clone() }),
            (true, Command::Approve { id: id.clone() }),
        ];
        for (by_alice, command) in steps {
            let envelope = if by_alice {
                alice.prepare(command).unwrap()
            } else {
                bob.prepare(command).unwrap()
            };
            deliver(&envelope, &mut [&mut alice, &mut bob]);
            assert_eq!(
                alice.ledger().fetch_all().unwrap(),
                bob.ledger().fetch_all().unwrap()
            );
        }

        let done = alice.ledger().fetch(&id).unwrap().unwrap();
        assert_eq!(done.state, ContractState::Done);
        assert_eq!(done.comments, vec!["more icing".to_string()]);
    }

    #[test]
    fn test_duplicate_delivery_is_rejected() {
        let mut alice = Replica::new(party("Alice"), MemoryLedger::new());
        let mut bob = Replica::new(party("Bob"), MemoryLedger::new());

        let proposal = alice.prepare(propose_command()).unwrap();
        deliver(&proposal, &mut [&mut alice, &mut bob]);
        let text = protocol::encode(&proposal).unwrap();
        assert!(matches!(
            bob.handle_inbound(&text),
            Err(ReplicaError::Transition(TransitionError::DuplicateId(_)))
        ));

        let accept = bob
            .prepare(Command::Accept {
                id: proposal.payload.id().clone(),
            })
            .unwrap();
        deliver(&accept, &mut [&mut alice, &mut bob]);
        let snapshot = alice.ledger().fetch_all().unwrap();

        let text = protocol::encode(&accept).unwrap();
        assert!(alice.handle_inbound(&text).is_err());
        assert_eq!(alice.ledger().fetch_all().unwrap(), snapshot);
    }

    #[test]
    fn test_spoofed_proposal_is_rejected() {
        let mut bob = Replica::new(party("Bob"), MemoryLedger::new());
        let mut proposal = Replica::new(party("Alice"), MemoryLedger::new())
            .prepare(propose_command())
            .unwrap();
        proposal.sender = party("Mallory");

        let err = bob.handle_inbound(&protocol::encode(&proposal).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            ReplicaError::Transition(TransitionError::ForeignId { .. })
        ));
        assert!(bob.ledger().list().unwrap().is_empty());
    }

    #[test]
    fn test_garbage_inbound_is_a_decode_error() {
        let mut bob = Replica::new(party("Bob"), MemoryLedger::new());
        let err = bob
            .handle_inbound(r#"{"sender": "Alice", "receivers": ["Bob"], "payload": {"type": "launch"}}"#)
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Decode(_)));
    }
}
