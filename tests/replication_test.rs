//! Two replicas driving a contract through its whole lifecycle via a live
//! relay

mod common;

use common::{party, start_relay, RECEIVE_TIMEOUT};
use qanban::contract::{Contract, ContractState};
use qanban::ledger::{Ledger, SqliteLedger};
use qanban::protocol::Command;
use qanban::{ContractId, RelayClient, Replica};
use tokio::time::timeout;

struct Node {
    replica: Replica<SqliteLedger>,
    client: RelayClient,
}

impl Node {
    async fn start(url: &str, name: &str, ledger: SqliteLedger) -> Node {
        let mut client = RelayClient::connect(url).await.unwrap();
        client.login(&party(name)).await.unwrap();
        Node {
            replica: Replica::new(party(name), ledger),
            client,
        }
    }

    async fn submit(&mut self, command: Command) -> ContractId {
        let envelope = self.replica.prepare(command).unwrap();
        self.client.send(&envelope).await.unwrap();
        envelope.payload.id().clone()
    }

    /// Apply the next inbound message
    async fn apply_next(&mut self) -> (ContractId, Contract) {
        let text = timeout(RECEIVE_TIMEOUT, self.client.receive_raw())
            .await
            .expect("timed out waiting for a message")
            .unwrap();
        self.replica.handle_inbound(&text).unwrap()
    }

    fn snapshot(&self) -> Vec<(ContractId, Contract)> {
        self.replica.ledger().fetch_all().unwrap()
    }
}

/// Submit on `actor`, then let both nodes commit the relayed message
async fn step(actor: &mut Node, other: &mut Node, command: Command) -> Contract {
    let id = actor.submit(command).await;
    let (mine, contract) = actor.apply_next().await;
    let (theirs, replicated) = other.apply_next().await;
    assert_eq!(mine, id);
    assert_eq!(theirs, id);
    assert_eq!(contract, replicated);
    contract
}

#[tokio::test]
async fn test_full_lifecycle_through_relay() {
    let dir = tempfile::TempDir::new().unwrap();
    let url = start_relay().await;
    let mut alice = Node::start(
        &url,
        "Alice",
        SqliteLedger::open(&dir.path().join("alice.db")).unwrap(),
    )
    .await;
    let mut bob = Node::start(&url, "Bob", SqliteLedger::open_in_memory().unwrap()).await;

    let proposed = step(
        &mut alice,
        &mut bob,
        Command::Propose {
            description: "Bake a cake".to_string(),
            assignee: party("Bob"),
            reviewers: vec![party("Alice")],
        },
    )
    .await;
    assert_eq!(proposed.state, ContractState::Proposed);
    assert_eq!(proposed.missing_acceptances, vec![party("Bob")]);
    let (id, _) = alice.snapshot().remove(0);
    assert!(id.is_minted_by(&party("Alice")));

    let accepted = step(&mut bob, &mut alice, Command::Accept { id: id.clone() }).await;
    assert_eq!(accepted.state, ContractState::Accepted);

    let started = step(&mut bob, &mut alice, Command::Start { id: id.clone() }).await;
    assert_eq!(started.state, ContractState::InProgress);

    let finished = step(&mut bob, &mut alice, Command::Finish { id: id.clone() }).await;
    assert_eq!(finished.state, ContractState::InReview);
    assert_eq!(finished.missing_approvals, vec![party("Alice")]);

    let rejected = step(
        &mut alice,
        &mut bob,
        Command::Reject {
            id: id.clone(),
            comment: "Needs more icing".to_string(),
        },
    )
    .await;
    assert_eq!(rejected.state, ContractState::InProgress);
    assert_eq!(rejected.comments, vec!["Needs more icing".to_string()]);

    step(&mut bob, &mut alice, Command::Finish { id: id.clone() }).await;
    let done = step(&mut alice, &mut bob, Command::Approve { id: id.clone() }).await;
    assert_eq!(done.state, ContractState::Done);
    assert!(done.missing_approvals.is_empty());

    assert_eq!(alice.snapshot(), bob.snapshot());
}

#[tokio::test]
async fn test_offline_party_catches_up() {
    let url = start_relay().await;
    let mut alice = Node::start(&url, "Alice", SqliteLedger::open_in_memory().unwrap()).await;

    let id = alice
        .submit(Command::Propose {
            description: "Water the plants".to_string(),
            assignee: party("Carol"),
            reviewers: vec![party("Alice")],
        })
        .await;
    alice.apply_next().await;

    // Carol was never connected; the proposal waits in the offline queue.
    let mut carol = Node::start(&url, "Carol", SqliteLedger::open_in_memory().unwrap()).await;
    let (received, contract) = carol.apply_next().await;
    assert_eq!(received, id);
    assert_eq!(contract.state, ContractState::Proposed);
    assert_eq!(alice.snapshot(), carol.snapshot());

    step(&mut carol, &mut alice, Command::Accept { id }).await;
    assert_eq!(alice.snapshot(), carol.snapshot());
}

#[tokio::test]
async fn test_refused_command_is_not_sent() {
    let url = start_relay().await;
    let mut bob = Node::start(&url, "Bob", SqliteLedger::open_in_memory().unwrap()).await;

    // Accepting an unknown contract fails locally.
    let unknown = ContractId::generate(&party("Alice"));
    assert!(bob.replica.prepare(Command::Accept { id: unknown }).is_err());

    // Nothing reached the relay: the next frame is our own proposal.
    let id = bob
        .submit(Command::Propose {
            description: "Fix the fence".to_string(),
            assignee: party("Bob"),
            reviewers: vec![party("Dave")],
        })
        .await;
    let (received, _) = bob.apply_next().await;
    assert_eq!(received, id);
    assert_eq!(bob.snapshot().len(), 1);
}
