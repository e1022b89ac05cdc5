//! Validated identifiers
//!
//! Raw strings cross the system boundary (login frames, envelopes, contract
//! payloads, URL paths) and are tagged here once:
//! - `PartyId`: a login name, `^[A-Za-z][A-Za-z0-9]*$`
//! - `ContractId`: `<proposer>-<uuid>`, self-describing and globally unique
//! - `Namespace`: the relay tenant carried in the connection path
//!
//! All three deserialize through their validating constructors, so a value
//! of one of these types is always well-formed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced when decoding wire data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The string is not a valid party identifier
    #[error("'{0}' is not a valid party identifier")]
    InvalidPartyId(String),

    /// The string is not a valid contract identifier
    #[error("'{0}' is not a valid contract identifier")]
    InvalidContractId(String),

    /// The string is not a valid namespace
    #[error("'{0}' is not a valid namespace")]
    InvalidNamespace(String),

    /// The JSON text does not have the expected shape
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

/// Result type for decoding operations
pub type DecodeResult<T> = Result<T, DecodeError>;

fn is_party_id(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => chars.all(|c| c.is_ascii_alphanumeric()),
        _ => false,
    }
}

/// Identifier of a participant
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartyId(String);

impl PartyId {
    /// Validate a raw string as a party identifier
    pub fn parse(s: impl Into<String>) -> DecodeResult<Self> {
        let s = s.into();
        if is_party_id(&s) {
            Ok(PartyId(s))
        } else {
            Err(DecodeError::InvalidPartyId(s))
        }
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PartyId {
    type Error = DecodeError;

    fn try_from(s: String) -> DecodeResult<Self> {
        PartyId::parse(s)
    }
}

impl From<PartyId> for String {
    fn from(id: PartyId) -> String {
        id.0
    }
}

impl FromStr for PartyId {
    type Err = DecodeError;

    fn from_str(s: &str) -> DecodeResult<Self> {
        PartyId::parse(s)
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a contract: `<proposer>-<uuid>`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContractId {
    raw: String,
    // Length of the proposer prefix within `raw`.
    split: usize,
}

impl ContractId {
    /// Generate a fresh identifier for a contract proposed by `proposer`
    pub fn generate(proposer: &PartyId) -> Self {
        let raw = format!("{}-{}", proposer, Uuid::new_v4());
        ContractId {
            split: proposer.as_str().len(),
            raw,
        }
    }

    /// Validate a raw string as a contract identifier
    ///
    /// The prefix up to the first `-` must be a valid party identifier and
    /// the remainder a UUID.
    pub fn parse(s: impl Into<String>) -> DecodeResult<Self> {
        let raw = s.into();
        let split = match raw.find('-') {
            Some(split) => split,
            None => return Err(DecodeError::InvalidContractId(raw)),
        };
        if !is_party_id(&raw[..split]) || Uuid::parse_str(&raw[split + 1..]).is_err() {
            return Err(DecodeError::InvalidContractId(raw));
        }
        Ok(ContractId { raw, split })
    }

    /// The party prefix the identifier was minted with
    pub fn proposer(&self) -> &str {
        &self.raw[..self.split]
    }

    /// Whether this identifier was minted by `party`
    pub fn is_minted_by(&self, party: &PartyId) -> bool {
        self.proposer() == party.as_str()
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl TryFrom<String> for ContractId {
    type Error = DecodeError;

    fn try_from(s: String) -> DecodeResult<Self> {
        ContractId::parse(s)
    }
}

impl From<ContractId> for String {
    fn from(id: ContractId) -> String {
        id.raw
    }
}

impl FromStr for ContractId {
    type Err = DecodeError;

    fn from_str(s: &str) -> DecodeResult<Self> {
        ContractId::parse(s)
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Relay tenant name
///
/// The empty namespace is the default one, selected by the root path.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace(String);

impl Namespace {
    /// Minimum length of a named namespace
    pub const MIN_LEN: usize = 4;
    /// Maximum length of a named namespace
    pub const MAX_LEN: usize = 32;

    /// Validate a namespace name (without leading slash)
    pub fn parse(name: impl Into<String>) -> DecodeResult<Self> {
        let name = name.into();
        let valid = (Self::MIN_LEN..=Self::MAX_LEN).contains(&name.len())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if valid {
            Ok(Namespace(name))
        } else {
            Err(DecodeError::InvalidNamespace(name))
        }
    }

    /// Resolve a request path such as `/myapp` into a namespace
    ///
    /// `/` resolves to the default namespace. The query string, if any, is
    /// ignored.
    pub fn from_path(path: &str) -> DecodeResult<Self> {
        let path = path.split('?').next().unwrap_or_default();
        match path.strip_prefix('/') {
            Some("") => Ok(Namespace::default()),
            Some(name) => Namespace::parse(name),
            None => Err(DecodeError::InvalidNamespace(path.to_string())),
        }
    }

    /// Whether this is the default namespace
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("<default>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_id_valid() {
        for name in ["Alice", "bob", "Carol42", "x"] {
            assert_eq!(PartyId::parse(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn test_party_id_invalid() {
        for name in ["", "1alice", "al-ice", "al ice", "alice!", "émile"] {
            assert_eq!(
                PartyId::parse(name),
                Err(DecodeError::InvalidPartyId(name.to_string()))
            );
        }
    }

    #[test]
    fn test_contract_id_generate_parses_back() {
        let alice = PartyId::parse("Alice").unwrap();
        let id = ContractId::generate(&alice);

        assert!(id.as_str().starts_with("Alice-"));
        assert_eq!(id.proposer(), "Alice");
        assert!(id.is_minted_by(&alice));

        let reparsed = ContractId::parse(id.as_str()).unwrap();
        assert_eq!(reparsed, id);
    }

    #[test]
    fn test_contract_id_invalid() {
        for raw in [
            "Alice",
            "Alice-",
            "Alice-not-a-uuid",
            "-7f2c6e4a-3b1d-4c8e-9a0f-1e2d3c4b5a69",
            "1lice-7f2c6e4a-3b1d-4c8e-9a0f-1e2d3c4b5a69",
        ] {
            assert!(ContractId::parse(raw).is_err(), "accepted {raw}");
        }
    }

    #[test]
    fn test_contract_id_other_minter() {
        let id = ContractId::parse("Alice-7f2c6e4a-3b1d-4c8e-9a0f-1e2d3c4b5a69").unwrap();
        let bob = PartyId::parse("Bob").unwrap();
        let ali = PartyId::parse("Ali").unwrap();

        assert!(!id.is_minted_by(&bob));
        assert!(!id.is_minted_by(&ali));
    }

    #[test]
    fn test_ids_deserialize_through_validation() {
        let party: PartyId = serde_json::from_str("\"Bob\"").unwrap();
        assert_eq!(party.as_str(), "Bob");

        assert!(serde_json::from_str::<PartyId>("\"B-ob\"").is_err());
        assert!(serde_json::from_str::<PartyId>("42").is_err());
        assert!(serde_json::from_str::<ContractId>("\"Bob-123\"").is_err());
    }

    #[test]
    fn test_namespace_from_path() {
        assert!(Namespace::from_path("/").unwrap().is_default());
        assert!(Namespace::from_path("/?token=1").unwrap().is_default());
        assert_eq!(Namespace::from_path("/qanban").unwrap().as_str(), "qanban");
        assert_eq!(Namespace::from_path("/my-app-2").unwrap().as_str(), "my-app-2");

        assert!(Namespace::from_path("/abc").is_err());
        assert!(Namespace::from_path("/has/slash").is_err());
        assert!(Namespace::from_path(&format!("/{}", "a".repeat(33))).is_err());
        assert!(Namespace::from_path("qanban").is_err());
    }
}
