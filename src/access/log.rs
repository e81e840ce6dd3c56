//! Access log schema and replay errors
//!
//! A step produces an ordered list of word accesses, optionally with Merkle
//! proofs anchored in the evolving state root, plus bracket/note
//! annotations. The abstract schema is normative; the serialized form is
//! whatever the consumer derives from serde.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::merkle::Proof;

/// Which features a log was generated with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogType {
    pub proofs: bool,
    pub annotations: bool,
}

impl LogType {
    pub fn with_proofs() -> Self {
        LogType { proofs: true, annotations: false }
    }

    pub fn full() -> Self {
        LogType { proofs: true, annotations: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    Read,
    Write,
}

/// One word access to the machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordAccess {
    #[serde(rename = "type")]
    pub access_type: AccessType,
    /// Physical address, aligned to the word size.
    pub address: u64,
    /// Value before the access (the value read, for reads).
    pub read: u64,
    /// Value after the access; equals `read` for reads.
    pub written: u64,
    /// Proof that `read` was the value at `address` under the root in
    /// effect before this access.
    pub proof: Option<Proof>,
    /// What the access was for, when annotations are enabled.
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BracketType {
    Begin,
    End,
}

/// Scope annotation: brackets nest around the accesses between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bracket {
    #[serde(rename = "type")]
    pub bracket_type: BracketType,
    /// Index into `accesses` where the bracket sits.
    pub r#where: usize,
    pub text: String,
}

/// Log of everything one step did to the machine state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLog {
    pub log_type: LogType,
    pub accesses: Vec<WordAccess>,
    pub brackets: Vec<Bracket>,
    pub notes: Vec<String>,
}

impl AccessLog {
    pub fn new(log_type: LogType) -> Self {
        AccessLog { log_type, ..Default::default() }
    }
}

/// Why a replay rejected an access log. Indices are 1-based positions in
/// the access list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("too few word accesses in log (log ended before access {index})")]
    TooFewAccesses { index: usize },
    #[error("too many word accesses in log ({count} accesses, {consumed} consumed)")]
    TooManyAccesses { count: usize, consumed: usize },
    #[error("access {index}: expected {expected:?} of {what}, log has {found:?}")]
    TypeMismatch { index: usize, expected: AccessType, found: AccessType, what: &'static str },
    #[error("access {index}: expected {what} at {expected:#x}, log has {found:#x}")]
    AddressMismatch { index: usize, expected: u64, found: u64, what: &'static str },
    #[error("access {index}: proof address does not match access address")]
    ProofAddressMismatch { index: usize },
    #[error("access {index}: proof root hash does not match the current root")]
    RootHashMismatch { index: usize },
    #[error("access {index}: value does not match the proof target hash")]
    TargetHashMismatch { index: usize },
    #[error("access {index}: proof does not reach its own root hash")]
    ProofMismatch { index: usize },
    #[error("access {index}: written value does not match the replayed write")]
    WrittenValueMismatch { index: usize },
    #[error("access {index}: invalid PMA flags ({reason})")]
    InvalidPmaFlags { index: usize, reason: &'static str },
    #[error("log has no proofs but proof verification was requested")]
    MissingProofs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_serializes_round_trip() {
        let mut log = AccessLog::new(LogType::full());
        log.accesses.push(WordAccess {
            access_type: AccessType::Read,
            address: 0x120,
            read: 7,
            written: 7,
            proof: None,
            note: Some("mcycle".into()),
        });
        log.brackets.push(Bracket {
            bracket_type: BracketType::Begin,
            r#where: 0,
            text: "step".into(),
        });
        let bytes = bincode::serialize(&log).unwrap();
        let back: AccessLog = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, log);
    }

    #[test]
    fn errors_name_the_access() {
        let err = AccessError::AddressMismatch { index: 3, expected: 0x100, found: 0x108, what: "pc" };
        let text = err.to_string();
        assert!(text.contains("access 3"));
        assert!(text.contains("pc"));
    }
}
