//! Deterministic RISC-V 64 emulator with a verifiable state
//!
//! Every side effect on the machine is a word access to a flat 64-bit
//! physical address space, committed to by a Keccak-256 Merkle tree at
//! 8-byte granularity. The interpreter runs over an exchangeable state
//! access: directly for speed, logging every word access with Merkle
//! proofs for one-step verification, or replaying such a log to check it
//! without trusting the emulator that produced it.

pub mod access;
pub mod config;
pub mod cpu;
pub mod devices;
pub mod fdt;
pub mod machine;
pub mod merkle;
pub mod pma;
pub mod shadow;
pub mod state;

pub use access::{AccessError, AccessLog, AccessType, LogType, WordAccess};
pub use config::{FlashConfig, HtifConfig, MachineConfig};
pub use machine::{Machine, MachineError, RunStatus};
pub use merkle::{Hash, MerkleTree, Proof};
