//! Core iptables programming
//!
//! - [`batch`]: per-table routing between direct and batched application
//! - [`rule_store`]: in-memory mirror of the pending program and its serialization
//! - [`restore`]: atomic application through `iptables-restore`
//! - [`passthrough`]: single-rule `iptables` commands
//! - [`probe`]: restore tool version detection
//! - [`error`]: error types

pub mod batch;
pub mod error;
pub mod passthrough;
pub mod probe;
pub mod restore;
pub mod rule_store;

#[cfg(test)]
pub mod test_helpers;
