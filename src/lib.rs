//! Enforcer core
//!
//! Programs iptables for a host policy enforcer and recovers the true
//! destination of connections redirected to its transparent proxy.
//!
//! # Architecture
//!
//! - [`core`] - Batched iptables programming, `iptables-restore` commits, version probing
//! - [`net`] - Marked sockets, `SO_ORIGINAL_DST` recovery, proxy port reservation
//! - [`config`] - Configuration loading
//!
//! # Logging
//!
//! Every component logs through `tracing` under a span handed to it at
//! construction. The library never installs a subscriber.

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod net;

// Re-export commonly used types
pub use core::batch::{BatchProgrammer, IptablesProgrammer, TableMode};
pub use core::error::{Error, Result};
pub use core::rule_store::RuleTable;
pub use net::marked::{MarkedListener, MarkedSocketFactory, ProxiedConnection};
