use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

use crate::net::original_dst::Family;

/// Core error types for the enforcer
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The atomic-apply tool failed to start or exited non-zero
    #[error("iptables-restore error: {message}")]
    Restore {
        message: String,
        output: String,
        exit_code: Option<i32>,
    },

    /// A single-rule iptables command failed
    #[error("{command} failed: {output}")]
    Command {
        command: String,
        output: String,
        exit_code: Option<i32>,
    },

    /// The pre-redirection destination of an accepted connection is unknown
    #[error("Original destination error: {0}")]
    OriginalDestination(#[from] OriginalDstError),

    /// Port reservation failed
    #[error("Port allocation error: {0}")]
    PortAllocation(String),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failures while recovering the original destination of a redirected connection.
#[derive(Debug, Error)]
pub enum OriginalDstError {
    #[error("invalid address family: expected {expected}, kernel returned {found}")]
    FamilyMismatch { expected: Family, found: u16 },

    #[error("getsockopt(SO_ORIGINAL_DST) failed: {0}")]
    Query(#[from] nix::errno::Errno),

    #[error("short response: got {len} bytes, need {expected}")]
    ShortResponse { len: usize, expected: usize },

    #[error("cannot read local address: {0}")]
    LocalAddr(std::io::Error),
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known iptables-restore failure patterns and their translations
pub struct RestoreErrorPattern;

impl RestoreErrorPattern {
    /// Matches tool output against known patterns and returns an operator-facing translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to program iptables")
                .with_suggestion("Run the enforcer as root or grant CAP_NET_ADMIN")
                .with_suggestion("Check that the process is not confined by a restrictive seccomp profile");
        }

        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Look for concurrent firewall managers: firewalld, ufw, kube-proxy")
                .with_suggestion("Retry the commit once the other writer has finished");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables-restore is not installed or not found in PATH")
                .with_suggestion("Install iptables: apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: dnf install iptables  (Fedora/RHEL)");
        }

        if lower.contains("couldn't load target") || lower.contains("couldn't load match") {
            return ErrorTranslation::new("A rule references an unknown target or match extension")
                .with_suggestion("Ensure every jump target chain is declared in the same table")
                .with_suggestion("Check that the required xt_* kernel modules are available");
        }

        if lower.contains("chain/target/match by that name") {
            return ErrorTranslation::new("A rule references a chain that does not exist")
                .with_suggestion("Create the chain before appending rules that jump to it");
        }

        if parse_failed_line(msg).is_some() {
            return ErrorTranslation::new("iptables-restore rejected a line of the batch")
                .with_suggestion("Inspect the logged line of the submitted buffer for bad syntax");
        }

        ErrorTranslation::new(format!("iptables-restore error: {msg}"))
            .with_suggestion("Check the captured tool output for more information")
    }
}

/// Extracts the 1-based line number from an `iptables-restore: line N failed` message.
pub fn parse_failed_line(output: &str) -> Option<usize> {
    static FAILED_LINE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\bline\s+([0-9]+)\s+failed").expect("failed-line regex is valid")
    });
    FAILED_LINE.captures(output)?.get(1)?.as_str().parse().ok()
}

pub type Result<T> = std::result::Result<T, Error>;
