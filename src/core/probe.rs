//! Capability probe for the atomic-apply tool
//!
//! `iptables-restore --wait` only serializes correctly against concurrent
//! xtables writers from 1.6.2 onwards. Older (or unidentifiable) installs
//! must keep using single-rule commands, so anything short of a clean,
//! parseable version at or above the minimum reports "unsupported".

use crate::core::restore::combined_output;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::process::Stdio;
use std::sync::LazyLock;
use tracing::{Span, debug, info};

static VERSION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"v([0-9]+(?:\.[0-9]+)+)").expect("version regex is valid"));

/// Dotted numeric version as printed by the iptables tools (`v1.8.7`).
///
/// Missing trailing components compare as zero, so `1.6` equals `1.6.0`.
#[derive(Debug, Clone, Eq)]
pub struct RestoreVersion {
    components: Vec<u64>,
}

impl RestoreVersion {
    pub fn new(components: &[u64]) -> Self {
        Self {
            components: components.to_vec(),
        }
    }

    /// The minimum version that supports `--wait`.
    pub fn minimum() -> Self {
        Self::new(&[1, 6, 2])
    }

    /// Parses a bare dotted version (`1.8.7`).
    pub fn parse(text: &str) -> Option<Self> {
        let components = text
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if components.len() < 2 {
            return None;
        }
        Some(Self { components })
    }

    /// Finds the first `vMAJOR.MINOR[.PATCH...]` token in tool output.
    pub fn extract(output: &str) -> Option<Self> {
        let captures = VERSION_TOKEN.captures(output)?;
        Self::parse(captures.get(1)?.as_str())
    }

    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }
}

impl PartialEq for RestoreVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for RestoreVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for RestoreVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RestoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Returns whether `restore_cmd` supports safe concurrent application.
///
/// Runs `<restore_cmd> --version` with an empty stdin and scans the combined
/// output. Spawn failures, non-zero exits, and unparseable output all report
/// `false`; the caller then falls back to direct rule application. Events are
/// logged under `span`.
pub async fn restore_has_wait(restore_cmd: &str, span: &Span) -> bool {
    let output = match tokio::process::Command::new(restore_cmd)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
    {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!(
                parent: span,
                command = restore_cmd,
                exit_code = ?output.status.code(),
                "version query exited non-zero, assuming no --wait support"
            );
            return false;
        }
        Err(e) => {
            debug!(
                parent: span,
                command = restore_cmd,
                error = %e,
                "cannot run version query, assuming no --wait support"
            );
            return false;
        }
    };

    let Some(version) = RestoreVersion::extract(&combined_output(&output)) else {
        debug!(
            parent: span,
            command = restore_cmd,
            "no version token in output, assuming no --wait support"
        );
        return false;
    };

    let supported = version >= RestoreVersion::minimum();
    info!(parent: span, command = restore_cmd, %version, supported, "probed atomic-apply tool");
    supported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_legacy_banner() {
        let v = RestoreVersion::extract("iptables-restore v1.8.7 (legacy)\n").unwrap();
        assert_eq!(v, RestoreVersion::new(&[1, 8, 7]));
    }

    #[test]
    fn test_extract_two_components() {
        let v = RestoreVersion::extract("ip6tables-restore v1.6").unwrap();
        assert_eq!(v, RestoreVersion::new(&[1, 6, 0]));
    }

    #[test]
    fn test_extract_without_token() {
        assert!(RestoreVersion::extract("iptables-restore: unknown option --version").is_none());
        assert!(RestoreVersion::extract("v1 only").is_none());
        assert!(RestoreVersion::extract("").is_none());
    }

    #[test]
    fn test_ordering_against_minimum() {
        let min = RestoreVersion::minimum();
        assert!(RestoreVersion::new(&[1, 6, 1]) < min);
        assert!(RestoreVersion::new(&[1, 4, 21]) < min);
        assert!(RestoreVersion::new(&[1, 6, 2]) >= min);
        assert!(RestoreVersion::new(&[1, 6, 2, 1]) > min);
        assert!(RestoreVersion::new(&[1, 8, 0]) > min);
        assert!(RestoreVersion::new(&[2, 0]) > min);
    }

    #[test]
    fn test_display() {
        assert_eq!(RestoreVersion::new(&[1, 8, 7]).to_string(), "1.8.7");
    }

    #[tokio::test]
    async fn test_missing_binary_is_unsupported() {
        assert!(!restore_has_wait("/nonexistent/iptables-restore", &Span::none()).await);
    }
}
