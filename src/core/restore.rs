//! Atomic application of a serialized rule program via `iptables-restore`
//!
//! The restore tool applies each `*table ... COMMIT` stanza as one kernel
//! transaction. No rollback is attempted here: when the tool fails, the
//! kernel keeps whatever its own transaction semantics left in place.

use crate::core::error::{Error, Result};
use std::future::Future;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tracing::{Span, debug, error, info_span};

pub const RESTORE_CMD_V4: &str = "iptables-restore";
pub const RESTORE_CMD_V6: &str = "ip6tables-restore";

/// Applies a complete `iptables-restore` buffer.
///
/// Implemented by [`RestoreCommand`] in production and by recording mocks in tests.
pub trait RestoreBackend: Send + Sync {
    fn restore(&self, buffer: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Runs `<restore_cmd> --wait` with the buffer on stdin.
#[derive(Debug, Clone)]
pub struct RestoreCommand {
    program: String,
    span: Span,
}

impl RestoreCommand {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let span = info_span!("restore", command = %program);
        Self { program, span }
    }

    pub fn with_span(program: impl Into<String>, span: Span) -> Self {
        Self {
            program: program.into(),
            span,
        }
    }
}

impl RestoreBackend for RestoreCommand {
    async fn restore(&self, buffer: &str) -> Result<()> {
        let mut child = tokio::process::Command::new(&self.program)
            .arg("--wait")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!(parent: &self.span, error = %e, "failed to spawn restore tool");
                Error::Restore {
                    message: format!("failed to spawn {}: {e}", self.program),
                    output: String::new(),
                    exit_code: None,
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The tool may reject a line and exit before reading the rest;
            // its exit status and output still describe the failure.
            match stdin.write_all(buffer.as_bytes()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(parent: &self.span, "restore tool closed stdin early");
                }
                Err(e) => return Err(e.into()),
            }
            // Dropping stdin closes the pipe so the tool sees EOF
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            debug!(parent: &self.span, bytes = buffer.len(), "restore applied");
            return Ok(());
        }

        Err(Error::Restore {
            message: format!("{} exited with {}", self.program, output.status),
            output: combined_output(&output),
            exit_code: output.status.code(),
        })
    }
}

/// Stdout followed by stderr, lossily decoded.
pub(crate) fn combined_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_failure_is_restore_error() {
        let backend = RestoreCommand::new("/nonexistent/iptables-restore");
        let err = backend.restore("*nat\nCOMMIT\n").await.unwrap_err();
        match err {
            Error::Restore { exit_code, .. } => assert_eq!(exit_code, None),
            other => panic!("unexpected error: {other}"),
        }
    }
}
