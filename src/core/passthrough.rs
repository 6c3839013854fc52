//! Single-rule iptables operations against the live kernel tables
//!
//! Every table that is not batched goes through a [`PassthroughApplier`],
//! and chain listing always does, batched or not.

use crate::core::error::{Error, Result};
use crate::core::restore::combined_output;
use std::future::Future;
use std::process::Stdio;
use tracing::{Span, debug, info_span};

pub const IPTABLES_CMD_V4: &str = "iptables";
pub const IPTABLES_CMD_V6: &str = "ip6tables";

/// Immediate, per-rule access to the kernel tables.
pub trait PassthroughApplier: Send + Sync {
    fn append(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> impl Future<Output = Result<()>> + Send;

    fn insert(
        &self,
        table: &str,
        chain: &str,
        pos: usize,
        rulespec: &[&str],
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> impl Future<Output = Result<()>> + Send;

    fn list_chains(&self, table: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn clear_chain(&self, table: &str, chain: &str) -> impl Future<Output = Result<()>> + Send;

    fn delete_chain(&self, table: &str, chain: &str) -> impl Future<Output = Result<()>> + Send;

    fn new_chain(&self, table: &str, chain: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Shells out to `iptables` / `ip6tables` for each operation.
#[derive(Debug, Clone)]
pub struct IptablesCommand {
    program: String,
    span: Span,
}

impl IptablesCommand {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let span = info_span!("iptables", command = %program);
        Self { program, span }
    }

    pub fn with_span(program: impl Into<String>, span: Span) -> Self {
        Self {
            program: program.into(),
            span,
        }
    }

    /// Runs `<program> --wait -t <table> <args...>` and returns stdout.
    async fn run(&self, table: &str, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new(&self.program)
            .arg("--wait")
            .args(["-t", table])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Command {
                command: self.program.clone(),
                output: e.to_string(),
                exit_code: None,
            })?;

        if output.status.success() {
            debug!(parent: &self.span, table, ?args, "iptables command applied");
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        Err(Error::Command {
            command: format!("{} -t {table} {}", self.program, args.join(" ")),
            output: combined_output(&output).trim_end().to_string(),
            exit_code: output.status.code(),
        })
    }
}

impl PassthroughApplier for IptablesCommand {
    async fn append(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()> {
        let mut args = vec!["-A", chain];
        args.extend_from_slice(rulespec);
        self.run(table, &args).await.map(drop)
    }

    async fn insert(&self, table: &str, chain: &str, pos: usize, rulespec: &[&str]) -> Result<()> {
        let pos = pos.to_string();
        let mut args = vec!["-I", chain, pos.as_str()];
        args.extend_from_slice(rulespec);
        self.run(table, &args).await.map(drop)
    }

    async fn delete(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()> {
        let mut args = vec!["-D", chain];
        args.extend_from_slice(rulespec);
        self.run(table, &args).await.map(drop)
    }

    async fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let listing = self.run(table, &["-S"]).await?;
        Ok(parse_chain_listing(&listing))
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(table, &["-F", chain]).await.map(drop)
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(table, &["-X", chain]).await.map(drop)
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(table, &["-N", chain]).await.map(drop)
    }
}

/// Collects chain names from `iptables -S` output.
///
/// Built-in chains appear as `-P <chain> <policy>`, user chains as `-N <chain>`.
fn parse_chain_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match fields.next()? {
                "-P" | "-N" => fields.next().map(String::from),
                _ => None,
            }
        })
        .collect()
}
