//! Batched iptables programming
//!
//! [`BatchProgrammer`] routes each mutation per table. Tables chosen for
//! batching at construction are mirrored in a [`RuleStore`] and applied in
//! one `iptables-restore --wait` run on [`BatchProgrammer::commit`]; every
//! other table is forwarded straight to the [`PassthroughApplier`].
//!
//! # Batching mode
//!
//! The batch table set is fixed when the programmer is built. With the
//! production constructors it is emptied when the restore tool is older
//! than 1.6.2 (or cannot be identified), which turns the programmer into a
//! pure passthrough and makes `commit` a no-op.
//!
//! # Consistency
//!
//! A single lock covers the store, forwarded calls, and commit. Commit
//! serializes the store while holding it, so the applied buffer is always
//! a consistent snapshot.
//!
//! `list_chains` always reads the live kernel tables, even for batched
//! tables, so it does not reflect mutations that have not been committed yet.

use crate::config::{IpVersion, ProviderConfig};
use crate::core::error::{Error, RestoreErrorPattern, Result, parse_failed_line};
use crate::core::passthrough::{IptablesCommand, PassthroughApplier};
use crate::core::probe::restore_has_wait;
use crate::core::restore::{RestoreBackend, RestoreCommand};
use crate::core::rule_store::{RuleStore, RuleTable, join_rulespec};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{Span, error, info, info_span};

/// How a table's mutations are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMode {
    /// Forwarded immediately to the passthrough applier
    Direct,
    /// Cached in the rule store until commit
    Deferred,
}

/// The production programmer: `iptables` passthrough, `iptables-restore` commit.
pub type IptablesProgrammer = BatchProgrammer<IptablesCommand, RestoreCommand>;

pub struct BatchProgrammer<P, R> {
    passthrough: P,
    restore: R,
    batch_tables: HashSet<String>,
    store: Mutex<RuleStore>,
    span: Span,
}

impl IptablesProgrammer {
    /// Builds a programmer for the configured IP version.
    ///
    /// Probes the restore tool once; if it lacks `--wait` support no table
    /// is batched.
    pub async fn iptables(config: &ProviderConfig) -> Self {
        let span = info_span!("batch_programmer", ip_version = %config.ip_version);
        Self::iptables_with_span(config, span).await
    }

    pub async fn iptables_with_span(config: &ProviderConfig, span: Span) -> Self {
        let restore_cmd = config.restore_command();
        let iptables_cmd = config.iptables_command();

        let batch_tables = if restore_has_wait(&restore_cmd, &span).await {
            config.batch_tables.clone()
        } else {
            info!(
                parent: &span,
                command = %restore_cmd,
                "restore tool lacks --wait support, programming all tables directly"
            );
            Vec::new()
        };

        Self::with_span(
            IptablesCommand::with_span(iptables_cmd, span.clone()),
            RestoreCommand::with_span(restore_cmd, span.clone()),
            batch_tables.as_slice(),
            span,
        )
    }

    pub async fn iptables_v4(batch_tables: &[&str]) -> Self {
        Self::iptables(&ProviderConfig::for_tables(IpVersion::V4, batch_tables)).await
    }

    pub async fn iptables_v6(batch_tables: &[&str]) -> Self {
        Self::iptables(&ProviderConfig::for_tables(IpVersion::V6, batch_tables)).await
    }
}

impl<P, R> BatchProgrammer<P, R>
where
    P: PassthroughApplier,
    R: RestoreBackend,
{
    /// Builds a programmer around caller-supplied backends.
    ///
    /// No probe is run: `batch_tables` is taken as given.
    pub fn with_backends<S: AsRef<str>>(passthrough: P, restore: R, batch_tables: &[S]) -> Self {
        Self::with_span(passthrough, restore, batch_tables, info_span!("batch_programmer"))
    }

    pub fn with_span<S: AsRef<str>>(
        passthrough: P,
        restore: R,
        batch_tables: &[S],
        span: Span,
    ) -> Self {
        let batch_tables = batch_tables
            .iter()
            .map(|t| t.as_ref().to_string())
            .collect::<HashSet<_>>();
        Self {
            passthrough,
            restore,
            batch_tables,
            store: Mutex::new(RuleStore::new()),
            span,
        }
    }

    pub fn table_mode(&self, table: &str) -> TableMode {
        if self.batch_tables.contains(table) {
            TableMode::Deferred
        } else {
            TableMode::Direct
        }
    }

    pub fn passthrough(&self) -> &P {
        &self.passthrough
    }

    pub async fn append(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()> {
        let mut store = self.store.lock().await;
        match self.table_mode(table) {
            TableMode::Direct => self.passthrough.append(table, chain, rulespec).await,
            TableMode::Deferred => {
                store.append(table, chain, join_rulespec(rulespec));
                Ok(())
            }
        }
    }

    /// Inserts a rule at 1-based position `pos` of the chain.
    pub async fn insert(
        &self,
        table: &str,
        chain: &str,
        pos: usize,
        rulespec: &[&str],
    ) -> Result<()> {
        let mut store = self.store.lock().await;
        match self.table_mode(table) {
            TableMode::Direct => self.passthrough.insert(table, chain, pos, rulespec).await,
            TableMode::Deferred => {
                store.insert(table, chain, pos, join_rulespec(rulespec));
                Ok(())
            }
        }
    }

    pub async fn delete(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()> {
        let mut store = self.store.lock().await;
        match self.table_mode(table) {
            TableMode::Direct => self.passthrough.delete(table, chain, rulespec).await,
            TableMode::Deferred => {
                store.delete(table, chain, &join_rulespec(rulespec));
                Ok(())
            }
        }
    }

    /// Lists chains as currently programmed in the kernel.
    pub async fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let _store = self.store.lock().await;
        self.passthrough.list_chains(table).await
    }

    pub async fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        match self.table_mode(table) {
            TableMode::Direct => self.passthrough.clear_chain(table, chain).await,
            TableMode::Deferred => {
                store.clear_chain(table, chain);
                Ok(())
            }
        }
    }

    pub async fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        match self.table_mode(table) {
            TableMode::Direct => self.passthrough.delete_chain(table, chain).await,
            TableMode::Deferred => {
                store.delete_chain(table, chain);
                Ok(())
            }
        }
    }

    pub async fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        match self.table_mode(table) {
            TableMode::Direct => self.passthrough.new_chain(table, chain).await,
            TableMode::Deferred => {
                store.new_chain(table, chain);
                Ok(())
            }
        }
    }

    /// Applies the whole rule store in one restore run.
    ///
    /// Does nothing when no table is batched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Restore`] if the restore tool cannot be spawned or
    /// exits non-zero. The store is left as it was.
    pub async fn commit(&self) -> Result<()> {
        let store = self.store.lock().await;

        if self.batch_tables.is_empty() {
            return Ok(());
        }

        let buffer = store.render();
        match self.restore.restore(&buffer).await {
            Ok(()) => {
                info!(parent: &self.span, tables = store.tables().len(), "committed batched rules");
                Ok(())
            }
            Err(e) => {
                let again = store.render();
                let output = match &e {
                    Error::Restore { output, .. } => output.as_str(),
                    _ => "",
                };
                let failed_line = parse_failed_line(output)
                    .and_then(|n| again.lines().nth(n.saturating_sub(1)))
                    .unwrap_or_default();
                let hint = RestoreErrorPattern::match_error(output);
                error!(
                    parent: &self.span,
                    error = %e,
                    output,
                    buffer = %again,
                    failed_line,
                    hint = %hint.user_message,
                    "failed to execute iptables-restore"
                );
                Err(e)
            }
        }
    }

    /// Snapshot of the pending rule store.
    pub async fn retrieve_table(&self) -> RuleTable {
        self.store.lock().await.tables().clone()
    }
}
