//! Shared test utilities for core module tests
//!
//! Provides recording backends so programmer tests never touch the real
//! iptables tools. This module is only compiled in test mode.

use crate::core::error::{Error, Result};
use crate::core::passthrough::PassthroughApplier;
use crate::core::restore::RestoreBackend;
use crate::core::rule_store::join_rulespec;
use std::sync::Mutex;

/// One forwarded passthrough operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Append(String, String, String),
    Insert(String, String, usize, String),
    Delete(String, String, String),
    ListChains(String),
    ClearChain(String, String),
    DeleteChain(String, String),
    NewChain(String, String),
}

/// Passthrough that records every call and optionally fails all of them.
#[derive(Debug, Default)]
pub struct RecordingPassthrough {
    calls: Mutex<Vec<Call>>,
    failure: Option<String>,
}

impl RecordingPassthrough {
    pub fn failing(output: &str) -> Self {
        Self {
            calls: Mutex::default(),
            failure: Some(output.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        match &self.failure {
            Some(output) => Err(Error::Command {
                command: "iptables".to_string(),
                output: output.clone(),
                exit_code: Some(1),
            }),
            None => Ok(()),
        }
    }
}

impl PassthroughApplier for RecordingPassthrough {
    async fn append(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()> {
        self.record(Call::Append(table.into(), chain.into(), join_rulespec(rulespec)))
    }

    async fn insert(&self, table: &str, chain: &str, pos: usize, rulespec: &[&str]) -> Result<()> {
        self.record(Call::Insert(table.into(), chain.into(), pos, join_rulespec(rulespec)))
    }

    async fn delete(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()> {
        self.record(Call::Delete(table.into(), chain.into(), join_rulespec(rulespec)))
    }

    async fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        self.record(Call::ListChains(table.into()))?;
        Ok(vec!["PREROUTING".to_string(), "OUTPUT".to_string()])
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.record(Call::ClearChain(table.into(), chain.into()))
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.record(Call::DeleteChain(table.into(), chain.into()))
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.record(Call::NewChain(table.into(), chain.into()))
    }
}

/// Restore backend that captures every buffer and optionally fails.
#[derive(Debug, Default)]
pub struct RecordingRestore {
    buffers: Mutex<Vec<String>>,
    failure: Option<String>,
}

impl RecordingRestore {
    pub fn failing(output: &str) -> Self {
        Self {
            buffers: Mutex::default(),
            failure: Some(output.to_string()),
        }
    }

    pub fn buffers(&self) -> Vec<String> {
        self.buffers.lock().unwrap().clone()
    }
}

impl RestoreBackend for RecordingRestore {
    async fn restore(&self, buffer: &str) -> Result<()> {
        self.buffers.lock().unwrap().push(buffer.to_string());
        match &self.failure {
            Some(output) => Err(Error::Restore {
                message: "iptables-restore exited with exit status: 1".to_string(),
                output: output.clone(),
                exit_code: Some(1),
            }),
            None => Ok(()),
        }
    }
}
