//! In-memory mirror of the pending iptables program
//!
//! Layout is table → chain → ordered rulespecs. A rulespec is the rule's
//! tokens joined by single spaces; equality is plain string equality.
//! [`RuleStore::render`] produces the `iptables-restore` input for the
//! whole store.

use std::collections::BTreeMap;
use std::fmt::Write;

/// Chain name → rulespecs, in evaluation order.
pub type ChainRules = BTreeMap<String, Vec<String>>;

/// Table name → chains.
pub type RuleTable = BTreeMap<String, ChainRules>;

/// Joins rule tokens into the cached rulespec form.
pub fn join_rulespec(rulespec: &[&str]) -> String {
    rulespec.join(" ")
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuleStore {
    tables: RuleTable,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain_mut(&mut self, table: &str, chain: &str) -> &mut Vec<String> {
        self.tables
            .entry(table.to_string())
            .or_default()
            .entry(chain.to_string())
            .or_default()
    }

    pub fn append(&mut self, table: &str, chain: &str, rule: String) {
        self.chain_mut(table, chain).push(rule);
    }

    /// Inserts `rule` so that it ends up at 1-based position `pos`.
    ///
    /// `pos` past the end (or 0) appends.
    pub fn insert(&mut self, table: &str, chain: &str, pos: usize, rule: String) {
        let rules = self.chain_mut(table, chain);
        if pos == 0 || pos > rules.len() {
            rules.push(rule);
        } else {
            rules.insert(pos - 1, rule);
        }
    }

    /// Removes the first rule equal to `rule`. Absent table, chain or rule is a no-op.
    pub fn delete(&mut self, table: &str, chain: &str, rule: &str) {
        let Some(rules) = self
            .tables
            .get_mut(table)
            .and_then(|chains| chains.get_mut(chain))
        else {
            return;
        };
        if let Some(index) = rules.iter().position(|r| r == rule) {
            rules.remove(index);
        }
    }

    /// Empties an existing chain. Does not create it.
    pub fn clear_chain(&mut self, table: &str, chain: &str) {
        if let Some(rules) = self
            .tables
            .get_mut(table)
            .and_then(|chains| chains.get_mut(chain))
        {
            rules.clear();
        }
    }

    pub fn delete_chain(&mut self, table: &str, chain: &str) {
        if let Some(chains) = self.tables.get_mut(table) {
            chains.remove(chain);
        }
    }

    /// Creates an empty chain, resetting it if it already exists.
    pub fn new_chain(&mut self, table: &str, chain: &str) {
        self.chain_mut(table, chain).clear();
    }

    pub fn tables(&self) -> &RuleTable {
        &self.tables
    }

    /// Serializes the store into `iptables-restore` input.
    ///
    /// One stanza per table: the table header, every chain declaration,
    /// then every rule grouped by chain in list order, then `COMMIT`.
    pub fn render(&self) -> String {
        let mut buf = String::new();
        for (table, chains) in &self.tables {
            let _ = writeln!(buf, "*{table}");
            for chain in chains.keys() {
                let _ = writeln!(buf, ":{chain} - [0:0]");
            }
            for (chain, rules) in chains {
                for rule in rules {
                    let _ = writeln!(buf, "-A {chain} {rule}");
                }
            }
            buf.push_str("COMMIT\n");
        }
        buf
    }
}
