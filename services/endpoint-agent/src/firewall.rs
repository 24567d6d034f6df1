//! Firewall chain programming.
//!
//! Chains are installed with `iptables-restore --noflush` so each rewrite is
//! atomic. The backend keeps a [`ChainTable`] of what it has programmed and
//! which profile chains each endpoint chain jumps to:
//!
//! - A referenced chain that has not been programmed yet is created as a
//!   stub that drops everything, so the jump is always valid
//! - A deleted chain that is still referenced becomes a stub instead
//! - A stub that nothing references any more is deleted

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};
use warden_rules::CompiledChains;

use crate::model::IpFamily;

/// Errors from firewall operations.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("`{command}` failed (exit code {code:?}): {stderr}")]
    RestoreFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("command execution failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Installs and removes endpoint chains.
pub trait FirewallBackend: Send + Sync {
    /// Atomically replace the given chains and record their dependencies.
    fn rewrite_chains(&self, compiled: &CompiledChains) -> Result<(), FirewallError>;

    /// Remove chains; chains still referenced elsewhere are stubbed.
    fn delete_chains(&self, names: &[String]) -> Result<(), FirewallError>;
}

// =============================================================================
// Chain Table
// =============================================================================

/// Bookkeeping of programmed chains and their references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainTable {
    /// Explicitly programmed chains and the chains they jump to.
    programmed: BTreeMap<String, BTreeSet<String>>,

    /// Placeholder chains created to satisfy a reference.
    stubs: BTreeSet<String>,
}

/// A rendered `iptables-restore` transaction and the table state after it.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Restore input.
    pub input: String,

    next: ChainTable,
}

impl ChainTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `chain` was explicitly programmed.
    pub fn is_programmed(&self, chain: &str) -> bool {
        self.programmed.contains_key(chain)
    }

    /// Whether `chain` currently exists only as a stub.
    pub fn is_stub(&self, chain: &str) -> bool {
        self.stubs.contains(chain)
    }

    /// Number of programmed chains that jump to `chain`.
    pub fn references(&self, chain: &str) -> usize {
        self.programmed
            .values()
            .filter(|deps| deps.contains(chain))
            .count()
    }

    /// Render a rewrite of the compiled chains.
    pub fn rewrite(&self, compiled: &CompiledChains) -> Transaction {
        let mut next = self.clone();
        let mut declarations = Vec::new();
        let mut body = Vec::new();

        for (chain, rules) in &compiled.updates {
            declarations.push(declare(chain));
            body.push(format!("--flush {}", chain));
            body.extend(rules.iter().cloned());

            let deps = compiled.dependencies.get(chain).cloned().unwrap_or_default();
            next.stubs.remove(chain);
            next.programmed.insert(chain.clone(), deps);
        }

        for dep in compiled.dependencies.values().flatten() {
            if !next.programmed.contains_key(dep) && !next.stubs.contains(dep) {
                declarations.push(declare(dep));
                body.push(format!("--flush {}", dep));
                body.push(stub_rule(dep));
                next.stubs.insert(dep.clone());
            }
        }

        next.remove_orphaned_stubs(&mut body);

        Transaction {
            input: render(declarations, body),
            next,
        }
    }

    /// Render removal of chains. Returns `None` if none of them are known.
    pub fn delete(&self, names: &[String]) -> Option<Transaction> {
        let mut next = self.clone();
        let mut body = Vec::new();

        let known: Vec<&String> = names
            .iter()
            .filter(|name| next.programmed.contains_key(*name) || next.stubs.contains(*name))
            .collect();
        if known.is_empty() {
            return None;
        }

        // Flush everything first so jumps between deleted chains are gone
        // before any of them is deleted.
        for name in &known {
            next.programmed.remove(*name);
            body.push(format!("--flush {}", name));
        }

        for name in &known {
            if next.references(name) > 0 {
                body.push(stub_rule(name));
                next.stubs.insert((*name).clone());
            } else {
                body.push(format!("--delete-chain {}", name));
                next.stubs.remove(*name);
            }
        }

        next.remove_orphaned_stubs(&mut body);

        Some(Transaction {
            input: render(Vec::new(), body),
            next,
        })
    }

    /// Commit a transaction that was applied successfully.
    pub fn commit(&mut self, txn: Transaction) {
        *self = txn.next;
    }

    fn remove_orphaned_stubs(&mut self, body: &mut Vec<String>) {
        let orphans: Vec<String> = self
            .stubs
            .iter()
            .filter(|stub| self.references(stub) == 0)
            .cloned()
            .collect();

        for orphan in orphans {
            body.push(format!("--flush {}", orphan));
            body.push(format!("--delete-chain {}", orphan));
            self.stubs.remove(&orphan);
        }
    }
}

fn declare(chain: &str) -> String {
    format!(":{} - [0:0]", chain)
}

fn stub_rule(chain: &str) -> String {
    format!(
        "--append {} --jump DROP -m comment --comment \"WARNING Missing chain DROP:\"",
        chain
    )
}

fn render(declarations: Vec<String>, body: Vec<String>) -> String {
    let mut lines = Vec::with_capacity(declarations.len() + body.len() + 2);
    lines.push("*filter".to_string());
    lines.extend(declarations);
    lines.extend(body);
    lines.push("COMMIT".to_string());
    let mut input = lines.join("\n");
    input.push('\n');
    input
}

// =============================================================================
// iptables-restore implementation
// =============================================================================

/// Firewall backend driving `iptables-restore` / `ip6tables-restore`.
///
/// Transactions are serialized; concurrent actors queue on the table lock.
#[derive(Debug)]
pub struct IptablesUpdater {
    family: IpFamily,
    table: Mutex<ChainTable>,
}

impl IptablesUpdater {
    pub fn new(family: IpFamily) -> Self {
        Self {
            family,
            table: Mutex::new(ChainTable::new()),
        }
    }

    fn restore_command(&self) -> &'static str {
        match self.family {
            IpFamily::V4 => "iptables-restore",
            IpFamily::V6 => "ip6tables-restore",
        }
    }

    fn apply(&self, input: &str) -> Result<(), FirewallError> {
        let command = self.restore_command();
        debug!(family = %self.family, input = %input, "Applying iptables transaction");

        let mut child = Command::new(command)
            .arg("--noflush")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(FirewallError::RestoreFailed {
                command: format!("{} --noflush", command),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

impl FirewallBackend for IptablesUpdater {
    fn rewrite_chains(&self, compiled: &CompiledChains) -> Result<(), FirewallError> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let txn = table.rewrite(compiled);
        self.apply(&txn.input)?;
        table.commit(txn);
        info!(
            family = %self.family,
            chains = ?compiled.chain_names().collect::<Vec<_>>(),
            "Rewrote chains"
        );
        Ok(())
    }

    fn delete_chains(&self, names: &[String]) -> Result<(), FirewallError> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let Some(txn) = table.delete(names) else {
            return Ok(());
        };
        self.apply(&txn.input)?;
        table.commit(txn);
        info!(family = %self.family, chains = ?names, "Deleted chains");
        Ok(())
    }
}

// =============================================================================
// Mock implementation
// =============================================================================

/// A call recorded by [`MockFirewall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallCall {
    Rewrite(CompiledChains),
    Delete(Vec<String>),
}

#[derive(Debug, Default)]
struct MockFirewallState {
    calls: Vec<FirewallCall>,
    transactions: Vec<String>,
    table: ChainTable,
    fail: bool,
}

/// Recording firewall backend for tests and dry runs.
///
/// Renders the same transactions as [`IptablesUpdater`] without running them.
#[derive(Debug, Default)]
pub struct MockFirewall {
    state: Mutex<MockFirewallState>,
}

impl MockFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockFirewallState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<FirewallCall> {
        self.lock().calls.clone()
    }

    /// Return and clear recorded calls.
    pub fn take_calls(&self) -> Vec<FirewallCall> {
        std::mem::take(&mut self.lock().calls)
    }

    /// Rendered transactions that would have been applied.
    pub fn transactions(&self) -> Vec<String> {
        self.lock().transactions.clone()
    }

    /// Current chain bookkeeping.
    pub fn table(&self) -> ChainTable {
        self.lock().table.clone()
    }

    /// Make every call fail.
    pub fn set_fail(&self, fail: bool) {
        self.lock().fail = fail;
    }
}

fn injected(command: &str) -> FirewallError {
    FirewallError::RestoreFailed {
        command: command.to_string(),
        code: Some(1),
        stderr: "injected failure".to_string(),
    }
}

impl FirewallBackend for MockFirewall {
    fn rewrite_chains(&self, compiled: &CompiledChains) -> Result<(), FirewallError> {
        let mut state = self.lock();
        state.calls.push(FirewallCall::Rewrite(compiled.clone()));
        if state.fail {
            return Err(injected("rewrite_chains"));
        }
        let txn = state.table.rewrite(compiled);
        state.transactions.push(txn.input.clone());
        state.table.commit(txn);
        Ok(())
    }

    fn delete_chains(&self, names: &[String]) -> Result<(), FirewallError> {
        let mut state = self.lock();
        state.calls.push(FirewallCall::Delete(names.to_vec()));
        if state.fail {
            return Err(injected("delete_chains"));
        }
        if let Some(txn) = state.table.delete(names) {
            state.transactions.push(txn.input.clone());
            state.table.commit(txn);
        }
        Ok(())
    }
}
