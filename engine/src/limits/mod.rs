//! Per-block admission control.
//!
//! A [`Limits`] instance lives for one block. It holds the rules that apply
//! to the current [`LimitMode`] and their running counters.

mod rules;

use std::fmt;
use std::time::Instant;

use tessera_common::config::LimitsConfig;
use tessera_common::types::Transaction;
use thiserror::Error;
use tracing::error;

use crate::storage::StateTables;
use rules::Rule;

/// Bit set of the phases a rule takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitMode(u8);

impl LimitMode {
    /// Dry run over the queue before assembling a block
    pub const PREPROCESS: LimitMode = LimitMode(1);
    /// Assembling a block locally
    pub const GENERATE: LimitMode = LimitMode(1 << 1);
    /// Replaying a received block
    pub const PARSE: LimitMode = LimitMode(1 << 2);

    pub const fn union(self, other: LimitMode) -> LimitMode {
        LimitMode(self.0 | other.0)
    }

    pub const fn contains(self, other: LimitMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Display for LimitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (LimitMode::PREPROCESS, "preprocess"),
            (LimitMode::GENERATE, "generate"),
            (LimitMode::PARSE, "parse"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(mode, _)| self.contains(*mode))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join("|"))
    }
}

/// Outcome of a failed limit check
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// End the block here, keeping what was accepted
    #[error("block limit reached")]
    Stop,

    /// Drop this transaction and carry on
    #[error("transaction skipped by limits")]
    Skip,

    #[error("{rule} limit exceeded: {reason}")]
    Hard { rule: &'static str, reason: String },
}

impl LimitError {
    pub(crate) fn hard(rule: &'static str, reason: String) -> Self {
        LimitError::Hard { rule, reason }
    }
}

/// Running limit state for one block
pub struct Limits {
    mode: LimitMode,
    rules: Vec<Rule>,
}

impl Limits {
    /// Instantiates the rules participating in `mode`. `started` is the
    /// moment block generation began.
    pub fn new(mode: LimitMode, config: &LimitsConfig, started: Instant) -> Self {
        let rules = Rule::all(config, started)
            .into_iter()
            .filter(|rule| rule.modes().contains(mode))
            .collect();
        Self { mode, rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(Rule::name).collect()
    }

    /// Checks `tx` against every rule. Counters only move when all rules
    /// accept the transaction.
    pub fn check(&mut self, tx: &Transaction, store: &dyn StateTables) -> Result<(), LimitError> {
        let mode = self.mode;
        for rule in self.rules.iter_mut() {
            if let Err(err) = rule.check(tx, mode, store) {
                if let LimitError::Hard { rule, reason } = &err {
                    error!(rule, %reason, %mode, tx = %tx.short_hash(), "limit exceeded");
                }
                return Err(err);
            }
        }
        for rule in self.rules.iter_mut() {
            rule.record(tx);
        }
        Ok(())
    }
}
