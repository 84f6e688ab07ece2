use std::collections::HashMap;
use std::time::{Duration, Instant};

use tessera_common::config::LimitsConfig;
use tessera_common::types::Transaction;

use super::{LimitError, LimitMode};
use crate::storage::StateTables;

/// Ecosystem parameter overriding the per-user ceiling
pub const ECOSYSTEM_USER_LIMIT_PARAM: &str = "max_tx_block_per_user";

const PRE: LimitMode = LimitMode::PREPROCESS;
const GEN: LimitMode = LimitMode::GENERATE;
const PARSE: LimitMode = LimitMode::PARSE;

/// The fixed set of admission rules
pub(super) enum Rule {
    TxCount(TxCount),
    BlockTime(BlockTime),
    UserTx(UserTx),
    EcosystemUserTx(EcosystemUserTx),
    Size(Size),
    Fuel(Fuel),
}

impl Rule {
    pub(super) fn all(config: &LimitsConfig, started: Instant) -> Vec<Rule> {
        vec![
            Rule::TxCount(TxCount {
                limit: config.max_tx_count,
                count: 0,
            }),
            Rule::BlockTime(BlockTime {
                started,
                budget: Duration::from_millis(config.max_block_generation_time_ms),
            }),
            Rule::UserTx(UserTx {
                limit: config.max_tx_per_user,
                counts: HashMap::new(),
            }),
            Rule::EcosystemUserTx(EcosystemUserTx {
                default_limit: config.max_tx_per_ecosystem_user,
                limits: HashMap::new(),
                counts: HashMap::new(),
            }),
            Rule::Size(Size {
                block_limit: config.max_block_size,
                tx_limit: config.max_tx_size,
                total: 0,
            }),
            Rule::Fuel(Fuel {
                block_limit: config.max_block_fuel,
                tx_limit: config.max_tx_fuel,
                total: 0,
            }),
        ]
    }

    pub(super) fn name(&self) -> &'static str {
        match self {
            Rule::TxCount(_) => "tx_count",
            Rule::BlockTime(_) => "block_time",
            Rule::UserTx(_) => "user_tx",
            Rule::EcosystemUserTx(_) => "ecosystem_user_tx",
            Rule::Size(_) => "size",
            Rule::Fuel(_) => "fuel",
        }
    }

    pub(super) fn modes(&self) -> LimitMode {
        match self {
            Rule::TxCount(_) | Rule::UserTx(_) => PRE.union(PARSE),
            Rule::BlockTime(_) => GEN,
            Rule::EcosystemUserTx(_) | Rule::Size(_) => PRE.union(GEN).union(PARSE),
            Rule::Fuel(_) => GEN.union(PARSE),
        }
    }

    pub(super) fn check(
        &mut self,
        tx: &Transaction,
        mode: LimitMode,
        store: &dyn StateTables,
    ) -> Result<(), LimitError> {
        match self {
            Rule::TxCount(rule) => rule.check(mode),
            Rule::BlockTime(rule) => rule.check(),
            Rule::UserTx(rule) => rule.check(tx, mode),
            Rule::EcosystemUserTx(rule) => rule.check(tx, mode, store),
            Rule::Size(rule) => rule.check(tx, mode),
            Rule::Fuel(rule) => rule.check(tx, mode),
        }
    }

    pub(super) fn record(&mut self, tx: &Transaction) {
        match self {
            Rule::TxCount(rule) => rule.count += 1,
            Rule::BlockTime(_) => {}
            Rule::UserTx(rule) => *rule.counts.entry(UserTx::scope(tx)).or_insert(0) += 1,
            Rule::EcosystemUserTx(rule) => {
                *rule.counts.entry((tx.ecosystem, tx.key_id)).or_insert(0) += 1
            }
            Rule::Size(rule) => rule.total = rule.total.saturating_add(tx.size()),
            Rule::Fuel(rule) => rule.total = rule.total.saturating_add(tx.fuel),
        }
    }
}

/// Soft outcome outside parse mode, hard inside it.
fn soft_or_hard(mode: LimitMode, soft: LimitError, rule: &'static str, reason: String) -> LimitError {
    if mode.contains(PARSE) {
        LimitError::hard(rule, reason)
    } else {
        soft
    }
}

pub(super) struct TxCount {
    limit: u64,
    count: u64,
}

impl TxCount {
    fn check(&self, mode: LimitMode) -> Result<(), LimitError> {
        let next = self.count + 1;
        // Preprocessing leaves one slot free
        if mode.contains(PRE) && next + 1 > self.limit {
            return Err(LimitError::Stop);
        }
        if next > self.limit {
            return Err(LimitError::hard(
                "tx_count",
                format!("{} transactions, limit {}", next, self.limit),
            ));
        }
        Ok(())
    }
}

pub(super) struct BlockTime {
    started: Instant,
    budget: Duration,
}

impl BlockTime {
    fn check(&self) -> Result<(), LimitError> {
        if self.started.elapsed() > self.budget {
            return Err(LimitError::Stop);
        }
        Ok(())
    }
}

/// Ecosystem whose transactions are counted on their own
const GLOBAL_ECOSYSTEM: i64 = 1;
/// Shared bucket for every other ecosystem
const CATCH_ALL_SCOPE: i64 = 0;

pub(super) struct UserTx {
    limit: u64,
    /// (scope, key id) -> transactions
    counts: HashMap<(i64, i64), u64>,
}

impl UserTx {
    fn scope(tx: &Transaction) -> (i64, i64) {
        let scope = if tx.ecosystem == GLOBAL_ECOSYSTEM {
            GLOBAL_ECOSYSTEM
        } else {
            CATCH_ALL_SCOPE
        };
        (scope, tx.key_id)
    }

    fn check(&self, tx: &Transaction, mode: LimitMode) -> Result<(), LimitError> {
        let next = self.counts.get(&Self::scope(tx)).copied().unwrap_or(0) + 1;
        if next > self.limit {
            return Err(soft_or_hard(
                mode,
                LimitError::Skip,
                "user_tx",
                format!("key {} sent {} transactions, limit {}", tx.key_id, next, self.limit),
            ));
        }
        Ok(())
    }
}

pub(super) struct EcosystemUserTx {
    default_limit: u64,
    /// Ceiling per ecosystem, read on first sight
    limits: HashMap<i64, u64>,
    counts: HashMap<(i64, i64), u64>,
}

impl EcosystemUserTx {
    fn limit_for(&mut self, ecosystem: i64, store: &dyn StateTables) -> u64 {
        if let Some(limit) = self.limits.get(&ecosystem) {
            return *limit;
        }
        let limit = match store.ecosystem_parameter(ecosystem, ECOSYSTEM_USER_LIMIT_PARAM) {
            Ok(Some(value)) => value.trim().parse::<u64>().unwrap_or(self.default_limit),
            Ok(None) => self.default_limit,
            Err(err) => {
                tracing::warn!(ecosystem, %err, "falling back to default per-user limit");
                self.default_limit
            }
        };
        self.limits.insert(ecosystem, limit);
        limit
    }

    fn check(
        &mut self,
        tx: &Transaction,
        mode: LimitMode,
        store: &dyn StateTables,
    ) -> Result<(), LimitError> {
        let limit = self.limit_for(tx.ecosystem, store);
        let next = self
            .counts
            .get(&(tx.ecosystem, tx.key_id))
            .copied()
            .unwrap_or(0)
            + 1;
        if next > limit {
            return Err(soft_or_hard(
                mode,
                LimitError::Skip,
                "ecosystem_user_tx",
                format!(
                    "key {} sent {} transactions in ecosystem {}, limit {}",
                    tx.key_id, next, tx.ecosystem, limit
                ),
            ));
        }
        Ok(())
    }
}

pub(super) struct Size {
    block_limit: u64,
    tx_limit: u64,
    total: u64,
}

impl Size {
    fn check(&self, tx: &Transaction, mode: LimitMode) -> Result<(), LimitError> {
        let size = tx.size();
        if size > self.tx_limit {
            return Err(LimitError::hard(
                "size",
                format!("transaction of {} bytes, limit {}", size, self.tx_limit),
            ));
        }
        let total = self.total.saturating_add(size);
        if total > self.block_limit {
            return Err(soft_or_hard(
                mode,
                LimitError::Stop,
                "size",
                format!("block of {} bytes, limit {}", total, self.block_limit),
            ));
        }
        Ok(())
    }
}

pub(super) struct Fuel {
    block_limit: u64,
    tx_limit: u64,
    total: u64,
}

impl Fuel {
    fn check(&self, tx: &Transaction, mode: LimitMode) -> Result<(), LimitError> {
        if tx.fuel > self.tx_limit {
            return Err(LimitError::hard(
                "fuel",
                format!("transaction fuel {}, limit {}", tx.fuel, self.tx_limit),
            ));
        }
        let total = self.total.saturating_add(tx.fuel);
        if total > self.block_limit {
            return Err(soft_or_hard(
                mode,
                LimitError::Stop,
                "fuel",
                format!("block fuel {}, limit {}", total, self.block_limit),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, Row, RowFilter, Value};
    use tessera_common::types::TxKind;
    use test_case::test_case;

    fn tx(key_id: i64, ecosystem: i64) -> Transaction {
        Transaction::new(key_id, ecosystem, TxKind::Contract, 100, 1, vec![7; 8])
    }

    fn user_rule(limit: u64) -> UserTx {
        UserTx {
            limit,
            counts: HashMap::new(),
        }
    }

    #[test_case(PRE, LimitError::Skip ; "preprocess skips")]
    #[test_case(PARSE, LimitError::hard("user_tx", "key 1 sent 3 transactions, limit 2".to_string()) ; "parse is hard")]
    fn test_user_limit(mode: LimitMode, expected: LimitError) {
        let mut rule = Rule::UserTx(user_rule(2));
        let store = MemoryStore::new();
        for _ in 0..2 {
            rule.check(&tx(1, 1), mode, &store).unwrap();
            rule.record(&tx(1, 1));
        }
        assert_eq!(rule.check(&tx(1, 1), mode, &store), Err(expected));
        // other keys are unaffected
        assert!(rule.check(&tx(2, 1), mode, &store).is_ok());
    }

    #[test]
    fn test_user_limit_scopes() {
        let mut rule = Rule::UserTx(user_rule(1));
        let store = MemoryStore::new();
        rule.check(&tx(1, 1), PRE, &store).unwrap();
        rule.record(&tx(1, 1));

        // other ecosystems share one bucket, apart from ecosystem 1
        rule.check(&tx(1, 2), PRE, &store).unwrap();
        rule.record(&tx(1, 2));
        assert_eq!(rule.check(&tx(1, 3), PRE, &store), Err(LimitError::Skip));
        assert_eq!(rule.check(&tx(1, 1), PRE, &store), Err(LimitError::Skip));
    }

    #[test]
    fn test_ecosystem_limit_read_lazily_with_fallback() {
        let mut store = MemoryStore::with_first_tables();
        let mut row = Row::new();
        row.insert("value".to_string(), Value::Text("1".to_string()));
        store
            .insert_row(
                "1_parameters",
                &RowFilter::in_ecosystem(ECOSYSTEM_USER_LIMIT_PARAM, 2),
                row,
            )
            .unwrap();

        let mut rule = Rule::EcosystemUserTx(EcosystemUserTx {
            default_limit: 3,
            limits: HashMap::new(),
            counts: HashMap::new(),
        });

        rule.check(&tx(1, 2), GEN, &store).unwrap();
        rule.record(&tx(1, 2));
        assert_eq!(rule.check(&tx(1, 2), GEN, &store), Err(LimitError::Skip));

        // ecosystem 1 has no parameter and uses the default
        for _ in 0..3 {
            rule.check(&tx(1, 1), GEN, &store).unwrap();
            rule.record(&tx(1, 1));
        }
        assert_eq!(rule.check(&tx(1, 1), GEN, &store), Err(LimitError::Skip));
    }

    #[test]
    fn test_oversized_tx_is_hard_in_every_mode() {
        let store = MemoryStore::new();
        let big = tx(1, 1);
        for mode in [PRE, GEN, PARSE] {
            let mut rule = Rule::Size(Size {
                block_limit: 10_000,
                tx_limit: big.size() - 1,
                total: 0,
            });
            assert!(matches!(
                rule.check(&big, mode, &store),
                Err(LimitError::Hard { rule: "size", .. })
            ));
        }
    }

    #[test]
    fn test_block_size_overflow() {
        let store = MemoryStore::new();
        let one = tx(1, 1);
        let mut rule = Rule::Size(Size {
            block_limit: one.size() * 2,
            tx_limit: one.size(),
            total: 0,
        });
        for _ in 0..2 {
            rule.check(&one, GEN, &store).unwrap();
            rule.record(&one);
        }
        assert_eq!(rule.check(&one, GEN, &store), Err(LimitError::Stop));
        assert!(matches!(
            rule.check(&one, PARSE, &store),
            Err(LimitError::Hard { rule: "size", .. })
        ));
    }
}
