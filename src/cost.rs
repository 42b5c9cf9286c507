//! Four-factor cost model.
//!
//! Costs are weighted sums over CPU, I/O, network and memory. Network
//! dominates by two orders of magnitude, which is what drives cross-source
//! plans toward shipping the smaller join side to the engine. Weights are
//! configurable; the defaults below are the documented contract.

use crate::catalog::{DEFAULT_ROW_COUNT, DEFAULT_SELECTIVITY};
use crate::expr::split_conjunction;
use crate::logical::{JoinType, LogicalPlan};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// Weight of each cost factor in the total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostWeights {
    pub cpu: f64,
    pub io: f64,
    pub network: f64,
    pub memory: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        CostWeights {
            cpu: 1.0,
            io: 10.0,
            network: 100.0,
            memory: 5.0,
        }
    }
}

/// Per-factor cost estimate of a physical node.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostVector {
    pub cpu: f64,
    pub io: f64,
    pub network: f64,
    pub memory: f64,
}

impl CostVector {
    pub fn total(&self, weights: &CostWeights) -> f64 {
        self.cpu * weights.cpu
            + self.io * weights.io
            + self.network * weights.network
            + self.memory * weights.memory
    }
}

impl Add for CostVector {
    type Output = CostVector;

    fn add(self, rhs: CostVector) -> CostVector {
        CostVector {
            cpu: self.cpu + rhs.cpu,
            io: self.io + rhs.io,
            network: self.network + rhs.network,
            memory: self.memory + rhs.memory,
        }
    }
}

impl fmt::Display for CostVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={:.0} io={:.0} net={:.0} mem={:.0}",
            self.cpu, self.io, self.network, self.memory
        )
    }
}

/// Cardinality estimate for a plan, with a marker for whether any input
/// fell back to the documented statistic defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowEstimate {
    pub rows: f64,
    /// True when a table without gathered statistics contributed, meaning
    /// the defaults (rows 10 000, selectivity 0.1) drove this number.
    pub assumed: bool,
}

impl RowEstimate {
    fn known(rows: f64) -> Self {
        RowEstimate {
            rows,
            assumed: false,
        }
    }
}

/// Estimate output cardinality of a logical subtree.
pub fn estimate_rows(plan: &LogicalPlan) -> RowEstimate {
    match plan {
        LogicalPlan::Scan(scan) => {
            let stats = &scan.table.statistics;
            let base = if stats.assumed {
                DEFAULT_ROW_COUNT as f64
            } else {
                stats.row_count as f64
            };
            let mut rows = base;
            if let Some(filter) = &scan.filter {
                let conjuncts = split_conjunction(filter).len() as u32;
                rows *= stats
                    .default_selectivity
                    .max(f64::EPSILON)
                    .powi(conjuncts as i32);
            }
            if let Some(limit) = scan.limit {
                rows = rows.min(limit as f64);
            }
            RowEstimate {
                rows: rows.max(1.0),
                assumed: stats.assumed,
            }
        }
        LogicalPlan::Filter { input, predicate } => {
            let inner = estimate_rows(input);
            let conjuncts = split_conjunction(predicate).len() as i32;
            RowEstimate {
                rows: (inner.rows * DEFAULT_SELECTIVITY.powi(conjuncts)).max(1.0),
                assumed: inner.assumed,
            }
        }
        LogicalPlan::Project { input, .. }
        | LogicalPlan::Sort { input, .. }
        | LogicalPlan::SubqueryAlias { input, .. } => estimate_rows(input),
        LogicalPlan::Join {
            left,
            right,
            join_type,
            on,
            ..
        } => {
            let l = estimate_rows(left);
            let r = estimate_rows(right);
            let assumed = l.assumed || r.assumed;
            let rows = match join_type {
                JoinType::Semi => l.rows * DEFAULT_SELECTIVITY.max(0.5),
                _ if on.is_empty() => l.rows * r.rows,
                // Equi join: assume the smaller side's keys are contained in
                // the larger side's.
                _ => l.rows.max(r.rows),
            };
            RowEstimate {
                rows: rows.max(1.0),
                assumed,
            }
        }
        LogicalPlan::Aggregate {
            input, group_by, ..
        } => {
            let inner = estimate_rows(input);
            if group_by.is_empty() {
                RowEstimate {
                    rows: 1.0,
                    assumed: inner.assumed,
                }
            } else {
                // Grouping reduces to roughly one distinct value in ten.
                RowEstimate {
                    rows: (inner.rows / 10.0).max(1.0),
                    assumed: inner.assumed,
                }
            }
        }
        LogicalPlan::Limit { input, limit, .. } => {
            let inner = estimate_rows(input);
            let rows = match limit {
                Some(n) => inner.rows.min(*n as f64),
                None => inner.rows,
            };
            RowEstimate {
                rows,
                assumed: inner.assumed,
            }
        }
        LogicalPlan::Union { inputs, .. } => {
            let mut rows = 0.0;
            let mut assumed = false;
            for input in inputs {
                let e = estimate_rows(input);
                rows += e.rows;
                assumed |= e.assumed;
            }
            RowEstimate { rows, assumed }
        }
        LogicalPlan::Values { rows, .. } => RowEstimate::known(rows.len() as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::federated_catalog;
    use crate::expr::{BinaryOp, ScalarExpr};
    use crate::logical::ScanNode;
    use crate::types::Value;
    use std::sync::Arc;

    #[test]
    fn default_weights_match_contract() {
        let w = CostWeights::default();
        assert_eq!((w.cpu, w.io, w.network, w.memory), (1.0, 10.0, 100.0, 5.0));
    }

    #[test]
    fn weighted_total() {
        let cost = CostVector {
            cpu: 2.0,
            io: 3.0,
            network: 1.0,
            memory: 4.0,
        };
        let total = cost.total(&CostWeights::default());
        assert_eq!(total, 2.0 + 30.0 + 100.0 + 20.0);
    }

    #[test]
    fn scan_estimate_uses_gathered_stats_and_selectivity() {
        let catalog = federated_catalog();
        let orders = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        let mut scan = ScanNode::new(orders, "o");
        assert_eq!(
            estimate_rows(&LogicalPlan::Scan(scan.clone())).rows,
            50_000.0
        );
        scan.filter = Some(ScalarExpr::binary(
            ScalarExpr::column(2, "status"),
            BinaryOp::Eq,
            ScalarExpr::literal(Value::String("completed".into())),
        ));
        let est = estimate_rows(&LogicalPlan::Scan(scan));
        assert_eq!(est.rows, 5_000.0);
        assert!(!est.assumed);
    }

    #[test]
    fn filter_multiplies_selectivity_per_conjunct() {
        let catalog = federated_catalog();
        let orders = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        let scan = Arc::new(LogicalPlan::Scan(ScanNode::new(orders, "o")));
        let two = ScalarExpr::binary(
            ScalarExpr::binary(
                ScalarExpr::column(0, "id"),
                BinaryOp::Gt,
                ScalarExpr::literal(Value::Int64(1)),
            ),
            BinaryOp::And,
            ScalarExpr::binary(
                ScalarExpr::column(0, "id"),
                BinaryOp::Lt,
                ScalarExpr::literal(Value::Int64(100)),
            ),
        );
        let filtered = LogicalPlan::Filter {
            input: scan,
            predicate: two,
        };
        assert_eq!(estimate_rows(&filtered).rows, 500.0);
    }

    #[test]
    fn missing_statistics_marked_assumed() {
        use crate::catalog::{ColumnMeta, TableKind, TableMeta, TableStatistics};
        use crate::types::LogicalType;
        let table = TableMeta {
            source: "s".into(),
            source_type: crate::catalog::SourceType::MySql,
            schema: "d".into(),
            name: "t".into(),
            kind: TableKind::Base,
            columns: vec![ColumnMeta {
                name: "c".into(),
                ordinal: 0,
                data_type: LogicalType::Int64,
                nullable: true,
                precision: None,
                scale: None,
            }],
            indexes: Vec::new(),
            statistics: TableStatistics::assumed(),
        };
        let est = estimate_rows(&LogicalPlan::Scan(ScanNode::new(Arc::new(table), "t")));
        assert!(est.assumed);
        assert_eq!(est.rows, DEFAULT_ROW_COUNT as f64);
    }
}
