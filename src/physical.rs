//! Cost-based physical planning (phase two).
//!
//! Enumerates join implementations (hash vs nested-loop, build side) and
//! access paths (full vs indexed scan), prices each with the four-factor
//! cost vector and keeps the cheapest. Leaves bind their pushdown: the
//! accepted part travels to the connector, the rest stays as an executor
//! residual.

use crate::connector::source_accepts_conjunct;
use crate::cost::{estimate_rows, CostVector, CostWeights, RowEstimate};
use crate::error::{EngineError, EngineResult};
use crate::expr::{conjoin, split_conjunction, AggregateExpr, ScalarExpr};
use crate::logical::{JoinType, LogicalPlan, ScanNode, SortKey};
use crate::types::Schema;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPath {
    FullScan,
    /// The source is expected to serve the filter through this index.
    IndexScan { column: String },
}

/// Physical scan leaf with its bound pushdown.
#[derive(Debug, Clone)]
pub struct ScanExec {
    pub scan: ScanNode,
    /// Base-table ordinals fetched from the source (sorted). Empty when the
    /// pushed aggregate defines the output shape instead.
    pub fetch: Vec<usize>,
    /// Conjunction the connector executes source-side (base ordinals).
    pub pushed_filter: Option<ScalarExpr>,
    /// Conjunction the executor applies over fetched rows (fetch-layout
    /// ordinals).
    pub residual: Option<ScalarExpr>,
    /// Sort delegated to the source (base ordinals).
    pub pushed_sort: Vec<SortKey>,
    /// Positions into the fetch layout forming the output row.
    pub output: Vec<usize>,
    pub schema: Schema,
    pub access: AccessPath,
}

/// Physical operator tree. Every node carries its output type, estimated
/// cardinality and cost vector.
#[derive(Debug, Clone)]
pub enum PhysicalPlan {
    SourceScan {
        exec: ScanExec,
        rows: RowEstimate,
        cost: CostVector,
    },
    Filter {
        input: Arc<PhysicalPlan>,
        predicate: ScalarExpr,
        rows: RowEstimate,
        cost: CostVector,
    },
    Project {
        input: Arc<PhysicalPlan>,
        exprs: Vec<(ScalarExpr, String)>,
        schema: Schema,
        rows: RowEstimate,
        cost: CostVector,
    },
    HashJoin {
        left: Arc<PhysicalPlan>,
        right: Arc<PhysicalPlan>,
        join_type: JoinType,
        on: Vec<(ScalarExpr, ScalarExpr)>,
        filter: Option<ScalarExpr>,
        build_side: BuildSide,
        schema: Schema,
        rows: RowEstimate,
        cost: CostVector,
    },
    NestedLoopJoin {
        left: Arc<PhysicalPlan>,
        right: Arc<PhysicalPlan>,
        join_type: JoinType,
        filter: Option<ScalarExpr>,
        schema: Schema,
        rows: RowEstimate,
        cost: CostVector,
    },
    Sort {
        input: Arc<PhysicalPlan>,
        keys: Vec<SortKey>,
        rows: RowEstimate,
        cost: CostVector,
    },
    Aggregate {
        input: Arc<PhysicalPlan>,
        group_by: Vec<ScalarExpr>,
        aggregates: Vec<AggregateExpr>,
        schema: Schema,
        rows: RowEstimate,
        cost: CostVector,
    },
    Limit {
        input: Arc<PhysicalPlan>,
        limit: Option<u64>,
        offset: u64,
        rows: RowEstimate,
        cost: CostVector,
    },
    Union {
        inputs: Vec<Arc<PhysicalPlan>>,
        schema: Schema,
        rows: RowEstimate,
        cost: CostVector,
    },
    Values {
        rows_data: Vec<Vec<ScalarExpr>>,
        schema: Schema,
        rows: RowEstimate,
        cost: CostVector,
    },
}

impl PhysicalPlan {
    pub fn schema(&self) -> Schema {
        match self {
            PhysicalPlan::SourceScan { exec, .. } => exec.schema.clone(),
            PhysicalPlan::Filter { input, .. } => input.schema(),
            PhysicalPlan::Project { schema, .. }
            | PhysicalPlan::HashJoin { schema, .. }
            | PhysicalPlan::NestedLoopJoin { schema, .. }
            | PhysicalPlan::Aggregate { schema, .. }
            | PhysicalPlan::Union { schema, .. }
            | PhysicalPlan::Values { schema, .. } => schema.clone(),
            PhysicalPlan::Sort { input, .. } | PhysicalPlan::Limit { input, .. } => {
                input.schema()
            }
        }
    }

    pub fn cost(&self) -> CostVector {
        match self {
            PhysicalPlan::SourceScan { cost, .. }
            | PhysicalPlan::Filter { cost, .. }
            | PhysicalPlan::Project { cost, .. }
            | PhysicalPlan::HashJoin { cost, .. }
            | PhysicalPlan::NestedLoopJoin { cost, .. }
            | PhysicalPlan::Sort { cost, .. }
            | PhysicalPlan::Aggregate { cost, .. }
            | PhysicalPlan::Limit { cost, .. }
            | PhysicalPlan::Union { cost, .. }
            | PhysicalPlan::Values { cost, .. } => *cost,
        }
    }

    pub fn estimate(&self) -> RowEstimate {
        match self {
            PhysicalPlan::SourceScan { rows, .. }
            | PhysicalPlan::Filter { rows, .. }
            | PhysicalPlan::Project { rows, .. }
            | PhysicalPlan::HashJoin { rows, .. }
            | PhysicalPlan::NestedLoopJoin { rows, .. }
            | PhysicalPlan::Sort { rows, .. }
            | PhysicalPlan::Aggregate { rows, .. }
            | PhysicalPlan::Limit { rows, .. }
            | PhysicalPlan::Union { rows, .. }
            | PhysicalPlan::Values { rows, .. } => *rows,
        }
    }

    pub fn inputs(&self) -> Vec<&Arc<PhysicalPlan>> {
        match self {
            PhysicalPlan::SourceScan { .. } | PhysicalPlan::Values { .. } => Vec::new(),
            PhysicalPlan::Filter { input, .. }
            | PhysicalPlan::Project { input, .. }
            | PhysicalPlan::Sort { input, .. }
            | PhysicalPlan::Aggregate { input, .. }
            | PhysicalPlan::Limit { input, .. } => vec![input],
            PhysicalPlan::HashJoin { left, right, .. }
            | PhysicalPlan::NestedLoopJoin { left, right, .. } => vec![left, right],
            PhysicalPlan::Union { inputs, .. } => inputs.iter().collect(),
        }
    }

    /// Total weighted cost of the whole tree.
    pub fn total_cost(&self, weights: &CostWeights) -> f64 {
        let own = self.cost().total(weights);
        own + self
            .inputs()
            .iter()
            .map(|i| i.total_cost(weights))
            .sum::<f64>()
    }

    /// True when any node's estimate fell back to the statistic defaults.
    pub fn used_default_statistics(&self) -> bool {
        self.estimate().assumed
            || self.inputs().iter().any(|i| i.used_default_statistics())
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        for _ in 0..indent {
            write!(f, "  ")?;
        }
        match self {
            PhysicalPlan::SourceScan { exec, rows, cost } => {
                write!(
                    f,
                    "SourceScan: {} [{}]",
                    exec.scan.table.qualified_name(),
                    match &exec.access {
                        AccessPath::FullScan => "full".to_string(),
                        AccessPath::IndexScan { column } => format!("index:{column}"),
                    }
                )?;
                if let Some(filter) = &exec.pushed_filter {
                    write!(f, " pushed={filter}")?;
                }
                if let Some(residual) = &exec.residual {
                    write!(f, " residual={residual}")?;
                }
                if !exec.pushed_sort.is_empty() {
                    write!(f, " sort=pushed")?;
                }
                if exec.scan.aggregate.is_some() {
                    write!(f, " aggregate=pushed")?;
                }
                if let Some(limit) = exec.scan.limit {
                    write!(f, " limit={limit}")?;
                }
                write!(f, " rows~{:.0} ({cost})", rows.rows)?;
                if rows.assumed {
                    write!(f, " [default stats]")?;
                }
                writeln!(f)
            }
            PhysicalPlan::Filter {
                predicate,
                rows,
                cost,
                ..
            } => writeln!(f, "Filter: {predicate} rows~{:.0} ({cost})", rows.rows),
            PhysicalPlan::Project { exprs, cost, .. } => {
                let cols: Vec<String> = exprs
                    .iter()
                    .map(|(e, n)| format!("{e} AS {n}"))
                    .collect();
                writeln!(f, "Project: {} ({cost})", cols.join(", "))
            }
            PhysicalPlan::HashJoin {
                join_type,
                on,
                build_side,
                rows,
                cost,
                ..
            } => {
                let keys: Vec<String> =
                    on.iter().map(|(l, r)| format!("{l} = {r}")).collect();
                writeln!(
                    f,
                    "HashJoin[{join_type}]: build={} on [{}] rows~{:.0} ({cost})",
                    match build_side {
                        BuildSide::Left => "left",
                        BuildSide::Right => "right",
                    },
                    keys.join(", "),
                    rows.rows
                )
            }
            PhysicalPlan::NestedLoopJoin {
                join_type,
                rows,
                cost,
                ..
            } => writeln!(
                f,
                "NestedLoopJoin[{join_type}]: rows~{:.0} ({cost})",
                rows.rows
            ),
            PhysicalPlan::Sort { keys, cost, .. } => {
                let rendered: Vec<String> = keys
                    .iter()
                    .map(|k| format!("{} {}", k.expr, if k.ascending { "ASC" } else { "DESC" }))
                    .collect();
                writeln!(f, "Sort: {} ({cost})", rendered.join(", "))
            }
            PhysicalPlan::Aggregate {
                group_by,
                aggregates,
                cost,
                ..
            } => writeln!(
                f,
                "Aggregate: groups={} aggs={} ({cost})",
                group_by.len(),
                aggregates.len()
            ),
            PhysicalPlan::Limit {
                limit,
                offset,
                cost,
                ..
            } => writeln!(f, "Limit: limit={limit:?} offset={offset} ({cost})"),
            PhysicalPlan::Union { cost, .. } => writeln!(f, "UnionAll ({cost})"),
            PhysicalPlan::Values {
                rows_data, cost, ..
            } => writeln!(f, "Values: {} row(s) ({cost})", rows_data.len()),
        }?;
        for input in self.inputs() {
            input.fmt_indented(f, indent + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for PhysicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

pub struct PhysicalPlanner {
    weights: CostWeights,
}

impl PhysicalPlanner {
    pub fn new(weights: CostWeights) -> Self {
        PhysicalPlanner { weights }
    }

    pub fn plan(&self, logical: &LogicalPlan) -> EngineResult<PhysicalPlan> {
        match logical {
            LogicalPlan::Scan(scan) => self.plan_scan(scan, Vec::new()),
            LogicalPlan::Filter { input, predicate } => {
                let child = self.plan(input)?;
                let rows = estimate_rows(logical);
                let cost = CostVector {
                    cpu: child.estimate().rows,
                    ..Default::default()
                };
                Ok(PhysicalPlan::Filter {
                    input: Arc::new(child),
                    predicate: predicate.clone(),
                    rows,
                    cost,
                })
            }
            LogicalPlan::Project {
                input,
                exprs,
                schema,
            } => {
                let child = self.plan(input)?;
                let rows = child.estimate();
                let cost = CostVector {
                    cpu: rows.rows * exprs.len().max(1) as f64 * 0.1,
                    ..Default::default()
                };
                Ok(PhysicalPlan::Project {
                    input: Arc::new(child),
                    exprs: exprs.clone(),
                    schema: schema.clone(),
                    rows,
                    cost,
                })
            }
            LogicalPlan::Join {
                left,
                right,
                join_type,
                on,
                filter,
                schema,
            } => self.plan_join(logical, left, right, *join_type, on, filter, schema),
            LogicalPlan::Aggregate {
                input,
                group_by,
                aggregates,
                schema,
            } => {
                let child = self.plan(input)?;
                let rows = estimate_rows(logical);
                let input_rows = child.estimate().rows;
                let cost = CostVector {
                    cpu: input_rows,
                    memory: rows.rows,
                    ..Default::default()
                };
                Ok(PhysicalPlan::Aggregate {
                    input: Arc::new(child),
                    group_by: group_by.clone(),
                    aggregates: aggregates.clone(),
                    schema: schema.clone(),
                    rows,
                    cost,
                })
            }
            LogicalPlan::Sort { input, keys } => {
                // A sort directly over a relational scan rides along with
                // the scan's pushdown instead of materialising here.
                if let LogicalPlan::Scan(scan) = input.as_ref() {
                    if let Some(pushed) = delegable_sort(scan, keys) {
                        return self.plan_scan(scan, pushed);
                    }
                }
                let child = self.plan(input)?;
                let rows = child.estimate();
                let n = rows.rows.max(2.0);
                let cost = CostVector {
                    cpu: n * n.log2(),
                    memory: n,
                    ..Default::default()
                };
                Ok(PhysicalPlan::Sort {
                    input: Arc::new(child),
                    keys: keys.clone(),
                    rows,
                    cost,
                })
            }
            LogicalPlan::Limit {
                input,
                limit,
                offset,
            } => {
                let child = self.plan(input)?;
                let rows = estimate_rows(logical);
                Ok(PhysicalPlan::Limit {
                    input: Arc::new(child),
                    limit: *limit,
                    offset: *offset,
                    rows,
                    cost: CostVector::default(),
                })
            }
            LogicalPlan::Union { inputs, all, schema } => {
                if !all {
                    return Err(EngineError::Internal(
                        "distinct union survived binding".to_string(),
                    ));
                }
                let children = inputs
                    .iter()
                    .map(|i| Ok(Arc::new(self.plan(i)?)))
                    .collect::<EngineResult<Vec<_>>>()?;
                let rows = estimate_rows(logical);
                Ok(PhysicalPlan::Union {
                    inputs: children,
                    schema: schema.clone(),
                    rows,
                    cost: CostVector::default(),
                })
            }
            LogicalPlan::SubqueryAlias { input, .. } => self.plan(input),
            LogicalPlan::Values { rows, schema } => Ok(PhysicalPlan::Values {
                rows_data: rows.clone(),
                schema: schema.clone(),
                rows: RowEstimate {
                    rows: rows.len() as f64,
                    assumed: false,
                },
                cost: CostVector::default(),
            }),
        }
    }

    fn plan_scan(
        &self,
        scan: &ScanNode,
        pushed_sort: Vec<SortKey>,
    ) -> EngineResult<PhysicalPlan> {
        let source_type = scan.table.source_type;
        let base_width = scan.table.columns.len();

        // Split the scan filter into what the source accepts and what the
        // executor must re-apply.
        let mut pushed = Vec::new();
        let mut residual_base = Vec::new();
        if let Some(filter) = &scan.filter {
            for conjunct in split_conjunction(filter) {
                if source_accepts_conjunct(source_type, &conjunct) {
                    pushed.push(conjunct);
                } else {
                    residual_base.push(conjunct);
                }
            }
        }

        if scan.aggregate.is_some() {
            if !residual_base.is_empty() {
                return Err(EngineError::Internal(
                    "aggregate pushed onto a scan with residual filter".to_string(),
                ));
            }
            let exec = ScanExec {
                scan: scan.clone(),
                fetch: Vec::new(),
                pushed_filter: conjoin(pushed),
                residual: None,
                pushed_sort,
                output: Vec::new(),
                schema: scan.output_schema(),
                access: AccessPath::FullScan,
            };
            let rows = estimate_rows(&LogicalPlan::Scan(scan.clone()));
            let rows = RowEstimate {
                rows: (rows.rows / 10.0).max(1.0),
                assumed: rows.assumed,
            };
            let cost = CostVector {
                io: scan.table.statistics.row_count as f64,
                network: rows.rows * exec.schema.len().max(1) as f64,
                cpu: rows.rows,
                memory: 0.0,
            };
            return Ok(PhysicalPlan::SourceScan { exec, rows, cost });
        }

        // Columns to fetch: the projected output plus residual inputs.
        let projection: Vec<usize> = scan
            .projection
            .clone()
            .unwrap_or_else(|| (0..base_width).collect());
        let mut fetch_set: BTreeSet<usize> = projection.iter().copied().collect();
        for conjunct in &residual_base {
            conjunct.columns_used(&mut fetch_set);
        }
        let fetch: Vec<usize> = fetch_set.into_iter().collect();
        let fetch_pos = |base: usize| fetch.iter().position(|&b| b == base);

        let residual = match conjoin(residual_base) {
            Some(residual) => Some(
                residual
                    .remap_columns(&|b| fetch_pos(b))
                    .ok_or_else(|| {
                        EngineError::Internal("residual references unfetched column".to_string())
                    })?,
            ),
            None => None,
        };
        let output: Vec<usize> = projection
            .iter()
            .map(|&b| {
                fetch_pos(b).ok_or_else(|| {
                    EngineError::Internal("projected column not fetched".to_string())
                })
            })
            .collect::<Result<_, _>>()?;

        // Index access when a pushed equality hits a leading index column.
        let access = pushed
            .iter()
            .find_map(|conjunct| indexed_column(scan, conjunct))
            .map(|column| AccessPath::IndexScan { column })
            .unwrap_or(AccessPath::FullScan);

        let rows = estimate_rows(&LogicalPlan::Scan(scan.clone()));
        let source_rows = match &access {
            AccessPath::FullScan => scan.table.statistics.row_count as f64,
            AccessPath::IndexScan { .. } => rows.rows,
        };
        let cost = CostVector {
            io: source_rows,
            network: rows.rows * fetch.len().max(1) as f64,
            cpu: if residual.is_some() { rows.rows } else { 0.0 },
            memory: 0.0,
        };

        let exec = ScanExec {
            scan: scan.clone(),
            fetch,
            pushed_filter: conjoin(pushed),
            residual,
            pushed_sort,
            output,
            schema: scan.output_schema(),
            access,
        };
        Ok(PhysicalPlan::SourceScan { exec, rows, cost })
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_join(
        &self,
        logical: &LogicalPlan,
        left: &Arc<LogicalPlan>,
        right: &Arc<LogicalPlan>,
        join_type: JoinType,
        on: &[(ScalarExpr, ScalarExpr)],
        filter: &Option<ScalarExpr>,
        schema: &Schema,
    ) -> EngineResult<PhysicalPlan> {
        let left_phys = Arc::new(self.plan(left)?);
        let right_phys = Arc::new(self.plan(right)?);
        let rows = estimate_rows(logical);
        let left_rows = left_phys.estimate().rows;
        let right_rows = right_phys.estimate().rows;

        let mut candidates: Vec<PhysicalPlan> = Vec::new();

        if !on.is_empty() || join_type == JoinType::Semi {
            for build_side in [BuildSide::Left, BuildSide::Right] {
                let build_rows = match build_side {
                    BuildSide::Left => left_rows,
                    BuildSide::Right => right_rows,
                };
                let probe_rows = left_rows + right_rows - build_rows;
                let cost = CostVector {
                    cpu: build_rows + probe_rows,
                    memory: build_rows,
                    ..Default::default()
                };
                candidates.push(PhysicalPlan::HashJoin {
                    left: left_phys.clone(),
                    right: right_phys.clone(),
                    join_type,
                    on: on.to_vec(),
                    filter: filter.clone(),
                    build_side,
                    schema: schema.clone(),
                    rows,
                    cost,
                });
            }
        }

        // Nested loops remain valid for any join shape; the equi keys fold
        // into the residual condition.
        let mut nl_filter = filter.clone();
        if !on.is_empty() {
            let left_len = left.schema().len();
            let mut conjuncts = Vec::new();
            for (l, r) in on {
                let shifted = r
                    .remap_columns(&|i| Some(i + left_len))
                    .ok_or_else(|| EngineError::Internal("unshiftable join key".to_string()))?;
                conjuncts.push(ScalarExpr::binary(
                    l.clone(),
                    crate::expr::BinaryOp::Eq,
                    shifted,
                ));
            }
            if let Some(existing) = nl_filter {
                conjuncts.push(existing);
            }
            nl_filter = conjoin(conjuncts);
        }
        candidates.push(PhysicalPlan::NestedLoopJoin {
            left: left_phys.clone(),
            right: right_phys.clone(),
            join_type,
            filter: nl_filter,
            schema: schema.clone(),
            rows,
            cost: CostVector {
                cpu: left_rows * right_rows,
                memory: right_rows,
                ..Default::default()
            },
        });

        let chosen = candidates
            .into_iter()
            .min_by(|a, b| {
                let ca = a.cost().total(&self.weights);
                let cb = b.cost().total(&self.weights);
                ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("at least one candidate");
        debug!(
            chosen = match &chosen {
                PhysicalPlan::HashJoin { build_side, .. } => match build_side {
                    BuildSide::Left => "hash/build-left",
                    BuildSide::Right => "hash/build-right",
                },
                _ => "nested-loop",
            },
            left_rows,
            right_rows,
            "join implementation selected"
        );
        Ok(chosen)
    }
}

/// A sort is delegable when the source is relational and every key is a
/// plain column mappable to the base table.
fn delegable_sort(scan: &ScanNode, keys: &[SortKey]) -> Option<Vec<SortKey>> {
    // Relational sources only; index sorting on analysed fields is not
    // reliable enough to delegate.
    if scan.table.source_type.kind() != crate::catalog::SourceKind::RelationalRow {
        return None;
    }
    if scan.aggregate.is_some() {
        return None;
    }
    let mut pushed = Vec::with_capacity(keys.len());
    for key in keys {
        match &key.expr {
            ScalarExpr::Column { .. } => {
                let base = key.expr.remap_columns(&|i| match &scan.projection {
                    Some(p) => p.get(i).copied(),
                    None => Some(i),
                })?;
                pushed.push(SortKey {
                    expr: base,
                    ascending: key.ascending,
                    nulls_first: key.nulls_first,
                });
            }
            _ => return None,
        }
    }
    Some(pushed)
}

fn indexed_column(scan: &ScanNode, conjunct: &ScalarExpr) -> Option<String> {
    let ScalarExpr::Binary {
        left,
        op: crate::expr::BinaryOp::Eq,
        right,
    } = conjunct
    else {
        return None;
    };
    let column = match (left.as_ref(), right.as_ref()) {
        (ScalarExpr::Column { index, .. }, ScalarExpr::Literal(_))
        | (ScalarExpr::Literal(_), ScalarExpr::Column { index, .. }) => {
            scan.table.columns.get(*index)?.name.clone()
        }
        _ => return None,
    };
    scan.table.has_index_on(&column).then_some(column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{Binder, BoundStatement};
    use crate::catalog::test_fixtures::federated_catalog;
    use crate::optimizer::Optimizer;
    use crate::parser::parse;

    fn physical(sql: &str) -> PhysicalPlan {
        let catalog = federated_catalog();
        let parsed = parse(sql, None).unwrap();
        let BoundStatement::Select(plan) =
            Binder::new(&catalog).bind_statement(parsed).unwrap()
        else {
            panic!("expected select");
        };
        let optimized = Optimizer::new().optimize(plan).unwrap();
        PhysicalPlanner::new(CostWeights::default())
            .plan(&optimized)
            .unwrap()
    }

    fn find_hash_join(plan: &PhysicalPlan) -> Option<(&PhysicalPlan, BuildSide)> {
        if let PhysicalPlan::HashJoin { build_side, .. } = plan {
            return Some((plan, *build_side));
        }
        plan.inputs().iter().find_map(|i| find_hash_join(i))
    }

    fn find_scan<'p>(plan: &'p PhysicalPlan, table: &str) -> Option<&'p ScanExec> {
        if let PhysicalPlan::SourceScan { exec, .. } = plan {
            if exec.scan.table.name == table {
                return Some(exec);
            }
        }
        plan.inputs().iter().find_map(|i| find_scan(i, table))
    }

    #[test]
    fn federated_join_builds_on_smaller_side() {
        let plan = physical(
            "SELECT o.id, o.customer, l.access_time \
             FROM mysql_db.orders o JOIN es_logs.access_logs l ON o.id = l.order_id \
             WHERE o.status = 'completed'",
        );
        let (join, build_side) = find_hash_join(&plan).expect("hash join chosen");
        // orders after the status filter: 5 000 rows; access_logs: 8 000.
        // The filtered orders side is smaller and is the left input.
        let PhysicalPlan::HashJoin { left, .. } = join else {
            unreachable!()
        };
        let left_is_orders = find_scan(left, "orders").is_some();
        if left_is_orders {
            assert_eq!(build_side, BuildSide::Left);
        } else {
            assert_eq!(build_side, BuildSide::Right);
        }
    }

    #[test]
    fn relational_filter_fully_pushed() {
        let plan = physical("SELECT id FROM mysql_db.orders WHERE status = 'completed'");
        let scan = find_scan(&plan, "orders").unwrap();
        assert!(scan.pushed_filter.is_some());
        assert!(scan.residual.is_none());
    }

    #[test]
    fn es_complex_predicate_becomes_residual() {
        // LENGTH() has no query-DSL rendering; it must come back to the
        // engine while the range predicate stays pushed.
        let plan = physical(
            "SELECT order_id FROM es_logs.access_logs \
             WHERE order_id > 5 AND LENGTH(order_id) > 2",
        );
        let scan = find_scan(&plan, "access_logs").unwrap();
        assert!(scan.pushed_filter.is_some(), "range pushed");
        assert!(scan.residual.is_some(), "function residual");
        // The residual's column is fetched even though not projected.
        assert_eq!(scan.fetch, vec![0]);
    }

    #[test]
    fn index_equality_selects_index_scan() {
        let plan = physical("SELECT customer FROM mysql_db.orders WHERE id = 42");
        let scan = find_scan(&plan, "orders").unwrap();
        assert_eq!(
            scan.access,
            AccessPath::IndexScan {
                column: "id".to_string()
            }
        );
    }

    #[test]
    fn non_indexed_filter_stays_full_scan() {
        let plan = physical("SELECT id FROM mysql_db.orders WHERE status = 'x'");
        let scan = find_scan(&plan, "orders").unwrap();
        assert_eq!(scan.access, AccessPath::FullScan);
    }

    #[test]
    fn sort_over_relational_scan_is_delegated() {
        let plan = physical("SELECT id FROM mysql_db.orders ORDER BY id DESC");
        let scan = find_scan(&plan, "orders").unwrap();
        assert_eq!(scan.pushed_sort.len(), 1);
        assert!(!scan.pushed_sort[0].ascending);
        fn has_sort(plan: &PhysicalPlan) -> bool {
            matches!(plan, PhysicalPlan::Sort { .. })
                || plan.inputs().iter().any(|i| has_sort(i))
        }
        assert!(!has_sort(&plan), "engine sort eliminated");
    }

    #[test]
    fn cross_join_uses_nested_loop() {
        let plan = physical(
            "SELECT o.id FROM mysql_db.orders o CROSS JOIN es_logs.access_logs l",
        );
        fn has_nl(plan: &PhysicalPlan) -> bool {
            matches!(plan, PhysicalPlan::NestedLoopJoin { .. })
                || plan.inputs().iter().any(|i| has_nl(i))
        }
        assert!(has_nl(&plan));
    }

    #[test]
    fn explain_rendering_mentions_defaults_when_stats_missing() {
        use crate::catalog::{
            Catalog, ColumnMeta, SourceType, TableKind, TableMeta, TableStatistics,
        };
        use crate::types::LogicalType;
        let catalog = Catalog::builder()
            .source("db", SourceType::MySql)
            .table(TableMeta {
                source: "db".into(),
                source_type: SourceType::MySql,
                schema: "s".into(),
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
            })
            .build();
        let parsed = parse("SELECT c FROM db.s.t", None).unwrap();
        let BoundStatement::Select(bound) =
            Binder::new(&catalog).bind_statement(parsed).unwrap()
        else {
            panic!("expected select");
        };
        let optimized = Optimizer::new().optimize(bound).unwrap();
        let plan = PhysicalPlanner::new(CostWeights::default())
            .plan(&optimized)
            .unwrap();
        assert!(plan.used_default_statistics());
        assert!(format!("{plan}").contains("[default stats]"));
    }

    #[test]
    fn total_cost_accumulates_down_the_tree() {
        let plan = physical(
            "SELECT o.id FROM mysql_db.orders o JOIN es_logs.access_logs l \
             ON o.id = l.order_id",
        );
        let weights = CostWeights::default();
        assert!(plan.total_cost(&weights) > plan.cost().total(&weights));
    }
}
