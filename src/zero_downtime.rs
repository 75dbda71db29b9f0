//! Zero-Downtime Rewriter
//!
//! Splits an ordered plan into expand, backfill and contract phases. Each
//! phase is applied in its own transaction, so the application can keep
//! running against the expanded schema while data is copied, and only the
//! contract phase removes anything old code might still read.

use crate::diff::{adds_required_column, ChangeClass};
use crate::model::{CanonicalName, Column, ObjectKind};
use crate::planner::Operation;
use crate::sqlgen::Step;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// The whole plan in one transaction
    Single,
    Expand,
    Backfill,
    Contract,
}

/// One independently-applicable slice of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub kind: PhaseKind,
    pub operations: Vec<Operation>,
}

/// Suffix of the shadow column a split type change writes into
pub const SHADOW_SUFFIX: &str = "__new";

/// Rewrites ordered operations into expand/backfill/contract phases
pub struct ExpandContractRewriter;

impl ExpandContractRewriter {
    /// The plan as one phase (empty plans have none)
    pub fn single_phase(operations: &[Operation]) -> Vec<Phase> {
        if operations.is_empty() {
            return Vec::new();
        }
        vec![Phase {
            kind: PhaseKind::Single,
            operations: operations.to_vec(),
        }]
    }

    pub fn rewrite(operations: &[Operation]) -> Vec<Phase> {
        let split_columns: BTreeSet<CanonicalName> = operations
            .iter()
            .filter(|op| matches!(op.step, Step::AlterColumnType { .. }))
            .filter(|op| op.split.as_ref().is_some_and(|s| s.splittable))
            .map(|op| op.target.clone())
            .collect();

        let mut next_id = operations.iter().map(|op| op.rank).max().unwrap_or(0) + 1;
        let mut synthesize = |origin: &Operation, step: Step, previous: Option<usize>| {
            let mut op = Operation::new(ChangeClass::Modify, ObjectKind::Column, origin.target.clone(), step);
            op.rank = next_id;
            op.after = previous.into_iter().collect();
            op.depends_on = origin.depends_on.clone();
            next_id += 1;
            op
        };

        let mut expand = Vec::new();
        let mut backfill = Vec::new();
        let mut contract = Vec::new();
        let mut not_null = Vec::new();
        let mut deferred: BTreeSet<usize> = BTreeSet::new();

        for op in operations {
            let column_step = matches!(
                op.step,
                Step::SetDefault { .. } | Step::DropDefault { .. } | Step::SetNotNull { .. } | Step::DropNotNull { .. }
            );
            match &op.step {
                Step::AlterColumnType { column, data_type, .. } if split_columns.contains(column) => {
                    let (nullable, default) = op
                        .split
                        .as_ref()
                        .map(|s| (s.nullable, s.default.clone()))
                        .unwrap_or((true, None));
                    let shadow = format!("{}{}", column.local(), SHADOW_SUFFIX);

                    let add = synthesize(
                        op,
                        Step::AddColumn {
                            column: Column {
                                name: column.column_of(shadow.clone()),
                                data_type: data_type.clone(),
                                nullable: true,
                                default: None,
                                identity: None,
                                position: 0,
                            },
                            serial: false,
                        },
                        None,
                    );
                    let copy = synthesize(
                        op,
                        Step::Backfill {
                            table: column.parent(),
                            target: shadow.clone(),
                            source: column.local().to_string(),
                            data_type: data_type.clone(),
                        },
                        Some(add.rank),
                    );
                    let mut drop_old = synthesize(op, Step::DropColumn { column: column.clone() }, Some(copy.rank));
                    drop_old.destructive = op.destructive;
                    drop_old.findings = op.findings.clone();
                    let mut previous = drop_old.rank;
                    let rename = synthesize(
                        op,
                        Step::RenameColumn {
                            column: column.column_of(shadow),
                            new_name: column.local().to_string(),
                        },
                        Some(previous),
                    );
                    previous = rename.rank;
                    expand.push(add);
                    backfill.push(copy);
                    contract.push(drop_old);
                    contract.push(rename);
                    if !nullable {
                        let restore = synthesize(op, Step::SetNotNull { column: column.clone() }, Some(previous));
                        previous = restore.rank;
                        contract.push(restore);
                    }
                    if let Some(expression) = default {
                        contract.push(synthesize(
                            op,
                            Step::SetDefault {
                                column: column.clone(),
                                expression,
                            },
                            Some(previous),
                        ));
                    }
                }
                // Superseded by the restore steps of the split
                _ if column_step && split_columns.contains(&op.target) => {}
                Step::AddColumn { column, serial } if !serial && adds_required_column(column) => {
                    let mut relaxed_column = column.clone();
                    relaxed_column.nullable = true;
                    let mut relaxed = op.clone();
                    relaxed.step = Step::AddColumn {
                        column: relaxed_column,
                        serial: false,
                    };
                    relaxed.sql = relaxed.step.to_sql();
                    relaxed.destructive = false;
                    relaxed.findings.clear();

                    let mut restore = synthesize(op, Step::SetNotNull { column: column.name.clone() }, Some(op.rank));
                    restore.destructive = op.destructive;
                    restore.findings = op.findings.clone();
                    expand.push(relaxed);
                    not_null.push(restore);
                }
                _ => {
                    let waits = op.after.iter().any(|rank| deferred.contains(rank));
                    // Narrowing or incompatible, but other objects rely on the column
                    let rewrite_in_place = matches!(op.step, Step::AlterColumnType { .. }) && op.split.is_some();
                    if op.destructive || waits || rewrite_in_place {
                        deferred.insert(op.rank);
                        contract.push(op.clone());
                    } else {
                        expand.push(op.clone());
                    }
                }
            }
        }
        contract.extend(not_null);

        let phases: Vec<Phase> = [
            (PhaseKind::Expand, expand),
            (PhaseKind::Backfill, backfill),
            (PhaseKind::Contract, contract),
        ]
        .into_iter()
        .filter(|(_, ops)| !ops.is_empty())
        .map(|(kind, operations)| Phase { kind, operations })
        .collect();

        debug!(
            "Rewrote {} operations into {} phases ({} split columns)",
            operations.len(),
            phases.len(),
            split_columns.len()
        );
        Self::renumber(phases)
    }

    /// Re-rank operations across phases and drop links to superseded steps
    fn renumber(mut phases: Vec<Phase>) -> Vec<Phase> {
        let mut new_rank: BTreeMap<usize, usize> = BTreeMap::new();
        let mut counter = 0;
        for phase in &phases {
            for op in &phase.operations {
                counter += 1;
                new_rank.insert(op.rank, counter);
            }
        }
        for phase in &mut phases {
            for op in &mut phase.operations {
                op.rank = new_rank.get(&op.rank).copied().unwrap_or(op.rank);
                let mut after: Vec<usize> = op.after.iter().filter_map(|r| new_rank.get(r).copied()).collect();
                after.sort_unstable();
                op.after = after;
            }
        }
        phases
    }
}
