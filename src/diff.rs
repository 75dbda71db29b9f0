//! Schema Diff Engine
//!
//! Compares the desired graph with the live graph name by name. Renames are
//! never guessed: a renamed object shows up as a drop plus an add.

use crate::error::{ReconcileError, ReconcileResult};
use crate::model::normalize::{classify_type_change, normalize_expr, normalize_index_key, normalize_view, TypeChange};
use crate::model::{CanonicalName, Column, ConstraintDef, ObjectKind, SchemaGraph, SchemaObject};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Broad class of a change; also the first ordering tie-breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeClass {
    Drop,
    Modify,
    Add,
}

/// A single difference between the desired and live schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "change")]
pub enum ChangeEntry {
    /// Present only in the declared schema
    Add { object: SchemaObject },
    /// Present only in the live database
    Drop { object: SchemaObject },
    /// Present in both with different attributes
    Modify { old: SchemaObject, new: SchemaObject },
}

impl ChangeEntry {
    pub fn name(&self) -> &CanonicalName {
        match self {
            ChangeEntry::Add { object } | ChangeEntry::Drop { object } => object.name(),
            ChangeEntry::Modify { new, .. } => new.name(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            ChangeEntry::Add { object } | ChangeEntry::Drop { object } => object.kind(),
            ChangeEntry::Modify { new, .. } => new.kind(),
        }
    }

    pub fn class(&self) -> ChangeClass {
        match self {
            ChangeEntry::Add { .. } => ChangeClass::Add,
            ChangeEntry::Drop { .. } => ChangeClass::Drop,
            ChangeEntry::Modify { .. } => ChangeClass::Modify,
        }
    }

    /// Whether applying this change can lose data or reject existing rows
    pub fn is_destructive(&self) -> bool {
        match self {
            ChangeEntry::Add { object: SchemaObject::Column(column) } => adds_required_column(column),
            ChangeEntry::Add { .. } => false,
            ChangeEntry::Drop { object: SchemaObject::Index(index) } => index.unique,
            ChangeEntry::Drop { .. } => true,
            ChangeEntry::Modify { old, new } => match (old, new) {
                (SchemaObject::Column(old), SchemaObject::Column(new)) => column_change_is_destructive(old, new),
                (SchemaObject::Constraint(_), _) => true,
                (SchemaObject::Index(old), _) => old.unique,
                _ => false,
            },
        }
    }
}

/// A NOT NULL column with nothing to fill existing rows
pub fn adds_required_column(column: &Column) -> bool {
    !column.nullable && column.default.is_none() && column.identity.is_none()
}

pub fn column_change_is_destructive(old: &Column, new: &Column) -> bool {
    let type_change = classify_type_change(&old.data_type, &new.data_type);
    matches!(type_change, TypeChange::Narrowing | TypeChange::Incompatible)
        || (old.nullable && !new.nullable && new.default.is_none())
        || (old.identity.is_some() && new.identity.is_none())
}

fn same_expr(a: &str, b: &str) -> bool {
    normalize_expr(a) == normalize_expr(b)
}

fn same_optional_expr(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => same_expr(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// The diff engine that compares schema graphs
pub struct DiffEngine;

impl DiffEngine {
    /// Every difference between `desired` and `live`, ordered by name
    pub fn diff(desired: &SchemaGraph, live: &SchemaGraph) -> ReconcileResult<Vec<ChangeEntry>> {
        let names: BTreeSet<&CanonicalName> = desired.names().chain(live.names()).collect();
        let mut changes = Vec::new();

        for name in names {
            match (desired.get(name), live.get(name)) {
                (Some(wanted), None) => changes.push(ChangeEntry::Add { object: wanted.clone() }),
                (None, Some(existing)) => changes.push(ChangeEntry::Drop { object: existing.clone() }),
                (Some(wanted), Some(existing)) => {
                    if wanted.kind() != existing.kind() {
                        return Err(ReconcileError::Diff {
                            name: name.to_string(),
                            desired_kind: wanted.kind(),
                            live_kind: existing.kind(),
                        });
                    }
                    if !Self::equivalent(wanted, existing) {
                        changes.push(ChangeEntry::Modify {
                            old: existing.clone(),
                            new: wanted.clone(),
                        });
                    }
                }
                (None, None) => {}
            }
        }

        debug!(
            "Diff found {} changes ({} destructive)",
            changes.len(),
            changes.iter().filter(|c| c.is_destructive()).count()
        );
        Ok(changes)
    }

    /// Structural equality of a desired object and a live object of the same kind
    pub fn equivalent(desired: &SchemaObject, live: &SchemaObject) -> bool {
        match (desired, live) {
            (SchemaObject::Table(_), SchemaObject::Table(_)) => true,
            (SchemaObject::Column(d), SchemaObject::Column(l)) => {
                d.data_type == l.data_type
                    && d.nullable == l.nullable
                    && d.identity == l.identity
                    && same_optional_expr(d.default.as_deref(), l.default.as_deref())
            }
            (SchemaObject::Constraint(d), SchemaObject::Constraint(l)) => {
                Self::same_constraint(&d.definition, &l.definition)
            }
            (SchemaObject::Index(d), SchemaObject::Index(l)) => {
                d.table == l.table
                    && d.unique == l.unique
                    && d.method.eq_ignore_ascii_case(&l.method)
                    && d.keys.len() == l.keys.len()
                    && d.keys
                        .iter()
                        .zip(&l.keys)
                        .all(|(a, b)| normalize_index_key(a) == normalize_index_key(b))
                    && same_optional_expr(d.predicate.as_deref(), l.predicate.as_deref())
            }
            (SchemaObject::Sequence(d), SchemaObject::Sequence(l)) => {
                d.data_type == l.data_type
                    && d.start == l.start
                    && d.increment == l.increment
                    && d.min_value == l.min_value
                    && d.max_value == l.max_value
                    && d.cache == l.cache
                    && d.cycle == l.cycle
                    && d.owned_by == l.owned_by
            }
            (SchemaObject::View(d), SchemaObject::View(l)) => {
                normalize_view(&d.definition) == normalize_view(&l.definition)
            }
            _ => false,
        }
    }

    fn same_constraint(desired: &ConstraintDef, live: &ConstraintDef) -> bool {
        match (desired, live) {
            (ConstraintDef::PrimaryKey { columns: d }, ConstraintDef::PrimaryKey { columns: l })
            | (ConstraintDef::Unique { columns: d }, ConstraintDef::Unique { columns: l }) => d == l,
            (ConstraintDef::Check { expression: d }, ConstraintDef::Check { expression: l }) => same_expr(d, l),
            (ConstraintDef::ForeignKey(d), ConstraintDef::ForeignKey(l)) => {
                d.columns == l.columns
                    && d.referenced_table == l.referenced_table
                    && (d.referenced_columns.is_empty() || d.referenced_columns == l.referenced_columns)
                    && d.on_delete == l.on_delete
                    && d.on_update == l.on_update
                    && d.deferrable == l.deferrable
                    && d.initially_deferred == l.initially_deferred
            }
            _ => false,
        }
    }
}
