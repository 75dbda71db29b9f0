//! Safety Classifier
//!
//! A rules engine over planned operations. Every rule has an id, a name
//! and a severity; an operation is destructive when a `Block` rule fires on
//! it. The gate in [`SafetyClassifier::enforce`] refuses a plan holding any
//! destructive operation unless the caller opted in.

use crate::error::{BlockedOperation, ReconcileError, ReconcileResult};
use crate::model::normalize::{classify_type_change, TypeChange};
use crate::model::{ReferentialAction, SchemaGraph, SchemaObject};
use crate::planner::Operation;
use crate::sqlgen::Step;
use serde::Serialize;
use tracing::warn;

/// Rule severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    /// Destructive: blocked unless destructive changes are allowed
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    DataLoss,
    Integrity,
    Performance,
}

/// A safety rule definition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub category: RuleCategory,
}

/// A rule that fired on an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub message: String,
    pub affected_object: String,
    pub suggestion: Option<String>,
}

/// The classifier that applies safety rules to operations
pub struct SafetyClassifier {
    rules: Vec<Rule>,
}

impl Default for SafetyClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyClassifier {
    pub fn new() -> Self {
        Self {
            rules: Self::default_rules(),
        }
    }

    pub fn list_rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Attach findings and the destructive flag to every operation
    pub fn annotate(&self, operations: &mut [Operation], desired: &SchemaGraph, live: &SchemaGraph) {
        for op in operations.iter_mut() {
            op.findings = self.classify(op, desired, live);
            op.destructive = op.findings.iter().any(|f| f.severity == Severity::Block);
        }
    }

    /// Every rule that fires on one operation
    pub fn classify(&self, op: &Operation, desired: &SchemaGraph, live: &SchemaGraph) -> Vec<Finding> {
        let target = op.target.to_string();
        let mut findings = Vec::new();
        let mut fire = |id: &str, message: String, suggestion: Option<&str>| {
            if let Some(rule) = self.rules.iter().find(|r| r.id == id) {
                findings.push(Finding {
                    rule_id: rule.id.to_string(),
                    rule_name: rule.name.to_string(),
                    severity: rule.severity,
                    message,
                    affected_object: target.clone(),
                    suggestion: suggestion.map(str::to_string),
                });
            }
        };

        match &op.step {
            Step::DropTable { .. } => fire(
                "S001",
                format!("Dropping table {} deletes all of its rows", target),
                Some("Archive the data first if it is still needed"),
            ),
            Step::DropColumn { .. } => fire(
                "S002",
                format!("Dropping column {} deletes its data", target),
                Some("Stop reading the column, then drop it in a later release"),
            ),
            Step::DropConstraint { .. } => fire(
                "S003",
                format!("Dropping constraint {} stops enforcing it", target),
                None,
            ),
            Step::DropSequence { .. } => fire(
                "S004",
                format!("Dropping sequence {} loses its current value", target),
                None,
            ),
            Step::DropIndex { index } => {
                let unique = live
                    .get(index)
                    .is_some_and(|o| matches!(o, SchemaObject::Index(i) if i.unique));
                if unique {
                    fire(
                        "S005",
                        format!("Dropping unique index {} could allow duplicate values", target),
                        Some("Add a unique constraint if uniqueness is still required"),
                    );
                } else {
                    fire(
                        "S006",
                        format!("Dropping index {} may slow down queries", target),
                        Some("Review query plans before removing indexes"),
                    );
                }
            }
            Step::DropView { .. } => fire(
                "S007",
                format!("Dropping view {} breaks its readers", target),
                None,
            ),
            Step::AlterColumnType { column, data_type, .. } => {
                let from = live.column(column).map(|c| c.data_type.as_str()).unwrap_or_default();
                match classify_type_change(from, data_type) {
                    TypeChange::Narrowing | TypeChange::Incompatible => fire(
                        "S008",
                        format!("Changing {} from {} to {} may lose or reject data", target, from, data_type),
                        Some("Add a new column, backfill it, then swap"),
                    ),
                    TypeChange::Widening => fire(
                        "S009",
                        format!("Widening {} from {} to {} rewrites the table", target, from, data_type),
                        None,
                    ),
                    TypeChange::Same => {}
                }
            }
            Step::SetNotNull { column } => {
                let filled = desired
                    .column(column)
                    .is_some_and(|c| c.default.is_some() || c.identity.is_some());
                if !filled {
                    fire(
                        "S010",
                        format!("Setting {} to NOT NULL fails if existing rows hold NULL", target),
                        Some("Backfill NULLs first, or give the column a default"),
                    );
                }
            }
            Step::AddColumn { column, serial } => {
                if !serial && crate::diff::adds_required_column(column) {
                    fire(
                        "S011",
                        format!("Adding NOT NULL column {} without a default fails on a non-empty table", target),
                        Some("Add the column as nullable, backfill, then set NOT NULL"),
                    );
                }
            }
            Step::DropIdentity { .. } => fire(
                "S012",
                format!("Dropping the identity of {} removes its value generator", target),
                None,
            ),
            Step::AddConstraint { constraint } => {
                let cascades = constraint
                    .foreign_key()
                    .is_some_and(|fk| fk.on_delete == ReferentialAction::Cascade);
                if cascades {
                    fire(
                        "S013",
                        format!("Foreign key {} deletes rows in cascade", target),
                        Some("Use RESTRICT or SET NULL if data preservation is important"),
                    );
                }
            }
            Step::CreateTable { constraints, .. } => {
                for constraint in constraints {
                    if constraint
                        .foreign_key()
                        .is_some_and(|fk| fk.on_delete == ReferentialAction::Cascade)
                    {
                        fire(
                            "S013",
                            format!("Foreign key {} deletes rows in cascade", constraint.name),
                            Some("Use RESTRICT or SET NULL if data preservation is important"),
                        );
                    }
                }
            }
            _ => {}
        }

        findings
    }

    /// Reject the plan when it holds destructive operations that are not allowed
    pub fn enforce(operations: &[Operation], allow_destructive: bool) -> ReconcileResult<()> {
        if allow_destructive {
            return Ok(());
        }
        let blocked: Vec<BlockedOperation> = operations
            .iter()
            .filter(|op| op.destructive)
            .map(|op| BlockedOperation {
                target: op.target.to_string(),
                statement: op.sql.clone(),
                reason: op.destructive_reason().unwrap_or("destructive change").to_string(),
            })
            .collect();
        if blocked.is_empty() {
            return Ok(());
        }
        warn!("🛑 Blocking plan: {} destructive operations", blocked.len());
        Err(ReconcileError::DestructiveOperationBlocked { operations: blocked })
    }

    fn default_rules() -> Vec<Rule> {
        vec![
            Rule {
                id: "S001",
                name: "Table Drop",
                description: "Dropping a table deletes its rows",
                severity: Severity::Block,
                category: RuleCategory::DataLoss,
            },
            Rule {
                id: "S002",
                name: "Column Drop",
                description: "Dropping a column deletes its data",
                severity: Severity::Block,
                category: RuleCategory::DataLoss,
            },
            Rule {
                id: "S003",
                name: "Constraint Drop",
                description: "Dropping a constraint stops enforcing it",
                severity: Severity::Block,
                category: RuleCategory::Integrity,
            },
            Rule {
                id: "S004",
                name: "Sequence Drop",
                description: "Dropping a sequence loses its position",
                severity: Severity::Block,
                category: RuleCategory::DataLoss,
            },
            Rule {
                id: "S005",
                name: "Unique Index Drop",
                description: "Dropping a unique index stops enforcing uniqueness",
                severity: Severity::Block,
                category: RuleCategory::Integrity,
            },
            Rule {
                id: "S006",
                name: "Index Drop",
                description: "Dropping an index may slow down queries",
                severity: Severity::Warning,
                category: RuleCategory::Performance,
            },
            Rule {
                id: "S007",
                name: "View Drop",
                description: "Dropping a view breaks its readers",
                severity: Severity::Block,
                category: RuleCategory::Integrity,
            },
            Rule {
                id: "S008",
                name: "Narrowing Type Change",
                description: "Narrowing or incompatible type changes may lose or reject data",
                severity: Severity::Block,
                category: RuleCategory::DataLoss,
            },
            Rule {
                id: "S009",
                name: "Widening Type Change",
                description: "Widening type changes keep data but rewrite the table",
                severity: Severity::Info,
                category: RuleCategory::Performance,
            },
            Rule {
                id: "S010",
                name: "NOT NULL Without Default",
                description: "SET NOT NULL on a column without a default fails on existing NULLs",
                severity: Severity::Block,
                category: RuleCategory::Integrity,
            },
            Rule {
                id: "S011",
                name: "Required Column Without Default",
                description: "Adding a NOT NULL column without a default fails on existing rows",
                severity: Severity::Block,
                category: RuleCategory::Integrity,
            },
            Rule {
                id: "S012",
                name: "Identity Drop",
                description: "Dropping an identity removes the column's value generator",
                severity: Severity::Block,
                category: RuleCategory::DataLoss,
            },
            Rule {
                id: "S013",
                name: "Cascade Delete",
                description: "ON DELETE CASCADE can remove rows far from the statement that triggered it",
                severity: Severity::Warning,
                category: RuleCategory::DataLoss,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_schema;
    use crate::planner::plan_changes;
    use pretty_assertions::assert_eq;

    fn plan(desired: &str, live: &str) -> Vec<Operation> {
        plan_changes(&parse_schema(desired, "public").unwrap(), &parse_schema(live, "public").unwrap()).unwrap()
    }

    fn rule_ids(op: &Operation) -> Vec<&str> {
        op.findings.iter().map(|f| f.rule_id.as_str()).collect()
    }

    #[test]
    fn test_dropped_column_is_blocked() {
        let ops = plan(
            "CREATE TABLE users (id int PRIMARY KEY);",
            "CREATE TABLE users (id int PRIMARY KEY, email text);",
        );
        assert_eq!(ops.len(), 1);
        assert!(ops[0].destructive);

        let err = SafetyClassifier::enforce(&ops, false).unwrap_err();
        match &err {
            ReconcileError::DestructiveOperationBlocked { operations } => {
                assert_eq!(operations.len(), 1);
                assert_eq!(operations[0].target, "public.users.email");
                assert_eq!(operations[0].statement, "ALTER TABLE \"public\".\"users\" DROP COLUMN \"email\"");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("users.email"));
        assert!(SafetyClassifier::enforce(&ops, true).is_ok());
    }

    #[test]
    fn test_type_changes_by_direction() {
        let ops = plan("CREATE TABLE t (a bigint, b varchar(5));", "CREATE TABLE t (a integer, b varchar(10));");
        let widen = ops.iter().find(|op| op.target.local() == "a").unwrap();
        let narrow = ops.iter().find(|op| op.target.local() == "b").unwrap();
        assert_eq!(rule_ids(widen), vec!["S009"]);
        assert!(!widen.destructive);
        assert_eq!(rule_ids(narrow), vec!["S008"]);
        assert!(narrow.destructive);
    }

    #[test]
    fn test_not_null_rules() {
        let ops = plan("CREATE TABLE t (a int NOT NULL, b int NOT NULL);", "CREATE TABLE t (a int);");
        let set = ops.iter().find(|op| op.target.local() == "a").unwrap();
        let add = ops.iter().find(|op| op.target.local() == "b").unwrap();
        assert_eq!(rule_ids(set), vec!["S010"]);
        assert_eq!(rule_ids(add), vec!["S011"]);

        let ops = plan("CREATE TABLE t (a int NOT NULL DEFAULT 0);", "CREATE TABLE t (a int);");
        assert!(ops.iter().all(|op| !op.destructive));
    }

    #[test]
    fn test_index_drops() {
        let live = "CREATE TABLE t (a int, b int);
                    CREATE UNIQUE INDEX t_a_idx ON t (a);
                    CREATE INDEX t_b_idx ON t (b);";
        let ops = plan("CREATE TABLE t (a int, b int);", live);
        let unique = ops.iter().find(|op| op.target.local() == "t_a_idx").unwrap();
        let plain = ops.iter().find(|op| op.target.local() == "t_b_idx").unwrap();
        assert!(unique.destructive);
        assert!(!plain.destructive);
        assert_eq!(plain.findings[0].severity, Severity::Warning);
    }

    #[test]
    fn test_safe_additions_pass_the_gate() {
        let ops = plan(
            "CREATE TABLE users (id int PRIMARY KEY, nickname text);
             CREATE INDEX users_nickname_idx ON users (nickname);
             CREATE VIEW names AS SELECT nickname FROM users;",
            "CREATE TABLE users (id int PRIMARY KEY);",
        );
        assert_eq!(ops.len(), 3);
        assert!(SafetyClassifier::enforce(&ops, false).is_ok());
    }

    #[test]
    fn test_cascade_delete_is_a_warning() {
        let ops = plan(
            "CREATE TABLE users (id int PRIMARY KEY);
             CREATE TABLE orders (user_id int REFERENCES users (id) ON DELETE CASCADE);",
            "CREATE TABLE users (id int PRIMARY KEY);",
        );
        assert_eq!(ops.len(), 1);
        assert_eq!(rule_ids(&ops[0]), vec!["S013"]);
        assert!(!ops[0].destructive);
    }
}
