//! Reconciliation Engine
//!
//! Ties the stages together: parse the declared schema, introspect the live
//! database, diff, order and classify, then either apply the plan or write
//! it to a migration file.

use crate::config::DatabaseConfig;
use crate::db::Database;
use crate::diff::ChangeClass;
use crate::error::ReconcileResult;
use crate::introspection::PostgresIntrospector;
use crate::model::SchemaGraph;
use crate::parser::parse_schema_in;
use crate::planner::{plan_changes, Operation};
use crate::safety::SafetyClassifier;
use crate::writer::{MigrationWriter, WriteOptions, WrittenMigration};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

pub use crate::executor::{ApplyOptions, ApplyReport};

/// An ordered, classified set of operations reconciling live to declared
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub operations: Vec<Operation>,
    /// SHA-256 of the declared schema text
    pub schema_hash: String,
    pub target_schemas: Vec<String>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn destructive_count(&self) -> usize {
        self.operations.iter().filter(|op| op.destructive).count()
    }

    /// Operations per change class: (add, modify, drop)
    pub fn counts(&self) -> (usize, usize, usize) {
        self.operations.iter().fold((0, 0, 0), |(a, m, d), op| match op.change {
            ChangeClass::Add => (a + 1, m, d),
            ChangeClass::Modify => (a, m + 1, d),
            ChangeClass::Drop => (a, m, d + 1),
        })
    }

    pub fn migration_count(&self) -> usize {
        self.operations.len()
    }

    /// One line per operation, e.g. `add table public.users`
    pub fn summaries(&self) -> Vec<String> {
        self.operations.iter().map(Operation::summary).collect()
    }
}

/// Hex SHA-256 of the raw declared schema text
pub fn compute_schema_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Plan against an already-built live graph
pub fn plan_schema(
    desired_sql: &str,
    live: &SchemaGraph,
    target_schemas: &[String],
) -> ReconcileResult<MigrationPlan> {
    let desired = parse_schema_in(desired_sql, target_schemas)?;
    debug!("Declared schema has {} objects, live has {}", desired.len(), live.len());

    let operations = plan_changes(&desired, live)?;
    Ok(MigrationPlan {
        operations,
        schema_hash: compute_schema_hash(desired_sql),
        target_schemas: target_schemas.to_vec(),
    })
}

/// Write a plan as the next numbered migration in `output_dir`.
///
/// The destructive gate applies as it does for apply. An empty plan writes
/// nothing and returns `None`.
pub fn write_plan(
    plan: &MigrationPlan,
    output_dir: &Path,
    options: &WriteOptions,
) -> ReconcileResult<Option<WrittenMigration>> {
    SafetyClassifier::enforce(&plan.operations, options.allow_destructive)?;
    if plan.is_empty() {
        info!("✅ Nothing to write, the plan is empty");
        return Ok(None);
    }
    let written = MigrationWriter::new(output_dir, options.prefix.as_deref()).write(plan)?;
    Ok(Some(written))
}

/// Entry point against a live database
pub struct Reconciler {
    database: Database,
}

impl Reconciler {
    pub async fn connect(config: &DatabaseConfig) -> ReconcileResult<Self> {
        Ok(Self::from_database(Database::connect(config).await?))
    }

    pub fn from_database(database: Database) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Read the live schema of the target schemas
    pub async fn introspect(&self, target_schemas: &[String]) -> ReconcileResult<SchemaGraph> {
        PostgresIntrospector::introspect(self.database.pool(), target_schemas).await
    }

    pub async fn compute_plan(&self, desired_sql: &str, target_schemas: &[String]) -> ReconcileResult<MigrationPlan> {
        // Parse first so a broken schema file never touches the database
        parse_schema_in(desired_sql, target_schemas)?;

        let live = self.introspect(target_schemas).await?;
        let plan = plan_schema(desired_sql, &live, target_schemas)?;
        let (added, modified, dropped) = plan.counts();
        info!(
            "📋 Plan ready: {} operations ({} add, {} modify, {} drop, {} destructive)",
            plan.operations.len(),
            added,
            modified,
            dropped,
            plan.destructive_count()
        );
        Ok(plan)
    }

    pub async fn apply_plan(&self, plan: &MigrationPlan, options: &ApplyOptions) -> ReconcileResult<ApplyReport> {
        crate::executor::Executor::apply(&self.database, plan, options).await
    }
}
