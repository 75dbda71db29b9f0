//! Plan Executor
//!
//! Applies a migration plan phase by phase. Each phase runs in its own
//! transaction: a failing statement rolls back only the phase it belongs
//! to, and phases committed before it stay applied.

use crate::db::Database;
use crate::engine::MigrationPlan;
use crate::error::{sanitize_db_error, ReconcileError, ReconcileResult};
use crate::safety::SafetyClassifier;
use crate::sqlgen::set_search_path;
use crate::zero_downtime::{ExpandContractRewriter, Phase};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How a plan should be applied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Let destructive operations through the safety gate
    pub allow_destructive: bool,
    /// Split the plan into expand/backfill/contract phases
    pub zero_downtime: bool,
    /// Deadline for the whole apply
    pub timeout: Option<Duration>,
    /// `SET LOCAL lock_timeout` for every phase
    pub lock_timeout: Option<Duration>,
}

/// Outcome of a successful apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub applied_count: usize,
    pub applied_at: DateTime<Utc>,
    pub phases_committed: usize,
    pub schema_hash: String,
}

/// Where the apply currently is; read back when the deadline hits
#[derive(Debug, Default)]
struct Progress {
    phase: usize,
    in_flight: Option<(usize, String)>,
    phases_committed: usize,
    applied_count: usize,
}

fn pg_error_message(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => sanitize_db_error(&format!("{} ({})", db.message(), db.code().code())),
        None => sanitize_db_error(e),
    }
}

/// Session settings run at the top of every phase transaction
fn phase_settings(target_schemas: &[String], lock_timeout: Option<Duration>) -> Vec<String> {
    let mut settings = vec![set_search_path(target_schemas)];
    if let Some(limit) = lock_timeout {
        settings.push(format!("SET LOCAL lock_timeout = '{}ms'", limit.as_millis()));
    }
    settings
}

/// Applies migration plans to the database
pub struct Executor;

impl Executor {
    /// The phases a plan is applied in
    pub fn phases(plan: &MigrationPlan, options: &ApplyOptions) -> Vec<Phase> {
        if options.zero_downtime {
            ExpandContractRewriter::rewrite(&plan.operations)
        } else {
            ExpandContractRewriter::single_phase(&plan.operations)
        }
    }

    pub async fn apply(
        database: &Database,
        plan: &MigrationPlan,
        options: &ApplyOptions,
    ) -> ReconcileResult<ApplyReport> {
        // The gate runs before any connection is checked out
        SafetyClassifier::enforce(&plan.operations, options.allow_destructive)?;

        let phases = Self::phases(plan, options);
        if phases.is_empty() {
            info!("✅ Schema already up to date, nothing to apply");
            return Ok(ApplyReport {
                applied_count: 0,
                applied_at: Utc::now(),
                phases_committed: 0,
                schema_hash: plan.schema_hash.clone(),
            });
        }

        info!(
            "🚀 Applying {} operations in {} phase(s)",
            plan.operations.len(),
            phases.len()
        );

        let mut client = database
            .pool()
            .get()
            .await
            .map_err(|e| ReconcileError::Pool(format!("Failed to get connection: {}", sanitize_db_error(&e))))?;
        let cancel_token = client.cancel_token();
        let progress = Mutex::new(Progress::default());

        let run = Self::run_phases(&mut client, &phases, &plan.target_schemas, options.lock_timeout, &progress);
        let outcome = match options.timeout {
            Some(limit) => match tokio::time::timeout_at(Instant::now() + limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // The dropped transaction rolls back once the running
                    // statement is cancelled
                    database.cancel(cancel_token).await;
                    let state = progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    let (rank, statement) = state.in_flight.clone().unzip();
                    error!("⏱️  Apply exceeded {:?}, cancelled phase {}", limit, state.phase);
                    Err(ReconcileError::Execution {
                        phase: state.phase,
                        rank,
                        statement,
                        message: format!("cancelled after exceeding the apply timeout of {:?}", limit),
                    })
                }
            },
            None => run.await,
        };
        drop(client);
        outcome?;

        let state = progress.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        let report = ApplyReport {
            applied_count: state.applied_count,
            applied_at: Utc::now(),
            phases_committed: state.phases_committed,
            schema_hash: plan.schema_hash.clone(),
        };
        info!(
            "✅ Applied {} operations in {} phase(s)",
            report.applied_count, report.phases_committed
        );
        Ok(report)
    }

    async fn run_phases(
        client: &mut deadpool_postgres::Client,
        phases: &[Phase],
        target_schemas: &[String],
        lock_timeout: Option<Duration>,
        progress: &Mutex<Progress>,
    ) -> ReconcileResult<()> {
        let update = |f: &dyn Fn(&mut Progress)| {
            let mut state = progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut state);
        };

        for (index, phase) in phases.iter().enumerate() {
            let number = index + 1;
            update(&|p| {
                p.phase = number;
                p.in_flight = None;
            });
            debug!("Phase {} ({:?}): {} operations", number, phase.kind, phase.operations.len());

            let transaction = client.transaction().await.map_err(|e| ReconcileError::Execution {
                phase: number,
                rank: None,
                statement: None,
                message: pg_error_message(&e),
            })?;

            for statement in phase_settings(target_schemas, lock_timeout) {
                if let Err(e) = transaction.batch_execute(&statement).await {
                    return Err(ReconcileError::Execution {
                        phase: number,
                        rank: None,
                        statement: Some(statement),
                        message: pg_error_message(&e),
                    });
                }
            }

            for op in &phase.operations {
                update(&|p| p.in_flight = Some((op.rank, op.sql.clone())));
                if let Err(e) = transaction.batch_execute(&op.sql).await {
                    let message = pg_error_message(&e);
                    error!("❌ Operation {} failed in phase {}: {}", op.rank, number, message);
                    if let Err(rollback) = transaction.rollback().await {
                        warn!("⚠️  Rollback of phase {} failed: {}", number, pg_error_message(&rollback));
                    }
                    return Err(ReconcileError::Execution {
                        phase: number,
                        rank: Some(op.rank),
                        statement: Some(op.sql.clone()),
                        message,
                    });
                }
            }

            update(&|p| p.in_flight = None);
            transaction.commit().await.map_err(|e| ReconcileError::Execution {
                phase: number,
                rank: None,
                statement: None,
                message: pg_error_message(&e),
            })?;
            update(&|p| {
                p.phases_committed += 1;
                p.applied_count += phase.operations.len();
            });
            info!("✅ Phase {} ({:?}) committed", number, phase.kind);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::engine::plan_schema;
    use crate::parser::parse_schema;
    use pretty_assertions::assert_eq;

    fn unreachable_database() -> Database {
        // Nothing listens on port 1; any attempt to connect fails
        let config = DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..DatabaseConfig::default()
        };
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(config.host);
        cfg.port = Some(config.port);
        cfg.user = Some(config.user);
        cfg.dbname = Some(config.database);
        let pool = cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), tokio_postgres::NoTls)
            .unwrap();
        Database::from_pool(pool)
    }

    #[test]
    fn test_gate_runs_before_connecting() {
        let live = parse_schema("CREATE TABLE users (id int, email text);", "public").unwrap();
        let plan = plan_schema("CREATE TABLE users (id int);", &live, &["public".to_string()]).unwrap();
        let database = unreachable_database();

        let err = tokio_test::block_on(Executor::apply(&database, &plan, &ApplyOptions::default())).unwrap_err();
        assert!(matches!(err, ReconcileError::DestructiveOperationBlocked { .. }));
    }

    #[test]
    fn test_empty_plan_is_a_noop() {
        let live = parse_schema("CREATE TABLE users (id int);", "public").unwrap();
        let plan = plan_schema("CREATE TABLE users (id int);", &live, &["public".to_string()]).unwrap();
        let database = unreachable_database();

        let report = tokio_test::block_on(Executor::apply(&database, &plan, &ApplyOptions::default())).unwrap();
        assert_eq!(report.applied_count, 0);
        assert_eq!(report.phases_committed, 0);
        assert_eq!(report.schema_hash, plan.schema_hash);
    }

    #[test]
    fn test_phase_settings_pin_search_path() {
        let schemas = vec!["app".to_string(), "public".to_string()];
        assert_eq!(
            phase_settings(&schemas, None),
            vec!["SET LOCAL search_path = \"app\", \"public\"".to_string()]
        );
        assert_eq!(
            phase_settings(&schemas, Some(Duration::from_secs(2))),
            vec![
                "SET LOCAL search_path = \"app\", \"public\"".to_string(),
                "SET LOCAL lock_timeout = '2000ms'".to_string(),
            ]
        );
    }

    #[test]
    fn test_phases_follow_mode() {
        let live = parse_schema("CREATE TABLE t (a int);", "public").unwrap();
        let plan = plan_schema("CREATE TABLE t (a int, b text NOT NULL);", &live, &["public".to_string()]).unwrap();

        let single = Executor::phases(&plan, &ApplyOptions::default());
        assert_eq!(single.len(), 1);

        let options = ApplyOptions {
            zero_downtime: true,
            ..ApplyOptions::default()
        };
        assert_eq!(Executor::phases(&plan, &options).len(), 2);
    }
}
