//! pgreconcile - reconcile a PostgreSQL database with a declared schema
//!
//! Reads the declared DDL from SCHEMA_FILE, introspects the database named by
//! DATABASE_URL (or the DB_* variables), and then either applies the plan or,
//! when MIGRATION_OUTPUT_DIR is set, writes it as the next migration file.

use anyhow::Context;
use pgreconcile::config::{RunMode, Settings};
use pgreconcile::{write_plan, ApplyOptions, Reconciler, WriteOptions};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting pgreconcile...");

    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");
    let reconcile = &settings.reconcile;

    let desired_sql = std::fs::read_to_string(&reconcile.schema_file)
        .with_context(|| format!("Failed to read schema file {}", reconcile.schema_file.display()))?;
    info!(
        "📄 Declared schema: {} ({} bytes, schemas: {})",
        reconcile.schema_file.display(),
        desired_sql.len(),
        reconcile.target_schemas.join(", ")
    );

    let reconciler = Reconciler::connect(&settings.database).await?;
    let plan = reconciler
        .compute_plan(&desired_sql, &reconcile.target_schemas)
        .await?;

    if plan.is_empty() {
        info!("✅ Database already matches the declared schema");
        return Ok(());
    }
    for op in &plan.operations {
        let marker = if op.destructive { " [destructive]" } else { "" };
        info!("   {}. {}{}", op.rank, op.summary(), marker);
    }
    debug!("Plan: {}", serde_json::to_string(&plan)?);

    match &reconcile.mode {
        RunMode::Apply => {
            let options = ApplyOptions {
                allow_destructive: reconcile.allow_destructive,
                zero_downtime: reconcile.zero_downtime,
                timeout: reconcile.apply_timeout,
                lock_timeout: reconcile.lock_timeout,
            };
            match reconciler.apply_plan(&plan, &options).await {
                Ok(report) => {
                    info!(
                        "🎉 Applied {} operations in {} phase(s) at {}",
                        report.applied_count, report.phases_committed, report.applied_at
                    );
                    debug!("Report: {}", serde_json::to_string(&report)?);
                }
                Err(e) => {
                    error!("❌ Apply failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        RunMode::Write { output_dir, prefix } => {
            if plan.destructive_count() > 0 && reconcile.allow_destructive {
                warn!(
                    "⚠️  Migration contains {} destructive operations, review before running it",
                    plan.destructive_count()
                );
            }
            let options = WriteOptions {
                prefix: prefix.clone(),
                allow_destructive: reconcile.allow_destructive,
            };
            if let Some(written) = write_plan(&plan, output_dir, &options)? {
                info!("🎉 Migration {:04} written to {}", written.number, written.path.display());
            }
        }
    }

    Ok(())
}

/// Initialize tracing subscriber; LOG_FORMAT=json switches to JSON lines
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pgreconcile=debug"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}
