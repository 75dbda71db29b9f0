//! pgreconcile - declarative PostgreSQL schema reconciliation
//!
//! Compares a declared schema (plain DDL) with the live catalog of a
//! PostgreSQL database, and produces an ordered, safety-classified plan of
//! DDL statements that brings the database in line. The plan can be applied
//! directly, optionally in expand/backfill/contract phases, or written to a
//! numbered migration file.

pub mod config;
pub mod db;
pub mod diff;
pub mod engine;
pub mod error;
pub mod executor;
pub mod introspection;
pub mod model;
pub mod parser;
pub mod planner;
pub mod safety;
pub mod sqlgen;
pub mod writer;
pub mod zero_downtime;

pub use engine::{
    compute_schema_hash, plan_schema, write_plan, ApplyOptions, ApplyReport, MigrationPlan, Reconciler,
};
pub use error::{ReconcileError, ReconcileResult, WriteError};
pub use writer::{WriteOptions, WrittenMigration};
