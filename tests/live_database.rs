//! Round trips against a real PostgreSQL server.
//!
//! Every test returns early unless PGRECONCILE_TEST_DATABASE_URL points at a
//! disposable database. Each test works in its own freshly created schema.

use pgreconcile::config::Settings;
use pgreconcile::db::Database;
use pgreconcile::{ApplyOptions, ReconcileError, Reconciler};
use pretty_assertions::assert_eq;
use std::time::Duration;

struct Scratch {
    reconciler: Reconciler,
    schema: String,
}

impl Scratch {
    async fn open() -> Option<Self> {
        let url = std::env::var("PGRECONCILE_TEST_DATABASE_URL").ok()?;
        let settings = Settings::from_lookup(|key| match key {
            "DATABASE_URL" => Some(url.clone()),
            "SCHEMA_FILE" => Some("schema.sql".to_string()),
            _ => None,
        })
        .unwrap();
        let database = Database::connect(&settings.database).await.unwrap();
        let schema = format!("pgreconcile_test_{}", uuid::Uuid::new_v4().simple());
        database
            .pool()
            .get()
            .await
            .unwrap()
            .batch_execute(&format!("CREATE SCHEMA \"{}\"", schema))
            .await
            .unwrap();
        Some(Self {
            reconciler: Reconciler::from_database(database),
            schema,
        })
    }

    fn targets(&self) -> Vec<String> {
        vec![self.schema.clone()]
    }

    /// Plan and apply `sql`, then check nothing is left to do
    async fn converge(&self, sql: &str, options: &ApplyOptions) -> usize {
        let plan = self.reconciler.compute_plan(sql, &self.targets()).await.unwrap();
        let report = self.reconciler.apply_plan(&plan, options).await.unwrap();
        let again = self.reconciler.compute_plan(sql, &self.targets()).await.unwrap();
        assert_eq!(again.summaries(), Vec::<String>::new());
        report.applied_count
    }

    async fn execute(&self, sql: &str) {
        let client = self.reconciler.database().pool().get().await.unwrap();
        client.batch_execute(sql).await.unwrap();
    }

    async fn close(self) {
        let client = self.reconciler.database().pool().get().await.unwrap();
        client
            .batch_execute(&format!("DROP SCHEMA \"{}\" CASCADE", self.schema))
            .await
            .unwrap();
    }
}

const INITIAL: &str = "
CREATE TABLE users (
    id bigserial PRIMARY KEY,
    email text NOT NULL UNIQUE,
    created_at timestamptz NOT NULL DEFAULT now()
);
CREATE TABLE posts (
    id bigserial PRIMARY KEY,
    author_id bigint NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    title varchar(200) NOT NULL,
    body text
);
CREATE INDEX posts_author_idx ON posts (author_id);
CREATE VIEW post_titles AS SELECT id, title FROM posts;
";

#[tokio::test]
async fn test_create_then_reconcile_is_idempotent() {
    let Some(scratch) = Scratch::open().await else { return };
    let applied = scratch.converge(INITIAL, &ApplyOptions::default()).await;
    assert!(applied >= 4);
    scratch.close().await;
}

#[tokio::test]
async fn test_additive_change_round_trips() {
    let Some(scratch) = Scratch::open().await else { return };
    scratch.converge(INITIAL, &ApplyOptions::default()).await;

    let evolved = INITIAL.replace("    body text\n", "    body text,\n    published boolean NOT NULL DEFAULT false\n");
    let applied = scratch.converge(&evolved, &ApplyOptions::default()).await;
    assert_eq!(applied, 1);
    scratch.close().await;
}

#[tokio::test]
async fn test_destructive_change_is_gated() {
    let Some(scratch) = Scratch::open().await else { return };
    scratch.converge(INITIAL, &ApplyOptions::default()).await;

    let without_body = INITIAL.replace(",\n    body text\n", "\n");
    let plan = scratch.reconciler.compute_plan(&without_body, &scratch.targets()).await.unwrap();
    let err = scratch
        .reconciler
        .apply_plan(&plan, &ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::DestructiveOperationBlocked { .. }));

    let options = ApplyOptions {
        allow_destructive: true,
        ..ApplyOptions::default()
    };
    assert_eq!(scratch.converge(&without_body, &options).await, 1);
    scratch.close().await;
}

#[tokio::test]
async fn test_zero_downtime_type_change() {
    let Some(scratch) = Scratch::open().await else { return };
    let before = "CREATE TABLE accounts (id int PRIMARY KEY, balance bigint NOT NULL DEFAULT 0);";
    scratch.converge(before, &ApplyOptions::default()).await;
    scratch
        .reconciler
        .database()
        .pool()
        .get()
        .await
        .unwrap()
        .batch_execute(&format!(
            "INSERT INTO \"{}\".accounts (id, balance) VALUES (1, 10), (2, 20)",
            scratch.schema
        ))
        .await
        .unwrap();

    let after = "CREATE TABLE accounts (id int PRIMARY KEY, balance integer NOT NULL DEFAULT 0);";
    let options = ApplyOptions {
        zero_downtime: true,
        allow_destructive: true,
        ..ApplyOptions::default()
    };
    scratch.converge(after, &options).await;

    let client = scratch.reconciler.database().pool().get().await.unwrap();
    let total: i64 = client
        .query_one(
            &format!("SELECT sum(balance)::bigint FROM \"{}\".accounts", scratch.schema),
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(total, 30);
    drop(client);
    scratch.close().await;
}

#[tokio::test]
async fn test_failed_contract_phase_keeps_expand() {
    let Some(scratch) = Scratch::open().await else { return };
    scratch
        .converge("CREATE TABLE tags (id int PRIMARY KEY);", &ApplyOptions::default())
        .await;
    scratch
        .execute(&format!("INSERT INTO \"{}\".tags (id) VALUES (1), (2)", scratch.schema))
        .await;

    // Existing rows leave the new column NULL, so SET NOT NULL fails in the contract phase
    let after = "CREATE TABLE tags (id int PRIMARY KEY, code text NOT NULL);";
    let plan = scratch.reconciler.compute_plan(after, &scratch.targets()).await.unwrap();
    let options = ApplyOptions {
        zero_downtime: true,
        allow_destructive: true,
        ..ApplyOptions::default()
    };
    let err = scratch.reconciler.apply_plan(&plan, &options).await.unwrap_err();
    match err {
        ReconcileError::Execution { phase, statement, .. } => {
            assert_eq!(phase, 2);
            assert!(statement.unwrap_or_default().contains("SET NOT NULL"));
        }
        other => panic!("expected execution error, got {:?}", other),
    }

    let client = scratch.reconciler.database().pool().get().await.unwrap();
    let nullable: String = client
        .query_one(
            "SELECT is_nullable::text FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = 'tags' AND column_name = 'code'",
            &[&scratch.schema],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(nullable, "YES");
    drop(client);
    scratch.close().await;
}

#[tokio::test]
async fn test_apply_timeout_cancels_and_rolls_back() {
    let Some(scratch) = Scratch::open().await else { return };
    let before = "CREATE TABLE accounts (id int PRIMARY KEY);";
    scratch.converge(before, &ApplyOptions::default()).await;

    let after = "CREATE TABLE accounts (id int PRIMARY KEY, note text);";
    let plan = scratch.reconciler.compute_plan(after, &scratch.targets()).await.unwrap();

    // Another session holds the table so the ALTER waits past the deadline
    let mut locker = scratch.reconciler.database().pool().get().await.unwrap();
    let lock = locker.transaction().await.unwrap();
    lock.batch_execute(&format!(
        "LOCK TABLE \"{}\".accounts IN ACCESS EXCLUSIVE MODE",
        scratch.schema
    ))
    .await
    .unwrap();

    let options = ApplyOptions {
        timeout: Some(Duration::from_secs(1)),
        ..ApplyOptions::default()
    };
    let err = scratch.reconciler.apply_plan(&plan, &options).await.unwrap_err();
    match err {
        ReconcileError::Execution { phase, rank, message, .. } => {
            assert_eq!(phase, 1);
            assert_eq!(rank, Some(1));
            assert!(message.contains("cancelled"), "{}", message);
        }
        other => panic!("expected execution error, got {:?}", other),
    }

    lock.rollback().await.unwrap();
    drop(locker);

    let again = scratch.reconciler.compute_plan(after, &scratch.targets()).await.unwrap();
    assert_eq!(
        again.summaries(),
        vec![format!("add column {}.accounts.note", scratch.schema)]
    );
    scratch.close().await;
}
