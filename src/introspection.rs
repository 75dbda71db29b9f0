//! Schema Introspection Module
//!
//! Reads the live schema of the target schemas out of `pg_catalog` and
//! reduces it to the same [`SchemaGraph`] the parser produces. Every query
//! runs inside one REPEATABLE READ READ ONLY transaction so the snapshot is
//! coherent even while other sessions run DDL.

use crate::error::{introspection_error, sanitize_db_error, ReconcileError, ReconcileResult};
use crate::model::{
    CanonicalName, Column, Constraint, ConstraintDef, ForeignKey, IdentityKind, Index,
    ReferentialAction, SchemaGraph, SchemaObject, Sequence, Table, View,
};
use crate::sqlgen::set_search_path;
use deadpool_postgres::{Pool, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use tokio_postgres::IsolationLevel;
use tracing::{debug, info};

/// Relations installed by an extension are not ours to manage
const NOT_EXTENSION_MEMBER: &str = "NOT EXISTS (
    SELECT 1 FROM pg_depend e
    WHERE e.classid = 'pg_class'::regclass AND e.objid = c.oid AND e.deptype = 'e')";

fn query_error(error: tokio_postgres::Error) -> ReconcileError {
    introspection_error(format!("Catalog query failed: {}", sanitize_db_error(&error)))
}

fn insert(graph: &mut SchemaGraph, object: SchemaObject) -> ReconcileResult<()> {
    graph
        .insert(object)
        .map_err(|name| introspection_error(format!("Catalog returned {} twice", name)))
}

/// Decode `pg_attribute.attidentity`
fn decode_identity(code: &str) -> Option<IdentityKind> {
    match code {
        "a" => Some(IdentityKind::Always),
        "d" => Some(IdentityKind::ByDefault),
        _ => None,
    }
}

fn decode_action(code: &str, constraint: &CanonicalName) -> ReconcileResult<ReferentialAction> {
    ReferentialAction::from_catalog(code).ok_or_else(|| {
        introspection_error(format!("Unknown referential action '{}' on {}", code, constraint))
    })
}

/// `pg_get_viewdef` output without its trailing semicolon
fn trim_view_definition(definition: &str) -> String {
    definition.trim().trim_end_matches(';').trim_end().to_string()
}

fn unsupported_relkind(relkind: &str) -> Option<&'static str> {
    match relkind {
        "p" => Some("partitioned table"),
        "m" => Some("materialized view"),
        "f" => Some("foreign table"),
        _ => None,
    }
}

/// Schema introspector for PostgreSQL
pub struct PostgresIntrospector;

impl PostgresIntrospector {
    /// Introspect the target schemas into a live schema graph
    pub async fn introspect(pool: &Pool, target_schemas: &[String]) -> ReconcileResult<SchemaGraph> {
        let mut client = pool.get().await.map_err(|e| {
            introspection_error(format!("Failed to get connection: {}", sanitize_db_error(&e)))
        })?;

        let transaction = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await
            .map_err(query_error)?;
        // Catalog text (defaults, view bodies) qualifies names against the session search_path
        transaction
            .batch_execute(&set_search_path(target_schemas))
            .await
            .map_err(query_error)?;

        let schemas: Vec<String> = target_schemas.to_vec();
        let mut graph = SchemaGraph::new();

        Self::load_relations(&transaction, &schemas, &mut graph).await?;
        Self::load_columns(&transaction, &schemas, &mut graph).await?;
        Self::load_constraints(&transaction, &schemas, &mut graph).await?;
        Self::load_indexes(&transaction, &schemas, &mut graph).await?;
        Self::load_sequences(&transaction, &schemas, &mut graph).await?;
        Self::load_views(&transaction, &schemas, &mut graph).await?;

        transaction.commit().await.map_err(query_error)?;

        graph.mark_implicit_sequences();

        info!(
            "🔎 Introspected {} objects in schemas [{}]",
            graph.len(),
            target_schemas.join(", ")
        );
        Ok(graph)
    }

    /// Tables; rejects relation kinds the engine cannot manage
    async fn load_relations(
        transaction: &Transaction<'_>,
        schemas: &[String],
        graph: &mut SchemaGraph,
    ) -> ReconcileResult<()> {
        let query = format!(
            r#"
            SELECT
                n.nspname::text AS schema_name,
                c.relname::text AS relation_name,
                c.relkind::text AS relkind
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname::text = ANY($1::text[])
              AND c.relkind IN ('r', 'p', 'm', 'f')
              AND {}
            ORDER BY 1, 2
        "#,
            NOT_EXTENSION_MEMBER
        );

        let rows = transaction.query(query.as_str(), &[&schemas]).await.map_err(query_error)?;

        for row in rows {
            let schema: String = row.get("schema_name");
            let name: String = row.get("relation_name");
            let relkind: String = row.get("relkind");

            if let Some(kind) = unsupported_relkind(&relkind) {
                return Err(introspection_error(format!(
                    "{}.{} is a {}, which is not supported",
                    schema, name, kind
                )));
            }
            insert(graph, SchemaObject::Table(Table { name: CanonicalName::relation(schema, name) }))?;
        }
        Ok(())
    }

    async fn load_columns(
        transaction: &Transaction<'_>,
        schemas: &[String],
        graph: &mut SchemaGraph,
    ) -> ReconcileResult<()> {
        let query = format!(
            r#"
            SELECT
                n.nspname::text AS schema_name,
                c.relname::text AS table_name,
                a.attname::text AS column_name,
                format_type(a.atttypid, a.atttypmod) AS data_type,
                a.attnotnull AS not_null,
                pg_get_expr(ad.adbin, ad.adrelid) AS default_expr,
                a.attidentity::text AS identity,
                a.attgenerated::text AS generated,
                a.attnum::bigint AS position
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_attrdef ad ON ad.adrelid = a.attrelid AND ad.adnum = a.attnum
            WHERE n.nspname::text = ANY($1::text[])
              AND c.relkind = 'r'
              AND a.attnum > 0
              AND NOT a.attisdropped
              AND {}
            ORDER BY 1, 2, a.attnum
        "#,
            NOT_EXTENSION_MEMBER
        );

        let rows = transaction.query(query.as_str(), &[&schemas]).await.map_err(query_error)?;

        for row in rows {
            let schema: String = row.get("schema_name");
            let table: String = row.get("table_name");
            let name = CanonicalName::column(schema, table, row.get::<_, String>("column_name"));

            let generated: String = row.get("generated");
            if generated == "s" {
                return Err(introspection_error(format!(
                    "{} is a generated stored column, which is not supported",
                    name
                )));
            }

            let position: i64 = row.get("position");
            let identity: String = row.get("identity");
            insert(
                graph,
                SchemaObject::Column(Column {
                    name,
                    data_type: row.get("data_type"),
                    nullable: !row.get::<_, bool>("not_null"),
                    default: row.get("default_expr"),
                    identity: decode_identity(&identity),
                    position: usize::try_from(position).unwrap_or_default(),
                }),
            )?;
        }
        Ok(())
    }

    async fn load_constraints(
        transaction: &Transaction<'_>,
        schemas: &[String],
        graph: &mut SchemaGraph,
    ) -> ReconcileResult<()> {
        let query = format!(
            r#"
            SELECT
                n.nspname::text AS schema_name,
                c.relname::text AS table_name,
                con.conname::text AS constraint_name,
                con.contype::text AS contype,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ) AS columns,
                fn.nspname::text AS ref_schema,
                fc.relname::text AS ref_table,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ) AS ref_columns,
                con.confdeltype::text AS on_delete,
                con.confupdtype::text AS on_update,
                con.condeferrable AS is_deferrable,
                con.condeferred AS is_deferred,
                CASE WHEN con.contype = 'c' THEN pg_get_expr(con.conbin, con.conrelid) END AS check_expr
            FROM pg_constraint con
            JOIN pg_class c ON c.oid = con.conrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_class fc ON fc.oid = con.confrelid
            LEFT JOIN pg_namespace fn ON fn.oid = fc.relnamespace
            WHERE n.nspname::text = ANY($1::text[])
              AND c.relkind = 'r'
              AND con.contype <> 'n'
              AND {}
            ORDER BY 1, 2, 3
        "#,
            NOT_EXTENSION_MEMBER
        );

        let rows = transaction.query(query.as_str(), &[&schemas]).await.map_err(query_error)?;

        for row in rows {
            let schema: String = row.get("schema_name");
            let table: String = row.get("table_name");
            let name = CanonicalName::constraint(schema, table, row.get::<_, String>("constraint_name"));
            let contype: String = row.get("contype");
            let columns: Vec<String> = row.get("columns");

            let definition = match contype.as_str() {
                "p" => ConstraintDef::PrimaryKey { columns },
                "u" => ConstraintDef::Unique { columns },
                "c" => ConstraintDef::Check {
                    expression: row.get::<_, Option<String>>("check_expr").unwrap_or_default(),
                },
                "f" => {
                    let ref_schema: Option<String> = row.get("ref_schema");
                    let ref_table: Option<String> = row.get("ref_table");
                    let (Some(ref_schema), Some(ref_table)) = (ref_schema, ref_table) else {
                        return Err(introspection_error(format!(
                            "Foreign key {} has no referenced table",
                            name
                        )));
                    };
                    ConstraintDef::ForeignKey(ForeignKey {
                        columns,
                        referenced_table: CanonicalName::relation(ref_schema, ref_table),
                        referenced_columns: row.get("ref_columns"),
                        on_delete: decode_action(&row.get::<_, String>("on_delete"), &name)?,
                        on_update: decode_action(&row.get::<_, String>("on_update"), &name)?,
                        deferrable: row.get("is_deferrable"),
                        initially_deferred: row.get("is_deferred"),
                    })
                }
                "x" => {
                    return Err(introspection_error(format!(
                        "{} is an exclusion constraint, which is not supported",
                        name
                    )))
                }
                "t" => {
                    return Err(introspection_error(format!(
                        "{} is a constraint trigger, which is not supported",
                        name
                    )))
                }
                other => {
                    return Err(introspection_error(format!(
                        "{} has unknown constraint type '{}'",
                        name, other
                    )))
                }
            };
            insert(graph, SchemaObject::Constraint(Constraint { name, definition }))?;
        }
        Ok(())
    }

    /// Standalone indexes; those backing a primary key, unique or exclusion
    /// constraint belong to the constraint
    async fn load_indexes(
        transaction: &Transaction<'_>,
        schemas: &[String],
        graph: &mut SchemaGraph,
    ) -> ReconcileResult<()> {
        let query = r#"
            SELECT
                n.nspname::text AS schema_name,
                ic.relname::text AS index_name,
                c.relname::text AS table_name,
                ix.indisunique AS is_unique,
                am.amname::text AS method,
                ARRAY(
                    SELECT pg_get_indexdef(ix.indexrelid, k, true)
                    FROM generate_series(1, ix.indnkeyatts::int) AS k
                    ORDER BY k
                ) AS keys,
                pg_get_expr(ix.indpred, ix.indrelid) AS predicate
            FROM pg_index ix
            JOIN pg_class ic ON ic.oid = ix.indexrelid
            JOIN pg_class c ON c.oid = ix.indrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_am am ON am.oid = ic.relam
            WHERE n.nspname::text = ANY($1::text[])
              AND c.relkind = 'r'
              AND NOT EXISTS (
                  SELECT 1 FROM pg_constraint con
                  WHERE con.conindid = ix.indexrelid
                    AND con.conrelid = ix.indrelid
                    AND con.contype IN ('p', 'u', 'x'))
              AND NOT EXISTS (
                  SELECT 1 FROM pg_depend e
                  WHERE e.classid = 'pg_class'::regclass AND e.objid = ic.oid AND e.deptype = 'e')
            ORDER BY 1, 2
        "#;

        let rows = transaction.query(query, &[&schemas]).await.map_err(query_error)?;

        for row in rows {
            let schema: String = row.get("schema_name");
            let table = CanonicalName::relation(schema.clone(), row.get::<_, String>("table_name"));
            insert(
                graph,
                SchemaObject::Index(Index {
                    name: CanonicalName::relation(schema, row.get::<_, String>("index_name")),
                    table,
                    unique: row.get("is_unique"),
                    method: row.get("method"),
                    keys: row.get("keys"),
                    predicate: row.get("predicate"),
                }),
            )?;
        }
        Ok(())
    }

    /// Sequences with their `OWNED BY` column; identity-backing sequences are
    /// part of their column and skipped
    async fn load_sequences(
        transaction: &Transaction<'_>,
        schemas: &[String],
        graph: &mut SchemaGraph,
    ) -> ReconcileResult<()> {
        let query = format!(
            r#"
            SELECT
                n.nspname::text AS schema_name,
                c.relname::text AS sequence_name,
                format_type(s.seqtypid, NULL) AS data_type,
                s.seqstart AS start_value,
                s.seqincrement AS increment_by,
                s.seqmin AS min_value,
                s.seqmax AS max_value,
                s.seqcache AS cache_size,
                s.seqcycle AS is_cycle,
                d.deptype::text AS dep_type,
                own.nspname::text AS owner_schema,
                oc.relname::text AS owner_table,
                oa.attname::text AS owner_column
            FROM pg_sequence s
            JOIN pg_class c ON c.oid = s.seqrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_depend d
                ON d.classid = 'pg_class'::regclass
               AND d.objid = c.oid
               AND d.refclassid = 'pg_class'::regclass
               AND d.refobjsubid > 0
               AND d.deptype IN ('a', 'i')
            LEFT JOIN pg_class oc ON oc.oid = d.refobjid
            LEFT JOIN pg_namespace own ON own.oid = oc.relnamespace
            LEFT JOIN pg_attribute oa ON oa.attrelid = d.refobjid AND oa.attnum = d.refobjsubid
            WHERE n.nspname::text = ANY($1::text[])
              AND {}
            ORDER BY 1, 2
        "#,
            NOT_EXTENSION_MEMBER
        );

        let rows = transaction.query(query.as_str(), &[&schemas]).await.map_err(query_error)?;

        for row in rows {
            let dep_type: Option<String> = row.get("dep_type");
            if dep_type.as_deref() == Some("i") {
                continue;
            }

            let owner_schema: Option<String> = row.get("owner_schema");
            let owner_table: Option<String> = row.get("owner_table");
            let owner_column: Option<String> = row.get("owner_column");
            let owned_by = match (owner_schema, owner_table, owner_column) {
                (Some(schema), Some(table), Some(column)) => Some(CanonicalName::column(schema, table, column)),
                _ => None,
            };

            insert(
                graph,
                SchemaObject::Sequence(Sequence {
                    name: CanonicalName::relation(
                        row.get::<_, String>("schema_name"),
                        row.get::<_, String>("sequence_name"),
                    ),
                    data_type: row.get("data_type"),
                    start: row.get("start_value"),
                    increment: row.get("increment_by"),
                    min_value: row.get("min_value"),
                    max_value: row.get("max_value"),
                    cache: row.get("cache_size"),
                    cycle: row.get("is_cycle"),
                    owned_by,
                    implicit: false,
                }),
            )?;
        }
        Ok(())
    }

    async fn load_views(
        transaction: &Transaction<'_>,
        schemas: &[String],
        graph: &mut SchemaGraph,
    ) -> ReconcileResult<()> {
        let dependency_query = r#"
            SELECT DISTINCT
                vn.nspname::text AS view_schema,
                v.relname::text AS view_name,
                rn.nspname::text AS ref_schema,
                rc.relname::text AS ref_name
            FROM pg_rewrite r
            JOIN pg_class v ON v.oid = r.ev_class
            JOIN pg_namespace vn ON vn.oid = v.relnamespace
            JOIN pg_depend d
                ON d.classid = 'pg_rewrite'::regclass
               AND d.objid = r.oid
               AND d.refclassid = 'pg_class'::regclass
            JOIN pg_class rc ON rc.oid = d.refobjid
            JOIN pg_namespace rn ON rn.oid = rc.relnamespace
            WHERE v.relkind = 'v'
              AND vn.nspname::text = ANY($1::text[])
              AND rc.oid <> v.oid
        "#;

        let mut references: BTreeMap<CanonicalName, BTreeSet<CanonicalName>> = BTreeMap::new();
        for row in transaction
            .query(dependency_query, &[&schemas])
            .await
            .map_err(query_error)?
        {
            let view = CanonicalName::relation(
                row.get::<_, String>("view_schema"),
                row.get::<_, String>("view_name"),
            );
            let target = CanonicalName::relation(
                row.get::<_, String>("ref_schema"),
                row.get::<_, String>("ref_name"),
            );
            references.entry(view).or_default().insert(target);
        }

        let query = format!(
            r#"
            SELECT
                n.nspname::text AS schema_name,
                c.relname::text AS view_name,
                pg_get_viewdef(c.oid, true) AS definition
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname::text = ANY($1::text[])
              AND c.relkind = 'v'
              AND {}
            ORDER BY 1, 2
        "#,
            NOT_EXTENSION_MEMBER
        );

        let rows = transaction.query(query.as_str(), &[&schemas]).await.map_err(query_error)?;
        let count = rows.len();

        for row in rows {
            let name = CanonicalName::relation(
                row.get::<_, String>("schema_name"),
                row.get::<_, String>("view_name"),
            );
            let definition: String = row.get("definition");
            insert(
                graph,
                SchemaObject::View(View {
                    references: references.remove(&name).unwrap_or_default(),
                    name,
                    definition: trim_view_definition(&definition),
                }),
            )?;
        }

        debug!("Loaded {} views", count);
        Ok(())
    }
}
