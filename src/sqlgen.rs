//! DDL rendering
//!
//! Every statement the planner emits is a [`Step`]. Rendering is kept apart
//! from ordering so the zero-downtime rewriter can reshape steps and
//! re-render them.

use crate::model::normalize::serial_alias;
use crate::model::{
    CanonicalName, Column, Constraint, ConstraintDef, ForeignKey, IdentityKind, Index, ReferentialAction, Sequence, View,
};
use serde::Serialize;

/// Quote an identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."relation"`
pub fn qualified(name: &CanonicalName) -> String {
    format!("{}.{}", quote_ident(&name.schema), quote_ident(&name.relation))
}

/// `SET LOCAL search_path` naming the target schemas, first one first.
///
/// Unqualified names in view bodies, defaults and check expressions then
/// resolve the way the declared schema resolved them.
pub fn set_search_path(schemas: &[String]) -> String {
    if schemas.is_empty() {
        return "SET LOCAL search_path = pg_catalog".to_string();
    }
    let list = schemas.iter().map(|s| quote_ident(s)).collect::<Vec<_>>().join(", ");
    format!("SET LOCAL search_path = {}", list)
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

/// Column definition as it appears in `CREATE TABLE` and `ADD COLUMN`.
///
/// A column backed by an implicit sequence is written with its serial alias
/// so PostgreSQL recreates the sequence and the ownership link itself.
pub fn column_definition(column: &Column, serial: bool) -> String {
    let mut sql = quote_ident(column.name.local());
    match serial_alias(&column.data_type).filter(|_| serial) {
        Some(alias) => {
            sql.push(' ');
            sql.push_str(alias);
        }
        None => {
            sql.push(' ');
            sql.push_str(&column.data_type);
            if let Some(identity) = column.identity {
                sql.push_str(&format!(" GENERATED {} AS IDENTITY", identity.as_sql()));
            }
            if let Some(default) = &column.default {
                sql.push_str(&format!(" DEFAULT {}", default));
            }
        }
    }
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    sql
}

fn foreign_key_clause(fk: &ForeignKey) -> String {
    let mut sql = format!("FOREIGN KEY ({}) REFERENCES {}", column_list(&fk.columns), qualified(&fk.referenced_table));
    if !fk.referenced_columns.is_empty() {
        sql.push_str(&format!(" ({})", column_list(&fk.referenced_columns)));
    }
    if fk.on_update != ReferentialAction::NoAction {
        sql.push_str(&format!(" ON UPDATE {}", fk.on_update.as_sql()));
    }
    if fk.on_delete != ReferentialAction::NoAction {
        sql.push_str(&format!(" ON DELETE {}", fk.on_delete.as_sql()));
    }
    if fk.deferrable {
        sql.push_str(" DEFERRABLE");
        if fk.initially_deferred {
            sql.push_str(" INITIALLY DEFERRED");
        }
    }
    sql
}

/// `CONSTRAINT "name" ...` clause
pub fn constraint_definition(constraint: &Constraint) -> String {
    let body = match &constraint.definition {
        ConstraintDef::PrimaryKey { columns } => format!("PRIMARY KEY ({})", column_list(columns)),
        ConstraintDef::Unique { columns } => format!("UNIQUE ({})", column_list(columns)),
        ConstraintDef::Check { expression } => format!("CHECK ({})", expression),
        ConstraintDef::ForeignKey(fk) => foreign_key_clause(fk),
    };
    format!("CONSTRAINT {} {}", quote_ident(constraint.name.local()), body)
}

fn sequence_options(sequence: &Sequence) -> String {
    format!(
        "AS {} INCREMENT BY {} MINVALUE {} MAXVALUE {} START WITH {} CACHE {} {}",
        sequence.data_type,
        sequence.increment,
        sequence.min_value,
        sequence.max_value,
        sequence.start,
        sequence.cache,
        if sequence.cycle { "CYCLE" } else { "NO CYCLE" }
    )
}

fn column_target(column: &CanonicalName) -> String {
    format!("{}.{}", qualified(&column.parent()), quote_ident(column.local()))
}

/// A single DDL (or backfill) statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "step")]
pub enum Step {
    CreateTable {
        table: CanonicalName,
        columns: Vec<Column>,
        /// Columns written with their serial alias
        serial_columns: Vec<String>,
        constraints: Vec<Constraint>,
    },
    DropTable { table: CanonicalName },
    AddColumn { column: Column, serial: bool },
    DropColumn { column: CanonicalName },
    RenameColumn { column: CanonicalName, new_name: String },
    AlterColumnType {
        column: CanonicalName,
        data_type: String,
        using: Option<String>,
    },
    SetDefault { column: CanonicalName, expression: String },
    DropDefault { column: CanonicalName },
    SetNotNull { column: CanonicalName },
    DropNotNull { column: CanonicalName },
    AddIdentity { column: CanonicalName, kind: IdentityKind },
    SetIdentity { column: CanonicalName, kind: IdentityKind },
    DropIdentity { column: CanonicalName },
    AddConstraint { constraint: Constraint },
    DropConstraint { constraint: CanonicalName },
    CreateIndex { index: Index },
    DropIndex { index: CanonicalName },
    CreateSequence { sequence: Sequence },
    AlterSequence { sequence: Sequence },
    SetSequenceOwner {
        sequence: CanonicalName,
        owner: Option<CanonicalName>,
    },
    DropSequence { sequence: CanonicalName },
    CreateView { view: View },
    ReplaceView { view: View },
    DropView { view: CanonicalName },
    Backfill {
        table: CanonicalName,
        target: String,
        source: String,
        data_type: String,
    },
}

impl Step {
    /// Render the statement, without a trailing semicolon
    pub fn to_sql(&self) -> String {
        match self {
            Step::CreateTable {
                table,
                columns,
                serial_columns,
                constraints,
            } => {
                let mut items: Vec<String> = columns
                    .iter()
                    .map(|c| column_definition(c, serial_columns.iter().any(|s| s == c.name.local())))
                    .collect();
                items.extend(constraints.iter().map(constraint_definition));
                if items.is_empty() {
                    format!("CREATE TABLE {} ()", qualified(table))
                } else {
                    format!("CREATE TABLE {} (\n    {}\n)", qualified(table), items.join(",\n    "))
                }
            }
            Step::DropTable { table } => format!("DROP TABLE {}", qualified(table)),
            Step::AddColumn { column, serial } => format!(
                "ALTER TABLE {} ADD COLUMN {}",
                qualified(&column.table()),
                column_definition(column, *serial)
            ),
            Step::DropColumn { column } => format!(
                "ALTER TABLE {} DROP COLUMN {}",
                qualified(&column.parent()),
                quote_ident(column.local())
            ),
            Step::RenameColumn { column, new_name } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                qualified(&column.parent()),
                quote_ident(column.local()),
                quote_ident(new_name)
            ),
            Step::AlterColumnType {
                column,
                data_type,
                using,
            } => {
                let mut sql = format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                    qualified(&column.parent()),
                    quote_ident(column.local()),
                    data_type
                );
                if let Some(using) = using {
                    sql.push_str(&format!(" USING {}", using));
                }
                sql
            }
            Step::SetDefault { column, expression } => {
                alter_column(column, &format!("SET DEFAULT {}", expression))
            }
            Step::DropDefault { column } => alter_column(column, "DROP DEFAULT"),
            Step::SetNotNull { column } => alter_column(column, "SET NOT NULL"),
            Step::DropNotNull { column } => alter_column(column, "DROP NOT NULL"),
            Step::AddIdentity { column, kind } => {
                alter_column(column, &format!("ADD GENERATED {} AS IDENTITY", kind.as_sql()))
            }
            Step::SetIdentity { column, kind } => alter_column(column, &format!("SET GENERATED {}", kind.as_sql())),
            Step::DropIdentity { column } => alter_column(column, "DROP IDENTITY"),
            Step::AddConstraint { constraint } => format!(
                "ALTER TABLE {} ADD {}",
                qualified(&constraint.table()),
                constraint_definition(constraint)
            ),
            Step::DropConstraint { constraint } => format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                qualified(&constraint.parent()),
                quote_ident(constraint.local())
            ),
            Step::CreateIndex { index } => {
                let mut sql = format!(
                    "CREATE {}INDEX {} ON {} USING {} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    quote_ident(&index.name.relation),
                    qualified(&index.table),
                    index.method,
                    index.keys.join(", ")
                );
                if let Some(predicate) = &index.predicate {
                    sql.push_str(&format!(" WHERE {}", predicate));
                }
                sql
            }
            Step::DropIndex { index } => format!("DROP INDEX {}", qualified(index)),
            Step::CreateSequence { sequence } => {
                format!("CREATE SEQUENCE {} {}", qualified(&sequence.name), sequence_options(sequence))
            }
            Step::AlterSequence { sequence } => {
                format!("ALTER SEQUENCE {} {}", qualified(&sequence.name), sequence_options(sequence))
            }
            Step::SetSequenceOwner { sequence, owner } => format!(
                "ALTER SEQUENCE {} OWNED BY {}",
                qualified(sequence),
                owner.as_ref().map(column_target).unwrap_or_else(|| "NONE".to_string())
            ),
            Step::DropSequence { sequence } => format!("DROP SEQUENCE {}", qualified(sequence)),
            Step::CreateView { view } => format!("CREATE VIEW {} AS {}", qualified(&view.name), view.definition),
            Step::ReplaceView { view } => {
                format!("CREATE OR REPLACE VIEW {} AS {}", qualified(&view.name), view.definition)
            }
            Step::DropView { view } => format!("DROP VIEW {}", qualified(view)),
            Step::Backfill {
                table,
                target,
                source,
                data_type,
            } => format!(
                "UPDATE {} SET {} = {}::{}",
                qualified(table),
                quote_ident(target),
                quote_ident(source),
                data_type
            ),
        }
    }

    /// Whether the statement removes an object or its data
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            Step::DropTable { .. }
                | Step::DropColumn { .. }
                | Step::DropConstraint { .. }
                | Step::DropIndex { .. }
                | Step::DropSequence { .. }
                | Step::DropView { .. }
        )
    }
}

fn alter_column(column: &CanonicalName, action: &str) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} {}",
        qualified(&column.parent()),
        quote_ident(column.local()),
        action
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn column(table: &str, name: &str, data_type: &str, nullable: bool, default: Option<&str>) -> Column {
        Column {
            name: CanonicalName::column("public", table, name),
            data_type: data_type.to_string(),
            nullable,
            default: default.map(str::to_string),
            identity: None,
            position: 1,
        }
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_search_path_lists_target_schemas() {
        assert_eq!(
            set_search_path(&["app".to_string(), "public".to_string()]),
            "SET LOCAL search_path = \"app\", \"public\""
        );
        assert_eq!(set_search_path(&[]), "SET LOCAL search_path = pg_catalog");
    }

    #[test]
    fn test_create_table_renders_members() {
        let table = CanonicalName::relation("public", "users");
        let step = Step::CreateTable {
            table: table.clone(),
            columns: vec![
                column("users", "id", "integer", false, Some("nextval('public.users_id_seq'::regclass)")),
                column("users", "email", "character varying(255)", false, None),
            ],
            serial_columns: vec!["id".to_string()],
            constraints: vec![Constraint {
                name: CanonicalName::constraint("public", "users", "users_pkey"),
                definition: ConstraintDef::PrimaryKey { columns: vec!["id".to_string()] },
            }],
        };
        assert_eq!(
            step.to_sql(),
            "CREATE TABLE \"public\".\"users\" (\n    \"id\" serial NOT NULL,\n    \"email\" character varying(255) NOT NULL,\n    CONSTRAINT \"users_pkey\" PRIMARY KEY (\"id\")\n)"
        );
    }

    #[test]
    fn test_foreign_key_clause_omits_defaults() {
        let constraint = Constraint {
            name: CanonicalName::constraint("public", "orders", "orders_user_id_fkey"),
            definition: ConstraintDef::ForeignKey(ForeignKey {
                columns: vec!["user_id".to_string()],
                referenced_table: CanonicalName::relation("public", "users"),
                referenced_columns: vec!["id".to_string()],
                on_delete: ReferentialAction::Cascade,
                on_update: ReferentialAction::NoAction,
                deferrable: true,
                initially_deferred: true,
            }),
        };
        assert_eq!(
            Step::AddConstraint { constraint }.to_sql(),
            "ALTER TABLE \"public\".\"orders\" ADD CONSTRAINT \"orders_user_id_fkey\" FOREIGN KEY (\"user_id\") REFERENCES \"public\".\"users\" (\"id\") ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED"
        );
    }

    #[test]
    fn test_column_alterations() {
        let email = CanonicalName::column("public", "users", "email");
        assert_eq!(
            Step::AlterColumnType {
                column: email.clone(),
                data_type: "text".to_string(),
                using: Some("\"email\"::text".to_string()),
            }
            .to_sql(),
            "ALTER TABLE \"public\".\"users\" ALTER COLUMN \"email\" TYPE text USING \"email\"::text"
        );
        assert_eq!(
            Step::SetNotNull { column: email.clone() }.to_sql(),
            "ALTER TABLE \"public\".\"users\" ALTER COLUMN \"email\" SET NOT NULL"
        );
        assert_eq!(
            Step::AddColumn { column: column("users", "age", "integer", true, Some("0")), serial: false }.to_sql(),
            "ALTER TABLE \"public\".\"users\" ADD COLUMN \"age\" integer DEFAULT 0"
        );
    }

    #[test]
    fn test_index_and_sequence_statements() {
        let index = Index {
            name: CanonicalName::relation("app", "users_email_idx"),
            table: CanonicalName::relation("app", "users"),
            unique: true,
            method: "btree".to_string(),
            keys: vec!["lower(email)".to_string()],
            predicate: Some("deleted_at IS NULL".to_string()),
        };
        assert_eq!(
            Step::CreateIndex { index }.to_sql(),
            "CREATE UNIQUE INDEX \"users_email_idx\" ON \"app\".\"users\" USING btree (lower(email)) WHERE deleted_at IS NULL"
        );

        let seq = Sequence::with_defaults(CanonicalName::relation("app", "ticket_seq"), "bigint", 1);
        assert_eq!(
            Step::CreateSequence { sequence: seq }.to_sql(),
            "CREATE SEQUENCE \"app\".\"ticket_seq\" AS bigint INCREMENT BY 1 MINVALUE 1 MAXVALUE 9223372036854775807 START WITH 1 CACHE 1 NO CYCLE"
        );
        assert_eq!(
            Step::SetSequenceOwner {
                sequence: CanonicalName::relation("app", "ticket_seq"),
                owner: Some(CanonicalName::column("app", "tickets", "id")),
            }
            .to_sql(),
            "ALTER SEQUENCE \"app\".\"ticket_seq\" OWNED BY \"app\".\"tickets\".\"id\""
        );
    }

    #[test]
    fn test_backfill_casts_source() {
        let step = Step::Backfill {
            table: CanonicalName::relation("public", "t"),
            target: "amount__new".to_string(),
            source: "amount".to_string(),
            data_type: "numeric(12,2)".to_string(),
        };
        assert_eq!(
            step.to_sql(),
            "UPDATE \"public\".\"t\" SET \"amount__new\" = \"amount\"::numeric(12,2)"
        );
    }
}
