//! Declared schema parser
//!
//! Splits SQL DDL text into statements, parses each with the nom grammar in
//! [`grammar`] and folds the results into a desired [`SchemaGraph`]. Nothing
//! here talks to a database.

pub mod builder;
pub mod grammar;

use crate::error::{parse_error, ReconcileError, ReconcileResult};
use crate::model::SchemaGraph;
use builder::{GraphBuilder, Position};
use nom::error::{VerboseError, VerboseErrorKind};
use tracing::debug;

/// One statement's text and its byte offset in the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk<'a> {
    offset: usize,
    text: &'a str,
}

/// Split on top-level semicolons, respecting literals, quoted identifiers,
/// dollar quoting and comments
fn split_statements(text: &str) -> Vec<Chunk<'_>> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < len {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < len {
                    if bytes[i] == quote {
                        if i + 1 < len && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'-' if i + 1 < len && bytes[i + 1] == b'-' => {
                while i < len && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if i + 1 < len && bytes[i + 1] == b'*' => {
                i = match text[i + 2..].find("*/") {
                    Some(end) => i + 2 + end + 2,
                    None => len,
                };
            }
            b'$' => {
                let tag_end = bytes[i + 1..]
                    .iter()
                    .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
                    .map(|p| i + 1 + p);
                match tag_end {
                    Some(end) if bytes[end] == b'$' => {
                        let tag = &text[i..=end];
                        i = match text[end + 1..].find(tag) {
                            Some(close) => end + 1 + close + tag.len(),
                            None => len,
                        };
                    }
                    _ => i += 1,
                }
            }
            b';' => {
                chunks.push(Chunk {
                    offset: start,
                    text: &text[start..i],
                });
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    if start < len {
        chunks.push(Chunk {
            offset: start,
            text: &text[start..],
        });
    }
    chunks
}

fn position_of(text: &str, offset: usize) -> Position {
    let before = &text[..offset.min(text.len())];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |p| p + 1);
    Position {
        line,
        column: before[line_start..].chars().count() + 1,
    }
}

fn snippet(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    let mut snippet: String = first_line.chars().take(40).collect();
    if first_line.chars().count() > 40 {
        snippet.push_str("...");
    }
    snippet
}

/// Turn a nom failure into a positioned parse error
fn describe_failure(source: &str, chunk: &Chunk<'_>, error: &VerboseError<&str>) -> ReconcileError {
    let Some((remaining, kind)) = error.errors.first() else {
        return located_error(source, chunk.offset, "syntax error".to_string());
    };
    let context = error.errors.iter().find_map(|(_, k)| match k {
        VerboseErrorKind::Context(c) => Some(*c),
        _ => None,
    });
    let expected = match kind {
        VerboseErrorKind::Char(c) => format!("expected '{}'", c),
        VerboseErrorKind::Context(c) => c.to_string(),
        VerboseErrorKind::Nom(_) => "syntax error".to_string(),
    };
    let message = match (kind, context) {
        (VerboseErrorKind::Context(_), _) | (_, None) => expected,
        (_, Some(context)) => format!("{} ({})", expected, context),
    };
    let message = if remaining.trim().is_empty() {
        format!("{} at end of statement", message)
    } else {
        format!("{} near `{}`", message, snippet(remaining))
    };
    let offset = chunk.offset + (chunk.text.len() - remaining.len());
    located_error(source, offset, message)
}

fn located_error(source: &str, offset: usize, message: String) -> ReconcileError {
    let at = position_of(source, offset);
    parse_error(at.line, at.column, message)
}

fn parse_into(text: &str, mut builder: GraphBuilder<'_>) -> ReconcileResult<SchemaGraph> {
    let mut count = 0;
    for chunk in split_statements(text) {
        let body = match grammar::ws0(chunk.text) {
            Ok((rest, _)) => rest,
            Err(_) => chunk.text,
        };
        if body.trim().is_empty() {
            continue;
        }
        let start = chunk.offset + (chunk.text.len() - body.len());
        let at = position_of(text, start);

        let statement = match grammar::statement(body) {
            Ok((rest, statement)) => {
                let rest = grammar::ws0(rest).map_or(rest, |(r, _)| r);
                if !rest.trim().is_empty() {
                    let offset = chunk.offset + (chunk.text.len() - rest.len());
                    return Err(located_error(
                        text,
                        offset,
                        format!("unexpected input `{}`", snippet(rest)),
                    ));
                }
                statement
            }
            Err(nom::Err::Failure(e)) => return Err(describe_failure(text, &chunk, &e)),
            Err(nom::Err::Error(_)) => {
                return Err(at_error(at, format!("unsupported or malformed statement `{}`", snippet(body))));
            }
            Err(nom::Err::Incomplete(_)) => {
                return Err(at_error(at, "incomplete statement".to_string()));
            }
        };
        builder.apply(statement, at)?;
        count += 1;
    }
    let graph = builder.finish()?;
    debug!("Parsed {} statements into {} schema objects", count, graph.len());
    Ok(graph)
}

fn at_error(at: Position, message: String) -> ReconcileError {
    parse_error(at.line, at.column, message)
}

/// Parse declared DDL; unqualified names land in `default_schema`
pub fn parse_schema(text: &str, default_schema: &str) -> ReconcileResult<SchemaGraph> {
    parse_into(text, GraphBuilder::new(default_schema, None))
}

/// Parse declared DDL, rejecting objects defined outside `target_schemas`.
/// The first target schema is the default for unqualified names.
pub fn parse_schema_in(text: &str, target_schemas: &[String]) -> ReconcileResult<SchemaGraph> {
    let default_schema = target_schemas.first().map(String::as_str).unwrap_or("public");
    parse_into(text, GraphBuilder::new(default_schema, Some(target_schemas)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CanonicalName, ConstraintDef, IdentityKind, ObjectKind, ReferentialAction, SchemaObject};
    use pretty_assertions::assert_eq;

    fn parse_err(sql: &str) -> (usize, usize, String) {
        match parse_schema(sql, "public") {
            Err(ReconcileError::Parse { line, column, message }) => (line, column, message),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_split_statements_respects_quoting() {
        let sql = "CREATE TABLE a (x text DEFAULT ';');\n-- comment; here\nCREATE VIEW v AS SELECT $$;$$ AS s;";
        let chunks = split_statements(sql);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.ends_with("DEFAULT ';')"));
        assert!(chunks[1].text.trim_start().starts_with("-- comment; here\nCREATE VIEW"));
        assert!(chunks[1].text.ends_with("$$;$$ AS s"));
    }

    #[test]
    fn test_users_table() {
        let graph = parse_schema("CREATE TABLE users (id bigint PRIMARY KEY, email text NOT NULL);", "public").unwrap();
        let users = CanonicalName::relation("public", "users");
        assert!(graph.table(&users).is_some());

        let id = graph.column(&users.column_of("id")).unwrap();
        assert_eq!(id.data_type, "bigint");
        assert!(!id.nullable);

        let pk = graph.primary_key_of(&users).unwrap();
        assert_eq!(pk.name, CanonicalName::constraint("public", "users", "users_pkey"));
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_serial_expands_to_sequence_and_default() {
        let graph = parse_schema("create table Orders (ID serial primary key, note varchar(20));", "app").unwrap();
        let column = CanonicalName::column("app", "orders", "id");
        let id = graph.column(&column).unwrap();
        assert_eq!(id.data_type, "integer");
        assert_eq!(id.default.as_deref(), Some("nextval('app.orders_id_seq'::regclass)"));
        assert!(!id.nullable);

        let seq = graph.serial_sequence_of(&column).unwrap();
        assert_eq!(seq.name, CanonicalName::relation("app", "orders_id_seq"));
        assert_eq!(seq.max_value, i32::MAX as i64);
        assert_eq!(
            graph.column(&CanonicalName::column("app", "orders", "note")).unwrap().data_type,
            "character varying(20)"
        );
    }

    #[test]
    fn test_default_constraint_names() {
        let graph = parse_schema(
            "CREATE TABLE users (id int PRIMARY KEY);
             CREATE TABLE orders (
                id int,
                user_id int REFERENCES users,
                total numeric CHECK (total >= 0),
                a int, b int,
                UNIQUE (a, b),
                CHECK (a < b)
             );
             CREATE INDEX ON orders (user_id);",
            "public",
        )
        .unwrap();
        let names: Vec<String> = graph
            .objects()
            .filter(|o| matches!(o.kind(), ObjectKind::Constraint | ObjectKind::Index))
            .map(|o| o.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "public.orders.orders_a_b_key",
                "public.orders.orders_check",
                "public.orders.orders_total_check",
                "public.orders.orders_user_id_fkey",
                "public.orders_user_id_idx",
                "public.users.users_pkey",
            ]
        );

        let fk = CanonicalName::constraint("public", "orders", "orders_user_id_fkey");
        let Some(SchemaObject::Constraint(c)) = graph.get(&fk) else {
            panic!("missing foreign key");
        };
        let fk = c.foreign_key().unwrap();
        assert_eq!(fk.referenced_columns, vec!["id".to_string()]);
        assert_eq!(fk.on_delete, ReferentialAction::NoAction);
    }

    #[test]
    fn test_alter_table_and_sequence_statements() {
        let graph = parse_schema(
            "CREATE TABLE t (id bigint GENERATED BY DEFAULT AS IDENTITY, code int);
             CREATE SEQUENCE code_seq AS integer START 10;
             ALTER SEQUENCE code_seq OWNED BY t.code;
             ALTER TABLE t ADD CONSTRAINT t_code_positive CHECK (code > 0);",
            "public",
        )
        .unwrap();
        let id = graph.column(&CanonicalName::column("public", "t", "id")).unwrap();
        assert_eq!(id.identity, Some(IdentityKind::ByDefault));
        assert!(!id.nullable);

        let seq = graph.sequence(&CanonicalName::relation("public", "code_seq")).unwrap();
        assert_eq!(seq.start, 10);
        assert_eq!(seq.owned_by, Some(CanonicalName::column("public", "t", "code")));
        assert!(!seq.implicit);

        let check = graph.get(&CanonicalName::constraint("public", "t", "t_code_positive"));
        assert!(matches!(
            check,
            Some(SchemaObject::Constraint(c)) if c.definition == ConstraintDef::Check { expression: "code > 0".into() }
        ));
    }

    #[test]
    fn test_quoted_identifiers_keep_case() {
        let graph = parse_schema("CREATE TABLE \"Accounts\" (\"OwnerId\" int);", "public").unwrap();
        assert!(graph.column(&CanonicalName::column("public", "Accounts", "OwnerId")).is_some());
    }

    #[test]
    fn test_view_references_are_recorded() {
        let graph = parse_schema(
            "CREATE TABLE users (id int, active boolean);
             CREATE VIEW active_users AS SELECT id FROM users WHERE active;",
            "public",
        )
        .unwrap();
        let deps = graph.dependencies(&CanonicalName::relation("public", "active_users"));
        assert!(deps.contains(&CanonicalName::relation("public", "users")));
    }

    #[test]
    fn test_star_view_is_rejected() {
        let (line, _, message) = parse_err(
            "CREATE TABLE users (id int, email text);\nCREATE VIEW everyone AS SELECT * FROM users;",
        );
        assert_eq!(line, 2);
        assert!(message.contains("selects '*'"), "{}", message);

        let graph = parse_schema(
            "CREATE TABLE users (id int);\nCREATE VIEW user_count AS SELECT count(*) AS n FROM users;",
            "public",
        );
        assert!(graph.is_ok());
    }

    #[test]
    fn test_duplicate_definition_is_rejected() {
        let (line, _, message) = parse_err("CREATE TABLE a (x int);\nCREATE VIEW a AS SELECT 1;");
        assert_eq!(line, 2);
        assert!(message.contains("duplicate definition of public.a"));
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let (line, column, message) = parse_err("CREATE TABLE a (x int);\nCREATE TABLE b (y int DEFAULT);");
        assert_eq!(line, 2);
        assert!(column > 1);
        assert!(message.contains("default expression"), "{}", message);
    }

    #[test]
    fn test_unsupported_statements_are_rejected() {
        let (_, _, message) = parse_err("CREATE FUNCTION f() RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql;");
        assert!(message.contains("unsupported"));

        let (_, _, message) = parse_err("CREATE TABLE t (a int, b int GENERATED ALWAYS AS (a + 1) STORED);");
        assert!(message.contains("generated columns are not supported"));

        let (_, _, message) = parse_err("CREATE MATERIALIZED VIEW m AS SELECT 1;");
        assert!(message.contains("materialized views"));
    }

    #[test]
    fn test_undeclared_table_is_rejected() {
        let (_, _, message) = parse_err("CREATE INDEX idx ON missing (a);");
        assert!(message.contains("public.missing is not declared"));
    }

    #[test]
    fn test_target_schema_enforced() {
        let targets = vec!["public".to_string()];
        let err = parse_schema_in("CREATE SCHEMA billing;\nCREATE TABLE billing.invoices (id int);", &targets).unwrap_err();
        match err {
            ReconcileError::Parse { line, message, .. } => {
                assert_eq!(line, 2);
                assert!(message.contains("outside the target schemas"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_blank_and_comment_only_input() {
        let graph = parse_schema("-- nothing here\n/* still nothing */;\n", "public").unwrap();
        assert!(graph.is_empty());
    }
}
