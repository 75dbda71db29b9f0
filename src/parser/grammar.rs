//! DDL grammar
//!
//! nom combinators that turn one SQL statement into a [`Statement`] tree.
//! Names are folded here (unquoted identifiers lower-cased, quoted ones kept
//! verbatim); expressions are captured as raw text and interpreted later.

use crate::model::{IdentityKind, ReferentialAction};
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_until, take_while};
use nom::character::complete::{char, digit1, multispace1, one_of, satisfy};
use nom::combinator::{cut, map, map_res, not, opt, peek, recognize, value};
use nom::error::{context, ErrorKind, ParseError, VerboseError, VerboseErrorKind};
use nom::multi::{many0, many0_count, separated_list0, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;

pub type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub schema: Option<String>,
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    pub deferrable: bool,
    pub initially_deferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct References {
    pub table: QualifiedName,
    pub columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
    pub timing: Timing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnConstraintKind {
    NotNull,
    Null,
    Default(Option<String>),
    PrimaryKey,
    Unique,
    Check(String),
    References(References),
    Identity(IdentityKind),
    Collate,
    Timing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnConstraint {
    pub name: Option<String>,
    pub kind: ColumnConstraintKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: String,
    pub constraints: Vec<ColumnConstraint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableConstraintKind {
    PrimaryKey(Vec<String>),
    Unique(Vec<String>),
    Check(String),
    ForeignKey {
        columns: Vec<String>,
        references: References,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConstraint {
    pub name: Option<String>,
    pub kind: TableConstraintKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableElement {
    Column(ColumnDef),
    Constraint(TableConstraint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStatement {
    pub name: Option<String>,
    pub unique: bool,
    pub table: QualifiedName,
    pub method: Option<String>,
    pub keys: Vec<String>,
    pub predicate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOption {
    DataType(String),
    Increment(i64),
    MinValue(Option<i64>),
    MaxValue(Option<i64>),
    Start(i64),
    Cache(i64),
    Cycle(bool),
    OwnedBy(Option<ColumnRef>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateTable {
        name: QualifiedName,
        elements: Vec<TableElement>,
    },
    CreateIndex(IndexStatement),
    AlterTableAdd {
        table: QualifiedName,
        constraints: Vec<TableConstraint>,
    },
    CreateSequence {
        name: QualifiedName,
        options: Vec<SequenceOption>,
    },
    AlterSequenceOwner {
        name: QualifiedName,
        owner: Option<ColumnRef>,
    },
    CreateView {
        name: QualifiedName,
        query: String,
    },
    /// Accepted but defines nothing we manage (`CREATE SCHEMA`, `SET`, ...)
    Ignored,
}

pub fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn unsupported<'a, T>(input: &'a str, what: &'static str) -> PResult<'a, T> {
    Err(nom::Err::Failure(VerboseError {
        errors: vec![(input, VerboseErrorKind::Context(what))],
    }))
}

fn comment(input: &str) -> PResult<'_, &str> {
    alt((
        recognize(pair(tag("--"), take_while(|c| c != '\n'))),
        recognize(tuple((tag("/*"), take_until("*/"), tag("*/")))),
    ))(input)
}

/// Whitespace and comments
pub fn ws0(input: &str) -> PResult<'_, ()> {
    value((), many0_count(alt((multispace1, comment))))(input)
}

fn kw<'a>(word: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    preceded(
        ws0,
        terminated(tag_no_case(word), not(peek(satisfy(is_ident_char)))),
    )
}

fn sym<'a>(c: char) -> impl FnMut(&'a str) -> PResult<'a, char> {
    preceded(ws0, char(c))
}

fn quoted_identifier(input: &str) -> PResult<'_, String> {
    let (mut rest, _) = char('"')(input)?;
    let mut name = String::new();
    loop {
        let Some(end) = rest.find('"') else {
            return unsupported(rest, "unterminated quoted identifier");
        };
        name.push_str(&rest[..end]);
        rest = &rest[end + 1..];
        match rest.strip_prefix('"') {
            Some(next) => {
                name.push('"');
                rest = next;
            }
            None => return Ok((rest, name)),
        }
    }
}

fn bare_identifier(input: &str) -> PResult<'_, String> {
    map(
        recognize(pair(
            satisfy(|c| c.is_alphabetic() || c == '_'),
            take_while(is_ident_char),
        )),
        |s: &str| s.to_lowercase(),
    )(input)
}

/// Case-folded identifier
pub fn identifier(input: &str) -> PResult<'_, String> {
    preceded(ws0, alt((quoted_identifier, bare_identifier)))(input)
}

pub fn qualified_name(input: &str) -> PResult<'_, QualifiedName> {
    let (input, first) = identifier(input)?;
    let (input, second) = opt(preceded(char('.'), alt((quoted_identifier, bare_identifier))))(input)?;
    let name = match second {
        Some(name) => QualifiedName {
            schema: Some(first),
            name,
        },
        None => QualifiedName {
            schema: None,
            name: first,
        },
    };
    Ok((input, name))
}

fn column_ref(input: &str) -> PResult<'_, ColumnRef> {
    let (rest, first) = identifier(input)?;
    let (rest, tail) = many0(preceded(char('.'), alt((quoted_identifier, bare_identifier))))(rest)?;
    let mut parts = vec![first];
    parts.extend(tail);
    match parts.len() {
        2 => {
            let column = parts.pop().unwrap_or_default();
            let table = parts.pop().unwrap_or_default();
            Ok((rest, ColumnRef { schema: None, table, column }))
        }
        3 => {
            let column = parts.pop().unwrap_or_default();
            let table = parts.pop().unwrap_or_default();
            Ok((rest, ColumnRef { schema: parts.pop(), table, column }))
        }
        _ => unsupported(input, "expected table.column"),
    }
}

fn column_list(input: &str) -> PResult<'_, Vec<String>> {
    delimited(sym('('), separated_list1(sym(','), identifier), cut(sym(')')))(input)
}

fn signed_int(input: &str) -> PResult<'_, i64> {
    preceded(
        ws0,
        map_res(recognize(pair(opt(one_of("+-")), digit1)), |s: &str| s.parse::<i64>()),
    )(input)
}

fn starts_with_keyword(text: &str, word: &str) -> bool {
    text.get(..word.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(word))
        && !text[word.len()..].starts_with(is_ident_char)
}

/// Byte offset where a raw expression ends: an unmatched `)`, a top-level
/// `,` (when `stop_at_comma`), or a top-level keyword from `stops`.
fn scan_raw(input: &str, stops: &[&str], stop_at_comma: bool) -> usize {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut depth = 0usize;
    let mut prev_ident = false;
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        match c {
            '\'' | '"' => {
                i += 1;
                while i < chars.len() {
                    if chars[i].1 == c {
                        if i + 1 < chars.len() && chars[i + 1].1 == c {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
                prev_ident = false;
                continue;
            }
            '(' | '[' => depth += 1,
            ')' | ']' => {
                if depth == 0 {
                    return pos;
                }
                depth -= 1;
            }
            ',' if depth == 0 && stop_at_comma => return pos,
            c if depth == 0 && !prev_ident && (c.is_alphabetic() || c == '_') => {
                let rest = &input[pos..];
                if stops.iter().any(|s| starts_with_keyword(rest, s)) {
                    return pos;
                }
            }
            _ => {}
        }
        prev_ident = is_ident_char(c);
        i += 1;
    }
    input.len()
}

fn raw_until<'a>(
    stops: &'static [&'static str],
    stop_at_comma: bool,
) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    move |input: &'a str| {
        let (input, _) = ws0(input)?;
        let end = scan_raw(input, stops, stop_at_comma);
        let raw = input[..end].trim_end();
        if raw.is_empty() {
            return Err(nom::Err::Error(VerboseError::from_error_kind(input, ErrorKind::TakeWhile1)));
        }
        Ok((&input[end..], raw))
    }
}

/// Contents of a parenthesized group, parentheses excluded
fn paren_body(input: &str) -> PResult<'_, &str> {
    let (input, _) = sym('(')(input)?;
    let end = scan_raw(input, &[], false);
    let body = input[..end].trim();
    let (input, _) = cut(context("closing parenthesis", char(')')))(&input[end..])?;
    Ok((input, body))
}

/// Everything left in the statement
fn rest_of_statement(input: &str) -> PResult<'_, &str> {
    let (input, _) = ws0(input)?;
    let text = input.trim_end();
    if text.is_empty() {
        return Err(nom::Err::Error(VerboseError::from_error_kind(input, ErrorKind::Eof)));
    }
    Ok(("", text))
}

/// Type name as written, with multi-word forms, modifiers and array suffixes
fn type_name(input: &str) -> PResult<'_, String> {
    let (mut rest, name) = context("data type", qualified_name)(input)?;
    let mut text = match name.schema {
        Some(schema) => format!("{}.{}", schema, name.name),
        None => name.name,
    };
    match text.as_str() {
        "double" => {
            let (r, _) = cut(context("double precision", kw("precision")))(rest)?;
            rest = r;
            text.push_str(" precision");
        }
        "character" | "char" | "bit" => {
            if let Ok((r, _)) = kw("varying")(rest) {
                rest = r;
                text.push_str(" varying");
            }
        }
        _ => {}
    }
    if let Ok((r, modifier)) = paren_body(rest) {
        rest = r;
        text = format!("{}({})", text, modifier);
    }
    if text.starts_with("time") {
        if let Ok((r, _)) = tuple((kw("with"), kw("time"), kw("zone")))(rest) {
            rest = r;
            text.push_str(" with time zone");
        } else if let Ok((r, _)) = tuple((kw("without"), kw("time"), kw("zone")))(rest) {
            rest = r;
            text.push_str(" without time zone");
        }
    }
    while let Ok((r, _)) = pair(sym('['), terminated(opt(digit1), char(']')))(rest) {
        rest = r;
        text.push_str("[]");
    }
    Ok((rest, text))
}

fn referential_action(input: &str) -> PResult<'_, ReferentialAction> {
    alt((
        value(ReferentialAction::NoAction, pair(kw("no"), kw("action"))),
        value(ReferentialAction::Restrict, kw("restrict")),
        value(ReferentialAction::Cascade, kw("cascade")),
        value(ReferentialAction::SetNull, pair(kw("set"), kw("null"))),
        value(ReferentialAction::SetDefault, pair(kw("set"), kw("default"))),
    ))(input)
}

#[derive(Debug, Clone, Copy)]
enum RefClause {
    OnDelete(ReferentialAction),
    OnUpdate(ReferentialAction),
    Match,
}

fn referential_clause(input: &str) -> PResult<'_, RefClause> {
    alt((
        map(
            preceded(pair(kw("on"), kw("delete")), cut(referential_action)),
            RefClause::OnDelete,
        ),
        map(
            preceded(pair(kw("on"), kw("update")), cut(referential_action)),
            RefClause::OnUpdate,
        ),
        value(
            RefClause::Match,
            pair(kw("match"), alt((kw("full"), kw("simple"), kw("partial")))),
        ),
    ))(input)
}

#[derive(Debug, Clone, Copy)]
enum TimingFlag {
    Deferrable,
    NotDeferrable,
    InitiallyDeferred,
    InitiallyImmediate,
}

fn timing_flag(input: &str) -> PResult<'_, TimingFlag> {
    alt((
        value(TimingFlag::Deferrable, kw("deferrable")),
        value(TimingFlag::NotDeferrable, pair(kw("not"), kw("deferrable"))),
        value(TimingFlag::InitiallyDeferred, pair(kw("initially"), kw("deferred"))),
        value(TimingFlag::InitiallyImmediate, pair(kw("initially"), kw("immediate"))),
    ))(input)
}

fn constraint_timing(input: &str) -> PResult<'_, Timing> {
    let (input, flags) = many0(timing_flag)(input)?;
    let mut timing = Timing::default();
    for flag in flags {
        match flag {
            TimingFlag::Deferrable => timing.deferrable = true,
            TimingFlag::NotDeferrable => timing.deferrable = false,
            TimingFlag::InitiallyDeferred => {
                timing.deferrable = true;
                timing.initially_deferred = true;
            }
            TimingFlag::InitiallyImmediate => timing.initially_deferred = false,
        }
    }
    Ok((input, timing))
}

fn references(input: &str) -> PResult<'_, References> {
    let (input, _) = kw("references")(input)?;
    let (input, table) = cut(context("referenced table", qualified_name))(input)?;
    let (input, columns) = opt(column_list)(input)?;
    let (input, clauses) = many0(referential_clause)(input)?;
    let (input, timing) = constraint_timing(input)?;

    let mut on_delete = ReferentialAction::NoAction;
    let mut on_update = ReferentialAction::NoAction;
    for clause in clauses {
        match clause {
            RefClause::OnDelete(action) => on_delete = action,
            RefClause::OnUpdate(action) => on_update = action,
            RefClause::Match => {}
        }
    }
    Ok((
        input,
        References {
            table,
            columns: columns.unwrap_or_default(),
            on_delete,
            on_update,
            timing,
        },
    ))
}

fn generated(input: &str) -> PResult<'_, ColumnConstraintKind> {
    let (input, _) = kw("generated")(input)?;
    let (input, kind) = cut(alt((
        value(IdentityKind::Always, kw("always")),
        value(IdentityKind::ByDefault, pair(kw("by"), kw("default"))),
    )))(input)?;
    let (input, _) = cut(kw("as"))(input)?;
    if sym('(')(input).is_ok() {
        return unsupported(input, "generated columns are not supported");
    }
    let (input, _) = cut(context("AS IDENTITY", kw("identity")))(input)?;
    let (input, _) = opt(paren_body)(input)?;
    Ok((input, ColumnConstraintKind::Identity(kind)))
}

const DEFAULT_STOPS: &[&str] = &[
    "not",
    "null",
    "primary",
    "unique",
    "check",
    "references",
    "constraint",
    "generated",
    "collate",
    "default",
    "deferrable",
    "initially",
];

fn default_clause(input: &str) -> PResult<'_, ColumnConstraintKind> {
    let (input, _) = kw("default")(input)?;
    let (input, expr) = cut(context(
        "default expression",
        alt((
            value(None, kw("null")),
            map(raw_until(DEFAULT_STOPS, true), |s: &str| Some(s.to_string())),
        )),
    ))(input)?;
    Ok((input, ColumnConstraintKind::Default(expr)))
}

fn column_constraint_kind(input: &str) -> PResult<'_, ColumnConstraintKind> {
    alt((
        value(ColumnConstraintKind::NotNull, pair(kw("not"), kw("null"))),
        value(ColumnConstraintKind::Null, kw("null")),
        default_clause,
        value(ColumnConstraintKind::PrimaryKey, pair(kw("primary"), cut(kw("key")))),
        value(ColumnConstraintKind::Unique, kw("unique")),
        map(preceded(kw("check"), cut(paren_body)), |e: &str| {
            ColumnConstraintKind::Check(e.to_string())
        }),
        map(references, ColumnConstraintKind::References),
        generated,
        value(ColumnConstraintKind::Collate, preceded(kw("collate"), cut(identifier))),
        value(ColumnConstraintKind::Timing, timing_flag),
    ))(input)
}

fn column_constraint(input: &str) -> PResult<'_, ColumnConstraint> {
    let (input, name) = opt(preceded(kw("constraint"), cut(identifier)))(input)?;
    let (input, kind) = match name {
        Some(_) => cut(context("column constraint", column_constraint_kind))(input)?,
        None => column_constraint_kind(input)?,
    };
    Ok((input, ColumnConstraint { name, kind }))
}

fn column_def(input: &str) -> PResult<'_, ColumnDef> {
    let (input, name) = identifier(input)?;
    let (input, type_name) = cut(type_name)(input)?;
    let (input, constraints) = many0(column_constraint)(input)?;
    Ok((input, ColumnDef { name, type_name, constraints }))
}

fn exclusion_constraint(input: &str) -> PResult<'_, TableConstraintKind> {
    let (input, _) = kw("exclude")(input)?;
    unsupported(input, "exclusion constraints are not supported")
}

fn table_constraint_body(input: &str) -> PResult<'_, TableConstraintKind> {
    alt((
        map(
            preceded(pair(kw("primary"), cut(kw("key"))), cut(column_list)),
            TableConstraintKind::PrimaryKey,
        ),
        map(preceded(kw("unique"), cut(column_list)), TableConstraintKind::Unique),
        map(preceded(kw("check"), cut(paren_body)), |e: &str| {
            TableConstraintKind::Check(e.to_string())
        }),
        map(
            preceded(pair(kw("foreign"), cut(kw("key"))), cut(pair(column_list, references))),
            |(columns, references)| TableConstraintKind::ForeignKey { columns, references },
        ),
        exclusion_constraint,
    ))(input)
}

pub fn table_constraint(input: &str) -> PResult<'_, TableConstraint> {
    let (input, name) = opt(preceded(kw("constraint"), cut(identifier)))(input)?;
    let (input, mut kind) = match name {
        Some(_) => cut(context("table constraint", table_constraint_body))(input)?,
        None => table_constraint_body(input)?,
    };
    let (input, timing) = constraint_timing(input)?;
    let (input, _) = opt(pair(kw("not"), kw("valid")))(input)?;
    if let TableConstraintKind::ForeignKey { references, .. } = &mut kind {
        if timing.deferrable {
            references.timing = timing;
        }
    }
    Ok((input, TableConstraint { name, kind }))
}

fn like_element(input: &str) -> PResult<'_, TableElement> {
    let (input, _) = kw("like")(input)?;
    unsupported(input, "LIKE table elements are not supported")
}

fn table_element(input: &str) -> PResult<'_, TableElement> {
    alt((
        map(table_constraint, TableElement::Constraint),
        like_element,
        map(column_def, TableElement::Column),
    ))(input)
}

fn if_not_exists(input: &str) -> PResult<'_, ()> {
    value((), opt(tuple((kw("if"), kw("not"), kw("exists")))))(input)
}

fn create_table(input: &str) -> PResult<'_, Statement> {
    let (input, _) = kw("create")(input)?;
    let (input, _) = kw("table")(input)?;
    let (input, _) = if_not_exists(input)?;
    let (input, name) = cut(context("table name", qualified_name))(input)?;
    let (input, elements) = cut(context(
        "table definition",
        delimited(sym('('), separated_list0(sym(','), table_element), sym(')')),
    ))(input)?;
    Ok((input, Statement::CreateTable { name, elements }))
}

fn create_index(input: &str) -> PResult<'_, Statement> {
    let (input, _) = kw("create")(input)?;
    let (input, unique) = map(opt(kw("unique")), |u| u.is_some())(input)?;
    let (input, _) = kw("index")(input)?;
    let (input, _) = opt(kw("concurrently"))(input)?;
    let (input, _) = if_not_exists(input)?;
    let (input, name) = opt(preceded(not(kw("on")), identifier))(input)?;
    let (input, _) = cut(context("ON", kw("on")))(input)?;
    let (input, _) = opt(kw("only"))(input)?;
    let (input, table) = cut(context("indexed table", qualified_name))(input)?;
    let (input, method) = opt(preceded(kw("using"), cut(identifier)))(input)?;
    let (input, keys) = cut(context(
        "index keys",
        delimited(
            sym('('),
            separated_list1(sym(','), map(raw_until(&[], true), str::to_string)),
            sym(')'),
        ),
    ))(input)?;
    if kw("include")(input).is_ok() {
        return unsupported(input, "INCLUDE columns are not supported");
    }
    let (input, predicate) = opt(preceded(kw("where"), cut(rest_of_statement)))(input)?;
    Ok((
        input,
        Statement::CreateIndex(IndexStatement {
            name,
            unique,
            table,
            method,
            keys,
            predicate: predicate.map(str::to_string),
        }),
    ))
}

fn alter_table(input: &str) -> PResult<'_, Statement> {
    let (input, _) = kw("alter")(input)?;
    let (input, _) = kw("table")(input)?;
    let (input, _) = opt(pair(kw("if"), kw("exists")))(input)?;
    let (input, _) = opt(kw("only"))(input)?;
    let (input, table) = cut(context("altered table", qualified_name))(input)?;
    let (input, constraints) = cut(separated_list1(
        sym(','),
        preceded(
            context("ADD", kw("add")),
            context("only ADD CONSTRAINT is supported in ALTER TABLE", table_constraint),
        ),
    ))(input)?;
    Ok((input, Statement::AlterTableAdd { table, constraints }))
}

fn owner_ref(input: &str) -> PResult<'_, Option<ColumnRef>> {
    alt((value(None, kw("none")), map(column_ref, Some)))(input)
}

fn alter_sequence(input: &str) -> PResult<'_, Statement> {
    let (input, _) = kw("alter")(input)?;
    let (input, _) = kw("sequence")(input)?;
    let (input, _) = opt(pair(kw("if"), kw("exists")))(input)?;
    let (input, name) = cut(context("sequence name", qualified_name))(input)?;
    let (input, _) = cut(context(
        "only ALTER SEQUENCE ... OWNED BY is supported",
        pair(kw("owned"), kw("by")),
    ))(input)?;
    let (input, owner) = cut(owner_ref)(input)?;
    Ok((input, Statement::AlterSequenceOwner { name, owner }))
}

fn sequence_option(input: &str) -> PResult<'_, SequenceOption> {
    alt((
        map(preceded(kw("as"), cut(type_name)), SequenceOption::DataType),
        map(
            preceded(pair(kw("increment"), opt(kw("by"))), cut(signed_int)),
            SequenceOption::Increment,
        ),
        map(preceded(kw("minvalue"), cut(signed_int)), |v| SequenceOption::MinValue(Some(v))),
        map(preceded(kw("maxvalue"), cut(signed_int)), |v| SequenceOption::MaxValue(Some(v))),
        value(SequenceOption::MinValue(None), pair(kw("no"), kw("minvalue"))),
        value(SequenceOption::MaxValue(None), pair(kw("no"), kw("maxvalue"))),
        value(SequenceOption::Cycle(false), pair(kw("no"), kw("cycle"))),
        value(SequenceOption::Cycle(true), kw("cycle")),
        map(
            preceded(pair(kw("start"), opt(kw("with"))), cut(signed_int)),
            SequenceOption::Start,
        ),
        map(preceded(kw("cache"), cut(signed_int)), SequenceOption::Cache),
        map(
            preceded(pair(kw("owned"), cut(kw("by"))), cut(owner_ref)),
            SequenceOption::OwnedBy,
        ),
    ))(input)
}

fn create_sequence(input: &str) -> PResult<'_, Statement> {
    let (input, _) = kw("create")(input)?;
    let (input, _) = kw("sequence")(input)?;
    let (input, _) = if_not_exists(input)?;
    let (input, name) = cut(context("sequence name", qualified_name))(input)?;
    let (input, options) = many0(sequence_option)(input)?;
    Ok((input, Statement::CreateSequence { name, options }))
}

fn create_view(input: &str) -> PResult<'_, Statement> {
    let (input, _) = kw("create")(input)?;
    let (input, _) = opt(pair(kw("or"), kw("replace")))(input)?;
    let (input, _) = kw("view")(input)?;
    let (input, name) = cut(context("view name", qualified_name))(input)?;
    let (input, _) = opt(column_list)(input)?;
    let (input, _) = opt(preceded(kw("with"), paren_body))(input)?;
    let (input, _) = cut(context("AS", kw("as")))(input)?;
    let (input, query) = cut(context("view query", rest_of_statement))(input)?;
    Ok((
        input,
        Statement::CreateView {
            name,
            query: query.to_string(),
        },
    ))
}

fn create_materialized_view(input: &str) -> PResult<'_, Statement> {
    let (input, _) = kw("create")(input)?;
    let (input, _) = kw("materialized")(input)?;
    unsupported(input, "materialized views are not supported")
}

fn ignored(input: &str) -> PResult<'_, Statement> {
    let (_, _) = alt((
        recognize(pair(kw("create"), kw("schema"))),
        recognize(pair(kw("create"), kw("extension"))),
        recognize(pair(kw("comment"), kw("on"))),
        kw("set"),
    ))(input)?;
    Ok(("", Statement::Ignored))
}

/// One complete statement (without its terminating semicolon)
pub fn statement(input: &str) -> PResult<'_, Statement> {
    alt((
        create_table,
        create_index,
        create_sequence,
        create_view,
        create_materialized_view,
        alter_table,
        alter_sequence,
        ignored,
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(sql: &str) -> Statement {
        let (rest, stmt) = statement(sql).unwrap();
        assert_eq!(ws0(rest).unwrap().0, "");
        stmt
    }

    #[test]
    fn test_create_table_columns() {
        let stmt = parse(
            "CREATE TABLE IF NOT EXISTS app.\"Users\" (
                id bigint PRIMARY KEY,
                email varchar(255) NOT NULL UNIQUE,
                status text DEFAULT 'active' NOT NULL,
                created_at timestamp with time zone DEFAULT now()
            )",
        );
        let Statement::CreateTable { name, elements } = stmt else {
            panic!("expected CREATE TABLE");
        };
        assert_eq!(name, QualifiedName { schema: Some("app".into()), name: "Users".into() });
        assert_eq!(elements.len(), 4);

        let TableElement::Column(status) = &elements[2] else {
            panic!("expected column");
        };
        assert_eq!(status.type_name, "text");
        assert_eq!(
            status.constraints.iter().map(|c| c.kind.clone()).collect::<Vec<_>>(),
            vec![
                ColumnConstraintKind::Default(Some("'active'".into())),
                ColumnConstraintKind::NotNull,
            ]
        );

        let TableElement::Column(created) = &elements[3] else {
            panic!("expected column");
        };
        assert_eq!(created.type_name, "timestamp with time zone");
        assert_eq!(created.constraints[0].kind, ColumnConstraintKind::Default(Some("now()".into())));
    }

    #[test]
    fn test_table_constraints_and_foreign_keys() {
        let stmt = parse(
            "create table orders (
                id int,
                user_id int references users on delete cascade,
                -- trailing comment
                constraint orders_pk primary key (id),
                foreign key (user_id) references public.users (id) deferrable initially deferred
            )",
        );
        let Statement::CreateTable { elements, .. } = stmt else {
            panic!("expected CREATE TABLE");
        };
        let TableElement::Column(user_id) = &elements[1] else {
            panic!("expected column");
        };
        let ColumnConstraintKind::References(r) = &user_id.constraints[0].kind else {
            panic!("expected references");
        };
        assert_eq!(r.on_delete, ReferentialAction::Cascade);
        assert!(r.columns.is_empty());

        assert_eq!(
            elements[2],
            TableElement::Constraint(TableConstraint {
                name: Some("orders_pk".into()),
                kind: TableConstraintKind::PrimaryKey(vec!["id".into()]),
            })
        );
        let TableElement::Constraint(TableConstraint {
            kind: TableConstraintKind::ForeignKey { references, .. },
            ..
        }) = &elements[3]
        else {
            panic!("expected foreign key");
        };
        assert!(references.timing.deferrable);
        assert!(references.timing.initially_deferred);
    }

    #[test]
    fn test_create_index_forms() {
        let stmt = parse("CREATE UNIQUE INDEX CONCURRENTLY idx_email ON users USING btree (lower(email), created_at DESC) WHERE deleted_at IS NULL");
        assert_eq!(
            stmt,
            Statement::CreateIndex(IndexStatement {
                name: Some("idx_email".into()),
                unique: true,
                table: QualifiedName { schema: None, name: "users".into() },
                method: Some("btree".into()),
                keys: vec!["lower(email)".into(), "created_at DESC".into()],
                predicate: Some("deleted_at IS NULL".into()),
            })
        );
        let Statement::CreateIndex(unnamed) = parse("create index on users (email)") else {
            panic!("expected CREATE INDEX");
        };
        assert_eq!(unnamed.name, None);
    }

    #[test]
    fn test_sequence_statements() {
        assert_eq!(
            parse("CREATE SEQUENCE order_seq AS integer INCREMENT BY 5 START WITH 100 NO CYCLE OWNED BY orders.id"),
            Statement::CreateSequence {
                name: QualifiedName { schema: None, name: "order_seq".into() },
                options: vec![
                    SequenceOption::DataType("integer".into()),
                    SequenceOption::Increment(5),
                    SequenceOption::Start(100),
                    SequenceOption::Cycle(false),
                    SequenceOption::OwnedBy(Some(ColumnRef {
                        schema: None,
                        table: "orders".into(),
                        column: "id".into(),
                    })),
                ],
            }
        );
        assert_eq!(
            parse("ALTER SEQUENCE order_seq OWNED BY NONE"),
            Statement::AlterSequenceOwner {
                name: QualifiedName { schema: None, name: "order_seq".into() },
                owner: None,
            }
        );
    }

    #[test]
    fn test_view_and_alter_table() {
        assert_eq!(
            parse("CREATE OR REPLACE VIEW active_users AS SELECT id FROM users WHERE active"),
            Statement::CreateView {
                name: QualifiedName { schema: None, name: "active_users".into() },
                query: "SELECT id FROM users WHERE active".into(),
            }
        );
        let Statement::AlterTableAdd { constraints, .. } =
            parse("ALTER TABLE ONLY orders ADD CONSTRAINT positive_total CHECK (total > 0) NOT VALID")
        else {
            panic!("expected ALTER TABLE");
        };
        assert_eq!(constraints[0].kind, TableConstraintKind::Check("total > 0".into()));
    }

    #[test]
    fn test_identity_and_generated_columns() {
        let Statement::CreateTable { elements, .. } =
            parse("CREATE TABLE t (id bigint GENERATED ALWAYS AS IDENTITY (START WITH 10))")
        else {
            panic!("expected CREATE TABLE");
        };
        let TableElement::Column(id) = &elements[0] else {
            panic!("expected column");
        };
        assert_eq!(id.constraints[0].kind, ColumnConstraintKind::Identity(IdentityKind::Always));

        let err = statement("CREATE TABLE t (a int, b int GENERATED ALWAYS AS (a * 2) STORED)");
        assert!(matches!(err, Err(nom::Err::Failure(_))));
    }

    #[test]
    fn test_ignored_and_unknown_statements() {
        assert_eq!(parse("CREATE SCHEMA IF NOT EXISTS app"), Statement::Ignored);
        assert_eq!(parse("SET search_path = public"), Statement::Ignored);
        assert!(matches!(
            statement("CREATE FUNCTION f() RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql"),
            Err(nom::Err::Error(_))
        ));
    }
}
