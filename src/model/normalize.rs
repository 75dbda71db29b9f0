//! Normalization helpers
//!
//! PostgreSQL reports types and expressions in its own spelling
//! (`character varying(255)`, `('active'::text)`, `(price > (0)::numeric)`).
//! Declared DDL uses whatever the author wrote. Everything the differ compares
//! goes through these functions first so both sides meet in the middle.

use super::CanonicalName;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeSet;

static QUOTED_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(-?[0-9]+(?:\.[0-9]+)?)'").expect("valid regex"));

static NEXTVAL_NORMALIZED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"nextval'(?:[^'.]+\.)?([^']+)'").expect("valid regex"));

static NEXTVAL_RAW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)nextval\s*\(\s*'([^']+)'").expect("valid regex"));

static IN_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(not\s+)?in\s*\(((?:'[^']*'|[^()'])*)\)").expect("valid regex")
});

static PLAIN_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^(?:([A-Za-z_][A-Za-z0-9_$]*)|"([^"]+)")$"#).expect("valid regex"));

const MULTIWORD_TYPES: &[&str] = &[
    "timestamp without time zone",
    "timestamp with time zone",
    "time without time zone",
    "time with time zone",
    "character varying",
    "double precision",
    "bit varying",
];

/// Lowercase everything outside double-quoted sections
pub fn fold_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quoted = false;
    for c in text.chars() {
        if c == '"' {
            quoted = !quoted;
            out.push(c);
        } else if quoted {
            out.push(c);
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn with_modifier(base: &str, modifier: Option<&str>) -> String {
    match modifier {
        Some(m) => format!("{}({})", base, m),
        None => base.to_string(),
    }
}

fn time_type(base: &str, modifier: Option<&str>, with_zone: bool) -> String {
    let zone = if with_zone { "with time zone" } else { "without time zone" };
    format!("{} {}", with_modifier(base, modifier), zone)
}

/// Spell a declared type the way `format_type()` reports it
pub fn canonical_type(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    let mut dimensions = 0;
    loop {
        let trimmed = text.trim_end();
        if trimmed.ends_with(']') {
            if let Some(open) = trimmed.rfind('[') {
                text = trimmed[..open].to_string();
                dimensions += 1;
                continue;
            }
        }
        if trimmed.to_ascii_lowercase().ends_with(" array") {
            text = trimmed[..trimmed.len() - " array".len()].to_string();
            dimensions += 1;
            continue;
        }
        break;
    }

    let folded = fold_case(&text);
    let (base, modifier) = match (folded.find('('), folded.rfind(')')) {
        (Some(open), Some(close)) if close > open => {
            let modifier: String = folded[open + 1..close]
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            let base = format!("{} {}", &folded[..open], &folded[close + 1..]);
            (collapse_whitespace(&base), Some(modifier))
        }
        _ => (collapse_whitespace(&folded), None),
    };
    let modifier = modifier.as_deref();

    let mut canonical = match base.as_str() {
        "int" | "int4" | "integer" | "serial" | "serial4" => "integer".to_string(),
        "int8" | "bigint" | "bigserial" | "serial8" => "bigint".to_string(),
        "int2" | "smallint" | "smallserial" | "serial2" => "smallint".to_string(),
        "bool" | "boolean" => "boolean".to_string(),
        "float8" | "double precision" => "double precision".to_string(),
        "float4" | "real" => "real".to_string(),
        "float" => match modifier.and_then(|m| m.parse::<u32>().ok()) {
            Some(p) if p <= 24 => "real".to_string(),
            _ => "double precision".to_string(),
        },
        "decimal" | "numeric" => with_modifier("numeric", modifier),
        "varchar" | "character varying" | "char varying" => with_modifier("character varying", modifier),
        "char" | "character" => with_modifier("character", modifier.or(Some("1"))),
        "bpchar" => with_modifier("bpchar", modifier),
        "timestamp" | "timestamp without time zone" => time_type("timestamp", modifier, false),
        "timestamptz" | "timestamp with time zone" => time_type("timestamp", modifier, true),
        "time" | "time without time zone" => time_type("time", modifier, false),
        "timetz" | "time with time zone" => time_type("time", modifier, true),
        "varbit" | "bit varying" => with_modifier("bit varying", modifier),
        "bit" => with_modifier("bit", modifier.or(Some("1"))),
        other => with_modifier(other, modifier),
    };
    for _ in 0..dimensions {
        canonical.push_str("[]");
    }
    canonical
}

/// `serial`, `bigserial` or `smallserial` spelled in any accepted form
pub fn is_serial_type(raw: &str) -> bool {
    matches!(
        fold_case(raw.trim()).as_str(),
        "serial" | "serial4" | "bigserial" | "serial8" | "smallserial" | "serial2"
    )
}

/// Serial pseudo-type that produces the given integer type
pub fn serial_alias(data_type: &str) -> Option<&'static str> {
    match data_type {
        "integer" => Some("serial"),
        "bigint" => Some("bigserial"),
        "smallint" => Some("smallserial"),
        _ => None,
    }
}

/// Value range of an integer type; anything else is treated as `bigint`
pub fn integer_bounds(data_type: &str) -> (i64, i64) {
    match data_type {
        "smallint" => (i16::MIN as i64, i16::MAX as i64),
        "integer" => (i32::MIN as i64, i32::MAX as i64),
        _ => (i64::MIN, i64::MAX),
    }
}

fn skip_cast(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    let rest: String = chars[i..].iter().collect::<String>().to_lowercase();
    let mut matched = false;
    for ty in MULTIWORD_TYPES {
        if rest.starts_with(ty) {
            let end = i + ty.chars().count();
            if end >= chars.len() || !is_ident_char(chars[end]) {
                i = end;
                matched = true;
                break;
            }
        }
    }
    if !matched {
        if i < chars.len() && chars[i] == '"' {
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                i += 1;
            }
            i += 1;
        } else {
            while i < chars.len() && (is_ident_char(chars[i]) || chars[i] == '.') {
                i += 1;
            }
        }
    }
    if i < chars.len() && chars[i] == '(' {
        let mut depth = 0;
        while i < chars.len() {
            match chars[i] {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }
    while i + 1 < chars.len() && chars[i] == '[' && chars[i + 1] == ']' {
        i += 2;
    }
    i
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn copy_quoted(chars: &[char], mut i: usize, quote: char, out: &mut String) -> usize {
    out.push(quote);
    i += 1;
    while i < chars.len() {
        out.push(chars[i]);
        if chars[i] == quote {
            if i + 1 < chars.len() && chars[i + 1] == quote {
                out.push(quote);
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

/// Rewrite `x IN (a, b)` the way the catalog prints it: `x = ANY (ARRAY[a, b])`
fn expand_in_lists(expr: &str) -> String {
    IN_LIST
        .replace_all(expr, |caps: &Captures<'_>| {
            let list = &caps[2];
            if list.trim_start().to_ascii_lowercase().starts_with("select") {
                return caps[0].to_string();
            }
            let operator = if caps.get(1).is_some() { "<> ALL" } else { "= ANY" };
            format!("{} (ARRAY[{}])", operator, list)
        })
        .into_owned()
}

/// Comparison key for default, check and predicate expressions.
///
/// Drops whitespace, parentheses and `::type` casts outside literals and folds
/// case, so `(price > (0)::numeric)` and `price > 0` compare equal. The result
/// is only ever compared, never executed.
pub fn normalize_expr(expr: &str) -> String {
    let chars: Vec<char> = expand_in_lists(expr.trim().trim_end_matches(';')).chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => i = copy_quoted(&chars, i, c, &mut out),
            ':' if i + 1 < chars.len() && chars[i + 1] == ':' => i = skip_cast(&chars, i + 2),
            '(' | ')' => i += 1,
            c if c.is_whitespace() => i += 1,
            c => {
                out.extend(c.to_lowercase());
                i += 1;
            }
        }
    }
    let out = QUOTED_NUMBER.replace_all(&out, "$1");
    NEXTVAL_NORMALIZED.replace_all(&out, "nextval'$1'").into_owned()
}

/// Remove `qualifier.` prefixes from identifiers outside literals
fn strip_qualifiers(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            i = copy_quoted(&chars, i, c, &mut out);
            continue;
        }
        let starts_ident = c == '"'
            || ((c.is_alphabetic() || c == '_') && (i == 0 || !is_ident_char(chars[i - 1])));
        if starts_ident {
            let mut token = String::new();
            let end = if c == '"' {
                copy_quoted(&chars, i, '"', &mut token)
            } else {
                let mut j = i;
                while j < chars.len() && is_ident_char(chars[j]) {
                    token.push(chars[j]);
                    j += 1;
                }
                j
            };
            let qualifies = end + 1 < chars.len()
                && chars[end] == '.'
                && (chars[end + 1].is_alphabetic() || chars[end + 1] == '_' || chars[end + 1] == '"' || chars[end + 1] == '*');
            if qualifies {
                i = end + 1;
            } else {
                out.push_str(&token);
                i = end;
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Comparison key for view definitions
pub fn normalize_view(definition: &str) -> String {
    normalize_expr(&strip_qualifiers(definition))
}

/// Drop `ASC`/`DESC`/`NULLS FIRST|LAST` from an index key
pub fn strip_sort_order(key: &str) -> &str {
    let mut key = key.trim();
    loop {
        let lower = key.to_ascii_lowercase();
        let stripped = ["nulls first", "nulls last", "asc", "desc"]
            .iter()
            .find(|suffix| {
                lower.ends_with(*suffix)
                    && lower[..lower.len() - suffix.len()].ends_with(char::is_whitespace)
            })
            .map(|suffix| key[..key.len() - suffix.len()].trim_end());
        match stripped {
            Some(rest) => key = rest,
            None => return key,
        }
    }
}

/// Comparison key for an index key
pub fn normalize_index_key(key: &str) -> String {
    normalize_expr(strip_sort_order(key))
}

/// Column name when an index key is a bare (or quoted) column reference
pub fn plain_column(key: &str) -> Option<String> {
    let caps = PLAIN_IDENT.captures(strip_sort_order(key))?;
    caps.get(1)
        .map(|m| m.as_str().to_lowercase())
        .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
}

/// Identifiers an expression mentions: bare words folded, quoted names
/// kept, string literals skipped. Keywords and function names come along too;
/// callers match the result against known columns.
pub fn expression_identifiers(expr: &str) -> BTreeSet<String> {
    let chars: Vec<char> = expr.chars().collect();
    let mut idents = BTreeSet::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            let mut token = String::new();
            i = copy_quoted(&chars, i, c, &mut token);
            if c == '"' && token.len() >= 2 {
                idents.insert(token[1..token.len() - 1].replace("\"\"", "\""));
            }
        } else if c == ':' && chars.get(i + 1) == Some(&':') {
            i = skip_cast(&chars, i + 2);
        } else if (c.is_alphabetic() || c == '_') && (i == 0 || !is_ident_char(chars[i - 1])) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            idents.insert(chars[start..i].iter().collect::<String>().to_lowercase());
        } else {
            i += 1;
        }
    }
    idents
}

/// Split `a.b` / `"A"."b"` into folded parts
pub fn split_qualified(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                was_quoted = true;
            }
            '.' if !quoted => {
                parts.push(if was_quoted { current.clone() } else { current.to_lowercase() });
                current.clear();
                was_quoted = false;
            }
            c => current.push(c),
        }
    }
    parts.push(if was_quoted { current } else { current.to_lowercase() });
    parts
}

/// Sequence a `nextval('...')` default draws from
pub fn nextval_target(default: &str, default_schema: &str) -> Option<CanonicalName> {
    let caps = NEXTVAL_RAW.captures(default)?;
    let parts = split_qualified(caps.get(1)?.as_str());
    match parts.as_slice() {
        [name] => Some(CanonicalName::relation(default_schema, name.clone())),
        [schema, name] => Some(CanonicalName::relation(schema.clone(), name.clone())),
        _ => None,
    }
}

/// How a column type change affects existing data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeChange {
    Same,
    /// Every existing value survives unchanged
    Widening,
    /// Values may be truncated or rejected
    Narrowing,
    /// Values must be reinterpreted
    Incompatible,
}

fn split_type(canonical: &str) -> (String, Vec<i64>) {
    match (canonical.find('('), canonical.find(')')) {
        (Some(open), Some(close)) if close > open => {
            let mods = canonical[open + 1..close]
                .split(',')
                .filter_map(|m| m.trim().parse().ok())
                .collect();
            let base = collapse_whitespace(&format!("{} {}", &canonical[..open], &canonical[close + 1..]));
            (base, mods)
        }
        _ => (canonical.to_string(), Vec::new()),
    }
}

fn integer_rank(base: &str) -> Option<u8> {
    match base {
        "smallint" => Some(1),
        "integer" => Some(2),
        "bigint" => Some(3),
        _ => None,
    }
}

fn integer_digits(base: &str) -> i64 {
    match base {
        "smallint" => 5,
        "integer" => 10,
        _ => 19,
    }
}

/// Character capacity; `None` means unbounded
fn char_capacity(base: &str, mods: &[i64]) -> Option<Option<i64>> {
    match base {
        "text" => Some(None),
        "character varying" => Some(mods.first().copied()),
        "character" | "bpchar" => Some(Some(mods.first().copied().unwrap_or(1))),
        _ => None,
    }
}

fn widening_if(cond: bool) -> TypeChange {
    if cond {
        TypeChange::Widening
    } else {
        TypeChange::Narrowing
    }
}

/// Classify a change between two canonical types
pub fn classify_type_change(from: &str, to: &str) -> TypeChange {
    if from == to {
        return TypeChange::Same;
    }
    match (from.strip_suffix("[]"), to.strip_suffix("[]")) {
        (Some(f), Some(t)) => return classify_type_change(f, t),
        (None, None) => {}
        _ => return TypeChange::Incompatible,
    }

    let (from_base, from_mods) = split_type(from);
    let (to_base, to_mods) = split_type(to);

    if let (Some(f), Some(t)) = (integer_rank(&from_base), integer_rank(&to_base)) {
        return widening_if(t >= f);
    }

    if to_base == "numeric" {
        if from_base == "numeric" {
            return match (from_mods.as_slice(), to_mods.as_slice()) {
                (_, []) => TypeChange::Widening,
                ([], _) => TypeChange::Narrowing,
                (f, t) => {
                    let (fp, fs) = (f[0], f.get(1).copied().unwrap_or(0));
                    let (tp, ts) = (t[0], t.get(1).copied().unwrap_or(0));
                    widening_if(ts == fs && tp >= fp)
                }
            };
        }
        if integer_rank(&from_base).is_some() {
            return match to_mods.as_slice() {
                [] => TypeChange::Widening,
                t => widening_if(t[0] - t.get(1).copied().unwrap_or(0) >= integer_digits(&from_base)),
            };
        }
    }

    match (from_base.as_str(), to_base.as_str()) {
        ("real", "double precision") => return TypeChange::Widening,
        ("double precision", "real") => return TypeChange::Narrowing,
        ("smallint" | "integer", "double precision") | ("smallint", "real") => return TypeChange::Widening,
        ("integer" | "bigint", "real") | ("bigint", "double precision") => return TypeChange::Narrowing,
        ("date", "timestamp without time zone" | "timestamp with time zone") => return TypeChange::Widening,
        ("timestamp without time zone" | "timestamp with time zone", "date") => return TypeChange::Narrowing,
        ("timestamp without time zone", "timestamp without time zone")
        | ("timestamp with time zone", "timestamp with time zone")
        | ("time without time zone", "time without time zone")
        | ("time with time zone", "time with time zone") => {
            let precision = |mods: &[i64]| mods.first().copied().unwrap_or(6);
            return widening_if(precision(&to_mods) >= precision(&from_mods));
        }
        _ => {}
    }

    match (char_capacity(&from_base, &from_mods), char_capacity(&to_base, &to_mods)) {
        (Some(_), Some(_)) if to_base == "character" => TypeChange::Narrowing,
        (Some(from_cap), Some(to_cap)) => match (from_cap, to_cap) {
            (_, None) => TypeChange::Widening,
            (None, Some(_)) => TypeChange::Narrowing,
            (Some(f), Some(t)) => widening_if(t >= f),
        },
        // Every type has a text form
        (None, Some(None)) => TypeChange::Widening,
        _ => TypeChange::Incompatible,
    }
}
