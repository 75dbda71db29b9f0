//! Statement tree → desired [`SchemaGraph`]
//!
//! Resolves names against the default schema, assigns PostgreSQL's default
//! names to unnamed constraints and indexes, and expands `serial` columns.

use super::grammar::{
    ColumnConstraint, ColumnConstraintKind, ColumnDef, ColumnRef, IndexStatement, QualifiedName,
    References, SequenceOption, Statement, TableConstraint, TableConstraintKind, TableElement,
};
use crate::error::{parse_error, ReconcileError, ReconcileResult};
use crate::model::normalize::{canonical_type, is_serial_type, plain_column};
use crate::model::{
    CanonicalName, Column, Constraint, ConstraintDef, ForeignKey, Index, Namespace, SchemaGraph,
    SchemaObject, Sequence, Table, View,
};
use std::collections::BTreeSet;
use tracing::debug;

/// PostgreSQL's NAMEDATALEN - 1
const MAX_IDENTIFIER_BYTES: usize = 63;

/// 1-based location of a statement in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    fn error(self, message: impl Into<String>) -> ReconcileError {
        parse_error(self.line, self.column, message)
    }
}

fn clip(text: &str, mut len: usize) -> &str {
    while !text.is_char_boundary(len) {
        len -= 1;
    }
    &text[..len]
}

/// `name1_name2_label`, shortening the longer of the two names until the
/// result fits in an identifier
pub fn make_object_name(name1: &str, name2: Option<&str>, label: &str) -> String {
    let overhead = label.len() + 1 + usize::from(name2.is_some());
    let available = MAX_IDENTIFIER_BYTES.saturating_sub(overhead);
    let mut len1 = name1.len();
    let mut len2 = name2.map_or(0, str::len);
    while len1 + len2 > available {
        if len1 > len2 {
            len1 -= 1;
        } else {
            len2 -= 1;
        }
    }
    let mut name = clip(name1, len1).to_string();
    if let Some(name2) = name2 {
        name.push('_');
        name.push_str(clip(name2, len2));
    }
    name.push('_');
    name.push_str(label);
    name
}

fn needs_quotes(ident: &str) -> bool {
    let mut chars = ident.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    !first_ok || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// `schema.name` as a regclass literal body
fn regclass_text(name: &CanonicalName) -> String {
    let part = |ident: &str| {
        if needs_quotes(ident) {
            format!("\"{}\"", ident.replace('"', "\"\""))
        } else {
            ident.to_string()
        }
    };
    format!("{}.{}", part(&name.schema), part(&name.relation)).replace('\'', "''")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Punct(char),
    /// String or numeric literal, value dropped
    Literal,
}

/// Rough SQL tokens: words folded, quoted identifiers kept, literal values
/// dropped
fn lex(text: &str) -> Vec<Token> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '\'' || c == '"' {
            let mut value = String::new();
            i += 1;
            while i < chars.len() {
                if chars[i] == c {
                    if chars.get(i + 1) == Some(&c) {
                        value.push(c);
                        i += 2;
                        continue;
                    }
                    break;
                }
                value.push(chars[i]);
                i += 1;
            }
            i += 1;
            tokens.push(if c == '"' { Token::Quoted(value) } else { Token::Literal });
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect::<String>().to_lowercase()));
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Literal);
        } else {
            tokens.push(Token::Punct(c));
            i += 1;
        }
    }
    tokens
}

fn is_word(token: Option<&Token>, word: &str) -> bool {
    matches!(token, Some(Token::Word(w)) if w == word)
}

/// Words that end a FROM item instead of naming an alias
const CLAUSE_WORDS: &[&str] = &[
    "where", "join", "inner", "left", "right", "full", "cross", "natural", "on", "using", "group",
    "order", "limit", "offset", "having", "window", "union", "except", "intersect", "fetch",
    "for", "select", "lateral", "only", "tablesample",
];

fn name_token(token: Option<&Token>) -> Option<String> {
    match token {
        Some(Token::Word(w)) if !CLAUSE_WORDS.contains(&w.as_str()) => Some(w.clone()),
        Some(Token::Quoted(q)) => Some(q.clone()),
        _ => None,
    }
}

fn relation_at(tokens: &[Token], i: usize) -> Option<(Option<String>, String, usize)> {
    let first = name_token(tokens.get(i))?;
    let (schema, name, next) = if tokens.get(i + 1) == Some(&Token::Punct('.')) {
        (Some(first), name_token(tokens.get(i + 2))?, i + 3)
    } else {
        (None, first, i + 1)
    };
    if tokens.get(next) == Some(&Token::Punct('(')) {
        return None;
    }
    Some((schema, name, next))
}

/// Names bound by `WITH name AS (...)`
fn cte_names(tokens: &[Token]) -> BTreeSet<String> {
    tokens
        .windows(3)
        .filter_map(|w| match (&w[0], &w[1], &w[2]) {
            (Token::Word(name), Token::Word(kw), Token::Punct('(')) if kw == "as" => Some(name.clone()),
            (Token::Quoted(name), Token::Word(kw), Token::Punct('(')) if kw == "as" => Some(name.clone()),
            _ => None,
        })
        .collect()
}

/// Relations named after `FROM` and `JOIN` in a view query
pub fn view_references(query: &str, default_schema: &str) -> BTreeSet<CanonicalName> {
    let tokens = lex(query);
    let ctes = cte_names(&tokens);
    let mut refs = BTreeSet::new();
    let mut i = 0;
    while i < tokens.len() {
        let from = is_word(tokens.get(i), "from");
        if !from && !is_word(tokens.get(i), "join") {
            i += 1;
            continue;
        }
        i += 1;
        loop {
            while is_word(tokens.get(i), "only") || is_word(tokens.get(i), "lateral") {
                i += 1;
            }
            let Some((schema, name, next)) = relation_at(&tokens, i) else {
                break;
            };
            i = next;
            if schema.is_some() || !ctes.contains(&name) {
                let schema = schema.unwrap_or_else(|| default_schema.to_string());
                refs.insert(CanonicalName::relation(schema, name));
            }
            if is_word(tokens.get(i), "as") {
                i += 2;
            } else if name_token(tokens.get(i)).is_some() {
                i += 1;
            }
            if from && tokens.get(i) == Some(&Token::Punct(',')) {
                i += 1;
                continue;
            }
            break;
        }
    }
    refs
}

/// Whether any top-level select list in the query contains `*` or `alias.*`
fn selects_star(query: &str) -> bool {
    let tokens = lex(query);
    let mut depth = 0usize;
    let mut in_list = false;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => depth = depth.saturating_sub(1),
            Token::Word(w) if depth == 0 && w == "select" => in_list = true,
            Token::Word(w) if depth == 0 && w == "from" => in_list = false,
            Token::Punct('*') if depth == 0 && in_list => {
                let before = i.checked_sub(1).and_then(|b| tokens.get(b));
                let item_start = match before {
                    Some(Token::Punct(',')) | Some(Token::Punct('.')) => true,
                    Some(Token::Word(w)) => matches!(w.as_str(), "select" | "distinct" | "all"),
                    _ => false,
                };
                let item_end = match tokens.get(i + 1) {
                    None | Some(Token::Punct(',')) => true,
                    Some(Token::Word(w)) => w == "from",
                    _ => false,
                };
                if item_start && item_end {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

pub struct GraphBuilder<'a> {
    default_schema: String,
    allowed_schemas: Option<&'a [String]>,
    graph: SchemaGraph,
    pending_owners: Vec<(CanonicalName, Option<ColumnRef>, Position)>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(default_schema: &str, allowed_schemas: Option<&'a [String]>) -> Self {
        Self {
            default_schema: default_schema.to_string(),
            allowed_schemas,
            graph: SchemaGraph::new(),
            pending_owners: Vec::new(),
        }
    }

    fn is_target_schema(&self, schema: &str) -> bool {
        match self.allowed_schemas {
            Some(allowed) => allowed.iter().any(|s| s == schema),
            None => schema == self.default_schema,
        }
    }

    /// Name of an object this statement defines; must be in a target schema
    fn defined_name(&self, name: &QualifiedName, at: Position) -> ReconcileResult<CanonicalName> {
        let schema = name.schema.clone().unwrap_or_else(|| self.default_schema.clone());
        if let Some(allowed) = self.allowed_schemas {
            if !allowed.contains(&schema) {
                return Err(at.error(format!(
                    "{}.{} is outside the target schemas ({})",
                    schema,
                    name.name,
                    allowed.join(", ")
                )));
            }
        }
        Ok(CanonicalName::relation(schema, name.name.clone()))
    }

    /// Name of an object this statement only refers to
    fn referenced_name(&self, name: &QualifiedName) -> CanonicalName {
        let schema = name.schema.clone().unwrap_or_else(|| self.default_schema.clone());
        CanonicalName::relation(schema, name.name.clone())
    }

    fn declared_table(&self, name: &QualifiedName, at: Position) -> ReconcileResult<CanonicalName> {
        let table = self.defined_name(name, at)?;
        if self.graph.table(&table).is_none() {
            return Err(at.error(format!("table {} is not declared before it is used", table)));
        }
        Ok(table)
    }

    fn insert(&mut self, object: SchemaObject, at: Position) -> ReconcileResult<()> {
        self.graph
            .insert(object)
            .map_err(|name| at.error(format!("duplicate definition of {}", name)))
    }

    pub fn apply(&mut self, statement: Statement, at: Position) -> ReconcileResult<()> {
        match statement {
            Statement::CreateTable { name, elements } => self.create_table(&name, elements, at),
            Statement::CreateIndex(index) => self.create_index(index, at),
            Statement::AlterTableAdd { table, constraints } => {
                let table = self.declared_table(&table, at)?;
                for constraint in constraints {
                    self.add_constraint(&table, constraint, at)?;
                }
                Ok(())
            }
            Statement::CreateSequence { name, options } => self.create_sequence(&name, options, at),
            Statement::AlterSequenceOwner { name, owner } => {
                let name = self.defined_name(&name, at)?;
                self.pending_owners.push((name, owner, at));
                Ok(())
            }
            Statement::CreateView { name, query } => {
                let name = self.defined_name(&name, at)?;
                // PostgreSQL freezes `*` into a column list, so the stored view never matches the text
                if selects_star(&query) {
                    return Err(at.error(format!(
                        "View {} selects '*'; list its columns explicitly",
                        name
                    )));
                }
                let references = view_references(&query, &self.default_schema);
                self.insert(
                    SchemaObject::View(View {
                        name,
                        definition: query,
                        references,
                    }),
                    at,
                )
            }
            Statement::Ignored => Ok(()),
        }
    }

    fn create_table(
        &mut self,
        name: &QualifiedName,
        elements: Vec<TableElement>,
        at: Position,
    ) -> ReconcileResult<()> {
        let table = self.defined_name(name, at)?;
        self.insert(SchemaObject::Table(Table { name: table.clone() }), at)?;

        let mut constraints = Vec::new();
        let mut position = 0;
        for element in elements {
            match element {
                TableElement::Column(def) => {
                    position += 1;
                    self.add_column(&table, def, position, &mut constraints, at)?;
                }
                TableElement::Constraint(constraint) => constraints.push(constraint),
            }
        }
        for constraint in constraints {
            self.add_constraint(&table, constraint, at)?;
        }
        debug!("Declared table {} with {} columns", table, position);
        Ok(())
    }

    fn add_column(
        &mut self,
        table: &CanonicalName,
        def: ColumnDef,
        position: usize,
        constraints: &mut Vec<TableConstraint>,
        at: Position,
    ) -> ReconcileResult<()> {
        let name = table.column_of(def.name.clone());
        let mut column = Column {
            name: name.clone(),
            data_type: canonical_type(&def.type_name),
            nullable: true,
            default: None,
            identity: None,
            position,
        };

        for ColumnConstraint { name: constraint_name, kind } in def.constraints {
            let own_columns = || vec![def.name.clone()];
            let table_kind = match kind {
                ColumnConstraintKind::NotNull => {
                    column.nullable = false;
                    None
                }
                ColumnConstraintKind::Null => {
                    column.nullable = true;
                    None
                }
                ColumnConstraintKind::Default(expr) => {
                    column.default = expr;
                    None
                }
                ColumnConstraintKind::Identity(kind) => {
                    column.identity = Some(kind);
                    column.nullable = false;
                    None
                }
                ColumnConstraintKind::PrimaryKey => Some(TableConstraintKind::PrimaryKey(own_columns())),
                ColumnConstraintKind::Unique => Some(TableConstraintKind::Unique(own_columns())),
                ColumnConstraintKind::Check(expression) => Some(TableConstraintKind::Check(expression)),
                ColumnConstraintKind::References(references) => Some(TableConstraintKind::ForeignKey {
                    columns: own_columns(),
                    references,
                }),
                ColumnConstraintKind::Collate | ColumnConstraintKind::Timing => None,
            };
            if let Some(kind) = table_kind {
                constraints.push(TableConstraint {
                    name: constraint_name,
                    kind,
                });
            }
        }

        if is_serial_type(&def.type_name) {
            if column.default.is_some() || column.identity.is_some() {
                return Err(at.error(format!(
                    "serial column {} cannot also declare a default or identity",
                    name
                )));
            }
            let sequence_name = CanonicalName::relation(
                table.schema.clone(),
                self.choose_name(&table.schema, &table.relation, Some(&def.name), "seq", true),
            );
            column.default = Some(format!("nextval('{}'::regclass)", regclass_text(&sequence_name)));
            column.nullable = false;

            let mut sequence = Sequence::with_defaults(sequence_name, &column.data_type, 1);
            sequence.owned_by = Some(name.clone());
            sequence.implicit = true;
            self.insert(SchemaObject::Sequence(sequence), at)?;
        }

        self.insert(SchemaObject::Column(column), at)
    }

    fn require_columns(&self, table: &CanonicalName, columns: &[String], at: Position) -> ReconcileResult<()> {
        match columns.iter().find(|c| self.graph.column(&table.column_of((*c).clone())).is_none()) {
            Some(missing) => Err(at.error(format!("column \"{}\" does not exist in {}", missing, table))),
            None => Ok(()),
        }
    }

    fn foreign_key(&self, columns: Vec<String>, references: References, at: Position) -> ReconcileResult<ForeignKey> {
        if !references.columns.is_empty() && references.columns.len() != columns.len() {
            return Err(at.error(
                "number of referencing and referenced columns for foreign key disagree",
            ));
        }
        Ok(ForeignKey {
            columns,
            referenced_table: self.referenced_name(&references.table),
            referenced_columns: references.columns,
            on_delete: references.on_delete,
            on_update: references.on_update,
            deferrable: references.timing.deferrable,
            initially_deferred: references.timing.initially_deferred,
        })
    }

    fn add_constraint(
        &mut self,
        table: &CanonicalName,
        constraint: TableConstraint,
        at: Position,
    ) -> ReconcileResult<()> {
        let definition = match constraint.kind {
            TableConstraintKind::PrimaryKey(columns) => {
                self.require_columns(table, &columns, at)?;
                if self.graph.primary_key_of(table).is_some() {
                    return Err(at.error(format!("multiple primary keys for table {} are not allowed", table)));
                }
                for column in &columns {
                    if let Some(SchemaObject::Column(c)) = self.graph.get_mut(&table.column_of(column.clone())) {
                        c.nullable = false;
                    }
                }
                ConstraintDef::PrimaryKey { columns }
            }
            TableConstraintKind::Unique(columns) => {
                self.require_columns(table, &columns, at)?;
                ConstraintDef::Unique { columns }
            }
            TableConstraintKind::Check(expression) => ConstraintDef::Check { expression },
            TableConstraintKind::ForeignKey { columns, references } => {
                self.require_columns(table, &columns, at)?;
                ConstraintDef::ForeignKey(self.foreign_key(columns, references, at)?)
            }
        };

        let name = match constraint.name {
            Some(name) => name,
            None => self.default_constraint_name(table, &definition),
        };
        self.insert(
            SchemaObject::Constraint(Constraint {
                name: CanonicalName::constraint(table.schema.clone(), table.relation.clone(), name),
                definition,
            }),
            at,
        )
    }

    fn default_constraint_name(&self, table: &CanonicalName, definition: &ConstraintDef) -> String {
        let (name2, label, index_backed) = match definition {
            ConstraintDef::PrimaryKey { .. } => (None, "pkey", true),
            ConstraintDef::Unique { columns } => (Some(columns.join("_")), "key", true),
            ConstraintDef::ForeignKey(fk) => (Some(fk.columns.join("_")), "fkey", false),
            ConstraintDef::Check { expression } => (self.sole_column(table, expression), "check", false),
        };
        self.choose_name(&table.schema, &table.relation, name2.as_deref(), label, index_backed)
    }

    /// The one column of `table` a check expression mentions, if exactly one
    fn sole_column(&self, table: &CanonicalName, expression: &str) -> Option<String> {
        let mentioned: BTreeSet<String> = lex(expression)
            .into_iter()
            .filter_map(|t| match t {
                Token::Word(w) | Token::Quoted(w) => Some(w),
                Token::Punct(_) | Token::Literal => None,
            })
            .filter(|w| self.graph.column(&table.column_of(w.clone())).is_some())
            .collect();
        if mentioned.len() == 1 {
            mentioned.into_iter().next()
        } else {
            None
        }
    }

    /// First free name of the form `name1_name2_label`, `..._label1`, ...
    fn choose_name(&self, schema: &str, name1: &str, name2: Option<&str>, label: &str, relation_level: bool) -> String {
        let mut pass = 0;
        loop {
            let suffix = if pass == 0 {
                label.to_string()
            } else {
                format!("{}{}", label, pass)
            };
            let candidate = make_object_name(name1, name2, &suffix);
            if !self.name_taken(schema, &candidate, relation_level) {
                return candidate;
            }
            pass += 1;
        }
    }

    fn name_taken(&self, schema: &str, candidate: &str, relation_level: bool) -> bool {
        let constraint_clash = self
            .graph
            .names()
            .any(|n| n.namespace == Namespace::Constraint && n.schema == schema && n.local() == candidate);
        constraint_clash || (relation_level && self.graph.contains(&CanonicalName::relation(schema, candidate)))
    }

    fn create_index(&mut self, index: IndexStatement, at: Position) -> ReconcileResult<()> {
        let table = self.declared_table(&index.table, at)?;
        let named_columns: Vec<Option<String>> = index.keys.iter().map(|k| plain_column(k)).collect();
        let plain: Vec<String> = named_columns.iter().flatten().cloned().collect();
        self.require_columns(&table, &plain, at)?;

        let name = match index.name {
            Some(name) => name,
            None => {
                let parts: Vec<String> = named_columns
                    .into_iter()
                    .map(|c| c.unwrap_or_else(|| "expr".to_string()))
                    .collect();
                self.choose_name(&table.schema, &table.relation, Some(&parts.join("_")), "idx", true)
            }
        };
        self.insert(
            SchemaObject::Index(Index {
                name: CanonicalName::relation(table.schema.clone(), name),
                table,
                unique: index.unique,
                method: index.method.unwrap_or_else(|| "btree".to_string()),
                keys: index.keys,
                predicate: index.predicate,
            }),
            at,
        )
    }

    fn create_sequence(
        &mut self,
        name: &QualifiedName,
        options: Vec<SequenceOption>,
        at: Position,
    ) -> ReconcileResult<()> {
        let name = self.defined_name(name, at)?;
        let mut data_type = "bigint".to_string();
        let mut increment = 1;
        let (mut min, mut max, mut start, mut cache, mut cycle) = (None, None, None, None, false);
        let mut owner = None;
        for option in options {
            match option {
                SequenceOption::DataType(t) => data_type = canonical_type(&t),
                SequenceOption::Increment(v) => increment = v,
                SequenceOption::MinValue(v) => min = v,
                SequenceOption::MaxValue(v) => max = v,
                SequenceOption::Start(v) => start = Some(v),
                SequenceOption::Cache(v) => cache = Some(v),
                SequenceOption::Cycle(v) => cycle = v,
                SequenceOption::OwnedBy(v) => owner = Some(v),
            }
        }
        if !matches!(data_type.as_str(), "smallint" | "integer" | "bigint") {
            return Err(at.error(format!("sequence type must be smallint, integer, or bigint, not {}", data_type)));
        }
        if increment == 0 {
            return Err(at.error("INCREMENT must not be zero"));
        }

        let mut sequence = Sequence::with_defaults(name.clone(), &data_type, increment);
        if let Some(min) = min {
            sequence.min_value = min;
        }
        if let Some(max) = max {
            sequence.max_value = max;
        }
        sequence.start = start.unwrap_or(if increment > 0 { sequence.min_value } else { sequence.max_value });
        sequence.cache = cache.unwrap_or(1);
        sequence.cycle = cycle;
        if sequence.min_value > sequence.max_value
            || sequence.start < sequence.min_value
            || sequence.start > sequence.max_value
        {
            return Err(at.error(format!("START value of sequence {} is out of range", name)));
        }

        self.insert(SchemaObject::Sequence(sequence), at)?;
        if let Some(owner) = owner {
            self.pending_owners.push((name, owner, at));
        }
        Ok(())
    }

    fn resolve_owners(&mut self) -> ReconcileResult<()> {
        for (sequence, owner, at) in std::mem::take(&mut self.pending_owners) {
            let owned_by = match owner {
                None => None,
                Some(column) => {
                    let schema = column.schema.unwrap_or_else(|| self.default_schema.clone());
                    if schema != sequence.schema {
                        return Err(at.error(format!(
                            "sequence {} must be in the same schema as the table it is linked to",
                            sequence
                        )));
                    }
                    let name = CanonicalName::column(schema, column.table, column.column);
                    if self.graph.column(&name).is_none() {
                        return Err(at.error(format!("OWNED BY refers to unknown column {}", name)));
                    }
                    Some(name)
                }
            };
            match self.graph.get_mut(&sequence) {
                Some(SchemaObject::Sequence(seq)) => seq.owned_by = owned_by,
                _ => return Err(at.error(format!("sequence {} is not declared", sequence))),
            }
        }
        Ok(())
    }

    /// `REFERENCES t` without columns points at t's primary key
    fn fill_referenced_columns(&mut self) {
        let fills: Vec<(CanonicalName, Vec<String>)> = self
            .graph
            .objects()
            .filter_map(|o| match o {
                SchemaObject::Constraint(c) => {
                    let fk = c.foreign_key().filter(|fk| fk.referenced_columns.is_empty())?;
                    let pk = self.graph.primary_key_of(&fk.referenced_table)?;
                    Some((c.name.clone(), pk.definition.columns().to_vec()))
                }
                _ => None,
            })
            .collect();
        for (name, columns) in fills {
            if let Some(SchemaObject::Constraint(Constraint {
                definition: ConstraintDef::ForeignKey(fk),
                ..
            })) = self.graph.get_mut(&name)
            {
                fk.referenced_columns = columns;
            }
        }
    }

    /// Drop view references that are not relations at all (`EXTRACT(... FROM col)`)
    fn prune_view_references(&mut self) {
        let views: Vec<CanonicalName> = self
            .graph
            .objects()
            .filter(|o| matches!(o, SchemaObject::View(_)))
            .map(|o| o.name().clone())
            .collect();
        for name in views {
            let keep: BTreeSet<CanonicalName> = match self.graph.get(&name) {
                Some(SchemaObject::View(view)) => view
                    .references
                    .iter()
                    .filter(|r| self.graph.contains(r) || !self.is_target_schema(&r.schema))
                    .cloned()
                    .collect(),
                _ => continue,
            };
            if let Some(SchemaObject::View(view)) = self.graph.get_mut(&name) {
                view.references = keep;
            }
        }
    }

    pub fn finish(mut self) -> ReconcileResult<SchemaGraph> {
        self.resolve_owners()?;
        self.graph.mark_implicit_sequences();
        self.fill_referenced_columns();
        self.prune_view_references();
        Ok(self.graph)
    }
}
