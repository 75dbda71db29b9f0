//! Canonical schema object model
//!
//! The declared schema and the live database are both reduced to a
//! [`SchemaGraph`]: an arena of [`SchemaObject`]s keyed by canonical name.
//! Dependencies are plain name references resolved by lookup, so foreign keys
//! and ownership links never form in-memory reference cycles.

pub mod normalize;

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Which PostgreSQL namespace a name lives in.
///
/// Tables, views, sequences and indexes share the relation namespace
/// (`pg_class`), which is what lets the differ notice a table and a view
/// fighting over one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Relation,
    Column,
    Constraint,
}

/// Schema-qualified, case-folded identifier of one object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalName {
    pub schema: String,
    pub relation: String,
    pub namespace: Namespace,
    pub member: Option<String>,
}

impl CanonicalName {
    pub fn relation(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            relation: name.into(),
            namespace: Namespace::Relation,
            member: None,
        }
    }

    pub fn column(schema: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            relation: table.into(),
            namespace: Namespace::Column,
            member: Some(column.into()),
        }
    }

    pub fn constraint(schema: impl Into<String>, table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            relation: table.into(),
            namespace: Namespace::Constraint,
            member: Some(name.into()),
        }
    }

    /// The relation this name belongs to (itself for relation-level names)
    pub fn parent(&self) -> CanonicalName {
        CanonicalName::relation(self.schema.clone(), self.relation.clone())
    }

    /// Column of the same relation
    pub fn column_of(&self, column: impl Into<String>) -> CanonicalName {
        CanonicalName::column(self.schema.clone(), self.relation.clone(), column)
    }

    /// Last path segment: the member name, or the relation name
    pub fn local(&self) -> &str {
        self.member.as_deref().unwrap_or(&self.relation)
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member {
            Some(member) => write!(f, "{}.{}.{}", self.schema, self.relation, member),
            None => write!(f, "{}.{}", self.schema, self.relation),
        }
    }
}

impl Serialize for CanonicalName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    Column,
    Index,
    Constraint,
    Sequence,
    View,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::Table => "table",
            ObjectKind::Column => "column",
            ObjectKind::Index => "index",
            ObjectKind::Constraint => "constraint",
            ObjectKind::Sequence => "sequence",
            ObjectKind::View => "view",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: CanonicalName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Always,
    ByDefault,
}

impl IdentityKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IdentityKind::Always => "ALWAYS",
            IdentityKind::ByDefault => "BY DEFAULT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: CanonicalName,
    /// Canonical type as `format_type` reports it
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub identity: Option<IdentityKind>,
    /// Ordinal position within the table; informational only
    pub position: usize,
}

impl Column {
    pub fn table(&self) -> CanonicalName {
        self.name.parent()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }

    /// Decode `pg_constraint.confdeltype` / `confupdtype`
    pub fn from_catalog(code: &str) -> Option<Self> {
        match code {
            "a" => Some(ReferentialAction::NoAction),
            "r" => Some(ReferentialAction::Restrict),
            "c" => Some(ReferentialAction::Cascade),
            "n" => Some(ReferentialAction::SetNull),
            "d" => Some(ReferentialAction::SetDefault),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub referenced_table: CanonicalName,
    /// Empty when declared as `REFERENCES t` and `t` is not part of the graph
    pub referenced_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
    pub deferrable: bool,
    pub initially_deferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ConstraintDef {
    PrimaryKey { columns: Vec<String> },
    Unique { columns: Vec<String> },
    Check { expression: String },
    ForeignKey(ForeignKey),
}

impl ConstraintDef {
    pub fn columns(&self) -> &[String] {
        match self {
            ConstraintDef::PrimaryKey { columns } | ConstraintDef::Unique { columns } => columns,
            ConstraintDef::ForeignKey(fk) => &fk.columns,
            ConstraintDef::Check { .. } => &[],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConstraintDef::PrimaryKey { .. } => "primary key",
            ConstraintDef::Unique { .. } => "unique",
            ConstraintDef::Check { .. } => "check",
            ConstraintDef::ForeignKey(_) => "foreign key",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub name: CanonicalName,
    pub definition: ConstraintDef,
}

impl Constraint {
    pub fn table(&self) -> CanonicalName {
        self.name.parent()
    }

    pub fn foreign_key(&self) -> Option<&ForeignKey> {
        match &self.definition {
            ConstraintDef::ForeignKey(fk) => Some(fk),
            _ => None,
        }
    }

    /// Foreign key pointing at a table other than its own
    pub fn is_cross_table_foreign_key(&self) -> bool {
        self.foreign_key()
            .is_some_and(|fk| fk.referenced_table != self.table())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub name: CanonicalName,
    pub table: CanonicalName,
    pub unique: bool,
    pub method: String,
    /// Key columns or expressions, as written
    pub keys: Vec<String>,
    pub predicate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    pub name: CanonicalName,
    pub data_type: String,
    pub start: i64,
    pub increment: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub cache: i64,
    pub cycle: bool,
    pub owned_by: Option<CanonicalName>,
    /// Created by a `serial` column rather than its own statement
    pub implicit: bool,
}

impl Sequence {
    /// Sequence with PostgreSQL's defaults for the given type and increment
    pub fn with_defaults(name: CanonicalName, data_type: &str, increment: i64) -> Self {
        let (type_min, type_max) = normalize::integer_bounds(data_type);
        let (min_value, max_value) = if increment < 0 { (type_min, -1) } else { (1, type_max) };
        Self {
            name,
            data_type: data_type.to_string(),
            start: if increment < 0 { max_value } else { min_value },
            increment,
            min_value,
            max_value,
            cache: 1,
            cycle: false,
            owned_by: None,
            implicit: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    pub name: CanonicalName,
    pub definition: String,
    /// Relations the query reads from
    pub references: BTreeSet<CanonicalName>,
}

/// One schema object, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SchemaObject {
    Table(Table),
    Column(Column),
    Index(Index),
    Constraint(Constraint),
    Sequence(Sequence),
    View(View),
}

impl SchemaObject {
    pub fn name(&self) -> &CanonicalName {
        match self {
            SchemaObject::Table(t) => &t.name,
            SchemaObject::Column(c) => &c.name,
            SchemaObject::Index(i) => &i.name,
            SchemaObject::Constraint(c) => &c.name,
            SchemaObject::Sequence(s) => &s.name,
            SchemaObject::View(v) => &v.name,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            SchemaObject::Table(_) => ObjectKind::Table,
            SchemaObject::Column(_) => ObjectKind::Column,
            SchemaObject::Index(_) => ObjectKind::Index,
            SchemaObject::Constraint(_) => ObjectKind::Constraint,
            SchemaObject::Sequence(_) => ObjectKind::Sequence,
            SchemaObject::View(_) => ObjectKind::View,
        }
    }

    /// Names this object requires to exist, derived from its own attributes
    pub fn references(&self) -> BTreeSet<CanonicalName> {
        let mut refs = BTreeSet::new();
        match self {
            SchemaObject::Table(_) => {}
            SchemaObject::Column(c) => {
                refs.insert(c.table());
                if let Some(default) = &c.default {
                    if let Some(seq) = normalize::nextval_target(default, &c.name.schema) {
                        refs.insert(seq);
                    }
                }
            }
            SchemaObject::Constraint(c) => {
                let table = c.table();
                for col in c.definition.columns() {
                    refs.insert(table.column_of(col.clone()));
                }
                if let ConstraintDef::ForeignKey(fk) = &c.definition {
                    refs.insert(fk.referenced_table.clone());
                    for col in &fk.referenced_columns {
                        refs.insert(fk.referenced_table.column_of(col.clone()));
                    }
                }
                refs.insert(table);
            }
            SchemaObject::Index(i) => {
                for key in &i.keys {
                    if let Some(col) = normalize::plain_column(key) {
                        refs.insert(i.table.column_of(col));
                    }
                }
                refs.insert(i.table.clone());
            }
            SchemaObject::Sequence(_) => {}
            SchemaObject::View(v) => {
                refs.extend(v.references.iter().cloned());
            }
        }
        refs.remove(self.name());
        refs
    }
}

/// Arena of schema objects keyed by canonical name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaGraph {
    objects: BTreeMap<CanonicalName, SchemaObject>,
}

impl SchemaGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object; returns the offending name when it is already taken
    pub fn insert(&mut self, object: SchemaObject) -> Result<(), CanonicalName> {
        use std::collections::btree_map::Entry;
        match self.objects.entry(object.name().clone()) {
            Entry::Occupied(e) => Err(e.key().clone()),
            Entry::Vacant(e) => {
                e.insert(object);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &CanonicalName) -> Option<&SchemaObject> {
        self.objects.get(name)
    }

    pub fn get_mut(&mut self, name: &CanonicalName) -> Option<&mut SchemaObject> {
        self.objects.get_mut(name)
    }

    pub fn contains(&self, name: &CanonicalName) -> bool {
        self.objects.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &CanonicalName> {
        self.objects.keys()
    }

    pub fn objects(&self) -> impl Iterator<Item = &SchemaObject> {
        self.objects.values()
    }

    pub fn table(&self, name: &CanonicalName) -> Option<&Table> {
        match self.objects.get(name) {
            Some(SchemaObject::Table(t)) => Some(t),
            _ => None,
        }
    }

    pub fn column(&self, name: &CanonicalName) -> Option<&Column> {
        match self.objects.get(name) {
            Some(SchemaObject::Column(c)) => Some(c),
            _ => None,
        }
    }

    pub fn sequence(&self, name: &CanonicalName) -> Option<&Sequence> {
        match self.objects.get(name) {
            Some(SchemaObject::Sequence(s)) => Some(s),
            _ => None,
        }
    }

    /// Columns of a table in ordinal order
    pub fn columns_of(&self, table: &CanonicalName) -> Vec<&Column> {
        let mut columns: Vec<&Column> = self
            .objects
            .values()
            .filter_map(|o| match o {
                SchemaObject::Column(c) if c.table() == *table => Some(c),
                _ => None,
            })
            .collect();
        columns.sort_by_key(|c| c.position);
        columns
    }

    pub fn constraints_of(&self, table: &CanonicalName) -> Vec<&Constraint> {
        self.objects
            .values()
            .filter_map(|o| match o {
                SchemaObject::Constraint(c) if c.table() == *table => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn indexes_of(&self, table: &CanonicalName) -> Vec<&Index> {
        self.objects
            .values()
            .filter_map(|o| match o {
                SchemaObject::Index(i) if i.table == *table => Some(i),
                _ => None,
            })
            .collect()
    }

    /// Sequences whose `OWNED BY` points at the given column
    pub fn sequences_owned_by(&self, column: &CanonicalName) -> Vec<&Sequence> {
        self.objects
            .values()
            .filter_map(|o| match o {
                SchemaObject::Sequence(s) if s.owned_by.as_ref() == Some(column) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Implicit (serial) sequence backing a column, if any
    pub fn serial_sequence_of(&self, column: &CanonicalName) -> Option<&Sequence> {
        self.sequences_owned_by(column)
            .into_iter()
            .find(|s| s.implicit)
    }

    pub fn primary_key_of(&self, table: &CanonicalName) -> Option<&Constraint> {
        self.constraints_of(table)
            .into_iter()
            .find(|c| matches!(c.definition, ConstraintDef::PrimaryKey { .. }))
    }

    /// Every name `name` depends on.
    ///
    /// Extends [`SchemaObject::references`] with what only the graph can
    /// resolve: the key constraint a foreign key relies on, and the columns
    /// named inside check expressions, index expressions and index predicates.
    pub fn dependencies(&self, name: &CanonicalName) -> BTreeSet<CanonicalName> {
        let Some(object) = self.objects.get(name) else {
            return BTreeSet::new();
        };
        let mut deps = object.references();
        match object {
            SchemaObject::Constraint(c) => {
                if let Some(fk) = c.foreign_key() {
                    if let Some(key) = self.referenced_key(fk) {
                        if key.name != c.name {
                            deps.insert(key.name.clone());
                        }
                    }
                }
                if let ConstraintDef::Check { expression } = &c.definition {
                    deps.extend(self.expression_columns(&c.table(), [expression.as_str()]));
                }
            }
            SchemaObject::Index(i) => {
                let expressions = i
                    .keys
                    .iter()
                    .filter(|k| normalize::plain_column(k).is_none())
                    .chain(i.predicate.iter())
                    .map(String::as_str);
                deps.extend(self.expression_columns(&i.table, expressions));
            }
            _ => {}
        }
        deps
    }

    /// Columns of `table` mentioned in free-form expressions
    fn expression_columns<'e>(
        &self,
        table: &CanonicalName,
        expressions: impl IntoIterator<Item = &'e str>,
    ) -> BTreeSet<CanonicalName> {
        expressions
            .into_iter()
            .flat_map(normalize::expression_identifiers)
            .map(|ident| table.column_of(ident))
            .filter(|name| self.column(name).is_some())
            .collect()
    }

    /// The primary key or unique constraint a foreign key points at
    pub fn referenced_key(&self, fk: &ForeignKey) -> Option<&Constraint> {
        let wanted: BTreeSet<&String> = fk.referenced_columns.iter().collect();
        self.constraints_of(&fk.referenced_table)
            .into_iter()
            .find(|c| match &c.definition {
                ConstraintDef::PrimaryKey { columns } | ConstraintDef::Unique { columns } => {
                    columns.iter().collect::<BTreeSet<_>>() == wanted
                }
                _ => false,
            })
    }

    /// Flag owned sequences that are indistinguishable from a `serial`
    /// expansion: default options for the owner's type, and the owner's
    /// default draws from them.
    pub fn mark_implicit_sequences(&mut self) {
        let implicit: Vec<CanonicalName> = self
            .objects
            .values()
            .filter_map(|o| match o {
                SchemaObject::Sequence(seq) if !seq.implicit => {
                    let owner = self.column(seq.owned_by.as_ref()?)?;
                    let feeds = owner
                        .default
                        .as_deref()
                        .and_then(|d| normalize::nextval_target(d, &owner.name.schema))
                        .is_some_and(|target| target == seq.name);
                    let mut expected = Sequence::with_defaults(seq.name.clone(), &owner.data_type, 1);
                    expected.owned_by = seq.owned_by.clone();
                    (feeds && *seq == expected).then(|| seq.name.clone())
                }
                _ => None,
            })
            .collect();
        for name in implicit {
            if let Some(SchemaObject::Sequence(seq)) = self.objects.get_mut(&name) {
                seq.implicit = true;
            }
        }
    }

    /// Objects in this graph that depend on `name`
    pub fn dependents(&self, name: &CanonicalName) -> Vec<CanonicalName> {
        self.objects
            .keys()
            .filter(|other| *other != name && self.dependencies(other).contains(name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn users_graph() -> SchemaGraph {
        let mut graph = SchemaGraph::new();
        let users = CanonicalName::relation("public", "users");
        graph.insert(SchemaObject::Table(Table { name: users.clone() })).unwrap();
        graph
            .insert(SchemaObject::Column(Column {
                name: users.column_of("id"),
                data_type: "integer".to_string(),
                nullable: false,
                default: Some("nextval('users_id_seq'::regclass)".to_string()),
                identity: None,
                position: 1,
            }))
            .unwrap();
        graph
            .insert(SchemaObject::Constraint(Constraint {
                name: CanonicalName::constraint("public", "users", "users_pkey"),
                definition: ConstraintDef::PrimaryKey { columns: vec!["id".to_string()] },
            }))
            .unwrap();
        graph
    }

    #[test]
    fn test_canonical_name_display() {
        assert_eq!(CanonicalName::relation("public", "users").to_string(), "public.users");
        assert_eq!(CanonicalName::column("public", "users", "email").to_string(), "public.users.email");
    }

    #[test]
    fn test_relation_namespace_is_shared() {
        let mut graph = users_graph();
        let clash = SchemaObject::View(View {
            name: CanonicalName::relation("public", "users"),
            definition: "SELECT 1".to_string(),
            references: BTreeSet::new(),
        });
        assert_eq!(graph.insert(clash), Err(CanonicalName::relation("public", "users")));
    }

    #[test]
    fn test_column_depends_on_table_and_sequence() {
        let graph = users_graph();
        let deps = graph.dependencies(&CanonicalName::column("public", "users", "id"));
        assert!(deps.contains(&CanonicalName::relation("public", "users")));
        assert!(deps.contains(&CanonicalName::relation("public", "users_id_seq")));
    }

    #[test]
    fn test_foreign_key_depends_on_referenced_key() {
        let mut graph = users_graph();
        graph
            .insert(SchemaObject::Table(Table { name: CanonicalName::relation("public", "orders") }))
            .unwrap();
        let fk = CanonicalName::constraint("public", "orders", "orders_user_id_fkey");
        graph
            .insert(SchemaObject::Constraint(Constraint {
                name: fk.clone(),
                definition: ConstraintDef::ForeignKey(ForeignKey {
                    columns: vec!["user_id".to_string()],
                    referenced_table: CanonicalName::relation("public", "users"),
                    referenced_columns: vec!["id".to_string()],
                    on_delete: ReferentialAction::NoAction,
                    on_update: ReferentialAction::NoAction,
                    deferrable: false,
                    initially_deferred: false,
                }),
            }))
            .unwrap();

        let deps = graph.dependencies(&fk);
        assert!(deps.contains(&CanonicalName::relation("public", "users")));
        assert!(deps.contains(&CanonicalName::constraint("public", "users", "users_pkey")));
        assert!(deps.contains(&CanonicalName::column("public", "orders", "user_id")));
        assert_eq!(
            graph.dependents(&CanonicalName::constraint("public", "users", "users_pkey")),
            vec![fk]
        );
    }

    #[test]
    fn test_expressions_depend_on_their_columns() {
        let mut graph = users_graph();
        let users = CanonicalName::relation("public", "users");
        graph
            .insert(SchemaObject::Column(Column {
                name: users.column_of("email"),
                data_type: "text".to_string(),
                nullable: true,
                default: None,
                identity: None,
                position: 2,
            }))
            .unwrap();
        let check = CanonicalName::constraint("public", "users", "users_id_check");
        graph
            .insert(SchemaObject::Constraint(Constraint {
                name: check.clone(),
                definition: ConstraintDef::Check { expression: "id > 0".to_string() },
            }))
            .unwrap();
        let index = CanonicalName::relation("public", "users_email_lower_idx");
        graph
            .insert(SchemaObject::Index(Index {
                name: index.clone(),
                table: users.clone(),
                unique: true,
                method: "btree".to_string(),
                keys: vec!["lower(email)".to_string()],
                predicate: Some("id > 100".to_string()),
            }))
            .unwrap();

        let deps = graph.dependencies(&check);
        assert!(deps.contains(&users.column_of("id")));
        assert!(!deps.contains(&users.column_of("email")));

        let deps = graph.dependencies(&index);
        assert!(deps.contains(&users.column_of("email")));
        assert!(deps.contains(&users.column_of("id")));
        assert!(!deps.contains(&users.column_of("lower")));
        assert_eq!(graph.dependents(&users.column_of("email")), vec![index]);
    }

    #[test]
    fn test_sequence_defaults_follow_type() {
        let seq = Sequence::with_defaults(CanonicalName::relation("public", "s"), "integer", 1);
        assert_eq!((seq.min_value, seq.max_value, seq.start), (1, 2147483647, 1));
        let desc = Sequence::with_defaults(CanonicalName::relation("public", "d"), "bigint", -1);
        assert_eq!((desc.min_value, desc.max_value, desc.start), (i64::MIN, -1, -1));
    }
}
