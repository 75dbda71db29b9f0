//! Dependency Planner
//!
//! Expands change entries into DDL [`Operation`]s and orders them so that
//! every statement runs after the objects it needs exist and before the
//! objects it still needs go away.
//!
//! Ordering is a Kahn topological sort over a DAG whose nodes are
//! operations. Ties are broken by change class (drop, modify, add), then by
//! object kind, then by name, so the same inputs always give the same plan.

use crate::diff::{ChangeClass, ChangeEntry, DiffEngine};
use crate::error::{ReconcileError, ReconcileResult};
use crate::model::normalize::{classify_type_change, normalize_expr, serial_alias, TypeChange};
use crate::model::{CanonicalName, Column, Namespace, ObjectKind, SchemaGraph, SchemaObject, Sequence};
use crate::safety::{Finding, SafetyClassifier, Severity};
use crate::sqlgen::{quote_ident, Step};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use tracing::debug;

/// What the zero-downtime rewriter needs to split a narrowing or
/// incompatible column type change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitColumn {
    /// No index, constraint, view, sequence or identity relies on the column,
    /// including through check, index and predicate expressions
    pub splittable: bool,
    pub nullable: bool,
    pub default: Option<String>,
}

/// One executable statement in a migration plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// 1-based position in the plan
    pub rank: usize,
    pub change: ChangeClass,
    pub kind: ObjectKind,
    pub target: CanonicalName,
    pub step: Step,
    pub sql: String,
    /// Names that must exist when the statement runs
    pub depends_on: BTreeSet<CanonicalName>,
    /// Ranks of earlier operations this one is ordered after
    pub after: Vec<usize>,
    pub destructive: bool,
    pub findings: Vec<Finding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split: Option<SplitColumn>,
}

impl Operation {
    pub fn new(change: ChangeClass, kind: ObjectKind, target: CanonicalName, step: Step) -> Self {
        let sql = step.to_sql();
        Self {
            rank: 0,
            change,
            kind,
            target,
            step,
            sql,
            depends_on: BTreeSet::new(),
            after: Vec::new(),
            destructive: false,
            findings: Vec::new(),
            split: None,
        }
    }

    /// One-line description, e.g. `add table public.users`
    pub fn summary(&self) -> String {
        let verb = match self.change {
            ChangeClass::Add => "add",
            ChangeClass::Drop => "drop",
            ChangeClass::Modify => "modify",
        };
        format!("{} {} {}", verb, self.kind, self.target)
    }

    /// Message of the first blocking finding
    pub fn destructive_reason(&self) -> Option<&str> {
        self.findings
            .iter()
            .find(|f| f.severity == Severity::Block)
            .map(|f| f.message.as_str())
    }
}

fn kind_order(class: ChangeClass, kind: ObjectKind) -> u8 {
    match class {
        ChangeClass::Drop => match kind {
            ObjectKind::View => 0,
            ObjectKind::Index => 1,
            ObjectKind::Constraint => 2,
            ObjectKind::Column => 3,
            ObjectKind::Table => 4,
            ObjectKind::Sequence => 5,
        },
        ChangeClass::Modify | ChangeClass::Add => match kind {
            ObjectKind::Sequence => 0,
            ObjectKind::Table => 1,
            ObjectKind::Column => 2,
            ObjectKind::Constraint => 3,
            ObjectKind::Index => 4,
            ObjectKind::View => 5,
        },
    }
}

/// Whether a column type change can be rewritten as add/backfill/swap
fn column_is_splittable(desired: &SchemaGraph, live: &SchemaGraph, old: &Column, new: &Column) -> bool {
    let relied_on = |graph: &SchemaGraph| {
        !graph.dependents(&old.name).is_empty()
            || !graph.sequences_owned_by(&old.name).is_empty()
            || graph.objects().any(|o| match o {
                SchemaObject::View(v) => v.references.contains(&old.table()),
                _ => false,
            })
    };
    old.identity.is_none() && new.identity.is_none() && !relied_on(desired) && !relied_on(live)
}

fn same_default(a: Option<&str>, b: Option<&str>) -> bool {
    a.map(normalize_expr) == b.map(normalize_expr)
}

fn sequence_options_differ(old: &Sequence, new: &Sequence) -> bool {
    old.data_type != new.data_type
        || old.start != new.start
        || old.increment != new.increment
        || old.min_value != new.min_value
        || old.max_value != new.max_value
        || old.cache != new.cache
        || old.cycle != new.cycle
}

/// The dependency planner that orders change entries into operations
pub struct DependencyPlanner<'a> {
    desired: &'a SchemaGraph,
    live: &'a SchemaGraph,
    operations: Vec<Operation>,
    /// Operation that brings a name into its desired shape
    provider: BTreeMap<CanonicalName, usize>,
    /// Operation that removes a name (or its old shape)
    remover: BTreeMap<CanonicalName, usize>,
    /// First operation of a column's modification chain
    modifier: BTreeMap<CanonicalName, usize>,
    /// Removal operations and the live names the removed objects relied on
    teardown: Vec<(usize, BTreeSet<CanonicalName>)>,
    /// Modifications and the live names the old shape relied on
    retire: Vec<(usize, BTreeSet<CanonicalName>)>,
    edges: BTreeSet<(usize, usize)>,
}

impl<'a> DependencyPlanner<'a> {
    /// Turn a change set into ordered, classified operations
    pub fn plan(
        changes: &[ChangeEntry],
        desired: &'a SchemaGraph,
        live: &'a SchemaGraph,
    ) -> ReconcileResult<Vec<Operation>> {
        let mut planner = DependencyPlanner {
            desired,
            live,
            operations: Vec::new(),
            provider: BTreeMap::new(),
            remover: BTreeMap::new(),
            modifier: BTreeMap::new(),
            teardown: Vec::new(),
            retire: Vec::new(),
            edges: BTreeSet::new(),
        };
        planner.expand(changes);
        planner.link();
        let mut operations = planner.sort()?;
        SafetyClassifier::new().annotate(&mut operations, desired, live);

        debug!(
            "Planned {} operations from {} changes",
            operations.len(),
            changes.len()
        );
        Ok(operations)
    }

    fn push(&mut self, op: Operation) -> usize {
        self.operations.push(op);
        self.operations.len() - 1
    }

    fn chain(&mut self, ops: &[usize]) {
        for pair in ops.windows(2) {
            self.edges.insert((pair[0], pair[1]));
        }
    }

    fn expand(&mut self, changes: &[ChangeEntry]) {
        let added: BTreeSet<&CanonicalName> = changes
            .iter()
            .filter(|c| c.class() == ChangeClass::Add)
            .map(|c| c.name())
            .collect();
        let dropped: BTreeSet<&CanonicalName> = changes
            .iter()
            .filter(|c| c.class() == ChangeClass::Drop)
            .map(|c| c.name())
            .collect();
        let is_added_table = |name: &CanonicalName| {
            added.contains(name) && self.desired.table(name).is_some()
        };
        let is_dropped_table = |name: &CanonicalName| {
            dropped.contains(name) && self.live.table(name).is_some()
        };

        let mut absorbed: BTreeSet<CanonicalName> = BTreeSet::new();
        for change in changes {
            match change {
                ChangeEntry::Add { object } => match object {
                    SchemaObject::Column(c) if is_added_table(&c.table()) => {
                        absorbed.insert(c.name.clone());
                    }
                    SchemaObject::Constraint(k) if is_added_table(&k.table()) => {
                        let deferred_link = k
                            .foreign_key()
                            .is_some_and(|fk| fk.deferrable && k.is_cross_table_foreign_key());
                        if !deferred_link {
                            absorbed.insert(k.name.clone());
                        }
                    }
                    SchemaObject::Sequence(s) if s.implicit => {
                        let owner_added = s.owned_by.as_ref().is_some_and(|o| {
                            added.contains(o)
                                && self
                                    .desired
                                    .column(o)
                                    .is_some_and(|c| serial_alias(&c.data_type).is_some())
                        });
                        if owner_added {
                            absorbed.insert(s.name.clone());
                        }
                    }
                    _ => {}
                },
                ChangeEntry::Drop { object } => match object {
                    SchemaObject::Column(c) if is_dropped_table(&c.table()) => {
                        absorbed.insert(c.name.clone());
                    }
                    SchemaObject::Constraint(k) if is_dropped_table(&k.table()) => {
                        if !k.is_cross_table_foreign_key() {
                            absorbed.insert(k.name.clone());
                        }
                    }
                    SchemaObject::Index(i) if is_dropped_table(&i.table) => {
                        absorbed.insert(i.name.clone());
                    }
                    SchemaObject::Sequence(s) => {
                        let owner_gone = s
                            .owned_by
                            .as_ref()
                            .is_some_and(|o| dropped.contains(o) || is_dropped_table(&o.parent()));
                        if owner_gone {
                            absorbed.insert(s.name.clone());
                        }
                    }
                    _ => {}
                },
                ChangeEntry::Modify { .. } => {}
            }
        }

        for change in changes {
            if absorbed.contains(change.name()) {
                continue;
            }
            match change {
                ChangeEntry::Add { object } => self.expand_add(object, &absorbed),
                ChangeEntry::Drop { object } => self.expand_drop(object, &absorbed),
                ChangeEntry::Modify { old, new } => self.expand_modify(old, new),
            }
        }
    }

    /// Implicit sequence absorbed into a column's serial alias
    fn absorbed_serial(&self, column: &Column, absorbed: &BTreeSet<CanonicalName>) -> Option<CanonicalName> {
        self.desired
            .serial_sequence_of(&column.name)
            .filter(|s| absorbed.contains(&s.name))
            .map(|s| s.name.clone())
    }

    fn expand_add(&mut self, object: &SchemaObject, absorbed: &BTreeSet<CanonicalName>) {
        let name = object.name().clone();
        let kind = object.kind();
        match object {
            SchemaObject::Table(table) => {
                let columns: Vec<Column> = self.desired.columns_of(&table.name).into_iter().cloned().collect();
                let constraints: Vec<_> = self
                    .desired
                    .constraints_of(&table.name)
                    .into_iter()
                    .filter(|k| absorbed.contains(&k.name))
                    .cloned()
                    .collect();

                let mut members: BTreeSet<CanonicalName> = BTreeSet::new();
                members.insert(name.clone());
                let mut serial_columns = Vec::new();
                for column in &columns {
                    members.insert(column.name.clone());
                    if let Some(seq) = self.absorbed_serial(column, absorbed) {
                        members.insert(seq);
                        serial_columns.push(column.name.local().to_string());
                    }
                }
                members.extend(constraints.iter().map(|k| k.name.clone()));

                let mut op = Operation::new(
                    ChangeClass::Add,
                    kind,
                    name,
                    Step::CreateTable {
                        table: table.name.clone(),
                        columns,
                        serial_columns,
                        constraints,
                    },
                );
                op.depends_on = members
                    .iter()
                    .flat_map(|m| self.desired.dependencies(m))
                    .filter(|d| !members.contains(d))
                    .collect();
                let index = self.push(op);
                for member in members {
                    self.provider.insert(member, index);
                }
            }
            SchemaObject::Column(column) => {
                let serial = self.absorbed_serial(column, absorbed);
                let mut op = Operation::new(
                    ChangeClass::Add,
                    kind,
                    name.clone(),
                    Step::AddColumn {
                        column: column.clone(),
                        serial: serial.is_some(),
                    },
                );
                op.depends_on = self.desired.dependencies(&name);
                if let Some(seq) = &serial {
                    op.depends_on.remove(seq);
                }
                let index = self.push(op);
                self.provider.insert(name, index);
                if let Some(seq) = serial {
                    self.provider.insert(seq, index);
                }
            }
            SchemaObject::Sequence(sequence) => {
                let create = self.push(Operation::new(
                    ChangeClass::Add,
                    kind,
                    name.clone(),
                    Step::CreateSequence {
                        sequence: sequence.clone(),
                    },
                ));
                self.provider.insert(name.clone(), create);
                if let Some(owner) = &sequence.owned_by {
                    let mut op = Operation::new(
                        ChangeClass::Add,
                        kind,
                        name.clone(),
                        Step::SetSequenceOwner {
                            sequence: name.clone(),
                            owner: Some(owner.clone()),
                        },
                    );
                    op.depends_on = BTreeSet::from([name, owner.clone()]);
                    let own = self.push(op);
                    self.chain(&[create, own]);
                }
            }
            SchemaObject::Constraint(k) => self.push_create(name, kind, Step::AddConstraint { constraint: k.clone() }),
            SchemaObject::Index(i) => self.push_create(name, kind, Step::CreateIndex { index: i.clone() }),
            SchemaObject::View(v) => self.push_create(name, kind, Step::CreateView { view: v.clone() }),
        }
    }

    fn push_create(&mut self, name: CanonicalName, kind: ObjectKind, step: Step) {
        let mut op = Operation::new(ChangeClass::Add, kind, name.clone(), step);
        op.depends_on = self.desired.dependencies(&name);
        let index = self.push(op);
        self.provider.insert(name, index);
    }

    /// Drop the old shape of a constraint or index, then create the new one
    fn push_rebuild(&mut self, old: &SchemaObject, name: CanonicalName, kind: ObjectKind, step: Step) {
        let needs_old = self.live.dependencies(&name);
        let mut drop = Operation::new(ChangeClass::Modify, kind, name.clone(), Self::drop_step(old));
        drop.depends_on = needs_old.clone();
        let drop = self.push(drop);
        self.teardown.push((drop, needs_old));
        self.remover.insert(name.clone(), drop);

        let mut create = Operation::new(ChangeClass::Modify, kind, name.clone(), step);
        create.depends_on = self.desired.dependencies(&name);
        let create = self.push(create);
        self.chain(&[drop, create]);
        self.provider.insert(name, create);
    }

    fn drop_step(object: &SchemaObject) -> Step {
        let name = object.name().clone();
        match object {
            SchemaObject::Table(_) => Step::DropTable { table: name },
            SchemaObject::Column(_) => Step::DropColumn { column: name },
            SchemaObject::Constraint(_) => Step::DropConstraint { constraint: name },
            SchemaObject::Index(_) => Step::DropIndex { index: name },
            SchemaObject::Sequence(_) => Step::DropSequence { sequence: name },
            SchemaObject::View(_) => Step::DropView { view: name },
        }
    }

    fn expand_drop(&mut self, object: &SchemaObject, absorbed: &BTreeSet<CanonicalName>) {
        let name = object.name().clone();
        let mut members: BTreeSet<CanonicalName> = BTreeSet::from([name.clone()]);
        if let SchemaObject::Table(table) = object {
            members.extend(
                self.live
                    .names()
                    .filter(|n| absorbed.contains(*n) && n.parent() == table.name && **n != table.name)
                    .cloned(),
            );
            members.extend(
                self.live
                    .objects()
                    .filter_map(|o| match o {
                        SchemaObject::Index(i) if i.table == table.name && absorbed.contains(&i.name) => {
                            Some(i.name.clone())
                        }
                        _ => None,
                    }),
            );
        }
        let owned: Vec<CanonicalName> = members
            .iter()
            .filter(|m| m.namespace == Namespace::Column)
            .flat_map(|m| self.live.sequences_owned_by(m))
            .map(|s| s.name.clone())
            .filter(|s| absorbed.contains(s))
            .collect();
        members.extend(owned);

        let mut op = Operation::new(ChangeClass::Drop, object.kind(), name, Self::drop_step(object));
        let needs: BTreeSet<CanonicalName> = members
            .iter()
            .flat_map(|m| self.live.dependencies(m))
            .filter(|d| !members.contains(d))
            .collect();
        op.depends_on = needs.clone();
        let index = self.push(op);
        for member in members {
            self.remover.insert(member, index);
        }
        self.teardown.push((index, needs));
    }

    fn expand_modify(&mut self, old: &SchemaObject, new: &SchemaObject) {
        let name = new.name().clone();
        let kind = new.kind();
        let needs_new = self.desired.dependencies(&name);
        let needs_old = self.live.dependencies(&name);

        match (old, new) {
            (SchemaObject::Column(old), SchemaObject::Column(new)) => {
                let mut steps = Vec::new();
                let default_changed = !same_default(old.default.as_deref(), new.default.as_deref());
                if old.identity.is_some() && new.identity.is_none() {
                    steps.push(Step::DropIdentity { column: name.clone() });
                }
                if default_changed && old.default.is_some() {
                    steps.push(Step::DropDefault { column: name.clone() });
                }
                let type_change = old.data_type != new.data_type;
                if type_change {
                    steps.push(Step::AlterColumnType {
                        column: name.clone(),
                        data_type: new.data_type.clone(),
                        using: Some(format!("{}::{}", quote_ident(name.local()), new.data_type)),
                    });
                }
                if old.nullable && !new.nullable {
                    steps.push(Step::SetNotNull { column: name.clone() });
                } else if !old.nullable && new.nullable {
                    steps.push(Step::DropNotNull { column: name.clone() });
                }
                if default_changed {
                    if let Some(expression) = &new.default {
                        steps.push(Step::SetDefault {
                            column: name.clone(),
                            expression: expression.clone(),
                        });
                    }
                }
                match (old.identity, new.identity) {
                    (None, Some(kind)) => steps.push(Step::AddIdentity { column: name.clone(), kind }),
                    (Some(a), Some(b)) if a != b => steps.push(Step::SetIdentity { column: name.clone(), kind: b }),
                    _ => {}
                }

                // Widening changes keep every value and run in place
                let rewrites_values = type_change
                    && matches!(
                        classify_type_change(&old.data_type, &new.data_type),
                        TypeChange::Narrowing | TypeChange::Incompatible
                    );
                let split = rewrites_values.then(|| SplitColumn {
                    splittable: column_is_splittable(self.desired, self.live, old, new),
                    nullable: new.nullable,
                    default: new.default.clone(),
                });
                let mut indices = Vec::new();
                for step in steps {
                    let is_type_change = matches!(step, Step::AlterColumnType { .. });
                    let mut op = Operation::new(ChangeClass::Modify, kind, name.clone(), step);
                    op.depends_on = needs_new.clone();
                    if is_type_change {
                        op.split = split.clone();
                    }
                    let index = self.push(op);
                    self.retire.push((index, needs_old.clone()));
                    indices.push(index);
                }
                self.chain(&indices);
                if let (Some(&first), Some(&last)) = (indices.first(), indices.last()) {
                    self.modifier.insert(name.clone(), first);
                    self.provider.insert(name, last);
                }
            }
            (SchemaObject::Sequence(old), SchemaObject::Sequence(new)) => {
                let mut indices = Vec::new();
                if sequence_options_differ(old, new) {
                    indices.push(self.push(Operation::new(
                        ChangeClass::Modify,
                        kind,
                        name.clone(),
                        Step::AlterSequence { sequence: new.clone() },
                    )));
                }
                if old.owned_by != new.owned_by {
                    let mut op = Operation::new(
                        ChangeClass::Modify,
                        kind,
                        name.clone(),
                        Step::SetSequenceOwner {
                            sequence: name.clone(),
                            owner: new.owned_by.clone(),
                        },
                    );
                    op.depends_on.extend(new.owned_by.iter().cloned());
                    indices.push(self.push(op));
                }
                // The old owner takes the sequence down with it unless the
                // ownership moves first
                let released: BTreeSet<CanonicalName> = old.owned_by.iter().cloned().collect();
                for &index in &indices {
                    self.retire.push((index, released.clone()));
                }
                self.chain(&indices);
                if let Some(&first) = indices.first() {
                    self.provider.insert(name, first);
                }
            }
            (SchemaObject::View(_), SchemaObject::View(view)) => {
                let mut op = Operation::new(
                    ChangeClass::Modify,
                    kind,
                    name.clone(),
                    Step::ReplaceView { view: view.clone() },
                );
                op.depends_on = needs_new;
                let index = self.push(op);
                self.retire.push((index, needs_old));
                self.provider.insert(name, index);
            }
            (SchemaObject::Constraint(_), SchemaObject::Constraint(k)) => {
                self.push_rebuild(old, name, kind, Step::AddConstraint { constraint: k.clone() })
            }
            (SchemaObject::Index(_), SchemaObject::Index(i)) => {
                self.push_rebuild(old, name, kind, Step::CreateIndex { index: i.clone() })
            }
            // Tables compare equal once their names match
            _ => {}
        }
    }

    fn link(&mut self) {
        let mut edges = Vec::new();
        for (index, op) in self.operations.iter().enumerate() {
            for dep in &op.depends_on {
                if let Some(&from) = self.provider.get(dep) {
                    edges.push((from, index));
                }
            }
        }
        for (index, needs) in &self.teardown {
            for dep in needs {
                if let Some(&to) = self.remover.get(dep) {
                    edges.push((*index, to));
                }
                if let Some(&to) = self.modifier.get(dep) {
                    edges.push((*index, to));
                }
            }
        }
        for (index, needs) in &self.retire {
            for dep in needs {
                if let Some(&to) = self.remover.get(dep) {
                    edges.push((*index, to));
                }
            }
        }
        for (name, &removal) in &self.remover {
            if let Some(&creation) = self.provider.get(name) {
                edges.push((removal, creation));
            }
        }
        self.edges.extend(edges.into_iter().filter(|(from, to)| from != to));
    }

    fn sort(self) -> ReconcileResult<Vec<Operation>> {
        let count = self.operations.len();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); count];
        for &(from, to) in &self.edges {
            successors[from].push(to);
            predecessors[to].push(from);
        }
        let mut indegree: Vec<usize> = predecessors.iter().map(Vec::len).collect();

        let key = |index: usize| {
            let op = &self.operations[index];
            Reverse((op.change, kind_order(op.change, op.kind), op.target.clone(), index))
        };
        let mut ready: BinaryHeap<_> = (0..count).filter(|&i| indegree[i] == 0).map(key).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(Reverse((_, _, _, index))) = ready.pop() {
            order.push(index);
            for &next in &successors[index] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(key(next));
                }
            }
        }

        if order.len() < count {
            let emitted: BTreeSet<usize> = order.iter().copied().collect();
            let cycle = Self::find_cycle(&predecessors, &emitted, count)
                .into_iter()
                .map(|i| self.operations[i].target.to_string())
                .fold(Vec::<String>::new(), |mut acc, name| {
                    if !acc.contains(&name) {
                        acc.push(name);
                    }
                    acc
                });
            return Err(ReconcileError::CircularDependency { cycle });
        }

        let mut rank_of = vec![0; count];
        for (position, &index) in order.iter().enumerate() {
            rank_of[index] = position + 1;
        }
        let mut slots: Vec<Option<Operation>> = self.operations.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(count);
        for &index in &order {
            if let Some(mut op) = slots[index].take() {
                op.rank = rank_of[index];
                let mut after: Vec<usize> = predecessors[index].iter().map(|&p| rank_of[p]).collect();
                after.sort_unstable();
                op.after = after;
                ordered.push(op);
            }
        }
        Ok(ordered)
    }

    /// Walk predecessors among the unsorted operations until one repeats
    fn find_cycle(predecessors: &[Vec<usize>], emitted: &BTreeSet<usize>, count: usize) -> Vec<usize> {
        let Some(start) = (0..count).find(|i| !emitted.contains(i)) else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut current = start;
        loop {
            let Some(&previous) = predecessors[current].iter().find(|p| !emitted.contains(*p)) else {
                return path;
            };
            if let Some(position) = path.iter().position(|&p| p == previous) {
                let mut cycle = path.split_off(position);
                cycle.reverse();
                return cycle;
            }
            path.push(previous);
            current = previous;
        }
    }
}

/// Diff two graphs and plan the result in one call
pub fn plan_changes(desired: &SchemaGraph, live: &SchemaGraph) -> ReconcileResult<Vec<Operation>> {
    let changes = DiffEngine::diff(desired, live)?;
    DependencyPlanner::plan(&changes, desired, live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_schema;
    use pretty_assertions::assert_eq;

    fn graph(sql: &str) -> SchemaGraph {
        parse_schema(sql, "public").unwrap()
    }

    fn plan(desired: &str, live: &str) -> Vec<Operation> {
        plan_changes(&graph(desired), &graph(live)).unwrap()
    }

    fn rank_of(ops: &[Operation], needle: &str) -> usize {
        ops.iter()
            .find(|op| op.sql.contains(needle))
            .unwrap_or_else(|| panic!("no operation containing {}", needle))
            .rank
    }

    #[test]
    fn test_new_table_is_one_operation() {
        let ops = plan("CREATE TABLE users (id bigint PRIMARY KEY, email text NOT NULL);", "");
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].summary(), "add table public.users");
        assert!(!ops[0].destructive);
        assert_eq!(
            ops[0].sql,
            "CREATE TABLE \"public\".\"users\" (\n    \"id\" bigint NOT NULL,\n    \"email\" text NOT NULL,\n    CONSTRAINT \"users_pkey\" PRIMARY KEY (\"id\")\n)"
        );
    }

    #[test]
    fn test_serial_column_is_absorbed() {
        let ops = plan("CREATE TABLE users (id serial PRIMARY KEY);", "");
        assert_eq!(ops.len(), 1);
        assert!(ops[0].sql.contains("\"id\" serial NOT NULL"));

        let ops = plan(
            "CREATE TABLE users (id bigint); ALTER TABLE users ADD CONSTRAINT users_pkey PRIMARY KEY (id);
             CREATE TABLE t (a int, b bigserial);",
            "CREATE TABLE users (id bigint); ALTER TABLE users ADD CONSTRAINT users_pkey PRIMARY KEY (id);
             CREATE TABLE t (a int);",
        );
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].sql, "ALTER TABLE \"public\".\"t\" ADD COLUMN \"b\" bigserial NOT NULL");
    }

    #[test]
    fn test_referenced_table_is_created_first() {
        let ops = plan(
            "CREATE TABLE a (id int PRIMARY KEY, b_id int REFERENCES b (id));
             CREATE TABLE b (id int PRIMARY KEY);",
            "",
        );
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].target.to_string(), "public.b");
        assert_eq!(ops[1].target.to_string(), "public.a");
        assert_eq!(ops[1].after, vec![1]);
    }

    #[test]
    fn test_mutual_foreign_keys_are_a_cycle() {
        let desired = graph(
            "CREATE TABLE a (id int PRIMARY KEY, b_id int REFERENCES b (id));
             CREATE TABLE b (id int PRIMARY KEY, a_id int REFERENCES a (id));",
        );
        let err = plan_changes(&desired, &SchemaGraph::new()).unwrap_err();
        match err {
            ReconcileError::CircularDependency { cycle } => {
                let mut sorted = cycle.clone();
                sorted.sort();
                assert_eq!(sorted, vec!["public.a".to_string(), "public.b".to_string()]);
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_deferrable_foreign_keys_break_the_cycle() {
        let ops = plan(
            "CREATE TABLE a (id int PRIMARY KEY, b_id int REFERENCES b (id) DEFERRABLE INITIALLY DEFERRED);
             CREATE TABLE b (id int PRIMARY KEY, a_id int REFERENCES a (id) DEFERRABLE INITIALLY DEFERRED);",
            "",
        );
        assert_eq!(ops.len(), 4);
        assert!(matches!(ops[0].step, Step::CreateTable { .. }));
        assert!(matches!(ops[1].step, Step::CreateTable { .. }));
        assert!(ops[2..].iter().all(|op| matches!(op.step, Step::AddConstraint { .. })));
    }

    #[test]
    fn test_dropped_table_absorbs_members() {
        let ops = plan(
            "CREATE TABLE users (id int PRIMARY KEY);",
            "CREATE TABLE users (id int PRIMARY KEY);
             CREATE TABLE orders (id serial PRIMARY KEY, user_id int REFERENCES users (id));
             CREATE INDEX orders_user_idx ON orders (user_id);",
        );
        let statements: Vec<&str> = ops.iter().map(|op| op.sql.as_str()).collect();
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE \"public\".\"orders\" DROP CONSTRAINT \"orders_user_id_fkey\"",
                "DROP TABLE \"public\".\"orders\"",
            ]
        );
        assert!(ops.iter().all(|op| op.destructive));
    }

    #[test]
    fn test_dependents_dropped_before_dependencies() {
        let ops = plan(
            "",
            "CREATE TABLE users (id int PRIMARY KEY);
             CREATE TABLE orders (user_id int REFERENCES users (id));
             CREATE VIEW active AS SELECT id FROM users;",
        );
        assert!(rank_of(&ops, "DROP VIEW") < rank_of(&ops, "DROP TABLE \"public\".\"users\""));
        assert!(rank_of(&ops, "DROP CONSTRAINT") < rank_of(&ops, "DROP TABLE \"public\".\"users\""));
    }

    #[test]
    fn test_column_modify_chain() {
        let ops = plan(
            "CREATE TABLE t (c bigint NOT NULL DEFAULT 1);",
            "CREATE TABLE t (c integer DEFAULT 0);",
        );
        let statements: Vec<&str> = ops.iter().map(|op| op.sql.as_str()).collect();
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE \"public\".\"t\" ALTER COLUMN \"c\" DROP DEFAULT",
                "ALTER TABLE \"public\".\"t\" ALTER COLUMN \"c\" TYPE bigint USING \"c\"::bigint",
                "ALTER TABLE \"public\".\"t\" ALTER COLUMN \"c\" SET NOT NULL",
                "ALTER TABLE \"public\".\"t\" ALTER COLUMN \"c\" SET DEFAULT 1",
            ]
        );
        assert_eq!(ops[1].split, None);
        assert!(ops.iter().all(|op| op.change == ChangeClass::Modify));
    }

    #[test]
    fn test_narrowing_type_change_carries_split_info() {
        let ops = plan(
            "CREATE TABLE t (c integer NOT NULL DEFAULT 0);",
            "CREATE TABLE t (c bigint NOT NULL DEFAULT 0);",
        );
        assert_eq!(ops.len(), 1);
        let split = ops[0].split.clone().unwrap();
        assert!(split.splittable);
        assert!(!split.nullable);
        assert!(split.default.is_some());
    }

    #[test]
    fn test_expression_dependents_block_the_split() {
        let ops = plan(
            "CREATE TABLE t (amount integer CHECK (amount >= 0));",
            "CREATE TABLE t (amount bigint CHECK (amount >= 0));",
        );
        assert!(!ops[0].split.clone().unwrap().splittable);

        let ops = plan(
            "CREATE TABLE u (email varchar(50)); CREATE INDEX u_email_lower ON u (lower(email));",
            "CREATE TABLE u (email text); CREATE INDEX u_email_lower ON u (lower(email));",
        );
        assert!(!ops[0].split.clone().unwrap().splittable);
    }

    #[test]
    fn test_constraint_rebuild_is_drop_then_add() {
        let ops = plan(
            "CREATE TABLE t (n int CONSTRAINT n_positive CHECK (n > 1));",
            "CREATE TABLE t (n int CONSTRAINT n_positive CHECK (n > 0));",
        );
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0].step, Step::DropConstraint { .. }));
        assert!(matches!(ops[1].step, Step::AddConstraint { .. }));
        assert_eq!(ops[1].after, vec![1]);
    }

    #[test]
    fn test_owned_sequence_is_created_then_owned() {
        let ops = plan(
            "CREATE TABLE t (id bigint DEFAULT nextval('t_seq'));
             CREATE SEQUENCE t_seq START 100;
             ALTER SEQUENCE t_seq OWNED BY t.id;",
            "",
        );
        let create_seq = rank_of(&ops, "CREATE SEQUENCE");
        let create_table = rank_of(&ops, "CREATE TABLE");
        let owner = rank_of(&ops, "OWNED BY");
        assert!(create_seq < create_table);
        assert!(create_table < owner);
    }

    #[test]
    fn test_identical_schemas_plan_nothing() {
        let sql = "CREATE TABLE users (id serial PRIMARY KEY, email text UNIQUE);
                   CREATE VIEW emails AS SELECT email FROM users;";
        assert!(plan(sql, sql).is_empty());
    }
}
