//! Query evaluation
//!
//! A query joins artifacts across named bindings. `for-each` bindings are
//! evaluated in declaration order, one recursion level per binding; each
//! level can capture properties of the matched artifact into placeholders
//! (`placeholder_assignments`) and later levels can constrain their filter
//! with those placeholders (`placeholder_constraints`), which is how a join
//! is expressed. `for-all` bindings are resolved at the recursion base: the
//! entire matching set, possibly empty, becomes one multi-valued binding.

use crate::props::PropertySet;
use crate::store::{Bindings, Database};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// One named binding of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryBinding {
    /// The variable the matched artifact (or set) is bound to.
    pub variable: String,
    /// Constant property constraints.
    pub constants: BTreeMap<String, String>,
    /// `(property, placeholder)`: the filter requires `property` to equal
    /// the placeholder's captured value.
    pub placeholder_constraints: Vec<(String, String)>,
    /// `(property, placeholder)`: capture `property` of the matched
    /// artifact under the placeholder name for later bindings.
    pub placeholder_assignments: Vec<(String, String)>,
}

impl QueryBinding {
    pub fn new(variable: impl Into<String>) -> Self {
        QueryBinding {
            variable: variable.into(),
            ..QueryBinding::default()
        }
    }

    pub fn constant(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.constants.insert(name.into(), value.into());
        self
    }

    pub fn assign_placeholder(
        mut self,
        property: impl Into<String>,
        placeholder: impl Into<String>,
    ) -> Self {
        self.placeholder_assignments
            .push((property.into(), placeholder.into()));
        self
    }

    pub fn constrain_placeholder(
        mut self,
        property: impl Into<String>,
        placeholder: impl Into<String>,
    ) -> Self {
        self.placeholder_constraints
            .push((property.into(), placeholder.into()));
        self
    }

    /// The concrete filter for this binding under the given placeholder map.
    fn filter(&self, placeholders: &BTreeMap<String, String>) -> PropertySet {
        let mut props = PropertySet::new();
        for (name, value) in &self.constants {
            props.add(name.clone(), value.clone());
        }
        for (property, placeholder) in &self.placeholder_constraints {
            let value = placeholders.get(placeholder).cloned().unwrap_or_default();
            props.add(property.clone(), value);
        }
        props
    }
}

/// A query: ordered `for-each` bindings plus unordered `for-all` bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub for_each: Vec<QueryBinding>,
    pub for_all: Vec<QueryBinding>,
}

impl Query {
    pub fn is_empty(&self) -> bool {
        self.for_each.is_empty() && self.for_all.is_empty()
    }

    /// The constant-property templates of every binding, used by the graph
    /// builder to link this query to upstream output templates.
    pub fn templates(&self) -> Vec<(bool, BTreeMap<String, String>)> {
        self.for_each
            .iter()
            .map(|binding| (false, binding.constants.clone()))
            .chain(
                self.for_all
                    .iter()
                    .map(|binding| (true, binding.constants.clone())),
            )
            .collect()
    }

    /// Evaluate against the store's current session.
    ///
    /// A query with no bindings yields a single empty bindings record; the
    /// caller treats that as one application with no inputs.
    pub fn evaluate(&self, db: &Database) -> Vec<Bindings> {
        let placeholders = BTreeMap::new();
        self.recurse(db, &placeholders, &self.for_each)
    }

    fn recurse(
        &self,
        db: &Database,
        placeholders: &BTreeMap<String, String>,
        remaining: &[QueryBinding],
    ) -> Vec<Bindings> {
        let Some((head, rest)) = remaining.split_first() else {
            // recursion base: resolve every for-all binding against the
            // placeholder map accumulated so far
            let mut record = Bindings::new();
            for binding in &self.for_all {
                let filter = binding.filter(placeholders);
                let matches = db
                    .find_current(&filter)
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>();
                record.add_set(binding.variable.clone(), matches);
            }
            return vec![record];
        };

        let filter = head.filter(placeholders);
        let artifacts = db.find_current(&filter);

        let mut records = Vec::new();
        for artifact in artifacts {
            let mut scoped = placeholders.clone();
            for (property, placeholder) in &head.placeholder_assignments {
                let value = artifact.props.string_value(property).unwrap_or_default();
                scoped.insert(placeholder.clone(), value.to_string());
            }
            for rest_record in self.recurse(db, &scoped, rest) {
                let mut record = Bindings::new();
                record.add_single(head.variable.clone(), artifact.clone());
                for (name, value) in rest_record.iter() {
                    match value {
                        crate::store::BindingValue::Single(a) => {
                            record.add_single(name, a.clone());
                        }
                        crate::store::BindingValue::Set(list) => {
                            record.add_set(name, list.clone());
                        }
                    }
                }
                records.push(record);
            }
        }
        records
    }

    /// Canonical text form of the query, folded into the rule fingerprint.
    /// `for_each` order is significant; `for_all` bindings are sorted by
    /// variable name.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for binding in &self.for_each {
            canonical_binding(&mut out, "each", binding);
        }
        let mut for_all: Vec<&QueryBinding> = self.for_all.iter().collect();
        for_all.sort_by(|a, b| a.variable.cmp(&b.variable));
        for binding in for_all {
            canonical_binding(&mut out, "all", binding);
        }
        out
    }
}

fn canonical_binding(out: &mut String, kind: &str, binding: &QueryBinding) {
    let _ = write!(out, "{kind} {}:", binding.variable);
    for (name, value) in &binding.constants {
        let _ = write!(out, " {name:?}={value:?}");
    }
    for (property, placeholder) in &binding.placeholder_constraints {
        let _ = write!(out, " {property:?}=?{placeholder:?}");
    }
    for (property, placeholder) in &binding.placeholder_assignments {
        let _ = write!(out, " ?{placeholder:?}:={property:?}");
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::PropertySet;
    use tempfile::TempDir;

    fn persist_current(db: &mut Database, pairs: &[(&str, &str)]) -> u32 {
        let mut props = PropertySet::new();
        for (k, v) in pairs {
            props.add(*k, *v);
        }
        let id = db.persist_artifact(props).expect("persist");
        let app = db.next_application_id();
        db.persist_applied_rule(app, "seed", "fp", Bindings::new(), None)
            .expect("persist applied");
        db.add_applied_to_current(app).expect("current");
        db.update_applied_complete(app, vec![id]).expect("complete");
        id
    }

    fn query_of(binding: QueryBinding) -> Query {
        Query {
            for_each: vec![binding],
            for_all: vec![],
        }
    }

    #[test]
    fn test_simple_query() {
        let temp = TempDir::new().expect("tempdir");
        let mut db = Database::open(temp.path()).expect("open");
        let a1 = persist_current(&mut db, &[("prop", "true"), ("common", "shared")]);
        let a2 = persist_current(&mut db, &[("prop", "false"), ("common", "shared")]);

        let fetch = |name: &str, value: &str| {
            query_of(QueryBinding::new("var").constant(name, value)).evaluate(&db)
        };

        let rows = fetch("prop", "true");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("var").expect("var").artifacts()[0].id, a1);

        let rows = fetch("prop", "false");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("var").expect("var").artifacts()[0].id, a2);

        assert!(fetch("prop", "other").is_empty());
        assert_eq!(fetch("common", "shared").len(), 2);
    }

    #[test]
    fn test_joined_query() {
        let temp = TempDir::new().expect("tempdir");
        let mut db = Database::open(temp.path()).expect("open");

        let joe_person =
            persist_current(&mut db, &[("type", "person"), ("name", "joe"), ("select", "a")]);
        let joe_address = persist_current(&mut db, &[("type", "address"), ("name", "joe")]);
        let steve_person = persist_current(
            &mut db,
            &[("type", "person"), ("name", "steve"), ("select", "b")],
        );
        let steve_address = persist_current(&mut db, &[("type", "address"), ("name", "steve")]);

        let fetch_and_verify = |select: &str, person: u32, address: u32| {
            let query = Query {
                for_each: vec![
                    QueryBinding::new("person")
                        .constant("type", "person")
                        .constant("select", select)
                        .assign_placeholder("name", "NAME"),
                    QueryBinding::new("address")
                        .constant("type", "address")
                        .constrain_placeholder("name", "NAME"),
                ],
                for_all: vec![],
            };
            let rows = query.evaluate(&db);
            assert_eq!(rows.len(), 1);
            assert_eq!(
                rows[0].get("person").expect("person").artifacts()[0].id,
                person
            );
            assert_eq!(
                rows[0].get("address").expect("address").artifacts()[0].id,
                address
            );
        };

        fetch_and_verify("a", joe_person, joe_address);
        fetch_and_verify("b", steve_person, steve_address);
    }

    #[test]
    fn test_empty_query_yields_one_empty_record() {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::open(temp.path()).expect("open");
        let rows = Query::default().evaluate(&db);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_empty());
    }

    #[test]
    fn test_for_all_collects_matching_set() {
        let temp = TempDir::new().expect("tempdir");
        let mut db = Database::open(temp.path()).expect("open");
        persist_current(&mut db, &[("type", "a-out"), ("value", "1")]);
        persist_current(&mut db, &[("type", "a-out"), ("value", "2")]);
        persist_current(&mut db, &[("type", "other")]);

        let query = Query {
            for_each: vec![],
            for_all: vec![QueryBinding::new("a").constant("type", "a-out")],
        };
        let rows = query.evaluate(&db);
        assert_eq!(rows.len(), 1);
        let value = rows[0].get("a").expect("a");
        assert!(!value.is_single());
        assert_eq!(value.artifacts().len(), 2);
    }

    #[test]
    fn test_for_all_with_zero_matches_yields_empty_set() {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::open(temp.path()).expect("open");
        let query = Query {
            for_each: vec![],
            for_all: vec![QueryBinding::new("a").constant("type", "missing")],
        };
        let rows = query.evaluate(&db);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("a").expect("a").artifacts().len(), 0);
    }

    #[test]
    fn test_for_each_with_zero_matches_yields_no_records() {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::open(temp.path()).expect("open");
        let rows = query_of(QueryBinding::new("a").constant("type", "missing")).evaluate(&db);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_canonical_is_order_stable_for_all() {
        let a = Query {
            for_each: vec![],
            for_all: vec![
                QueryBinding::new("x").constant("type", "t"),
                QueryBinding::new("a").constant("type", "u"),
            ],
        };
        let b = Query {
            for_each: vec![],
            for_all: vec![
                QueryBinding::new("a").constant("type", "u"),
                QueryBinding::new("x").constant("type", "t"),
            ],
        };
        assert_eq!(a.canonical(), b.canonical());
    }
}
