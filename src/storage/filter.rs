//! Search filters evaluated by document indexes.

use serde_json::Value;

use crate::storage::document::Document;

/// A predicate over document payload fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// matches every document
    All,
    /// field equals the value
    Eq(String, Value),
    /// field equals one of the values
    In(String, Vec<Value>),
    /// numeric field is strictly greater than the bound
    Gt(String, i64),
    /// numeric field is less than or equal to the bound
    Lte(String, i64),
    /// string field starts with the prefix
    Prefix(String, String),
    /// field is absent or null
    IsNull(String),
    /// all inner filters match
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn one_of<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn gt(field: &str, bound: i64) -> Self {
        Filter::Gt(field.to_string(), bound)
    }

    pub fn lte(field: &str, bound: i64) -> Self {
        Filter::Lte(field.to_string(), bound)
    }

    pub fn prefix(field: &str, prefix: impl Into<String>) -> Self {
        Filter::Prefix(field.to_string(), prefix.into())
    }

    pub fn is_null(field: &str) -> Self {
        Filter::IsNull(field.to_string())
    }

    /// combine with another filter, flattening nested conjunctions
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    /// evaluate the filter against a document
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => lookup(doc, field) == Some(value),
            Filter::In(field, values) => lookup(doc, field).is_some_and(|v| values.contains(v)),
            Filter::Gt(field, bound) => lookup(doc, field).and_then(Value::as_i64).is_some_and(|v| v > *bound),
            Filter::Lte(field, bound) => lookup(doc, field).and_then(Value::as_i64).is_some_and(|v| v <= *bound),
            Filter::Prefix(field, prefix) => lookup(doc, field)
                .and_then(Value::as_str)
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            Filter::IsNull(field) => lookup(doc, field).map_or(true, Value::is_null),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }
}

/// resolve a dotted field path (`attributes.term`) inside a document
fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}
