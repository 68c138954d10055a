//! Collection queries understood by [`DocumentStore::query`](super::DocumentStore::query).

use crate::error::{StoreError, StoreResult};
use serde_json::Value;
use std::cmp::Ordering;

/// Most values an `In` filter may carry, matching common document databases.
pub const MAX_IN_VALUES: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field == value`
    Eq { field: String, value: Value },
    /// `field` equals one of `values`
    In { field: String, values: Vec<Value> },
    /// `field` is a string starting with `prefix`
    Prefix { field: String, prefix: String },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In {
            field: field.into(),
            values,
        }
    }

    pub fn prefix(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Filter::Prefix {
            field: field.into(),
            prefix: prefix.into(),
        }
    }

    /// Whether a record with `fields` passes this filter.
    pub fn matches(&self, fields: &serde_json::Map<String, Value>) -> bool {
        match self {
            Filter::Eq { field, value } => fields.get(field) == Some(value),
            Filter::In { field, values } => fields
                .get(field)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            Filter::Prefix { field, prefix } => fields
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|s| s.starts_with(prefix.as_str())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// A query over the records of one collection path (e.g. `"users"` or
/// `"posts/p1/comments"`).
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject queries a backend would refuse before running them.
    pub fn validate(&self) -> StoreResult<()> {
        if self.collection.trim_matches('/').is_empty() {
            return Err(StoreError::InvalidQuery("empty collection".to_string()));
        }
        for filter in &self.filters {
            if let Filter::In { field, values } = filter {
                if values.is_empty() {
                    return Err(StoreError::InvalidQuery(format!(
                        "IN filter on '{}' has no values",
                        field
                    )));
                }
                if values.len() > MAX_IN_VALUES {
                    return Err(StoreError::InvalidQuery(format!(
                        "IN filter on '{}' has {} values, at most {} allowed",
                        field,
                        values.len(),
                        MAX_IN_VALUES
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Total order over JSON values used for sorting query results.
///
/// Values of different kinds order as null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(0.0)
                .total_cmp(&y.as_f64().unwrap_or(0.0)),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_matches() {
        let record = fields(json!({"name": "john doe", "producer": "u1", "plays": 3}));

        assert!(Filter::eq("producer", "u1").matches(&record));
        assert!(!Filter::eq("producer", "u2").matches(&record));
        assert!(Filter::is_in("producer", vec![json!("u0"), json!("u1")]).matches(&record));
        assert!(!Filter::is_in("missing", vec![json!("u1")]).matches(&record));
        assert!(Filter::prefix("name", "john").matches(&record));
        assert!(!Filter::prefix("name", "doe").matches(&record));
        // Prefix only applies to strings
        assert!(!Filter::prefix("plays", "3").matches(&record));
    }

    #[test]
    fn test_validate_in_limit() {
        let values: Vec<Value> = (0..MAX_IN_VALUES).map(|i| json!(i)).collect();
        assert!(Query::collection("posts")
            .filter(Filter::is_in("producer", values.clone()))
            .validate()
            .is_ok());

        let mut too_many = values;
        too_many.push(json!(99));
        assert!(matches!(
            Query::collection("posts")
                .filter(Filter::is_in("producer", too_many))
                .validate(),
            Err(StoreError::InvalidQuery(_))
        ));

        assert!(Query::collection("posts")
            .filter(Filter::is_in("producer", Vec::new()))
            .validate()
            .is_err());
        assert!(Query::collection("/").validate().is_err());
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!(1), &json!(2)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!("1"), &json!(1)), Ordering::Greater);
    }
}
