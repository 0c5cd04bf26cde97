//! Record store used for inspections, upstream accounts, report records and
//! settings. The production backend is Supabase (PostgREST); an in-memory
//! backend with the same semantics serves tests and offline runs.

pub mod memory;
pub mod records;
pub mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("unexpected row shape in `{table}`: {message}")]
    Shape { table: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    Gte(String, Value),
    Lte(String, Value),
    IsNull(String),
}

/// Conjunction of column conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    pub fn gte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Gte(column.to_string(), value.into()));
        self
    }

    pub fn lte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Lte(column.to_string(), value.into()));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::IsNull(column.to_string()));
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(column, expected) => row
                .get(column)
                .is_some_and(|actual| loosely_equal(actual, expected)),
            Condition::Gte(column, bound) => row
                .get(column)
                .and_then(|actual| compare_values(actual, bound))
                .is_some_and(|ord| ord != Ordering::Less),
            Condition::Lte(column, bound) => row
                .get(column)
                .and_then(|actual| compare_values(actual, bound))
                .is_some_and(|ord| ord != Ordering::Greater),
            Condition::IsNull(column) => row.get(column).is_none_or(Value::is_null),
        })
    }

    /// PostgREST query-string pairs (`col=eq.value`).
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        self.conditions
            .iter()
            .map(|condition| match condition {
                Condition::Eq(column, value) => (column.clone(), format!("eq.{}", plain(value))),
                Condition::Gte(column, value) => (column.clone(), format!("gte.{}", plain(value))),
                Condition::Lte(column, value) => (column.clone(), format!("lte.{}", plain(value))),
                Condition::IsNull(column) => (column.clone(), "is.null".to_string()),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filter: Filter,
    pub order: Option<(String, bool)>,
    pub range: Option<(usize, usize)>,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some((column.to_string(), ascending));
        self
    }

    /// Inclusive row range, `(0, 0)` is the first row.
    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.range = Some((from, to.max(from)));
        self
    }

    pub fn limit(self, count: usize) -> Self {
        self.range(0, count.saturating_sub(1))
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a row and returns it as stored (with its id).
    async fn insert(&self, table: &str, record: Value) -> Result<Value, StoreError>;

    /// Applies `patch` to the row with `id` only when `guard` matches the
    /// current row. `None` means no row matched.
    async fn update_where(
        &self,
        table: &str,
        id: &str,
        guard: &Filter,
        patch: Value,
    ) -> Result<Option<Value>, StoreError>;

    async fn select_many(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError>;

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError>;

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: Value,
    ) -> Result<Option<Value>, StoreError> {
        self.update_where(table, id, &Filter::new(), patch).await
    }

    async fn select_one(&self, table: &str, query: &Query) -> Result<Option<Value>, StoreError> {
        let mut query = query.clone();
        if query.range.is_none() {
            query = query.limit(1);
        }
        Ok(self.select_many(table, &query).await?.into_iter().next())
    }
}

pub fn decode<T: DeserializeOwned>(table: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|err| StoreError::Shape {
        table: table.to_string(),
        message: err.to_string(),
    })
}

pub fn row_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(_), Value::Number(_)) | (Value::Number(_), Value::String(_)) => {
            plain(actual) == plain(expected)
        }
        _ => false,
    }
}

pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::<FixedOffset>::parse_from_rfc3339(x),
                DateTime::<FixedOffset>::parse_from_rfc3339(y),
            ) {
                (Ok(x), Ok(y)) => Some(x.cmp(&y)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
