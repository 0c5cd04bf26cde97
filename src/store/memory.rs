use super::{Filter, Query, RecordStore, StoreError, compare_values, row_id};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::{cmp::Ordering, collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Process-local store. Guarded updates run under one write lock, so
/// `update_where` is a real compare-and-swap here.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, Vec<Value>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts rows as given, without id or timestamp defaults.
    pub async fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut guard = self.tables.write().await;
        guard.entry(table.to_string()).or_default().extend(rows);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, table: &str, record: Value) -> Result<Value, StoreError> {
        let Value::Object(mut fields) = record else {
            return Err(StoreError::Shape {
                table: table.to_string(),
                message: "record must be a JSON object".into(),
            });
        };
        if fields.get("id").is_none_or(Value::is_null) {
            fields.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        fields
            .entry("created_at")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        let row = Value::Object(fields);
        let mut guard = self.tables.write().await;
        guard.entry(table.to_string()).or_default().push(row.clone());
        Ok(row)
    }

    async fn update_where(
        &self,
        table: &str,
        id: &str,
        guard: &Filter,
        patch: Value,
    ) -> Result<Option<Value>, StoreError> {
        let Value::Object(patch) = patch else {
            return Err(StoreError::Shape {
                table: table.to_string(),
                message: "patch must be a JSON object".into(),
            });
        };
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(None);
        };
        let Some(row) = rows
            .iter_mut()
            .find(|row| row_id(row).as_deref() == Some(id))
        else {
            return Ok(None);
        };
        if !guard.matches(row) {
            return Ok(None);
        }
        if let Value::Object(fields) = row {
            merge(fields, patch);
        }
        Ok(Some(row.clone()))
    }

    async fn select_many(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Value> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some((column, ascending)) = &query.order {
            rows.sort_by(|a, b| {
                let ord = match (a.get(column), b.get(column)) {
                    (Some(x), Some(y)) if !x.is_null() && !y.is_null() => {
                        compare_values(x, y).unwrap_or(Ordering::Equal)
                    }
                    // nulls first ascending, like Postgres `NULLS FIRST` on asc
                    (Some(x), _) if !x.is_null() => Ordering::Greater,
                    (_, Some(y)) if !y.is_null() => Ordering::Less,
                    _ => Ordering::Equal,
                };
                if *ascending { ord } else { ord.reverse() }
            });
        }
        if let Some((from, to)) = query.range {
            rows = rows.into_iter().skip(from).take(to - from + 1).collect();
        }
        Ok(rows)
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).count() as u64)
            .unwrap_or(0))
    }
}

fn merge(fields: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        fields.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_assigns_id_and_timestamp() {
        let store = MemoryStore::new();
        let row = store
            .insert("inspections", json!({"email": "a@b.c"}))
            .await
            .unwrap();
        assert!(row_id(&row).is_some());
        assert!(row.get("created_at").is_some());
        assert_eq!(store.count("inspections", &Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn guarded_update_rejects_stale_expectation() {
        let store = MemoryStore::new();
        store
            .seed("inspections", vec![json!({"id": "1", "status": "paid"})])
            .await;
        let stale = store
            .update_where(
                "inspections",
                "1",
                &Filter::new().eq("status", "pending"),
                json!({"status": "paid"}),
            )
            .await
            .unwrap();
        assert!(stale.is_none());
        let ok = store
            .update_where(
                "inspections",
                "1",
                &Filter::new().eq("status", "paid"),
                json!({"status": "report initiated"}),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok["status"], "report initiated");
    }

    #[tokio::test]
    async fn ordering_puts_nulls_first_and_ranges_apply() {
        let store = MemoryStore::new();
        store
            .seed(
                "accounts",
                vec![
                    json!({"id": "a", "last_used_at": "2026-10-19T08:00:00Z"}),
                    json!({"id": "b", "last_used_at": null}),
                    json!({"id": "c", "last_used_at": "2026-10-18T08:00:00Z"}),
                ],
            )
            .await;
        let rows = store
            .select_many("accounts", &Query::all().order_by("last_used_at", true))
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().filter_map(row_id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let first = store
            .select_one("accounts", &Query::all().order_by("last_used_at", false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first["id"], "a");
    }
}
