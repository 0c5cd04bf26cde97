use super::{Filter, Query, RecordStore, StoreError};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;

/// PostgREST-backed store talking to Supabase with the service-role key.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseStore {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(base_url, service_key))
    }

    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            http: build_client(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn rows(response: Response) -> Result<Vec<Value>, StoreError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Request(format!("HTTP {status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }
}

#[async_trait]
impl RecordStore for SupabaseStore {
    async fn insert(&self, table: &str, record: Value) -> Result<Value, StoreError> {
        let response = self
            .authed(self.http.post(self.table_url(table)))
            .header("Prefer", "return=representation")
            .json(&vec![record])
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        Self::rows(response)
            .await?
            .pop()
            .ok_or_else(|| StoreError::Shape {
                table: table.to_string(),
                message: "insert returned no rows".into(),
            })
    }

    async fn update_where(
        &self,
        table: &str,
        id: &str,
        guard: &Filter,
        patch: Value,
    ) -> Result<Option<Value>, StoreError> {
        let mut params = vec![("id".to_string(), format!("eq.{id}"))];
        params.extend(guard.to_query_pairs());
        let response = self
            .authed(self.http.patch(self.table_url(table)))
            .header("Prefer", "return=representation")
            .query(&params)
            .json(&patch)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        Ok(Self::rows(response).await?.pop())
    }

    async fn select_many(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(query.filter.to_query_pairs());
        if let Some((column, ascending)) = &query.order {
            let direction = if *ascending { "asc.nullsfirst" } else { "desc.nullslast" };
            params.push(("order".to_string(), format!("{column}.{direction}")));
        }
        let mut request = self
            .authed(self.http.get(self.table_url(table)))
            .query(&params);
        if let Some((from, to)) = query.range {
            request = request
                .header("Range-Unit", "items")
                .header("Range", format!("{from}-{to}"));
        }
        let response = request
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        Self::rows(response).await
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut params = vec![("select".to_string(), "id".to_string())];
        params.extend(filter.to_query_pairs());
        let response = self
            .authed(self.http.head(self.table_url(table)))
            .header("Prefer", "count=exact")
            .query(&params)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let header = response
            .headers()
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        parse_content_range_total(header)
            .ok_or_else(|| StoreError::Deserialize(format!("bad Content-Range `{header}`")))
    }
}

/// `0-24/3573` → 3573, `*/0` → 0.
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_parsing() {
        assert_eq!(parse_content_range_total("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-24/*"), None);
    }

    #[test]
    fn base_url_is_normalized() {
        let store = SupabaseStore::new("https://x.supabase.co/", "key");
        assert_eq!(
            store.table_url("inspections"),
            "https://x.supabase.co/rest/v1/inspections"
        );
    }
}
