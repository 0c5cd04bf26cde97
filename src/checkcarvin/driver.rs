use super::{
    config::CheckCarVinConfig,
    session::{Session, SessionError, SessionFactory, SessionResponse},
};
use crate::store::{
    RecordStore,
    records::{AUDIT_LOGS, AuditLogEntry},
};
use crate::extraction::sanitize::PDF_MAGIC;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Value, json};
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

const STORE_CHECKED_VIN: &str = "/api/v1/dashboard/store-checked-vin";
const PAY_FROM_BALANCE: &str = "/api/v1/dashboard/pay-from-balance";
const CHECK_STATUS: &str = "/api/v1/report/stripe-check-status-report";
const LOGIN: &str = "/api/v1/auth/login";
const XSRF_COOKIE: &str = "XSRF-TOKEN";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{action} rejected by provider: {detail}")]
    Rejected { action: &'static str, detail: String },
    #[error("report file is not a PDF: {0}")]
    Malformed(String),
    #[error("could not store report file: {0}")]
    Io(#[from] std::io::Error),
}

/// Bearer token plus the XSRF value the provider expects alongside it.
#[derive(Clone)]
pub struct AuthPair {
    pub token: String,
    pub xsrf: String,
}

impl std::fmt::Debug for AuthPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPair")
            .field("token", &token_preview(&self.token))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VinSummary {
    pub status: u16,
    pub meta: Option<Value>,
    pub data: Option<Value>,
    pub raw: Value,
}

impl VinSummary {
    pub fn user_id(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|data| lookup_id(data, &["user_id", "userId"]))
            .or_else(|| lookup_id(&self.raw, &["user_id", "userId"]))
    }
}

#[derive(Debug, Clone)]
pub struct PaymentResult {
    pub report_ids: Vec<String>,
    pub user_id: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct ReportStatus {
    pub report_uuid: String,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub token: String,
    pub xsrf: Option<String>,
}

pub struct Driver {
    config: CheckCarVinConfig,
    sessions: Arc<dyn SessionFactory>,
    store: Arc<dyn RecordStore>,
}

impl Driver {
    pub fn new(
        config: CheckCarVinConfig,
        sessions: Arc<dyn SessionFactory>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            config,
            sessions,
            store,
        }
    }

    pub fn config(&self) -> &CheckCarVinConfig {
        &self.config
    }

    pub async fn pre_check_vin(
        &self,
        vin: &str,
        auth: &AuthPair,
    ) -> Result<VinSummary, DriverError> {
        let request = json!({ "vin": vin });
        let (response, _) = self
            .call_json(
                STORE_CHECKED_VIN,
                &request,
                &request,
                auth_headers(auth, "application/json"),
                self.config.settle,
            )
            .await?;
        let summary = normalize_vin_summary(response);
        info!(target = "vinrelay.checkcarvin", vin = %vin, status = summary.status, "vin_pre_checked");
        Ok(summary)
    }

    pub async fn pay_from_balance(
        &self,
        vin: &str,
        email: &str,
        auth: &AuthPair,
    ) -> Result<PaymentResult, DriverError> {
        let payload = pay_payload(vin, email);
        let (response, _) = self
            .call_json(
                PAY_FROM_BALANCE,
                &payload,
                &payload,
                auth_headers(auth, "application/json"),
                self.config.settle,
            )
            .await?;
        match payment_success(&response) {
            Some(result) => {
                info!(target = "vinrelay.checkcarvin", vin = %vin, reports = result.report_ids.len(), "report_purchased");
                Ok(result)
            }
            None => Err(DriverError::Rejected {
                action: "pay_from_balance",
                detail: response_message(&response),
            }),
        }
    }

    pub async fn check_report_status(
        &self,
        vin: &str,
        user_id: &str,
        report_ids: &[String],
        auth: &AuthPair,
    ) -> Result<ReportStatus, DriverError> {
        let payload = json!({
            "vin": vin,
            "user_id": numeric_or_text(user_id),
            "reports": report_ids.iter().map(|id| numeric_or_text(id)).collect::<Vec<_>>(),
            "intent": "",
            "cnt": 1,
        });
        let (response, _) = self
            .call_json(
                CHECK_STATUS,
                &payload,
                &payload,
                auth_headers(auth, "application/json"),
                self.config.settle,
            )
            .await?;
        status_success(&response).ok_or_else(|| DriverError::Rejected {
            action: "check_report_status",
            detail: response_message(&response),
        })
    }

    /// Fetches the generated PDF and stores it under the report directory.
    /// The file is kept even when the magic check fails.
    pub async fn download_report(
        &self,
        report_uuid: &str,
        auth: &AuthPair,
    ) -> Result<PathBuf, DriverError> {
        let report_id = normalize_report_id(report_uuid);
        let path = format!("/api/v1/report/pdf/{report_id}?path=%2Freport%2F{report_id}");
        let headers = auth_headers(auth, "application/pdf");

        let mut session = self.open_settled(self.config.settle).await?;
        let fetched = session.request_bytes(&path, &headers).await;
        session.close().await;
        let (status, bytes) = match fetched {
            Ok(ok) => ok,
            Err(err) => {
                self.audit(
                    &path,
                    json!({ "report_id": report_id }),
                    json!({ "error": err.to_string() }),
                    None,
                )
                .await;
                return Err(err.into());
            }
        };
        self.audit(
            &path,
            json!({ "report_id": report_id }),
            json!({
                "bytes": bytes.len(),
                "magic": String::from_utf8_lossy(&bytes[..bytes.len().min(4)]),
            }),
            Some(status),
        )
        .await;
        if status != 200 {
            return Err(DriverError::Rejected {
                action: "download_report",
                detail: format!("HTTP {status}"),
            });
        }

        tokio::fs::create_dir_all(&self.config.report_dir).await?;
        let file = self.config.report_dir.join(format!("{report_id}.pdf"));
        tokio::fs::write(&file, &bytes).await?;
        if !bytes.starts_with(PDF_MAGIC) {
            warn!(target = "vinrelay.checkcarvin", report_id = %report_id, "report_not_pdf");
            return Err(DriverError::Malformed(file.display().to_string()));
        }
        info!(target = "vinrelay.checkcarvin", report_id = %report_id, file = %file.display(), "report_downloaded");
        Ok(file)
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        xsrf: Option<&str>,
    ) -> Result<LoginResult, DriverError> {
        let payload = json!({
            "email": email,
            "password": password,
            "device_name": "Mozilla/5.0 Chrome/114.0.0.0",
        });
        let redacted = json!({ "email": email, "password": "<redacted>" });
        let mut headers = json_headers("application/json");
        if let Some(xsrf) = xsrf.filter(|v| !v.is_empty()) {
            headers.push(("x-xsrf-token".into(), decode_xsrf(xsrf)));
        }
        let (response, cookie) = self
            .call_json(LOGIN, &payload, &redacted, headers, self.config.login_settle)
            .await?;
        let token = login_token(&response).ok_or_else(|| DriverError::Rejected {
            action: "login",
            detail: response_message(&response),
        })?;
        Ok(LoginResult {
            token,
            xsrf: cookie.or_else(|| xsrf.map(str::to_string)),
        })
    }

    async fn open_settled(&self, settle: Duration) -> Result<Box<dyn Session>, DriverError> {
        let mut session = self.sessions.open().await?;
        if let Err(err) = session.navigate_and_settle(settle).await {
            session.close().await;
            return Err(err.into());
        }
        Ok(session)
    }

    /// One settled session, one POST, one audit row. Also returns the XSRF
    /// cookie the session ended with.
    async fn call_json(
        &self,
        path: &str,
        body: &Value,
        audit_body: &Value,
        headers: Vec<(String, String)>,
        settle: Duration,
    ) -> Result<(SessionResponse, Option<String>), DriverError> {
        let mut session = self.open_settled(settle).await?;
        let result = session
            .request_json(Method::POST, path, &headers, Some(body))
            .await;
        let cookie = session.cookie(XSRF_COOKIE).await;
        session.close().await;
        match result {
            Ok(response) => {
                self.audit(path, audit_body.clone(), response.body.clone(), Some(response.status))
                    .await;
                Ok((response, cookie))
            }
            Err(err) => {
                self.audit(path, audit_body.clone(), json!({ "error": err.to_string() }), None)
                    .await;
                Err(err.into())
            }
        }
    }

    async fn audit(
        &self,
        url: &str,
        request_data: Value,
        response_data: Value,
        status: Option<u16>,
    ) {
        let entry = AuditLogEntry {
            url: url.trim_start_matches('/').to_string(),
            request_data,
            response_data,
            status,
        };
        let record = match serde_json::to_value(&entry) {
            Ok(record) => record,
            Err(err) => {
                warn!(target = "vinrelay.checkcarvin", error = %err, "audit_encode_failed");
                return;
            }
        };
        if let Err(err) = self.store.insert(AUDIT_LOGS, record).await {
            warn!(target = "vinrelay.checkcarvin", url = %url, error = %err, "audit_write_failed");
        }
    }
}

fn json_headers(accept: &str) -> Vec<(String, String)> {
    vec![
        ("Content-Type".into(), "application/json".into()),
        ("Accept".into(), accept.into()),
    ]
}

fn auth_headers(auth: &AuthPair, accept: &str) -> Vec<(String, String)> {
    let mut headers = json_headers(accept);
    headers.push(("Authorization".into(), format!("Bearer {}", auth.token)));
    headers.push(("x-xsrf-token".into(), decode_xsrf(&auth.xsrf)));
    headers
}

/// The XSRF cookie is stored URL-encoded; the header wants it decoded.
pub fn decode_xsrf(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

pub fn normalize_report_id(raw: &str) -> String {
    raw.replace('-', "")
}

pub fn token_preview(token: &str) -> String {
    let head: String = token.chars().take(6).collect();
    format!("{head}…")
}

fn pay_payload(vin: &str, email: &str) -> Value {
    json!({
        "vin": vin,
        "email": email,
        "paymentMethodSelected": {
            "slug": "subscription",
            "name": "Subscription",
            "reportsAvailable": ["Report Available: 100"],
            "tpr_ids": [5],
            "available": true
        },
        "selectedUserReport": {
            "type_report_id": 5,
            "type_report_slug": "checkcar",
            "type_report_title": "Checkcar.vin",
            "price": 9.99,
            "sign": "EUR",
            "discount": 0,
            "retail_price": 9.99,
            "tpr_ids": [5],
            "original_price": 9.99,
            "buy_price": 9.99,
            "currency_code": "EUR",
            "name": "1 report",
            "type": "retail"
        }
    })
}

/// Unwraps a body that may itself be JSON text, and parses `meta`/`data`
/// when they arrive as strings. Unparseable nested fields become `null`.
pub fn normalize_vin_summary(response: SessionResponse) -> VinSummary {
    let raw = unwrap_json_text(response.body);
    let nested = |key: &str| match raw.get(key) {
        Some(Value::String(text)) => serde_json::from_str::<Value>(text).ok(),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.clone()),
    };
    let meta = nested("meta");
    let data = nested("data");
    let mut raw = raw.clone();
    if let Value::Object(fields) = &mut raw {
        fields.insert("meta".into(), meta.clone().unwrap_or(Value::Null));
        if data.is_some() {
            fields.insert("data".into(), data.clone().unwrap_or(Value::Null));
        }
    }
    VinSummary {
        status: response.status,
        meta,
        data,
        raw,
    }
}

fn unwrap_json_text(body: Value) -> Value {
    match body {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

fn is_success_message(body: &Value) -> bool {
    body.get("message")
        .and_then(Value::as_str)
        .is_some_and(|m| m.to_lowercase().contains("success"))
}

fn reports_of(body: &Value) -> Option<&Vec<Value>> {
    body.get("data")
        .and_then(|d| d.get("reports"))
        .and_then(Value::as_array)
        .or_else(|| body.get("reports").and_then(Value::as_array))
}

/// HTTP 200, a success message and at least one report id.
pub fn payment_success(response: &SessionResponse) -> Option<PaymentResult> {
    let body = unwrap_json_text(response.body.clone());
    if response.status != 200 || !is_success_message(&body) {
        return None;
    }
    let report_ids: Vec<String> = reports_of(&body)?
        .iter()
        .filter_map(|entry| match entry {
            Value::Object(_) => lookup_id(entry, &["id", "report_id"]),
            other => scalar_text(other),
        })
        .collect();
    if report_ids.is_empty() {
        return None;
    }
    let user_id = body
        .get("data")
        .and_then(|d| lookup_id(d, &["user_id", "userId"]))
        .or_else(|| lookup_id(&body, &["user_id", "userId"]));
    Some(PaymentResult {
        report_ids,
        user_id,
        raw: body,
    })
}

/// HTTP 200, a success message, overall `status == "Success"` and the first
/// report entry also `"Success"`.
pub fn status_success(response: &SessionResponse) -> Option<ReportStatus> {
    let body = unwrap_json_text(response.body.clone());
    if response.status != 200 || !is_success_message(&body) {
        return None;
    }
    let overall = body
        .get("status")
        .or_else(|| body.get("data").and_then(|d| d.get("status")))
        .and_then(Value::as_str);
    if overall != Some("Success") {
        return None;
    }
    let first = reports_of(&body)?.first()?;
    if first.get("status").and_then(Value::as_str) != Some("Success") {
        return None;
    }
    let report_uuid = ["uuid", "report_uuid"]
        .iter()
        .find_map(|key| first.get(*key).and_then(scalar_text))?;
    Some(ReportStatus {
        report_uuid,
        raw: body,
    })
}

fn login_token(response: &SessionResponse) -> Option<String> {
    let body = unwrap_json_text(response.body.clone());
    if !(200..300).contains(&response.status) {
        return None;
    }
    ["token", "access_token"].iter().find_map(|key| {
        body.get(*key)
            .or_else(|| body.get("data").and_then(|d| d.get(*key)))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    })
}

fn response_message(response: &SessionResponse) -> String {
    let body = unwrap_json_text(response.body.clone());
    let message = body
        .get("message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("unexpected response shape");
    format!("HTTP {}: {}", response.status, message)
}

fn lookup_id(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(scalar_text))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn numeric_or_text(raw: &str) -> Value {
    raw.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkcarvin::session::scripted::{Reply, ScriptedFactory};
    use crate::store::{Filter, MemoryStore, Query};

    fn auth() -> AuthPair {
        AuthPair {
            token: "tok-123456789".into(),
            xsrf: "eyJpdiI6%3D".into(),
        }
    }

    fn driver(factory: &ScriptedFactory, dir: PathBuf) -> (Driver, MemoryStore) {
        let store = MemoryStore::new();
        let config = CheckCarVinConfig {
            settle: Duration::ZERO,
            login_settle: Duration::ZERO,
            report_dir: dir,
            ..CheckCarVinConfig::default()
        };
        (
            Driver::new(config, Arc::new(factory.clone()), Arc::new(store.clone())),
            store,
        )
    }

    fn response(status: u16, body: Value) -> SessionResponse {
        SessionResponse { status, body }
    }

    #[test]
    fn payment_requires_status_message_and_reports() {
        let ok = response(
            200,
            json!({"message": "Payment successful", "data": {"reports": [991], "user_id": 44}}),
        );
        let result = payment_success(&ok).unwrap();
        assert_eq!(result.report_ids, vec!["991".to_string()]);
        assert_eq!(result.user_id.as_deref(), Some("44"));

        let empty = json!({"message": "Payment successful", "reports": []});
        assert!(payment_success(&response(200, empty)).is_none());
        let refused = json!({"message": "success", "reports": [1]});
        assert!(payment_success(&response(402, refused)).is_none());
        let broke = json!({"message": "Insufficient balance", "reports": [1]});
        assert!(payment_success(&response(200, broke)).is_none());
    }

    #[test]
    fn status_requires_success_on_queue_and_first_report() {
        let ok = response(200, json!({
            "message": "success",
            "status": "Success",
            "reports": [{"status": "Success", "uuid": "0b1c-22dd"}]
        }));
        assert_eq!(status_success(&ok).unwrap().report_uuid, "0b1c-22dd");

        let pending = response(200, json!({
            "message": "success",
            "status": "Success",
            "reports": [{"status": "Pending", "uuid": "0b1c-22dd"}]
        }));
        assert!(status_success(&pending).is_none());

        let queue_pending = response(200, json!({
            "message": "success",
            "status": "Processing",
            "reports": [{"status": "Success", "uuid": "x"}]
        }));
        assert!(status_success(&queue_pending).is_none());
    }

    #[test]
    fn vin_summary_parses_nested_json_strings() {
        let summary = normalize_vin_summary(response(
            200,
            json!("{\"meta\":\"{\\\"records\\\":3}\",\"data\":{\"user_id\":7},\"vin\":\"KMH\"}"),
        ));
        assert_eq!(summary.meta, Some(json!({"records": 3})));
        assert_eq!(summary.user_id().as_deref(), Some("7"));
        assert_eq!(summary.raw["vin"], "KMH");

        let broken = normalize_vin_summary(response(200, json!({"meta": "{not json"})));
        assert_eq!(broken.meta, None);
        assert_eq!(broken.raw["meta"], Value::Null);
    }

    #[test]
    fn xsrf_is_url_decoded_and_report_ids_lose_hyphens() {
        assert_eq!(decode_xsrf("eyJpdiI6%3D"), "eyJpdiI6=");
        assert_eq!(normalize_report_id("ab-cd-12"), "abcd12");
        assert_eq!(token_preview("abcdefghij"), "abcdef…");
        assert!(!format!("{:?}", auth()).contains("tok-123456789"));
    }

    #[tokio::test]
    async fn failed_payment_is_still_audited() {
        let refused = Reply::Json(200, json!({"message": "Insufficient balance"}));
        let factory = ScriptedFactory::new(vec![refused]);
        let dir = tempfile::tempdir().unwrap();
        let (driver, store) = driver(&factory, dir.path().to_path_buf());

        let err = driver
            .pay_from_balance("KMHJ3815GGU085263", "a@b.c", &auth())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Rejected { action: "pay_from_balance", .. }));

        let logs = store.select_many(AUDIT_LOGS, &Query::all()).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["url"], "api/v1/dashboard/pay-from-balance");
        assert_eq!(logs[0]["request_data"]["selectedUserReport"]["price"], 9.99);

        let call = &factory.calls()[0];
        assert!(call.headers.contains(&("x-xsrf-token".into(), "eyJpdiI6=".into())));
        assert!(call.headers.contains(&("Authorization".into(), "Bearer tok-123456789".into())));
    }

    #[tokio::test]
    async fn transport_failure_is_audited_and_propagated() {
        let factory = ScriptedFactory::new(vec![Reply::Fail("challenge timeout".into())]);
        let dir = tempfile::tempdir().unwrap();
        let (driver, store) = driver(&factory, dir.path().to_path_buf());
        assert!(driver.pre_check_vin("VIN", &auth()).await.is_err());
        assert_eq!(store.count(AUDIT_LOGS, &Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn download_writes_file_and_checks_magic() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::new(vec![
            Reply::Bytes(200, b"%PDF-1.7 body".to_vec()),
            Reply::Bytes(200, b"JSON{}".to_vec()),
        ]);
        let (driver, _) = driver(&factory, dir.path().to_path_buf());

        let file = driver.download_report("ab-12", &auth()).await.unwrap();
        assert_eq!(file, dir.path().join("ab12.pdf"));
        assert_eq!(factory.calls()[0].path, "/api/v1/report/pdf/ab12?path=%2Freport%2Fab12");

        let err = driver.download_report("cd-34", &auth()).await.unwrap_err();
        assert!(matches!(err, DriverError::Malformed(_)));
        assert!(dir.path().join("cd34.pdf").exists());
    }

    #[tokio::test]
    async fn login_redacts_password_and_picks_up_xsrf_cookie() {
        let factory = ScriptedFactory::new(vec![Reply::Json(200, json!({"token": "fresh-token"}))]);
        factory.set_cookie("XSRF-TOKEN", "new%3Dxsrf");
        let dir = tempfile::tempdir().unwrap();
        let (driver, store) = driver(&factory, dir.path().to_path_buf());

        let result = driver.login("pool@example.com", "hunter2", None).await.unwrap();
        assert_eq!(result.token, "fresh-token");
        assert_eq!(result.xsrf.as_deref(), Some("new%3Dxsrf"));

        let logs = store.select_many(AUDIT_LOGS, &Query::all()).await.unwrap();
        assert_eq!(logs[0]["request_data"]["password"], "<redacted>");
        assert!(!logs[0].to_string().contains("hunter2"));
    }
}
