use super::config::{API_URL, AUTH_URL, CebiaCredentials, CebiaPolling};
use crate::http::build_client;
use crate::poll::{Attempt, PollOutcome, poll_until};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CebiaError {
    #[error("token request failed: {0}")]
    Auth(String),
    #[error("vin rejected by provider")]
    InvalidVin,
    #[error("provider did not answer in time: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct VehicleInfo {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub raw: Value,
}

impl VehicleInfo {
    pub fn from_payload(raw: Value) -> Self {
        let brand = text_field(&raw, &["brand", "make", "manufacturer", "brandName"]);
        let model = text_field(&raw, &["model", "modelName", "modelLine"]);
        Self { brand, model, raw }
    }
}

/// Primary report provider: token-authenticated queue API.
#[async_trait]
pub trait CebiaApi: Send + Sync {
    async fn authenticate(&self) -> Result<String, CebiaError>;

    async fn request_queue_id(
        &self,
        vin: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CebiaError>;

    async fn fetch_basic_info(
        &self,
        queue_id: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<VehicleInfo, CebiaError>;

    async fn fetch_paid_coupon(
        &self,
        queue_id: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CebiaError>;
}

#[derive(Debug, PartialEq)]
pub enum QueueReply {
    Ready(String),
    InvalidVin,
    Pending,
}

/// Reads a `CreateBaseInfoQuery` body. A definite rejection arrives as an
/// in-body `status: 400` with an "invalid VIN" message.
pub fn interpret_queue_response(body: &Value) -> QueueReply {
    let status = body.get("status").and_then(as_i64);
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    if status == Some(400) && message.contains("invalid") && message.contains("vin") {
        return QueueReply::InvalidVin;
    }
    let queue_status = body.get("queueStatus").and_then(as_i64);
    match (queue_status, body.get("queue").and_then(id_text)) {
        (Some(1 | 2), Some(queue)) => QueueReply::Ready(queue),
        _ => QueueReply::Pending,
    }
}

/// `queueStatus == 3` plus a data payload means the base info is ready.
pub fn interpret_basic_info(body: &Value) -> Option<Value> {
    let ready = body.get("queueStatus").and_then(as_i64) == Some(3);
    let data = body.get("baseInfoData").filter(|v| !v.is_null())?;
    ready.then(|| data.clone())
}

pub fn interpret_coupon(body: &Value) -> Option<String> {
    body.get("couponNumber").and_then(id_text)
}

pub struct CebiaClient {
    http: Client,
    credentials: CebiaCredentials,
    polling: CebiaPolling,
}

impl CebiaClient {
    pub fn from_env() -> Self {
        Self::new(CebiaCredentials::from_env(), CebiaPolling::from_env())
    }

    pub fn new(credentials: CebiaCredentials, polling: CebiaPolling) -> Self {
        if !credentials.is_complete() {
            warn!(target = "vinrelay.cebia", "cebia credentials incomplete; token requests will fail");
        }
        Self {
            http: build_client(),
            credentials,
            polling,
        }
    }

    async fn get_json(&self, path: &str, token: &str) -> Result<Value, reqwest::Error> {
        self.http
            .get(format!("{}{}", *API_URL, path))
            .header("Accept", "application/json")
            .bearer_auth(token)
            .send()
            .await?
            .json::<Value>()
            .await
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[async_trait]
impl CebiaApi for CebiaClient {
    async fn authenticate(&self) -> Result<String, CebiaError> {
        let form = [
            ("grant_type", "password"),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(AUTH_URL.as_str())
            .form(&form)
            .send()
            .await
            .map_err(|err| CebiaError::Auth(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CebiaError::Auth(format!("HTTP {}", response.status())));
        }
        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| CebiaError::Auth(err.to_string()))?;
        Ok(payload.access_token)
    }

    async fn request_queue_id(
        &self,
        vin: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CebiaError> {
        let path = format!("CreateBaseInfoQuery/{vin}");
        let outcome = poll_until(self.polling.queue, cancel, |attempt| {
            let path = path.clone();
            async move {
                debug!(target = "vinrelay.cebia", vin = %vin, attempt, "queue_poll");
                match self.get_json(&path, token).await {
                    Ok(body) => match interpret_queue_response(&body) {
                        QueueReply::Ready(queue) => Attempt::Ready(Ok(queue)),
                        QueueReply::InvalidVin => Attempt::Ready(Err(CebiaError::InvalidVin)),
                        QueueReply::Pending => Attempt::Pending,
                    },
                    Err(err) => Attempt::Abort(err.to_string()),
                }
            }
        })
        .await;
        match outcome {
            PollOutcome::Ready(Ok(queue)) => {
                info!(target = "vinrelay.cebia", vin = %vin, queue = %queue, "queue_ready");
                Ok(queue)
            }
            PollOutcome::Ready(Err(err)) => Err(err),
            other => Err(unavailable("queue", other)),
        }
    }

    async fn fetch_basic_info(
        &self,
        queue_id: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<VehicleInfo, CebiaError> {
        let path = format!("GetBaseInfoQuery/{queue_id}");
        let outcome = poll_until(self.polling.basic_info, cancel, |attempt| {
            let path = path.clone();
            async move {
                debug!(target = "vinrelay.cebia", queue = %queue_id, attempt, "basic_info_poll");
                match self.get_json(&path, token).await {
                    Ok(body) => {
                        interpret_basic_info(&body).map_or(Attempt::Pending, Attempt::Ready)
                    }
                    Err(err) => Attempt::Abort(err.to_string()),
                }
            }
        })
        .await;
        match outcome {
            PollOutcome::Ready(data) => Ok(VehicleInfo::from_payload(data)),
            other => Err(unavailable("basic_info", other)),
        }
    }

    async fn fetch_paid_coupon(
        &self,
        queue_id: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CebiaError> {
        let path = format!("GetPayedDataQuery/{queue_id}");
        let outcome = poll_until(self.polling.coupon, cancel, |attempt| {
            let path = path.clone();
            async move {
                match self.get_json(&path, token).await {
                    Ok(body) => interpret_coupon(&body).map_or(Attempt::Pending, Attempt::Ready),
                    Err(err) => {
                        // transient on this endpoint; keep polling
                        warn!(target = "vinrelay.cebia", queue = %queue_id, attempt, error = %err, "coupon_poll_error");
                        Attempt::Pending
                    }
                }
            }
        })
        .await;
        match outcome {
            PollOutcome::Ready(coupon) => {
                info!(target = "vinrelay.cebia", queue = %queue_id, "coupon_ready");
                Ok(coupon)
            }
            other => Err(unavailable("coupon", other)),
        }
    }
}

fn unavailable<T>(what: &str, outcome: PollOutcome<T>) -> CebiaError {
    let reason = match outcome {
        PollOutcome::Exhausted => "attempts exhausted".to_string(),
        PollOutcome::Aborted(reason) => reason,
        PollOutcome::Cancelled => "cancelled".to_string(),
        PollOutcome::Ready(_) => "unexpected".to_string(),
    };
    warn!(target = "vinrelay.cebia", what, reason = %reason, "provider_unavailable");
    CebiaError::Unavailable(format!("{what}: {reason}"))
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_field(raw: &Value, keys: &[&str]) -> Option<String> {
    let object = raw.as_object()?;
    keys.iter().find_map(|key| {
        object
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .and_then(|(_, value)| value.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}
