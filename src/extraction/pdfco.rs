use super::{ExtractionError, ReportExtractor};
use crate::http::{build_client, env_secs};
use crate::poll::{Attempt, PollOutcome, PollPolicy, poll_until};
use async_trait::async_trait;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde_json::{Value, json};
use std::{future::Future, path::Path, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// PDF.co document service: upload to temporary storage, then an async
/// `ai-invoice-parser` job polled until it settles. Jobs take minutes.
pub struct PdfCoExtractor {
    http: Client,
    api_key: String,
    base_url: String,
    poll: PollPolicy,
}

impl PdfCoExtractor {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("PDFCO_API_KEY").ok().filter(|v| !v.is_empty())?;
        let base_url = std::env::var("PDFCO_BASE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "https://api.pdf.co/v1".to_string());
        let interval = Duration::from_secs(env_secs("PDFCO_POLL_INTERVAL_SECS", 180));
        let attempts = std::env::var("PDFCO_POLL_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(20);
        Some(Self::new(api_key, base_url, PollPolicy::delayed(interval, attempts)))
    }

    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, poll: PollPolicy) -> Self {
        Self {
            http: build_client(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll,
        }
    }

    async fn upload(&self, path: &Path) -> Result<String, ExtractionError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report.pdf".to_string());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/pdf")
            .map_err(|err| ExtractionError::Request(err.to_string()))?;
        let body: Value = self
            .http
            .post(format!("{}/file/upload", self.base_url))
            .header("x-api-key", &self.api_key)
            .multipart(Form::new().part("file", part))
            .send()
            .await
            .map_err(|err| ExtractionError::Request(err.to_string()))?
            .json()
            .await
            .map_err(|err| ExtractionError::Request(err.to_string()))?;
        service_field(&body, "url")
    }

    async fn create_job(&self, url: &str) -> Result<String, ExtractionError> {
        let body: Value = self
            .http
            .post(format!("{}/ai-invoice-parser", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&json!({ "url": url, "async": true }))
            .send()
            .await
            .map_err(|err| ExtractionError::Request(err.to_string()))?
            .json()
            .await
            .map_err(|err| ExtractionError::Request(err.to_string()))?;
        service_field(&body, "jobId")
    }

    async fn check_job(&self, job_id: &str) -> Result<Value, String> {
        self.http
            .get(format!("{}/job/check", self.base_url))
            .header("x-api-key", &self.api_key)
            .query(&[("jobid", job_id)])
            .send()
            .await
            .map_err(|err| err.to_string())?
            .json()
            .await
            .map_err(|err| err.to_string())
    }
}

/// Reads `field` from a PDF.co reply, honouring its in-body `error` flag.
fn service_field(body: &Value, field: &str) -> Result<String, ExtractionError> {
    if body.get("error").and_then(Value::as_bool).unwrap_or(false) {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(ExtractionError::Service(message.to_string()));
    }
    body.get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ExtractionError::Service(format!("missing `{field}`")))
}

pub fn interpret_job_status(body: &Value) -> Attempt<Value> {
    match body.get("status").and_then(Value::as_str) {
        Some("success") => Attempt::Ready(body.get("body").cloned().unwrap_or(Value::Null)),
        Some(status @ ("failed" | "aborted")) => Attempt::Abort(status.to_string()),
        _ => Attempt::Pending,
    }
}

/// Polls a job until it settles. A failed or aborted job ends the wait at
/// once, as does a transport error.
pub async fn await_job<F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Option<Value>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Value, String>>,
{
    let outcome = poll_until(policy, cancel, |attempt| {
        let fut = check(attempt);
        async move {
            match fut.await {
                Ok(body) => interpret_job_status(&body),
                Err(err) => Attempt::Abort(err),
            }
        }
    })
    .await;
    match outcome {
        PollOutcome::Ready(body) => Some(body),
        PollOutcome::Aborted(reason) => {
            warn!(target = "vinrelay.pdfco", reason = %reason, "job_aborted");
            None
        }
        PollOutcome::Exhausted => {
            warn!(target = "vinrelay.pdfco", attempts = policy.max_attempts, "job_timeout");
            None
        }
        PollOutcome::Cancelled => None,
    }
}

#[async_trait]
impl ReportExtractor for PdfCoExtractor {
    fn name(&self) -> &'static str {
        "pdfco"
    }

    async fn stage(&self, path: &Path) -> Option<String> {
        match self.upload(path).await {
            Ok(url) => {
                info!(target = "vinrelay.pdfco", file = %path.display(), "file_uploaded");
                Some(url)
            }
            Err(err) => {
                warn!(target = "vinrelay.pdfco", file = %path.display(), error = %err, "upload_failed");
                None
            }
        }
    }

    async fn convert(&self, source: &str, cancel: &CancellationToken) -> Option<Value> {
        let job_id = match self.create_job(source).await {
            Ok(job_id) => job_id,
            Err(err) => {
                warn!(target = "vinrelay.pdfco", error = %err, "job_create_failed");
                return None;
            }
        };
        info!(target = "vinrelay.pdfco", job_id = %job_id, "job_created");
        let job_id = job_id.as_str();
        await_job(self.poll, cancel, |_| self.check_job(job_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    #[test]
    fn service_errors_are_reported() {
        let err = service_field(&json!({"error": true, "message": "bad key"}), "url").unwrap_err();
        assert!(err.to_string().contains("bad key"));
        assert_eq!(
            service_field(&json!({"error": false, "url": "https://tmp/x.pdf"}), "url").unwrap(),
            "https://tmp/x.pdf"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_stops_after_first_poll() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = await_job(
            PollPolicy::delayed(Duration::from_secs(180), 20),
            &CancellationToken::new(),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"status": "failed"}))
                }
            },
        )
        .await;
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn working_job_returns_body_on_success() {
        let result = await_job(
            PollPolicy::delayed(Duration::from_secs(180), 20),
            &CancellationToken::new(),
            |attempt| async move {
                if attempt < 3 {
                    Ok(json!({"status": "working"}))
                } else {
                    Ok(json!({"status": "success", "body": {"vin": "KMH", "year": "2016"}}))
                }
            },
        )
        .await;
        assert_eq!(result, Some(json!({"vin": "KMH", "year": "2016"})));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_job_times_out() {
        let result = await_job(
            PollPolicy::delayed(Duration::from_secs(180), 3),
            &CancellationToken::new(),
            |_| async { Ok(json!({"status": "working"})) },
        )
        .await;
        assert!(result.is_none());
    }
}
