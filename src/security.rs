use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashSet, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

/// Keys accepted on `/internal/*` routes (scheduler and operator calls).
#[derive(Clone)]
pub struct InternalAuth {
    keys: Arc<HashSet<String>>,
}

impl InternalAuth {
    pub fn from_env() -> Self {
        Self::new(env::var("INTERNAL_API_KEYS").unwrap_or_default().split(','))
    }

    pub fn new<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let keys: HashSet<String> = keys
            .into_iter()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        if keys.is_empty() {
            warn!(
                target = "vinrelay.api",
                "INTERNAL_API_KEYS is empty; internal routes will reject every call"
            );
        } else {
            info!(target = "vinrelay.api", key_count = keys.len(), "loaded internal API keys");
        }
        Self {
            keys: Arc::new(keys),
        }
    }

    fn accepts(&self, presented: &str) -> bool {
        self.keys.contains(presented)
    }
}

pub async fn require_internal_key(
    State(auth): State<InternalAuth>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Internal-Key or Bearer token",
        ));
    };
    if !auth.accepts(&presented) {
        warn!(target = "vinrelay.api", path = %request.uri().path(), "internal_key_rejected");
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    }
    Ok(next.run(request).await)
}

fn extract_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Internal-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}
