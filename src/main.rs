mod cebia;
mod checkcarvin;
mod extraction;
mod http;
mod i18n;
mod jobs;
mod locks;
mod metrics;
mod models;
mod notify;
mod payment;
mod pipeline;
mod poll;
mod security;
mod store;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use checkcarvin::{AccountPool, CheckCarVinConfig, Driver, session_factory};
use i18n::Locale;
use jobs::{JobInfo, JobKind, JobQueue};
use locks::InspectionLocks;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, CheckoutRequest, CheckoutResponse, ConfirmQuery, CreateInspectionRequest,
    InspectionSummary, ProcessRequest,
};
use payment::{
    CheckoutSettings, PaymentError, PaymentGateway, RedirectCipher, StripeGateway,
    completed_checkout, verify_stripe_signature,
};
use pipeline::{
    AdvanceOutcome, Collaborators, Pipeline, PipelineConfig, PipelineError, PipelineErrorKind,
};
use security::{InternalAuth, require_internal_key};
use serde::Serialize;
use serde_json::{Value, json};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use store::{MemoryStore, RecordStore, SupabaseStore, records::ProcessCorrelation};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "vinrelay.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let shutdown = CancellationToken::new();
    let pipeline = build_pipeline();
    let (queue, worker) = JobQueue::spawn(pipeline.clone(), shutdown.clone());
    let scheduler = jobs::spawn_scheduler(
        queue.clone(),
        jobs::scheduler_interval_from_env(),
        shutdown.clone(),
    );

    let state = AppState {
        pipeline,
        queue,
        prometheus_handle,
        payments: Payments::from_env(),
        shutdown: shutdown.clone(),
    };
    let app = router(state, InternalAuth::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "vinrelay.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target = "vinrelay.api", "shutdown_requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(worker, scheduler);
    Ok(())
}

fn build_pipeline() -> Pipeline {
    let store: Arc<dyn RecordStore> = match SupabaseStore::from_env() {
        Some(store) => Arc::new(store),
        None => {
            warn!(
                target = "vinrelay.store",
                "SUPABASE_URL or service key missing; records live in memory only"
            );
            Arc::new(MemoryStore::new())
        }
    };
    let redis = std::env::var("REDIS_URL")
        .ok()
        .filter(|url| !url.is_empty())
        .and_then(|url| match redis::Client::open(url) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(target = "vinrelay.api", error = %err, "redis_url_unusable");
                None
            }
        });

    let checkcarvin = CheckCarVinConfig::from_env();
    let sessions = session_factory(&checkcarvin);
    let driver = Arc::new(Driver::new(checkcarvin.clone(), sessions, store.clone()));
    let pool = Arc::new(AccountPool::new(store.clone(), driver.clone(), checkcarvin));

    Pipeline::new(
        PipelineConfig::from_env(),
        Collaborators {
            store,
            cebia: Arc::new(cebia::CebiaClient::from_env()),
            driver,
            pool,
            extractor: extraction::extractor_from_env(),
            notifier: notify::notifier_from_env(),
            locks: InspectionLocks::from_env(redis),
        },
    )
}

fn router(state: AppState, internal_auth: InternalAuth) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let internal = Router::new()
        .route("/inspections/{id}/advance", post(advance_inspection))
        .route("/accounts/refresh", post(enqueue_refresh))
        .route("/jobs/advance-open", post(enqueue_advance_open))
        .route("/jobs/{id}", get(get_job_status))
        .route_layer(middleware::from_fn_with_state(internal_auth, require_internal_key));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/inspections", post(create_inspection))
        .route("/inspections/{id}", get(get_inspection))
        .route("/inspections/{id}/report", get(get_report))
        .route("/inspections/{id}/process", post(register_process))
        .route("/processes/{process_id}/uploaded", post(process_uploaded))
        .route("/payments/checkout", post(create_checkout))
        .route("/payments/confirm", get(confirm_redirect))
        .route("/payments/webhook", post(payment_webhook))
        .nest("/internal", internal)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: JobQueue,
    prometheus_handle: PrometheusHandle,
    payments: Payments,
    shutdown: CancellationToken,
}

/// Checkout collaborators. Any of them may be absent; the routes that need
/// one answer 503 until it is configured.
#[derive(Clone)]
struct Payments {
    gateway: Option<Arc<dyn PaymentGateway>>,
    cipher: Option<RedirectCipher>,
    settings: Arc<CheckoutSettings>,
    webhook_secret: Option<Arc<str>>,
}

impl Payments {
    fn from_env() -> Self {
        let gateway = StripeGateway::from_env().map(|g| Arc::new(g) as Arc<dyn PaymentGateway>);
        if gateway.is_none() {
            warn!(target = "vinrelay.api", "STRIPE_SECRET_KEY not set; checkout disabled");
        }
        Self {
            gateway,
            cipher: RedirectCipher::from_env(),
            settings: Arc::new(CheckoutSettings::from_env()),
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .ok()
                .filter(|v| !v.is_empty())
                .map(Arc::from),
        }
    }
}

/// Caller's language from `Accept-Language`, `sq` when absent.
struct Lang(Locale);

impl<S: Send + Sync> FromRequestParts<S> for Lang {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let accept = parts
            .headers
            .get(header::ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok());
        Ok(Lang(Locale::parse(accept)))
    }
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "vinrelay-api-rs",
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Create an inspection, or return the recent identical one.
///
/// - Method: `POST`
/// - Path: `/inspections`
/// - Body: `CreateInspectionRequest`
/// - Response: `InspectionSummary`; `existing` is true for a deduplicated submission
async fn create_inspection(
    State(state): State<AppState>,
    Lang(locale): Lang,
    Json(mut payload): Json<CreateInspectionRequest>,
) -> Result<Json<InspectionSummary>, AppError> {
    crate::metrics::inc_requests("/inspections");
    if payload.locale.is_none() {
        payload.locale = Some(locale.code().to_string());
    }
    let cancel = state.shutdown.child_token();
    let summary = state
        .pipeline
        .create_inspection(payload, &cancel)
        .await
        .map_err(AppError::localized(locale))?;
    Ok(Json(summary))
}

async fn get_inspection(
    State(state): State<AppState>,
    Lang(locale): Lang,
    Path(id): Path<String>,
) -> Result<Json<InspectionSummary>, AppError> {
    crate::metrics::inc_requests("/inspections/{id}");
    let inspection = state
        .pipeline
        .get_inspection(&id)
        .await
        .map_err(AppError::localized(locale))?;
    Ok(Json(InspectionSummary::from_inspection(&inspection, false)))
}

async fn get_report(
    State(state): State<AppState>,
    Lang(locale): Lang,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/inspections/{id}/report");
    let view = state
        .pipeline
        .report_view(&id)
        .await
        .map_err(AppError::localized(locale))?;
    Ok(Json(view))
}

async fn register_process(
    State(state): State<AppState>,
    Lang(locale): Lang,
    Path(id): Path<String>,
    Json(payload): Json<ProcessRequest>,
) -> Result<Json<ProcessCorrelation>, AppError> {
    crate::metrics::inc_requests("/inspections/{id}/process");
    let correlation = state
        .pipeline
        .register_process(&id, &payload.process_id)
        .await
        .map_err(AppError::localized(locale))?;
    Ok(Json(correlation))
}

async fn process_uploaded(
    State(state): State<AppState>,
    Lang(locale): Lang,
    Path(process_id): Path<String>,
) -> Result<Json<ProcessCorrelation>, AppError> {
    crate::metrics::inc_requests("/processes/{process_id}/uploaded");
    let correlation = state
        .pipeline
        .resolve_process(&process_id)
        .await
        .map_err(AppError::localized(locale))?;
    Ok(Json(correlation))
}

/// Open a hosted checkout for an unpaid inspection.
///
/// - Method: `POST`
/// - Path: `/payments/checkout`
/// - Body: `{ "inspection_id": ... }`
/// - Response: `{ "session_id", "url" }`; the success redirect carries an encrypted token
async fn create_checkout(
    State(state): State<AppState>,
    Lang(locale): Lang,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, AppError> {
    crate::metrics::inc_requests("/payments/checkout");
    let (Some(gateway), Some(cipher)) = (&state.payments.gateway, &state.payments.cipher) else {
        return Err(AppError::new(PaymentError::NotConfigured, locale));
    };
    let inspection = state
        .pipeline
        .get_inspection(&payload.inspection_id)
        .await
        .map_err(AppError::localized(locale))?;
    if inspection.status.is_paid() {
        return Err(AppError::new(
            PipelineError::invalid_input("checkout", "inspection is already paid"),
            locale,
        ));
    }
    let token = cipher.encrypt(&inspection.id).map_err(AppError::localized(locale))?;
    let request = state.payments.settings.request_for(
        &inspection.id,
        &inspection.email,
        inspection.amount_due(),
        &token,
    );
    let session = gateway
        .create_checkout(&request)
        .await
        .map_err(AppError::localized(locale))?;
    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

/// Success redirect: the token decrypts to the inspection id.
async fn confirm_redirect(
    State(state): State<AppState>,
    Lang(locale): Lang,
    Query(query): Query<ConfirmQuery>,
) -> Result<Json<AdvanceOutcome>, AppError> {
    crate::metrics::inc_requests("/payments/confirm");
    let cipher = state
        .payments
        .cipher
        .as_ref()
        .ok_or_else(|| AppError::new(PaymentError::NotConfigured, locale))?;
    let inspection_id = cipher
        .decrypt(&query.token)
        .map_err(AppError::localized(locale))?;
    let outcome = state
        .pipeline
        .confirm_payment(&inspection_id, None)
        .await
        .map_err(AppError::localized(locale))?;
    enqueue_follow_up(&state.queue, &outcome).await;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<AdvanceOutcome>,
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    crate::metrics::inc_requests("/payments/webhook");
    let locale = Locale::En;
    let secret = state
        .payments
        .webhook_secret
        .as_deref()
        .ok_or_else(|| AppError::new(PaymentError::NotConfigured, locale))?;
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::new(PaymentError::Signature("missing header"), locale))?;
    verify_stripe_signature(&body, signature, secret, chrono::Utc::now().timestamp())
        .map_err(AppError::localized(locale))?;

    let event: Value = serde_json::from_slice(&body).map_err(|err| {
        AppError::new(PipelineError::invalid_input("webhook", err.to_string()), locale)
    })?;
    let Some(checkout) = completed_checkout(&event) else {
        return Ok(Json(WebhookAck {
            received: true,
            outcome: None,
        }));
    };
    let outcome = state
        .pipeline
        .confirm_payment(&checkout.inspection_id, checkout.amount)
        .await
        .map_err(AppError::localized(locale))?;
    enqueue_follow_up(&state.queue, &outcome).await;
    Ok(Json(WebhookAck {
        received: true,
        outcome: Some(outcome),
    }))
}

/// Starts driving a freshly paid inspection without waiting for the sweep.
async fn enqueue_follow_up(queue: &JobQueue, outcome: &AdvanceOutcome) {
    let kind = JobKind::Advance {
        inspection_id: outcome.inspection_id.clone(),
    };
    if let Err(err) = queue.enqueue(kind).await {
        warn!(target = "vinrelay.api", inspection_id = %outcome.inspection_id, error = %err.error, "advance_not_enqueued");
    }
}

async fn advance_inspection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AdvanceOutcome>, AppError> {
    crate::metrics::inc_requests("/internal/inspections/{id}/advance");
    let cancel = state.shutdown.child_token();
    let outcome = state
        .pipeline
        .advance(&id, &cancel)
        .await
        .map_err(AppError::localized(Locale::En))?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_refresh(State(state): State<AppState>) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/internal/accounts/refresh");
    enqueue(&state.queue, JobKind::RefreshTokens).await
}

async fn enqueue_advance_open(
    State(state): State<AppState>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/internal/jobs/advance-open");
    enqueue(&state.queue, JobKind::AdvanceOpen).await
}

async fn enqueue(queue: &JobQueue, kind: JobKind) -> Result<Json<EnqueueResponse>, AppError> {
    let id = queue.enqueue(kind).await.map_err(AppError::localized(Locale::En))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::new(
            PipelineError::invalid_input("jobs", "invalid_job_id"),
            Locale::En,
        ));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or_else(|| {
            AppError::new(PipelineError::not_found("jobs", format!("job {id}")), Locale::En)
        })
}

#[derive(Debug)]
enum Failure {
    Pipeline(PipelineError),
    Payment(PaymentError),
    Queue(ApiError),
}

impl From<PipelineError> for Failure {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<PaymentError> for Failure {
    fn from(value: PaymentError) -> Self {
        Self::Payment(value)
    }
}

impl From<ApiError> for Failure {
    fn from(value: ApiError) -> Self {
        Self::Queue(value)
    }
}

/// A failure plus the language its client-facing message is rendered in.
#[derive(Debug)]
struct AppError {
    failure: Failure,
    locale: Locale,
}

impl AppError {
    fn new(err: impl Into<Failure>, locale: Locale) -> Self {
        Self {
            failure: err.into(),
            locale,
        }
    }

    fn localized<E: Into<Failure>>(locale: Locale) -> impl Fn(E) -> AppError {
        move |err| AppError::new(err, locale)
    }

    fn status_and_key(&self) -> (StatusCode, &'static str) {
        match &self.failure {
            Failure::Pipeline(err) => match err.kind() {
                PipelineErrorKind::InvalidInput => (StatusCode::BAD_REQUEST, "invalid_input"),
                PipelineErrorKind::InvalidVin => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_vin"),
                PipelineErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
                PipelineErrorKind::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
                PipelineErrorKind::Persistence | PipelineErrorKind::Internal => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                }
            },
            Failure::Payment(err) => match err {
                PaymentError::InvalidToken | PaymentError::Signature(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_input")
                }
                PaymentError::NotConfigured => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
                PaymentError::Request(_) | PaymentError::Provider(_) => {
                    (StatusCode::BAD_GATEWAY, "unavailable")
                }
            },
            Failure::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, key) = self.status_and_key();
        match &self.failure {
            Failure::Pipeline(err) => {
                if status.is_server_error() {
                    error!(target = "vinrelay.api", stage = err.stage(), kind = ?err.kind(), error = %err.detail(), "request_failed");
                } else {
                    info!(target = "vinrelay.api", stage = err.stage(), kind = ?err.kind(), error = %err.detail(), "request_rejected");
                }
            }
            Failure::Payment(err) => warn!(target = "vinrelay.api", error = %err, "payment_request_failed"),
            Failure::Queue(err) => warn!(target = "vinrelay.api", error = %err.error, "job_queue_unavailable"),
        }
        let payload = ApiError {
            error: key.to_string(),
            detail: Some(i18n::message(key, self.locale).to_string()),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
