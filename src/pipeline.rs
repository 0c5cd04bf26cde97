use crate::cebia::{CebiaApi, CebiaError};
use crate::checkcarvin::{
    AccountPool, AuthPair, Driver, DriverError, PaymentResult, PoolError, RefreshSummary,
    Reservation, VinSummary,
};
use crate::extraction::{
    ReportExtractor,
    sanitize::{clean_values, has_vehicle_fields, is_valid_pdf, normalize_keys, sanitize},
};
use crate::i18n::Locale;
use crate::locks::InspectionLocks;
use crate::models::{CreateInspectionRequest, InspectionSummary, StageReport};
use crate::notify::Notifier;
use crate::store::{
    Filter, Query, RecordStore, StoreError, decode,
    records::{
        CHECKCARVIN_RECORDS, CheckCarVinPatch, CheckCarVinRecord, INSPECTIONS, Inspection,
        InspectionPatch, InspectionStatus, PROCESS_CORRELATIONS, PROMO_CODES, ProcessCorrelation,
        PromoCode, UPSTREAM_ACCOUNTS, UpstreamAccount, VinType, find, list, to_patch,
    },
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::{env, path::PathBuf, sync::Arc, time::Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const AMOUNT_TOLERANCE: f64 = 0.01;

/// Statuses a scheduler sweep still has work for.
const OPEN_STATUSES: [InspectionStatus; 5] = [
    InspectionStatus::Paid,
    InspectionStatus::ReportInitiated,
    InspectionStatus::ReportGenerated,
    InspectionStatus::ReportDownloaded,
    InspectionStatus::ReportUploaded,
];

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    store: Arc<dyn RecordStore>,
    cebia: Arc<dyn CebiaApi>,
    driver: Arc<Driver>,
    pool: Arc<AccountPool>,
    extractor: Arc<dyn ReportExtractor>,
    notifier: Arc<dyn Notifier>,
    locks: InspectionLocks,
}

/// Everything the state machine talks to.
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub cebia: Arc<dyn CebiaApi>,
    pub driver: Arc<Driver>,
    pub pool: Arc<AccountPool>,
    pub extractor: Arc<dyn ReportExtractor>,
    pub notifier: Arc<dyn Notifier>,
    pub locks: InspectionLocks,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub inspection_fee: f64,
    pub dedup_window: ChronoDuration,
    pub report_settle: ChronoDuration,
    pub report_base_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inspection_fee: 24.99,
            dedup_window: ChronoDuration::days(5),
            report_settle: ChronoDuration::minutes(5),
            report_base_url: "http://localhost:3000/report".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            inspection_fee: env::var("INSPECTION_FEE")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| *v >= 0.0)
                .unwrap_or(defaults.inspection_fee),
            dedup_window: env::var("DEDUP_WINDOW_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v >= 0)
                .map(ChronoDuration::days)
                .unwrap_or(defaults.dedup_window),
            report_settle: env::var("REPORT_SETTLE_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v >= 0)
                .map(ChronoDuration::minutes)
                .unwrap_or(defaults.report_settle),
            report_base_url: env::var("REPORT_BASE_URL")
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.report_base_url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceAction {
    Advanced,
    Waiting,
    QuotaExhausted,
    NotReady,
    Rejected,
    Failed,
    Noop,
}

/// Result of one driving call. Expected conditions (not yet ready, no quota,
/// upstream hiccups) end up here rather than in [`PipelineError`].
#[derive(Debug, Clone, Serialize)]
pub struct AdvanceOutcome {
    pub inspection_id: String,
    pub status: InspectionStatus,
    pub action: AdvanceAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageReport>,
}

impl AdvanceOutcome {
    fn new(inspection: &Inspection, action: AdvanceAction, detail: Option<String>) -> Self {
        Self {
            inspection_id: inspection.id.clone(),
            status: inspection.status,
            action,
            detail,
            stages: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct SweepSummary {
    pub visited: usize,
    pub advanced: usize,
    pub failed: usize,
}

enum Step {
    Advanced(Inspection),
    Stay(AdvanceAction, String),
    /// Another writer moved the row first.
    Superseded(Inspection),
}

struct Purchase {
    summary: VinSummary,
    payment: PaymentResult,
    user_id: Option<String>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, parts: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            store: parts.store,
            cebia: parts.cebia,
            driver: parts.driver,
            pool: parts.pool,
            extractor: parts.extractor,
            notifier: parts.notifier,
            locks: parts.locks,
        }
    }

    /// Creates an inspection, or returns the one already submitted for the
    /// same plate and email inside the dedup window.
    pub async fn create_inspection(
        &self,
        request: CreateInspectionRequest,
        cancel: &CancellationToken,
    ) -> Result<InspectionSummary, PipelineError> {
        let plate = request.plate_number.trim().to_uppercase();
        let email = request.email.trim().to_lowercase();
        if plate.is_empty() {
            return Err(PipelineError::invalid_input(
                "create_inspection",
                "plate_number is required",
            ));
        }
        if !email.contains('@') {
            return Err(PipelineError::invalid_input(
                "create_inspection",
                "a valid email is required",
            ));
        }
        let vin_type = request.vin_type.unwrap_or_default();

        if request.reseller_id.is_none()
            && let Some(existing) = self.find_recent(&plate, &email).await?
        {
            info!(target = "vinrelay.pipeline", inspection_id = %existing.id, status = %existing.status, "inspection_deduplicated");
            return Ok(InspectionSummary::from_inspection(&existing, true));
        }

        let fee = self.config.inspection_fee;
        let promo = match request.promo_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => self.active_promo(code).await?,
            None => None,
        };
        let discount = promo.as_ref().map(|p| p.discount.clamp(0.0, fee)).unwrap_or(0.0);

        let (queue_id, brand, model) = match vin_type {
            VinType::Standard => {
                let token = self
                    .cebia
                    .authenticate()
                    .await
                    .map_err(|err| cebia_failure("create_inspection", err))?;
                let queue_id = self
                    .cebia
                    .request_queue_id(&plate, &token, cancel)
                    .await
                    .map_err(|err| cebia_failure("create_inspection", err))?;
                match self.cebia.fetch_basic_info(&queue_id, &token, cancel).await {
                    Ok(info) => (Some(queue_id), info.brand, info.model),
                    Err(err) => {
                        warn!(target = "vinrelay.pipeline", vin = %plate, error = %err, "basic_info_unavailable");
                        (Some(queue_id), None, None)
                    }
                }
            }
            VinType::Korea => (None, None, None),
        };

        let row = json!({
            "plate_number": plate,
            "email": email,
            "status": InspectionStatus::Pending,
            "queue_id": queue_id,
            "vin_type": vin_type,
            "inspection_fee": fee,
            "discount": discount,
            "promo_code": promo.map(|p| p.code),
            "reseller_id": request.reseller_id,
            "model": model,
            "brand": brand,
            "image_uploaded": false,
            "ai_inspection_completed": false,
            "skip_ai": request.skip_ai.unwrap_or(false),
            "send_email": request.send_email.unwrap_or(true),
            "locale": Locale::parse(request.locale.as_deref()).code(),
            "created_at": Utc::now().to_rfc3339(),
        });
        let stored = self
            .store
            .insert(INSPECTIONS, row)
            .await
            .map_err(persistence("create_inspection"))?;
        let inspection: Inspection =
            decode(INSPECTIONS, stored).map_err(persistence("create_inspection"))?;
        info!(target = "vinrelay.pipeline", inspection_id = %inspection.id, vin = %inspection.plate_number, vin_type = ?vin_type, "inspection_created");
        Ok(InspectionSummary::from_inspection(&inspection, false))
    }

    async fn find_recent(
        &self,
        plate: &str,
        email: &str,
    ) -> Result<Option<Inspection>, PipelineError> {
        let since = Utc::now() - self.config.dedup_window;
        let filter = Filter::new()
            .eq("plate_number", plate)
            .eq("email", email)
            .is_null("reseller_id")
            .gte("created_at", since.to_rfc3339());
        find(
            self.store.as_ref(),
            INSPECTIONS,
            &Query::new(filter).order_by("created_at", false),
        )
        .await
        .map_err(persistence("create_inspection"))
    }

    async fn active_promo(&self, code: &str) -> Result<Option<PromoCode>, PipelineError> {
        let filter = Filter::new().eq("code", code).eq("is_active", true);
        let promo: Option<PromoCode> = find(self.store.as_ref(), PROMO_CODES, &Query::new(filter))
            .await
            .map_err(persistence("create_inspection"))?;
        if promo.is_none() {
            warn!(target = "vinrelay.pipeline", promo_code = %code, "promo_code_ignored");
        }
        Ok(promo)
    }

    /// `pending → paid`. Repeated confirmations report the current state.
    pub async fn confirm_payment(
        &self,
        inspection_id: &str,
        amount: Option<f64>,
    ) -> Result<AdvanceOutcome, PipelineError> {
        let inspection = self.get_inspection(inspection_id).await?;
        if let Some(paid) = amount
            && (paid - inspection.amount_due()).abs() > AMOUNT_TOLERANCE
        {
            warn!(target = "vinrelay.pipeline", inspection_id = %inspection.id, paid, due = inspection.amount_due(), "payment_amount_mismatch");
            return Err(PipelineError::invalid_input(
                "confirm_payment",
                format!("paid {paid:.2}, due {:.2}", inspection.amount_due()),
            ));
        }
        if inspection.status.is_paid() {
            info!(target = "vinrelay.pipeline", inspection_id = %inspection.id, status = %inspection.status, "payment_already_confirmed");
            return Ok(AdvanceOutcome::new(
                &inspection,
                AdvanceAction::Noop,
                Some("already paid".into()),
            ));
        }
        match self
            .transition(&inspection, InspectionStatus::Paid, InspectionPatch::default())
            .await?
        {
            Step::Advanced(next) => Ok(AdvanceOutcome::new(&next, AdvanceAction::Advanced, None)),
            Step::Superseded(current) => {
                Ok(AdvanceOutcome::new(&current, AdvanceAction::Noop, None))
            }
            Step::Stay(action, detail) => {
                Ok(AdvanceOutcome::new(&inspection, action, Some(detail)))
            }
        }
    }

    /// Moves the inspection forward as far as it can go right now. Safe to
    /// call repeatedly; unmet preconditions come back as non-advancing
    /// outcomes.
    pub async fn advance(
        &self,
        inspection_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AdvanceOutcome, PipelineError> {
        let Some(guard) = self
            .locks
            .acquire(inspection_id)
            .await
            .map_err(|err| PipelineError::unavailable("advance", err.to_string()))?
        else {
            let inspection = self.get_inspection(inspection_id).await?;
            return Ok(AdvanceOutcome::new(
                &inspection,
                AdvanceAction::Noop,
                Some("another run holds this inspection".into()),
            ));
        };
        let result = match self.get_inspection(inspection_id).await {
            Ok(inspection) => self.drive(inspection, cancel).await,
            Err(err) => Err(err),
        };
        guard.release().await;
        result
    }

    async fn drive(
        &self,
        mut inspection: Inspection,
        cancel: &CancellationToken,
    ) -> Result<AdvanceOutcome, PipelineError> {
        let mut stages = Vec::new();
        let mut advanced = false;
        loop {
            let Some(stage) = next_stage(inspection.vin_type, inspection.status) else {
                let action = match inspection.status {
                    _ if advanced => AdvanceAction::Advanced,
                    InspectionStatus::Pending => AdvanceAction::NotReady,
                    _ => AdvanceAction::Noop,
                };
                let mut outcome = AdvanceOutcome::new(&inspection, action, None);
                outcome.stages = stages;
                return Ok(outcome);
            };
            if cancel.is_cancelled() {
                let mut outcome = AdvanceOutcome::new(
                    &inspection,
                    AdvanceAction::Waiting,
                    Some("cancelled".into()),
                );
                outcome.stages = stages;
                return Ok(outcome);
            }

            let started = Instant::now();
            let step = match inspection.status {
                InspectionStatus::Paid if inspection.vin_type == VinType::Standard => {
                    self.complete_standard(&inspection, cancel).await?
                }
                InspectionStatus::Paid => self.initiate_report(&inspection).await?,
                InspectionStatus::ReportInitiated => self.await_generation(&inspection).await?,
                InspectionStatus::ReportGenerated => self.download_report(&inspection).await?,
                InspectionStatus::ReportDownloaded => self.stage_report(&inspection).await?,
                _ => self.extract_report(&inspection, cancel).await?,
            };
            let elapsed_ms = started.elapsed().as_millis();
            crate::metrics::stage_elapsed(stage, elapsed_ms);

            match step {
                Step::Advanced(next) => {
                    stages.push(StageReport::new(
                        stage,
                        elapsed_ms,
                        json!({ "from": inspection.status, "to": next.status }),
                    ));
                    advanced = true;
                    inspection = next;
                }
                Step::Stay(action, detail) => {
                    info!(target = "vinrelay.pipeline", inspection_id = %inspection.id, stage, action = ?action, detail = %detail, "stage_held");
                    stages.push(StageReport::new(
                        stage,
                        elapsed_ms,
                        json!({ "action": action, "detail": detail }),
                    ));
                    let action = if advanced { AdvanceAction::Advanced } else { action };
                    let mut outcome = AdvanceOutcome::new(&inspection, action, Some(detail));
                    outcome.stages = stages;
                    return Ok(outcome);
                }
                Step::Superseded(current) => {
                    let mut outcome = AdvanceOutcome::new(
                        &current,
                        AdvanceAction::Noop,
                        Some("advanced by another run".into()),
                    );
                    outcome.stages = stages;
                    return Ok(outcome);
                }
            }
        }
    }

    /// Standard path, `paid → completed`: redeem the coupon, then email.
    async fn complete_standard(
        &self,
        inspection: &Inspection,
        cancel: &CancellationToken,
    ) -> Result<Step, PipelineError> {
        let Some(queue_id) = inspection.queue_id.as_deref() else {
            return Ok(Step::Stay(AdvanceAction::Failed, "inspection has no queue id".into()));
        };
        let token = match self.cebia.authenticate().await {
            Ok(token) => token,
            Err(err) => {
                warn!(target = "vinrelay.pipeline", inspection_id = %inspection.id, error = %err, "cebia_auth_failed");
                return Ok(Step::Stay(AdvanceAction::Failed, err.to_string()));
            }
        };
        let coupon = match self.cebia.fetch_paid_coupon(queue_id, &token, cancel).await {
            Ok(coupon) => coupon,
            Err(err) => return Ok(Step::Stay(AdvanceAction::Waiting, err.to_string())),
        };
        let patch = InspectionPatch {
            cebia_coupon_number: Some(coupon),
            ..Default::default()
        };
        let step = self
            .transition(inspection, InspectionStatus::Completed, patch)
            .await?;
        if let Step::Advanced(done) = &step {
            self.deliver(done).await;
        }
        Ok(step)
    }

    /// `paid → report initiated`: buy one report with a reserved account.
    async fn initiate_report(&self, inspection: &Inspection) -> Result<Step, PipelineError> {
        let record = self.record_for(inspection).await?;
        if record.initiate_report && record.report_id.is_some() {
            // purchase went through on an earlier run; only the status is behind
            return self
                .transition(
                    inspection,
                    InspectionStatus::ReportInitiated,
                    InspectionPatch::default(),
                )
                .await;
        }

        let Some(reservation) = soft("initiate_report", self.pool.reserve().await)?.flatten() else {
            return Ok(Step::Stay(
                AdvanceAction::QuotaExhausted,
                "no account under the daily limit".into(),
            ));
        };
        let purchase = match self.purchase(inspection, &record, &reservation.account).await {
            Ok(Ok(purchase)) => purchase,
            Ok(Err(step)) => {
                self.release(inspection, reservation).await?;
                return Ok(step);
            }
            Err(err) => {
                self.release(inspection, reservation).await?;
                return Err(err);
            }
        };

        let account_id = reservation.account.id.clone();
        let patch = CheckCarVinPatch {
            stored_vin_data: Some(purchase.summary.raw.clone()),
            report_id: Some(purchase.payment.report_ids.join(",")),
            initiate_report: Some(true),
            checkcarvin_user_id: purchase.user_id,
            checkcarvin_account_id: Some(account_id.clone()),
            ..Default::default()
        };
        self.patch_record(&record, patch).await?;
        info!(target = "vinrelay.pipeline", inspection_id = %inspection.id, account_id = %account_id, daily_report_count = reservation.count, "report_purchased");
        self.transition(inspection, InspectionStatus::ReportInitiated, InspectionPatch::default())
            .await
    }

    /// Pre-checks the VIN and pays for the report with the reserved account.
    /// The inner `Err` is the step to stay on when nothing was bought.
    async fn purchase(
        &self,
        inspection: &Inspection,
        record: &CheckCarVinRecord,
        buyer: &UpstreamAccount,
    ) -> Result<Result<Purchase, Step>, PipelineError> {
        let check_account = soft("initiate_report", self.pool.get_latest_token_account().await)?
            .flatten()
            .unwrap_or_else(|| buyer.clone());
        let Some(check_auth) = soft("initiate_report", self.pool.auth_for(&check_account).await)?
        else {
            return Ok(Err(Step::Stay(
                AdvanceAction::Failed,
                "no usable account token".into(),
            )));
        };
        let summary = match self.driver.pre_check_vin(&record.vin, &check_auth).await {
            Ok(summary) => summary,
            Err(err) => return Ok(Err(driver_failure(inspection, "pre_check_vin", err))),
        };

        let Some(pay_auth) = soft("initiate_report", self.pool.auth_for(buyer).await)? else {
            return Ok(Err(Step::Stay(
                AdvanceAction::Failed,
                "reserved account has no token".into(),
            )));
        };
        let payment = match self
            .driver
            .pay_from_balance(&record.vin, &buyer.email, &pay_auth)
            .await
        {
            Ok(payment) => payment,
            Err(err) => return Ok(Err(driver_failure(inspection, "pay_from_balance", err))),
        };

        let user_id = match payment.user_id.clone() {
            Some(user_id) => Some(user_id),
            None if check_account.id == buyer.id => summary.user_id(),
            // the pre-check ran as another account; ask again as the buyer
            None => match self.driver.pre_check_vin(&record.vin, &pay_auth).await {
                Ok(own) => own.user_id(),
                Err(err) => {
                    warn!(target = "vinrelay.pipeline", inspection_id = %inspection.id, error = %err, "buyer_user_id_unavailable");
                    None
                }
            },
        };
        Ok(Ok(Purchase {
            summary,
            payment,
            user_id,
        }))
    }

    async fn release(
        &self,
        inspection: &Inspection,
        reservation: Reservation,
    ) -> Result<(), PipelineError> {
        let account_id = reservation.account.id.clone();
        match self.pool.release(reservation).await {
            Ok(_) => Ok(()),
            Err(PoolError::Store(err)) => Err(persistence("initiate_report")(err)),
            Err(err) => {
                warn!(target = "vinrelay.pipeline", inspection_id = %inspection.id, account_id = %account_id, error = %err, "account_quota_not_released");
                Ok(())
            }
        }
    }

    /// `report initiated → report generated` once the provider says so.
    async fn await_generation(&self, inspection: &Inspection) -> Result<Step, PipelineError> {
        let record = self.record_for(inspection).await?;
        if record.report_generated && record.report_uuid.is_some() {
            return self
                .transition(
                    inspection,
                    InspectionStatus::ReportGenerated,
                    InspectionPatch::default(),
                )
                .await;
        }
        let report_ids: Vec<String> = record
            .report_id
            .as_deref()
            .map(|ids| ids.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        let Some(user_id) = record
            .checkcarvin_user_id
            .as_deref()
            .filter(|_| !report_ids.is_empty())
        else {
            return Ok(Step::Stay(
                AdvanceAction::Failed,
                "no purchased report on record".into(),
            ));
        };
        let Some(auth) = self.auth_for_record(&record).await? else {
            return Ok(Step::Stay(AdvanceAction::Failed, "no usable account token".into()));
        };
        let status = match self
            .driver
            .check_report_status(&record.vin, user_id, &report_ids, &auth)
            .await
        {
            Ok(status) => status,
            Err(DriverError::Rejected { detail, .. }) => {
                return Ok(Step::Stay(AdvanceAction::Waiting, detail));
            }
            Err(err) => return Ok(driver_failure(inspection, "check_report_status", err)),
        };
        let patch = CheckCarVinPatch {
            report_generated: Some(true),
            report_uuid: Some(status.report_uuid),
            report_generated_on: Some(Utc::now()),
            ..Default::default()
        };
        self.patch_record(&record, patch).await?;
        self.transition(inspection, InspectionStatus::ReportGenerated, InspectionPatch::default())
            .await
    }

    /// `report generated → report downloaded`, not before the settle period.
    async fn download_report(&self, inspection: &Inspection) -> Result<Step, PipelineError> {
        let record = self.record_for(inspection).await?;
        let (Some(uuid), Some(generated_on)) =
            (record.report_uuid.as_deref(), record.report_generated_on)
        else {
            return Ok(Step::Stay(AdvanceAction::Failed, "report generation not recorded".into()));
        };
        let elapsed = Utc::now() - generated_on;
        if elapsed < self.config.report_settle {
            let remaining = (self.config.report_settle - elapsed).num_seconds().max(0);
            return Ok(Step::Stay(
                AdvanceAction::Waiting,
                format!("report settles for another {remaining}s"),
            ));
        }
        let Some(auth) = self.auth_for_record(&record).await? else {
            return Ok(Step::Stay(AdvanceAction::Failed, "no usable account token".into()));
        };
        let path = match self.driver.download_report(uuid, &auth).await {
            Ok(path) => path,
            Err(err) => return Ok(driver_failure(inspection, "download_report", err)),
        };
        let patch = CheckCarVinPatch {
            report_path: Some(path.display().to_string()),
            ..Default::default()
        };
        self.patch_record(&record, patch).await?;
        self.transition(inspection, InspectionStatus::ReportDownloaded, InspectionPatch::default())
            .await
    }

    /// `report downloaded → report uploaded to pdfco`: validate, then hand the
    /// file to the extractor.
    async fn stage_report(&self, inspection: &Inspection) -> Result<Step, PipelineError> {
        let record = self.record_for(inspection).await?;
        let path = self.report_path(&record);
        if !is_valid_pdf(&path).await {
            warn!(target = "vinrelay.pipeline", inspection_id = %inspection.id, file = %path.display(), "report_not_pdf");
            return Ok(Step::Stay(AdvanceAction::Rejected, "report file is not a PDF".into()));
        }
        let Some(source) = self.extractor.stage(&path).await else {
            return Ok(Step::Stay(
                AdvanceAction::Failed,
                format!("{} could not stage the report", self.extractor.name()),
            ));
        };
        let patch = CheckCarVinPatch {
            report_source: Some(source),
            ..Default::default()
        };
        self.patch_record(&record, patch).await?;
        self.transition(inspection, InspectionStatus::ReportUploaded, InspectionPatch::default())
            .await
    }

    /// `report uploaded to pdfco → completed`: convert, store, email.
    async fn extract_report(
        &self,
        inspection: &Inspection,
        cancel: &CancellationToken,
    ) -> Result<Step, PipelineError> {
        let record = self.record_for(inspection).await?;
        let Some(source) = record.report_source.as_deref() else {
            return Ok(Step::Stay(AdvanceAction::Failed, "no staged report".into()));
        };
        let Some(data) = self.extractor.convert(source, cancel).await else {
            return Ok(Step::Stay(
                AdvanceAction::Failed,
                format!("{} returned no data", self.extractor.name()),
            ));
        };
        if !has_vehicle_fields(&data) {
            warn!(target = "vinrelay.pipeline", inspection_id = %inspection.id, "report_data_unrecognized");
            return Ok(Step::Stay(
                AdvanceAction::Rejected,
                "extracted data has no vehicle fields".into(),
            ));
        }
        let patch = CheckCarVinPatch {
            report_data: Some(sanitize(data)),
            ..Default::default()
        };
        self.patch_record(&record, patch).await?;
        let step = self
            .transition(inspection, InspectionStatus::Completed, InspectionPatch::default())
            .await?;
        if let Step::Advanced(done) = &step {
            self.deliver(done).await;
        }
        Ok(step)
    }

    /// Guarded status write: only lands while the row still holds the status
    /// it was read with, and never moves backwards.
    async fn transition(
        &self,
        inspection: &Inspection,
        to: InspectionStatus,
        mut patch: InspectionPatch,
    ) -> Result<Step, PipelineError> {
        let from = inspection.status;
        if to.rank() <= from.rank() {
            return Err(PipelineError::internal(
                "transition",
                format!("refusing to move `{from}` to `{to}`"),
            ));
        }
        patch.status = Some(to);
        let value = to_patch(INSPECTIONS, &patch).map_err(persistence("transition"))?;
        let guard = Filter::new().eq("status", from.as_str());
        let updated = self
            .store
            .update_where(INSPECTIONS, &inspection.id, &guard, value)
            .await
            .map_err(persistence("transition"))?;
        match updated {
            Some(row) => {
                crate::metrics::transition(from.as_str(), to.as_str());
                info!(target = "vinrelay.pipeline", inspection_id = %inspection.id, from = %from, to = %to, "status_transition");
                Ok(Step::Advanced(decode(INSPECTIONS, row).map_err(persistence("transition"))?))
            }
            None => {
                let current = self.get_inspection(&inspection.id).await?;
                warn!(target = "vinrelay.pipeline", inspection_id = %inspection.id, expected = %from, found = %current.status, "status_transition_lost");
                Ok(Step::Superseded(current))
            }
        }
    }

    async fn deliver(&self, inspection: &Inspection) {
        if !inspection.send_email {
            info!(target = "vinrelay.pipeline", inspection_id = %inspection.id, "report_email_disabled");
            return;
        }
        let link = self.report_link(&inspection.id);
        let locale = Locale::parse(inspection.locale.as_deref());
        if let Err(err) = self
            .notifier
            .send_report_ready(&inspection.email, &link, locale)
            .await
        {
            warn!(target = "vinrelay.pipeline", inspection_id = %inspection.id, error = %err, "report_email_failed");
        }
    }

    pub fn report_link(&self, inspection_id: &str) -> String {
        format!("{}/{}", self.config.report_base_url, inspection_id)
    }

    fn report_path(&self, record: &CheckCarVinRecord) -> PathBuf {
        match (&record.report_path, &record.report_uuid) {
            (Some(path), _) => PathBuf::from(path),
            (None, Some(uuid)) => self
                .driver
                .config()
                .report_dir
                .join(format!("{}.pdf", crate::checkcarvin::driver::normalize_report_id(uuid))),
            (None, None) => PathBuf::new(),
        }
    }

    async fn record_for(
        &self,
        inspection: &Inspection,
    ) -> Result<CheckCarVinRecord, PipelineError> {
        let query = Query::new(Filter::new().eq("inspection_id", inspection.id.as_str()));
        let existing: Option<CheckCarVinRecord> =
            find(self.store.as_ref(), CHECKCARVIN_RECORDS, &query)
                .await
                .map_err(persistence("report_record"))?;
        if let Some(record) = existing {
            return Ok(record);
        }
        let row = json!({
            "inspection_id": inspection.id,
            "vin": inspection.plate_number,
            "initiate_report": false,
            "report_generated": false,
        });
        let stored = self
            .store
            .insert(CHECKCARVIN_RECORDS, row)
            .await
            .map_err(persistence("report_record"))?;
        decode(CHECKCARVIN_RECORDS, stored).map_err(persistence("report_record"))
    }

    async fn patch_record(
        &self,
        record: &CheckCarVinRecord,
        patch: CheckCarVinPatch,
    ) -> Result<CheckCarVinRecord, PipelineError> {
        let value = to_patch(CHECKCARVIN_RECORDS, &patch).map_err(persistence("report_record"))?;
        let row = self
            .store
            .update(CHECKCARVIN_RECORDS, &record.id, value)
            .await
            .map_err(persistence("report_record"))?
            .ok_or_else(|| {
                PipelineError::internal(
                    "report_record",
                    format!("record {} disappeared", record.id),
                )
            })?;
        decode(CHECKCARVIN_RECORDS, row).map_err(persistence("report_record"))
    }

    /// Auth of the account that bought the report, else the freshest token.
    async fn auth_for_record(
        &self,
        record: &CheckCarVinRecord,
    ) -> Result<Option<AuthPair>, PipelineError> {
        let buyer: Option<UpstreamAccount> = match record.checkcarvin_account_id.as_deref() {
            Some(id) => find(
                self.store.as_ref(),
                UPSTREAM_ACCOUNTS,
                &Query::new(Filter::new().eq("id", id)),
            )
            .await
            .map_err(persistence("account_auth"))?,
            None => None,
        };
        let account = match buyer {
            Some(account) => Some(account),
            None => soft("account_auth", self.pool.get_latest_token_account().await)?.flatten(),
        };
        match account {
            Some(account) => soft("account_auth", self.pool.auth_for(&account).await),
            None => Ok(None),
        }
    }

    pub async fn get_inspection(&self, inspection_id: &str) -> Result<Inspection, PipelineError> {
        find(
            self.store.as_ref(),
            INSPECTIONS,
            &Query::new(Filter::new().eq("id", inspection_id)),
        )
        .await
        .map_err(persistence("get_inspection"))?
        .ok_or_else(|| {
            PipelineError::not_found("get_inspection", format!("inspection {inspection_id}"))
        })
    }

    /// Display form of a finished report. Keys are normalised and values
    /// cleaned here only; the stored payload stays as extracted.
    pub async fn report_view(&self, inspection_id: &str) -> Result<Value, PipelineError> {
        let inspection = self.get_inspection(inspection_id).await?;
        let summary = InspectionSummary::from_inspection(&inspection, false);
        let report = match inspection.vin_type {
            VinType::Standard => json!({ "coupon_number": inspection.cebia_coupon_number }),
            VinType::Korea => {
                let query = Query::new(Filter::new().eq("inspection_id", inspection.id.as_str()));
                let record: Option<CheckCarVinRecord> =
                    find(self.store.as_ref(), CHECKCARVIN_RECORDS, &query)
                        .await
                        .map_err(persistence("report_view"))?;
                record
                    .and_then(|r| r.report_data)
                    .map(|data| clean_values(normalize_keys(data)))
                    .unwrap_or(Value::Null)
            }
        };
        Ok(json!({
            "inspection": summary,
            "brand": inspection.brand,
            "model": inspection.model,
            "report": report,
        }))
    }

    pub async fn refresh_tokens(&self) -> Result<RefreshSummary, PipelineError> {
        self.pool.refresh_all_tokens().await.map_err(|err| match err {
            PoolError::Store(err) => persistence("refresh_tokens")(err),
            other => PipelineError::internal("refresh_tokens", other.to_string()),
        })
    }

    /// Scheduler sweep over every inspection with work left. One failing
    /// inspection does not stop the sweep.
    pub async fn advance_all_open(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SweepSummary, PipelineError> {
        let mut summary = SweepSummary::default();
        for status in OPEN_STATUSES {
            let query = Query::new(Filter::new().eq("status", status.as_str()))
                .order_by("created_at", true);
            let open: Vec<Inspection> = list(self.store.as_ref(), INSPECTIONS, &query)
                .await
                .map_err(persistence("advance_all_open"))?;
            for inspection in open {
                if cancel.is_cancelled() {
                    return Ok(summary);
                }
                summary.visited += 1;
                match self.advance(&inspection.id, cancel).await {
                    Ok(outcome) if outcome.action == AdvanceAction::Advanced => {
                        summary.advanced += 1
                    }
                    Ok(_) => {}
                    Err(err) => {
                        summary.failed += 1;
                        warn!(target = "vinrelay.pipeline", inspection_id = %inspection.id, stage = err.stage(), error = %err, "sweep_advance_failed");
                    }
                }
            }
        }
        info!(target = "vinrelay.pipeline", visited = summary.visited, advanced = summary.advanced, failed = summary.failed, "sweep_finished");
        Ok(summary)
    }

    /// Remembers which inspection an external media process belongs to.
    pub async fn register_process(
        &self,
        inspection_id: &str,
        process_id: &str,
    ) -> Result<ProcessCorrelation, PipelineError> {
        let process_id = process_id.trim();
        if process_id.is_empty() {
            return Err(PipelineError::invalid_input("register_process", "process_id is required"));
        }
        let inspection = self.get_inspection(inspection_id).await?;
        let query = Query::new(Filter::new().eq("process_id", process_id));
        let existing: Option<ProcessCorrelation> =
            find(self.store.as_ref(), PROCESS_CORRELATIONS, &query)
                .await
                .map_err(persistence("register_process"))?;
        if let Some(existing) = existing {
            if existing.inspection_id != inspection.id {
                return Err(PipelineError::invalid_input(
                    "register_process",
                    "process_id belongs to another inspection",
                ));
            }
            return Ok(existing);
        }
        let correlation = ProcessCorrelation {
            process_id: process_id.to_string(),
            inspection_id: inspection.id,
            email: inspection.email,
        };
        let row = serde_json::to_value(&correlation)
            .map_err(|err| PipelineError::internal("register_process", err.to_string()))?;
        self.store
            .insert(PROCESS_CORRELATIONS, row)
            .await
            .map_err(persistence("register_process"))?;
        Ok(correlation)
    }

    /// Marks the inspection behind `process_id` as having its images uploaded.
    pub async fn resolve_process(
        &self,
        process_id: &str,
    ) -> Result<ProcessCorrelation, PipelineError> {
        let query = Query::new(Filter::new().eq("process_id", process_id));
        let correlation: ProcessCorrelation =
            find(self.store.as_ref(), PROCESS_CORRELATIONS, &query)
                .await
                .map_err(persistence("resolve_process"))?
                .ok_or_else(|| {
                    PipelineError::not_found("resolve_process", format!("process {process_id}"))
                })?;
        let patch = InspectionPatch {
            image_uploaded: Some(true),
            ..Default::default()
        };
        let value = to_patch(INSPECTIONS, &patch).map_err(persistence("resolve_process"))?;
        self.store
            .update(INSPECTIONS, &correlation.inspection_id, value)
            .await
            .map_err(persistence("resolve_process"))?
            .ok_or_else(|| {
                PipelineError::not_found(
                    "resolve_process",
                    format!("inspection {}", correlation.inspection_id),
                )
            })?;
        info!(target = "vinrelay.pipeline", inspection_id = %correlation.inspection_id, process_id = %process_id, "process_images_uploaded");
        Ok(correlation)
    }
}

fn next_stage(vin_type: VinType, status: InspectionStatus) -> Option<&'static str> {
    match (vin_type, status) {
        (_, InspectionStatus::Pending | InspectionStatus::Completed) => None,
        (VinType::Standard, InspectionStatus::Paid) => Some("redeem_coupon"),
        (VinType::Standard, _) => None,
        (VinType::Korea, InspectionStatus::Paid) => Some("initiate_report"),
        (VinType::Korea, InspectionStatus::ReportInitiated) => Some("check_report_status"),
        (VinType::Korea, InspectionStatus::ReportGenerated) => Some("download_report"),
        (VinType::Korea, InspectionStatus::ReportDownloaded) => Some("stage_report"),
        (VinType::Korea, InspectionStatus::ReportUploaded) => Some("extract_report"),
    }
}

fn driver_failure(inspection: &Inspection, action: &'static str, err: DriverError) -> Step {
    warn!(target = "vinrelay.pipeline", inspection_id = %inspection.id, action, error = %err, "upstream_call_failed");
    match err {
        DriverError::Malformed(detail) => Step::Stay(AdvanceAction::Rejected, detail),
        other => Step::Stay(AdvanceAction::Failed, format!("{action}: {other}")),
    }
}

/// Store failures propagate; any other pool failure is logged and read as
/// "nothing usable".
fn soft<T>(stage: &'static str, result: Result<T, PoolError>) -> Result<Option<T>, PipelineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(PoolError::Store(err)) => Err(persistence(stage)(err)),
        Err(err) => {
            warn!(target = "vinrelay.pipeline", stage, error = %err, "account_pool_unusable");
            Ok(None)
        }
    }
}

fn cebia_failure(stage: &'static str, err: CebiaError) -> PipelineError {
    match err {
        CebiaError::InvalidVin => PipelineError::invalid_vin(stage, err.to_string()),
        other => PipelineError::unavailable(stage, other.to_string()),
    }
}

fn persistence(stage: &'static str) -> impl Fn(StoreError) -> PipelineError {
    move |err| PipelineError::persistence(stage, err.to_string())
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    InvalidVin,
    NotFound,
    Unavailable,
    Persistence,
    Internal,
}

impl PipelineError {
    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn invalid_vin(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidVin)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn unavailable(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Unavailable)
    }

    pub fn persistence(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Persistence)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cebia::VehicleInfo;
    use crate::checkcarvin::{
        CheckCarVinConfig,
        session::scripted::{Reply, ScriptedFactory},
    };
    use crate::notify::recording::RecordingNotifier;
    use crate::store::{
        MemoryStore,
        records::{AUDIT_LOGS, UPSTREAM_ACCOUNTS},
    };
    use async_trait::async_trait;
    use std::{
        path::Path,
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    const VIN: &str = "KMHJ3815GGU085263";

    #[derive(Default)]
    pub(crate) struct FakeCebia {
        pub(crate) invalid: bool,
        pub(crate) queue_calls: AtomicU32,
    }

    #[async_trait]
    impl CebiaApi for FakeCebia {
        async fn authenticate(&self) -> Result<String, CebiaError> {
            Ok("cebia-token".into())
        }

        async fn request_queue_id(
            &self,
            _vin: &str,
            _token: &str,
            _cancel: &CancellationToken,
        ) -> Result<String, CebiaError> {
            self.queue_calls.fetch_add(1, Ordering::SeqCst);
            if self.invalid {
                Err(CebiaError::InvalidVin)
            } else {
                Ok("queue-7".into())
            }
        }

        async fn fetch_basic_info(
            &self,
            _queue_id: &str,
            _token: &str,
            _cancel: &CancellationToken,
        ) -> Result<VehicleInfo, CebiaError> {
            Ok(VehicleInfo::from_payload(json!({"brand": "Hyundai", "model": "Tucson"})))
        }

        async fn fetch_paid_coupon(
            &self,
            _queue_id: &str,
            _token: &str,
            _cancel: &CancellationToken,
        ) -> Result<String, CebiaError> {
            Ok("COUPON-1".into())
        }
    }

    /// Extractor that treats the file path as the staged source and returns
    /// canned data.
    struct CannedExtractor {
        data: Option<Value>,
    }

    #[async_trait]
    impl ReportExtractor for CannedExtractor {
        fn name(&self) -> &'static str {
            "canned"
        }

        async fn stage(&self, path: &Path) -> Option<String> {
            Some(path.display().to_string())
        }

        async fn convert(&self, _source: &str, _cancel: &CancellationToken) -> Option<Value> {
            self.data.clone()
        }
    }

    pub(crate) struct Harness {
        pub(crate) pipeline: Pipeline,
        pub(crate) store: MemoryStore,
        pub(crate) factory: ScriptedFactory,
        pub(crate) notifier: Arc<RecordingNotifier>,
        pub(crate) cebia: Arc<FakeCebia>,
        pub(crate) dir: tempfile::TempDir,
    }

    pub(crate) fn harness(cebia: FakeCebia, data: Option<Value>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let shared: Arc<dyn RecordStore> = Arc::new(store.clone());
        let factory = ScriptedFactory::new(Vec::new());
        let config = CheckCarVinConfig {
            settle: Duration::ZERO,
            login_settle: Duration::ZERO,
            report_dir: dir.path().to_path_buf(),
            ..CheckCarVinConfig::default()
        };
        let driver = Arc::new(Driver::new(
            config.clone(),
            Arc::new(factory.clone()),
            shared.clone(),
        ));
        let pool = Arc::new(AccountPool::new(shared.clone(), driver.clone(), config));
        let notifier = Arc::new(RecordingNotifier::default());
        let cebia = Arc::new(cebia);
        let pipeline = Pipeline::new(
            PipelineConfig {
                report_base_url: "https://reports.test/r".into(),
                ..PipelineConfig::default()
            },
            Collaborators {
                store: shared,
                cebia: cebia.clone(),
                driver,
                pool,
                extractor: Arc::new(CannedExtractor { data }),
                notifier: notifier.clone(),
                locks: InspectionLocks::in_process(),
            },
        );
        Harness {
            pipeline,
            store,
            factory,
            notifier,
            cebia,
            dir,
        }
    }

    pub(crate) fn request(vin_type: VinType) -> CreateInspectionRequest {
        CreateInspectionRequest {
            plate_number: VIN.into(),
            email: "driver@example.com".into(),
            vin_type: Some(vin_type),
            promo_code: None,
            reseller_id: None,
            locale: Some("en".into()),
            send_email: None,
            skip_ai: None,
        }
    }

    pub(crate) async fn seed_account(store: &MemoryStore) {
        store
            .seed(
                UPSTREAM_ACCOUNTS,
                vec![json!({
                    "id": "acc-1",
                    "email": "pool@example.com",
                    "password": "secret",
                    "token": "tok-abcdefgh",
                    "xsrf_token": "xsrf%3D",
                    "token_generated_at": Utc::now().to_rfc3339(),
                    "daily_report_count": 0,
                    "last_used_at": Utc::now().to_rfc3339(),
                })],
            )
            .await;
    }

    pub(crate) async fn seed_korea(
        store: &MemoryStore,
        status: InspectionStatus,
        record: Value,
    ) -> String {
        store
            .seed(
                INSPECTIONS,
                vec![json!({
                    "id": "insp-1",
                    "plate_number": VIN,
                    "email": "driver@example.com",
                    "status": status,
                    "vin_type": "korea",
                    "inspection_fee": 24.99,
                    "locale": "en",
                    "created_at": Utc::now().to_rfc3339(),
                })],
            )
            .await;
        let mut record = record;
        record["id"] = json!("rec-1");
        record["inspection_id"] = json!("insp-1");
        record["vin"] = json!(VIN);
        store.seed(CHECKCARVIN_RECORDS, vec![record]).await;
        "insp-1".into()
    }

    async fn record(store: &MemoryStore) -> CheckCarVinRecord {
        let rows = store.select_many(CHECKCARVIN_RECORDS, &Query::all()).await.unwrap();
        decode(CHECKCARVIN_RECORDS, rows[0].clone()).unwrap()
    }

    fn vehicle_data() -> Value {
        json!({"vin": VIN, "model": "Tucson", "year": "2016", "note": "clean\u{0}title"})
    }

    #[tokio::test]
    async fn duplicate_submission_returns_existing_inspection() {
        let h = harness(FakeCebia::default(), None);
        h.store
            .seed(PROMO_CODES, vec![json!({"code": "SPRING5", "discount": 5.0, "is_active": true})])
            .await;
        let mut req = request(VinType::Standard);
        req.promo_code = Some("SPRING5".into());

        let first = h
            .pipeline
            .create_inspection(req.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!first.existing);
        assert_eq!(first.status, InspectionStatus::Pending);
        assert!((first.amount_due - 19.99).abs() < 1e-9);

        let second = h
            .pipeline
            .create_inspection(req, &CancellationToken::new())
            .await
            .unwrap();
        assert!(second.existing);
        assert_eq!(second.id, first.id);
        assert_eq!(h.store.count(INSPECTIONS, &Filter::new()).await.unwrap(), 1);
        assert_eq!(h.cebia.queue_calls.load(Ordering::SeqCst), 1);

        let stored = h.pipeline.get_inspection(&first.id).await.unwrap();
        assert_eq!(stored.brand.as_deref(), Some("Hyundai"));
        assert_eq!(stored.queue_id.as_deref(), Some("queue-7"));
    }

    #[tokio::test]
    async fn invalid_vin_creates_no_row() {
        let h = harness(FakeCebia { invalid: true, ..FakeCebia::default() }, None);
        let err = h
            .pipeline
            .create_inspection(request(VinType::Standard), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidVin);
        assert_eq!(h.store.count(INSPECTIONS, &Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn standard_inspection_completes_after_payment() {
        let h = harness(FakeCebia::default(), None);
        let created = h
            .pipeline
            .create_inspection(request(VinType::Standard), &CancellationToken::new())
            .await
            .unwrap();

        let early = h.pipeline.advance(&created.id, &CancellationToken::new()).await.unwrap();
        assert_eq!(early.action, AdvanceAction::NotReady);

        let wrong = h.pipeline.confirm_payment(&created.id, Some(1.0)).await.unwrap_err();
        assert_eq!(wrong.kind(), PipelineErrorKind::InvalidInput);

        let paid = h.pipeline.confirm_payment(&created.id, Some(24.99)).await.unwrap();
        assert_eq!(paid.status, InspectionStatus::Paid);
        let again = h.pipeline.confirm_payment(&created.id, None).await.unwrap();
        assert_eq!(again.action, AdvanceAction::Noop);

        let done = h.pipeline.advance(&created.id, &CancellationToken::new()).await.unwrap();
        assert_eq!(done.status, InspectionStatus::Completed);
        let stored = h.pipeline.get_inspection(&created.id).await.unwrap();
        assert_eq!(stored.cebia_coupon_number.as_deref(), Some("COUPON-1"));

        let sent = h.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, format!("https://reports.test/r/{}", created.id));
        assert_eq!(sent[0].2, Locale::En);

        // completed inspections cannot be paid "again" into an earlier state
        let late = h.pipeline.confirm_payment(&created.id, None).await.unwrap();
        assert_eq!(late.status, InspectionStatus::Completed);
    }

    #[tokio::test]
    async fn second_initiate_call_does_not_buy_twice() {
        let h = harness(FakeCebia::default(), None);
        seed_account(&h.store).await;
        let id = seed_korea(&h.store, InspectionStatus::Paid, json!({})).await;
        h.factory
            .push(Reply::Json(200, json!({"data": "{\"user_id\": 44}", "meta": null})));
        h.factory.push(Reply::Json(
            200,
            json!({"message": "Payment successful", "data": {"reports": [991], "user_id": 44}}),
        ));
        h.factory.push(Reply::Json(
            200,
            json!({"message": "Report is processing", "status": "Processing"}),
        ));

        let first = h.pipeline.advance(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(first.status, InspectionStatus::ReportInitiated);
        assert_eq!(first.action, AdvanceAction::Advanced);

        h.factory.push(Reply::Json(
            200,
            json!({"message": "Report is processing", "status": "Processing"}),
        ));
        let second = h.pipeline.advance(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(second.status, InspectionStatus::ReportInitiated);
        assert_eq!(second.action, AdvanceAction::Waiting);

        let pays = h
            .factory
            .calls()
            .iter()
            .filter(|c| c.path.ends_with("pay-from-balance"))
            .count();
        assert_eq!(pays, 1);
        let account = h.store.select_many(UPSTREAM_ACCOUNTS, &Query::all()).await.unwrap();
        assert_eq!(account[0]["daily_report_count"], 1);
        let rec = record(&h.store).await;
        assert_eq!(rec.report_id.as_deref(), Some("991"));
        assert_eq!(rec.checkcarvin_user_id.as_deref(), Some("44"));
        assert_eq!(rec.checkcarvin_account_id.as_deref(), Some("acc-1"));
        assert!(h.store.count(AUDIT_LOGS, &Filter::new()).await.unwrap() >= 4);
    }

    #[tokio::test]
    async fn exhausted_pool_holds_at_paid() {
        let h = harness(FakeCebia::default(), None);
        h.store
            .seed(
                UPSTREAM_ACCOUNTS,
                vec![json!({
                    "id": "acc-1", "email": "p@e.x", "password": "s", "token": "t",
                    "daily_report_count": 15, "last_used_at": Utc::now().to_rfc3339(),
                })],
            )
            .await;
        let id = seed_korea(&h.store, InspectionStatus::Paid, json!({})).await;
        let outcome = h.pipeline.advance(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.action, AdvanceAction::QuotaExhausted);
        assert_eq!(outcome.status, InspectionStatus::Paid);
        assert!(h.factory.calls().is_empty());
    }

    #[tokio::test]
    async fn rejected_payment_gives_the_quota_back() {
        let h = harness(FakeCebia::default(), None);
        seed_account(&h.store).await;
        let id = seed_korea(&h.store, InspectionStatus::Paid, json!({})).await;
        h.factory
            .push(Reply::Json(200, json!({"data": "{\"user_id\": 44}", "meta": null})));
        h.factory
            .push(Reply::Json(200, json!({"message": "Insufficient balance"})));

        let outcome = h.pipeline.advance(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.status, InspectionStatus::Paid);
        let account = h.store.select_many(UPSTREAM_ACCOUNTS, &Query::all()).await.unwrap();
        assert_eq!(account[0]["daily_report_count"], 0);
        assert!(!record(&h.store).await.initiate_report);
    }

    #[tokio::test]
    async fn user_id_comes_from_the_buying_account() {
        let h = harness(FakeCebia::default(), None);
        let earlier = (Utc::now() - ChronoDuration::hours(2)).to_rfc3339();
        h.store
            .seed(
                UPSTREAM_ACCOUNTS,
                vec![
                    json!({
                        "id": "buyer", "email": "buyer@example.com", "password": "s",
                        "token": "tok-buyer", "token_generated_at": earlier,
                        "daily_report_count": 0, "last_used_at": earlier,
                    }),
                    json!({
                        "id": "fresh", "email": "fresh@example.com", "password": "s",
                        "token": "tok-fresh", "token_generated_at": Utc::now().to_rfc3339(),
                        "daily_report_count": 0, "last_used_at": Utc::now().to_rfc3339(),
                    }),
                ],
            )
            .await;
        let id = seed_korea(&h.store, InspectionStatus::Paid, json!({})).await;
        h.factory
            .push(Reply::Json(200, json!({"data": "{\"user_id\": 77}", "meta": null})));
        h.factory.push(Reply::Json(
            200,
            json!({"message": "Payment successful", "data": {"reports": [991]}}),
        ));
        h.factory
            .push(Reply::Json(200, json!({"data": "{\"user_id\": 44}", "meta": null})));
        h.factory.push(Reply::Json(
            200,
            json!({"message": "Report is processing", "status": "Processing"}),
        ));

        let outcome = h.pipeline.advance(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.status, InspectionStatus::ReportInitiated);
        let rec = record(&h.store).await;
        assert_eq!(rec.checkcarvin_account_id.as_deref(), Some("buyer"));
        assert_eq!(rec.checkcarvin_user_id.as_deref(), Some("44"));

        let calls = h.factory.calls();
        let bearer = ("Authorization".to_string(), "Bearer tok-buyer".to_string());
        assert!(calls[1].headers.contains(&bearer));
        assert!(calls[2].headers.contains(&bearer));
    }

    #[tokio::test]
    async fn download_waits_for_settle_period() {
        let h = harness(FakeCebia::default(), Some(vehicle_data()));
        seed_account(&h.store).await;
        let id = seed_korea(
            &h.store,
            InspectionStatus::ReportGenerated,
            json!({
                "report_id": "991",
                "initiate_report": true,
                "checkcarvin_user_id": "44",
                "checkcarvin_account_id": "acc-1",
                "report_generated": true,
                "report_uuid": "ab-12",
                "report_generated_on": (Utc::now() - ChronoDuration::minutes(2)).to_rfc3339(),
            }),
        )
        .await;

        let early = h.pipeline.advance(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(early.action, AdvanceAction::Waiting);
        assert_eq!(early.status, InspectionStatus::ReportGenerated);
        assert!(h.factory.calls().is_empty());

        let six_minutes_ago = (Utc::now() - ChronoDuration::minutes(6)).to_rfc3339();
        h.store
            .update(CHECKCARVIN_RECORDS, "rec-1", json!({"report_generated_on": six_minutes_ago}))
            .await
            .unwrap();
        h.factory.push(Reply::Bytes(200, b"%PDF-1.7 report".to_vec()));

        let done = h.pipeline.advance(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(done.status, InspectionStatus::Completed);
        assert_eq!(done.stages.len(), 3);
        assert_eq!(h.factory.calls()[0].path, "/api/v1/report/pdf/ab12?path=%2Freport%2Fab12");

        let rec = record(&h.store).await;
        let stored = rec.report_data.unwrap();
        assert_eq!(stored["note"], "cleantitle");
        assert_eq!(rec.report_path.unwrap(), h.dir.path().join("ab12.pdf").display().to_string());
        assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_pdf_download_does_not_advance() {
        let h = harness(FakeCebia::default(), Some(vehicle_data()));
        let file = h.dir.path().join("cd34.pdf");
        std::fs::write(&file, b"JSON{\"error\":true}").unwrap();
        let id = seed_korea(
            &h.store,
            InspectionStatus::ReportDownloaded,
            json!({"report_uuid": "cd-34", "report_path": file.display().to_string()}),
        )
        .await;

        let outcome = h.pipeline.advance(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.action, AdvanceAction::Rejected);
        assert_eq!(outcome.status, InspectionStatus::ReportDownloaded);
        assert!(record(&h.store).await.report_source.is_none());
    }

    #[tokio::test]
    async fn unrecognized_extraction_is_rejected() {
        let h = harness(FakeCebia::default(), Some(json!({"pages": 3})));
        let id = seed_korea(
            &h.store,
            InspectionStatus::ReportUploaded,
            json!({"report_source": "https://tmp/x.pdf"}),
        )
        .await;
        let outcome = h.pipeline.advance(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.action, AdvanceAction::Rejected);
        assert_eq!(outcome.status, InspectionStatus::ReportUploaded);
        assert!(h.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_never_moves_backwards() {
        let h = harness(FakeCebia::default(), None);
        let id = seed_korea(&h.store, InspectionStatus::ReportGenerated, json!({})).await;
        let inspection = h.pipeline.get_inspection(&id).await.unwrap();

        let err = h
            .pipeline
            .transition(&inspection, InspectionStatus::Paid, InspectionPatch::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), PipelineErrorKind::Internal);

        // a stale reader loses the race instead of overwriting
        h.store
            .update(INSPECTIONS, &id, json!({"status": "report downloaded"}))
            .await
            .unwrap();
        let step = h
            .pipeline
            .transition(&inspection, InspectionStatus::ReportDownloaded, InspectionPatch::default())
            .await
            .unwrap();
        assert!(matches!(
            step,
            Step::Superseded(current) if current.status == InspectionStatus::ReportDownloaded
        ));
    }

    #[tokio::test]
    async fn busy_inspection_is_left_alone() {
        let h = harness(FakeCebia::default(), None);
        let id = seed_korea(&h.store, InspectionStatus::Paid, json!({})).await;
        let held = h.pipeline.locks.acquire(&id).await.unwrap().unwrap();
        let outcome = h.pipeline.advance(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.action, AdvanceAction::Noop);
        assert!(h.factory.calls().is_empty());
        held.release().await;
    }

    #[tokio::test]
    async fn process_correlation_survives_in_the_store() {
        let h = harness(FakeCebia::default(), None);
        let id = seed_korea(&h.store, InspectionStatus::Paid, json!({})).await;
        h.pipeline.register_process(&id, "proc-9").await.unwrap();
        h.pipeline.register_process(&id, "proc-9").await.unwrap();
        assert_eq!(h.store.count(PROCESS_CORRELATIONS, &Filter::new()).await.unwrap(), 1);

        let resolved = h.pipeline.resolve_process("proc-9").await.unwrap();
        assert_eq!(resolved.email, "driver@example.com");
        assert!(h.pipeline.get_inspection(&id).await.unwrap().image_uploaded);

        let missing = h.pipeline.resolve_process("nope").await.unwrap_err();
        assert_eq!(missing.kind(), PipelineErrorKind::NotFound);
    }

    #[tokio::test]
    async fn report_view_normalizes_for_display_only() {
        let h = harness(FakeCebia::default(), None);
        let id = seed_korea(
            &h.store,
            InspectionStatus::Completed,
            json!({"report_data": {"Vehicle Info": {"Country": "대한민국"}}}),
        )
        .await;
        let view = h.pipeline.report_view(&id).await.unwrap();
        assert_eq!(view["report"]["vehicle_info"]["country"], "KR");
        assert!(record(&h.store).await.report_data.unwrap().get("Vehicle Info").is_some());
    }

    #[tokio::test]
    async fn sweep_visits_open_inspections() {
        let h = harness(FakeCebia::default(), None);
        let id = seed_korea(&h.store, InspectionStatus::ReportUploaded, json!({})).await;
        let summary = h.pipeline.advance_all_open(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.visited, 1);
        assert_eq!(summary.advanced, 0);
        assert_eq!(
            h.pipeline.get_inspection(&id).await.unwrap().status,
            InspectionStatus::ReportUploaded
        );
    }
}
