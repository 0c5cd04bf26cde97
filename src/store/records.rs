use super::{Query, RecordStore, StoreError, decode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::fmt;

pub const INSPECTIONS: &str = "inspections";
pub const UPSTREAM_ACCOUNTS: &str = "checkcarvin_accounts";
pub const CHECKCARVIN_RECORDS: &str = "checkcarvin_inspections";
pub const APP_SETTINGS: &str = "app_settings";
pub const AUDIT_LOGS: &str = "checkcarvin_logs";
pub const PROMO_CODES: &str = "promo_codes";
pub const PROCESS_CORRELATIONS: &str = "process_correlations";

/// Lifecycle of an inspection. The order of the variants is the only order in
/// which a row may move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InspectionStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "paid")]
    Paid,
    #[serde(rename = "report initiated")]
    ReportInitiated,
    #[serde(rename = "report generated")]
    ReportGenerated,
    #[serde(rename = "report downloaded")]
    ReportDownloaded,
    #[serde(rename = "report uploaded to pdfco")]
    ReportUploaded,
    #[serde(rename = "completed")]
    Completed,
}

impl InspectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InspectionStatus::Pending => "pending",
            InspectionStatus::Paid => "paid",
            InspectionStatus::ReportInitiated => "report initiated",
            InspectionStatus::ReportGenerated => "report generated",
            InspectionStatus::ReportDownloaded => "report downloaded",
            InspectionStatus::ReportUploaded => "report uploaded to pdfco",
            InspectionStatus::Completed => "completed",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            InspectionStatus::Pending => 0,
            InspectionStatus::Paid => 1,
            InspectionStatus::ReportInitiated => 2,
            InspectionStatus::ReportGenerated => 3,
            InspectionStatus::ReportDownloaded => 4,
            InspectionStatus::ReportUploaded => 5,
            InspectionStatus::Completed => 6,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.rank() >= InspectionStatus::Paid.rank()
    }
}

impl fmt::Display for InspectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VinType {
    #[default]
    Standard,
    Korea,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inspection {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub plate_number: String,
    pub email: String,
    pub status: InspectionStatus,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub queue_id: Option<String>,
    #[serde(default)]
    pub cebia_coupon_number: Option<String>,
    #[serde(default)]
    pub inspection_case_id: Option<String>,
    #[serde(default)]
    pub vin_type: VinType,
    #[serde(default)]
    pub inspection_fee: f64,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub promo_code: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub reseller_id: Option<String>,
    #[serde(default)]
    pub commission: Option<f64>,
    #[serde(default)]
    pub image_uploaded: bool,
    #[serde(default)]
    pub ai_inspection_completed: bool,
    #[serde(default)]
    pub skip_ai: bool,
    #[serde(default = "default_true")]
    pub send_email: bool,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Inspection {
    pub fn amount_due(&self) -> f64 {
        (self.inspection_fee - self.discount).max(0.0)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize)]
pub struct InspectionPatch {
    pub status: Option<InspectionStatus>,
    pub model: Option<String>,
    pub brand: Option<String>,
    pub cebia_coupon_number: Option<String>,
    pub inspection_case_id: Option<String>,
    pub image_uploaded: Option<bool>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamAccount {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub xsrf_token: Option<String>,
    #[serde(default)]
    pub token_generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub daily_report_count: i64,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for UpstreamAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamAccount")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("has_token", &self.token.is_some())
            .field("token_generated_at", &self.token_generated_at)
            .field("daily_report_count", &self.daily_report_count)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckCarVinRecord {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub inspection_id: String,
    pub vin: String,
    #[serde(default)]
    pub stored_vin_data: Option<Value>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub report_id: Option<String>,
    #[serde(default)]
    pub initiate_report: bool,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub checkcarvin_user_id: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub checkcarvin_account_id: Option<String>,
    #[serde(default)]
    pub report_generated: bool,
    #[serde(default)]
    pub report_uuid: Option<String>,
    #[serde(default)]
    pub report_generated_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub report_path: Option<String>,
    #[serde(default)]
    pub report_source: Option<String>,
    #[serde(default)]
    pub report_data: Option<Value>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckCarVinPatch {
    pub stored_vin_data: Option<Value>,
    pub report_id: Option<String>,
    pub initiate_report: Option<bool>,
    pub checkcarvin_user_id: Option<String>,
    pub checkcarvin_account_id: Option<String>,
    pub report_generated: Option<bool>,
    pub report_uuid: Option<String>,
    pub report_generated_on: Option<DateTime<Utc>>,
    pub report_path: Option<String>,
    pub report_source: Option<String>,
    pub report_data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSetting {
    pub prop_name: String,
    #[serde(default)]
    pub prop_value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub url: String,
    pub request_data: Value,
    pub response_data: Value,
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromoCode {
    pub code: String,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessCorrelation {
    pub process_id: String,
    #[serde(deserialize_with = "id_string")]
    pub inspection_id: String,
    pub email: String,
}

pub async fn find<T: DeserializeOwned>(
    store: &dyn RecordStore,
    table: &str,
    query: &Query,
) -> Result<Option<T>, StoreError> {
    store
        .select_one(table, query)
        .await?
        .map(|row| decode(table, row))
        .transpose()
}

pub async fn list<T: DeserializeOwned>(
    store: &dyn RecordStore,
    table: &str,
    query: &Query,
) -> Result<Vec<T>, StoreError> {
    store
        .select_many(table, query)
        .await?
        .into_iter()
        .map(|row| decode(table, row))
        .collect()
}

pub fn to_patch<T: Serialize>(table: &str, patch: &T) -> Result<Value, StoreError> {
    serde_json::to_value(patch).map_err(|err| StoreError::Shape {
        table: table.to_string(),
        message: err.to_string(),
    })
}

fn default_true() -> bool {
    true
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

fn opt_id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_strings_round_trip_through_rows() {
        let row = json!({
            "id": 42,
            "plate_number": "KMHJ3815GGU085263",
            "email": "driver@example.com",
            "status": "report uploaded to pdfco",
            "vin_type": "korea",
            "queue_id": 991,
        });
        let inspection: Inspection = serde_json::from_value(row).unwrap();
        assert_eq!(inspection.id, "42");
        assert_eq!(inspection.status, InspectionStatus::ReportUploaded);
        assert_eq!(inspection.vin_type, VinType::Korea);
        assert_eq!(inspection.queue_id.as_deref(), Some("991"));
        assert!(inspection.send_email);
    }

    #[test]
    fn ranks_follow_declared_lifecycle() {
        let order = [
            InspectionStatus::Pending,
            InspectionStatus::Paid,
            InspectionStatus::ReportInitiated,
            InspectionStatus::ReportGenerated,
            InspectionStatus::ReportDownloaded,
            InspectionStatus::ReportUploaded,
            InspectionStatus::Completed,
        ];
        assert!(order.windows(2).all(|w| w[0].rank() < w[1].rank()));
    }

    #[test]
    fn patches_skip_unset_fields() {
        let patch = InspectionPatch {
            status: Some(InspectionStatus::Paid),
            ..Default::default()
        };
        assert_eq!(
            to_patch(INSPECTIONS, &patch).unwrap(),
            json!({"status": "paid"})
        );
    }

    #[test]
    fn account_debug_hides_password() {
        let account: UpstreamAccount = serde_json::from_value(json!({
            "id": "1",
            "email": "pool@example.com",
            "password": "hunter2",
        }))
        .unwrap();
        assert!(!format!("{account:?}").contains("hunter2"));
    }
}
