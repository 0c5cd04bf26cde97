use crate::store::records::{Inspection, InspectionStatus, VinType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CreateInspectionRequest {
    #[serde(alias = "vin")]
    pub plate_number: String,
    pub email: String,
    #[serde(default)]
    pub vin_type: Option<VinType>,
    #[serde(default)]
    pub promo_code: Option<String>,
    #[serde(default)]
    pub reseller_id: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub send_email: Option<bool>,
    #[serde(default)]
    pub skip_ai: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectionSummary {
    pub id: String,
    pub status: InspectionStatus,
    pub vin_type: VinType,
    pub inspection_fee: f64,
    pub discount: f64,
    pub amount_due: f64,
    /// True when a recent identical submission was returned instead.
    pub existing: bool,
}

impl InspectionSummary {
    pub fn from_inspection(inspection: &Inspection, existing: bool) -> Self {
        Self {
            id: inspection.id.clone(),
            status: inspection.status,
            vin_type: inspection.vin_type,
            inspection_fee: inspection.inspection_fee,
            discount: inspection.discount,
            amount_due: inspection.amount_due(),
            existing,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub inspection_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmQuery {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessRequest {
    pub process_id: String,
}
