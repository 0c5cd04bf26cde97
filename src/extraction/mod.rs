//! Report PDF to structured vehicle-history data. Two interchangeable
//! strategies sit behind [`ReportExtractor`]: the PDF.co conversion service
//! and a local text parser.

pub mod local;
pub mod pdfco;
pub mod sanitize;

use async_trait::async_trait;
use serde_json::Value;
use std::{path::Path, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use local::LocalExtractor;
pub use pdfco::PdfCoExtractor;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("service error: {0}")]
    Service(String),
    #[error("could not read report: {0}")]
    Read(#[from] std::io::Error),
    #[error("could not parse report: {0}")]
    Parse(String),
}

#[async_trait]
pub trait ReportExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Makes the file available to [`convert`](Self::convert) and returns the
    /// handle to pass on. `None` when staging failed.
    async fn stage(&self, path: &Path) -> Option<String>;

    /// Structured data for a staged report, `None` on failure or timeout.
    async fn convert(&self, source: &str, cancel: &CancellationToken) -> Option<Value>;
}

/// `REPORT_EXTRACTOR=pdfco|local`; PDF.co by default when a key is present.
pub fn extractor_from_env() -> Arc<dyn ReportExtractor> {
    let requested = std::env::var("REPORT_EXTRACTOR")
        .ok()
        .map(|v| v.trim().to_lowercase());
    let pdfco = PdfCoExtractor::from_env();
    let extractor: Arc<dyn ReportExtractor> = match (requested.as_deref(), pdfco) {
        (Some("local"), _) => Arc::new(LocalExtractor),
        (_, Some(pdfco)) => Arc::new(pdfco),
        (Some("pdfco"), None) => {
            warn!(target = "vinrelay.pdfco", "PDFCO_API_KEY missing; using local extraction");
            Arc::new(LocalExtractor)
        }
        (_, None) => Arc::new(LocalExtractor),
    };
    info!(target = "vinrelay.pdfco", extractor = extractor.name(), "report_extractor_selected");
    extractor
}
