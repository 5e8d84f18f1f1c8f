//! End-to-end report pipeline
//!
//! Linear state machine: LISTING -> CREATING -> POLLING -> DOWNLOADING ->
//! DONE, failing out of whichever stage errored. Single caller, no locking;
//! concurrency control lives in the broker, not here.

use tracing::info;

use crate::error::Result;
use crate::periods::choose_period;
use crate::report::BillingClient;

/// Pipeline stage, carried in log fields so a stuck run names where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Listing,
    Creating,
    Polling,
    Downloading,
    Done,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Listing => "listing",
            Stage::Creating => "creating",
            Stage::Polling => "polling",
            Stage::Downloading => "downloading",
            Stage::Done => "done",
        }
    }
}

/// What to ask the billing API for.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub group: String,
    pub document_type: String,
    pub report_format: String,
}

impl Default for ReportRequest {
    fn default() -> Self {
        Self {
            group: "ML".into(),
            document_type: "BILL".into(),
            report_format: "CSV".into(),
        }
    }
}

impl ReportRequest {
    fn normalized(&self) -> Self {
        let up = |s: &str| s.trim().to_uppercase();
        Self {
            group: up(&self.group),
            document_type: up(&self.document_type),
            report_format: up(&self.report_format),
        }
    }
}

/// A downloaded report plus the identifiers that produced it.
pub struct ReportFile {
    pub period_key: String,
    pub file_id: String,
    pub content: Vec<u8>,
    pub content_type: String,
}

/// Run the full pipeline: pick the most recent period, create the report,
/// wait for it, download it.
pub async fn run_report(client: &BillingClient, request: &ReportRequest) -> Result<ReportFile> {
    let request = request.normalized();

    info!(stage = Stage::Listing.as_str(), group = %request.group, "pipeline started");
    let periods = client
        .list_periods(&request.group, &request.document_type)
        .await?;
    let period_key = choose_period(&periods)?;

    info!(stage = Stage::Creating.as_str(), %period_key, "period selected");
    let file_id = client
        .create_report(
            &period_key,
            &request.group,
            &request.document_type,
            &request.report_format,
        )
        .await?;

    info!(stage = Stage::Polling.as_str(), %file_id, "waiting for report");
    client
        .poll_until_ready(&file_id, &request.document_type)
        .await?;

    info!(stage = Stage::Downloading.as_str(), %file_id, "report ready");
    let (content, content_type) = client.download(&file_id, &request.document_type).await?;

    info!(
        stage = Stage::Done.as_str(),
        bytes = content.len(),
        %content_type,
        "pipeline finished"
    );
    Ok(ReportFile {
        period_key,
        file_id,
        content,
        content_type,
    })
}
