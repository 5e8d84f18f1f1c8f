//! One-shot billing report extraction
//!
//! Fetches an access token from the token broker, drives the billing report
//! pipeline (periods -> create -> poll -> download), and writes the file to
//! the output directory with a timestamped name. Meant to run from a
//! scheduler; exits non-zero on any failure.

mod config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use meli_billing::{BillingClient, BrokerTokenSource, ReportRequest, run_report, token_prefix};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let config_path = Config::resolve_path(cli_config_path);
    let config = Config::load(&config_path).context("failed to load configuration")?;

    let internal_key = config.internal_key.context("internal_key missing")?;
    info!(
        broker_url = %config.report.broker_url,
        seller_id = %config.report.seller_id,
        group = %config.report.group,
        "starting report extraction"
    );

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let tokens = BrokerTokenSource::new(
        http.clone(),
        config.report.broker_url.clone(),
        internal_key.expose().to_owned(),
        config.report.seller_id.clone(),
    );

    // warm fetch so a not-connected seller fails before any billing call
    let bundle = tokens.get(true).await.context("failed to fetch token from broker")?;
    info!(
        seller_id = %bundle.seller_id,
        token_prefix = token_prefix(&bundle.access_token),
        "token acquired"
    );

    let api_base = std::env::var("MELI_API_BASE")
        .unwrap_or_else(|_| "https://api.mercadolibre.com".to_owned());
    let client = BillingClient::new(http, api_base, tokens);

    let request = ReportRequest {
        group: config.report.group.clone(),
        document_type: config.report.document_type.clone(),
        report_format: config.report.report_format.clone(),
    };
    let report = run_report(&client, &request).await.context("report pipeline failed")?;

    let extension = guess_extension(&config.report.report_format, &report.content_type);
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let filename = safe_filename(&format!(
        "meli_sales_report_{}_{}_{}_{}_{timestamp}.{extension}",
        config.report.group.to_uppercase(),
        config.report.document_type.to_uppercase(),
        report.period_key,
        report.file_id,
    ));
    let path = save_file(&report.content, &config.report.out_dir, &filename)
        .context("failed to write report file")?;

    info!(
        path = %path.display(),
        bytes = report.content.len(),
        content_type = %report.content_type,
        "report saved"
    );
    Ok(())
}

/// Map the requested format and the served content type to a file extension.
fn guess_extension(report_format: &str, content_type: &str) -> &'static str {
    let rf = report_format.to_uppercase();
    let ct = content_type.to_lowercase();

    if ct.contains("spreadsheet") || ct.contains("xlsx") || rf == "XLSX" {
        return "xlsx";
    }
    if ct.contains("csv") || ct.contains("text/plain") || rf == "CSV" {
        return "csv";
    }
    "bin"
}

/// Keep only filesystem-safe characters.
fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn save_file(content: &[u8], out_dir: &Path, filename: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join(filename);
    std::fs::write(&path, content)?;
    Ok(path)
}
