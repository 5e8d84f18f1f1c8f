//! Configuration for the one-shot report extraction
//!
//! A TOML file is optional for this binary; everything can come from the
//! environment, which is how the scheduler invokes it. Env vars override
//! file values.

use common::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub report: ReportConfig,

    /// Shared secret for the broker, `MELI_INTERNAL_KEY` env var.
    #[serde(skip)]
    pub internal_key: Option<Secret<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ReportConfig {
    /// Base URL of the token broker, `MELI_OAUTH_SERVICE_URL` env var.
    #[serde(default)]
    pub broker_url: String,
    /// Seller to extract for, `MELI_SELLER_ID` env var.
    #[serde(default)]
    pub seller_id: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_document_type")]
    pub document_type: String,
    #[serde(default = "default_report_format")]
    pub report_format: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            seller_id: String::new(),
            group: default_group(),
            document_type: default_document_type(),
            report_format: default_report_format(),
            out_dir: default_out_dir(),
        }
    }
}

fn default_group() -> String {
    "ML".into()
}

fn default_document_type() -> String {
    "BILL".into()
}

fn default_report_format() -> String {
    "CSV".into()
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

impl Config {
    /// Load from the TOML file when it exists, then overlay env vars.
    pub fn load(path: &Path) -> common::Result<Self> {
        let mut config: Config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };

        let overlay = |target: &mut String, var: &str| {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    *target = value.trim().to_owned();
                }
            }
        };
        overlay(&mut config.report.broker_url, "MELI_OAUTH_SERVICE_URL");
        overlay(&mut config.report.seller_id, "MELI_SELLER_ID");
        overlay(&mut config.report.group, "MELI_BILLING_GROUP");
        overlay(&mut config.report.document_type, "MELI_BILLING_DOCUMENT_TYPE");
        overlay(&mut config.report.report_format, "MELI_BILLING_REPORT_FORMAT");
        if let Ok(dir) = std::env::var("MELI_REPORT_OUT_DIR") {
            if !dir.trim().is_empty() {
                config.report.out_dir = PathBuf::from(dir.trim());
            }
        }
        if let Ok(key) = std::env::var("MELI_INTERNAL_KEY") {
            config.internal_key = Some(Secret::new(key));
        }

        let mut missing = Vec::new();
        if config.report.broker_url.is_empty() {
            missing.push("report.broker_url (MELI_OAUTH_SERVICE_URL)".to_owned());
        }
        if config.internal_key.as_ref().is_none_or(Secret::is_empty) {
            missing.push("internal_key (MELI_INTERNAL_KEY)".to_owned());
        }
        if config.report.seller_id.is_empty() {
            missing.push("report.seller_id (MELI_SELLER_ID)".to_owned());
        }
        if !missing.is_empty() {
            return Err(common::Error::ConfigMissing(missing));
        }
        Ok(config)
    }

    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("billing-report.toml")
    }
}
