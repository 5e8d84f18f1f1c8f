//! Billing report pipeline for the marketplace
//!
//! Sits downstream of the token broker: fetches ready-to-use access tokens
//! over HTTP, then drives the billing integration endpoints through the
//! list-create-poll-download sequence. The broker owns refresh and locking;
//! this crate retries a call at most once with a forced token re-fetch, and
//! retries transient upstream failures within a bounded policy.

mod error;
mod periods;
mod pipeline;
mod report;
mod token_source;

pub use error::{Error, Result};
pub use periods::{Period, choose_period, parse_periods};
pub use pipeline::{ReportFile, ReportRequest, Stage, run_report};
pub use report::BillingClient;
pub use token_source::{BrokerTokenSource, TokenBundle, token_prefix};
