//! Shared types for the Mercado Livre ingestion services

mod error;
mod secret;
mod time;

pub use error::{Error, Result};
pub use secret::Secret;
pub use time::unix_now;
