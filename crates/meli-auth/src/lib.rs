//! Mercado Livre OAuth primitives
//!
//! Three pieces, layered bottom-up:
//! 1. PKCE generation and validation per RFC 7636 (`pkce`)
//! 2. A bounded retry policy for transient upstream failures (`retry`)
//! 3. The marketplace API client wrapping the token and identity
//!    endpoints (`client`)
//!
//! The client is stateless: it holds only a shared `reqwest::Client` and the
//! API base URL. Token persistence lives in `meli-store`.

mod client;
mod error;
mod pkce;
mod retry;

pub use client::{DEFAULT_API_BASE, IdentityPayload, MeliClient, TokenPayload};
pub use error::{Error, Result};
pub use pkce::{
    AuthorizationUrlParams, build_authorization_url, make_challenge, make_state, make_verifier,
    sha256_hex, validate_state, validate_verifier, DEFAULT_VERIFIER_LEN,
};
pub use retry::RetryPolicy;
