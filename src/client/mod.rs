//! HTTP client side of the auth flow: an in-memory access token holder with
//! single-flight refresh, and an API client that retries once on 401.

use thiserror::Error;

pub mod api;
pub mod token_manager;

pub use api::ApiClient;
pub use token_manager::TokenManager;

pub const REFRESH_PATH: &str = "/auth/refresh";

/// Outcome of a failed refresh. `Clone` so every waiter on a shared refresh
/// receives the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("refresh rejected with status {status}")]
    Rejected { status: u16 },
    #[error("refresh request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session expired; login required")]
    SessionExpired(#[source] RefreshError),
    #[error("request failed with status {status}: {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
