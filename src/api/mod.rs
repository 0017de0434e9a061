use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ApiError;

pub mod http;

pub use http::HttpApi;

pub const AUTH_URL_PATH: &str = "/api/gmail/auth-url";
pub const CALLBACK_PATH: &str = "/api/gmail/callback";
pub const FINALIZE_TOKENS_PATH: &str = "/api/gmail/finalize-tokens";
pub const STATUS_PATH: &str = "/api/gmail/status";
pub const DISCONNECT_PATH: &str = "/api/gmail/disconnect";
pub const FETCH_PATH: &str = "/fetch";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthUrlResponse {
    pub auth_url: String,
}

/// Which slice of the mailbox the ingestion service should pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Large historical pull, used right after a mailbox is connected.
    Backfill,
    /// Only the most recent small batch.
    Incremental,
}

impl Display for SyncMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backfill => write!(f, "backfill"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

/// Body returned by the ingestion service's `/fetch` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReport {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub users_processed: Option<u64>,
    #[serde(default)]
    pub backfill: Option<bool>,
}

/// Token-management API. Every call is authenticated with the current
/// session's bearer token.
#[async_trait]
pub trait GmailBackend: Send + Sync {
    async fn auth_url(&self) -> Result<Url, ApiError>;

    async fn exchange_code(&self, code: &str) -> Result<(), ApiError>;

    async fn finalize_tokens(&self, temp_token_id: &str) -> Result<(), ApiError>;

    async fn status(&self) -> Result<StatusResponse, ApiError>;

    async fn disconnect(&self) -> Result<(), ApiError>;
}

#[async_trait]
pub trait IngestionBackend: Send + Sync {
    async fn fetch(&self, uid: &str, mode: SyncMode) -> Result<FetchReport, ApiError>;
}
