use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::api::{
    AuthUrlResponse, FetchReport, GmailBackend, IngestionBackend, StatusResponse, SyncMode,
    AUTH_URL_PATH, CALLBACK_PATH, DISCONNECT_PATH, FETCH_PATH, FINALIZE_TOKENS_PATH,
    STATUS_PATH,
};
use crate::config::ConnectConfig;
use crate::error::ApiError;
use crate::identity::IdentitySession;

const REDACTED_BODY_MAX_LEN: usize = 200;

/// reqwest-backed client for the token-management API and the ingestion
/// service. A fresh bearer token is requested from the identity session for
/// every call.
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    api_base: Url,
    ingestion_host: Url,
    identity: Arc<dyn IdentitySession>,
}

impl HttpApi {
    pub fn new(config: &ConnectConfig, identity: Arc<dyn IdentitySession>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| ApiError::Transport {
                endpoint: config.api_base.to_string(),
                message: format!("build http client: {error}"),
            })?;

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            ingestion_host: config.ingestion_host.clone(),
            identity,
        })
    }

    fn endpoint(base: &Url, path: &str) -> Result<Url, ApiError> {
        let raw = format!("{}{path}", base.as_str().trim_end_matches('/'));
        Url::parse(&raw).map_err(|error| ApiError::Transport {
            endpoint: raw.clone(),
            message: format!("invalid endpoint URL: {error}"),
        })
    }

    async fn send(&self, request: RequestBuilder, endpoint: &str) -> Result<String, ApiError> {
        let token = self
            .identity
            .bearer_token()
            .await
            .map_err(|_| ApiError::Unauthenticated)?;

        debug!(endpoint, "sending authenticated request");
        let response = request
            .bearer_auth(token)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|error| ApiError::Transport {
                endpoint: endpoint.to_string(),
                message: error.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|error| ApiError::Transport {
            endpoint: endpoint.to_string(),
            message: format!("read response body: {error}"),
        })?;

        if !status.is_success() {
            let message = server_message(&body).unwrap_or_else(|| {
                let redacted = redact_response_body(&body);
                if redacted.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                } else {
                    redacted
                }
            });
            return Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl GmailBackend for HttpApi {
    async fn auth_url(&self) -> Result<Url, ApiError> {
        let url = Self::endpoint(&self.api_base, AUTH_URL_PATH)?;
        let body = self
            .send(
                self.client.post(url).json(&serde_json::json!({})),
                AUTH_URL_PATH,
            )
            .await?;

        let payload: AuthUrlResponse =
            serde_json::from_str(&body).map_err(|error| ApiError::Decode {
                endpoint: AUTH_URL_PATH.to_string(),
                message: error.to_string(),
            })?;
        Url::parse(&payload.auth_url).map_err(|error| ApiError::Decode {
            endpoint: AUTH_URL_PATH.to_string(),
            message: format!("authUrl is not a URL: {error}"),
        })
    }

    async fn exchange_code(&self, code: &str) -> Result<(), ApiError> {
        let url = Self::endpoint(&self.api_base, CALLBACK_PATH)?;
        self.send(
            self.client
                .post(url)
                .json(&serde_json::json!({ "code": code })),
            CALLBACK_PATH,
        )
        .await?;
        Ok(())
    }

    async fn finalize_tokens(&self, temp_token_id: &str) -> Result<(), ApiError> {
        let url = Self::endpoint(&self.api_base, FINALIZE_TOKENS_PATH)?;
        self.send(
            self.client
                .post(url)
                .json(&serde_json::json!({ "temp_token_id": temp_token_id })),
            FINALIZE_TOKENS_PATH,
        )
        .await?;
        Ok(())
    }

    async fn status(&self) -> Result<StatusResponse, ApiError> {
        let url = Self::endpoint(&self.api_base, STATUS_PATH)?;
        let body = self.send(self.client.get(url), STATUS_PATH).await?;
        serde_json::from_str(&body).map_err(|error| ApiError::Decode {
            endpoint: STATUS_PATH.to_string(),
            message: error.to_string(),
        })
    }

    async fn disconnect(&self) -> Result<(), ApiError> {
        let url = Self::endpoint(&self.api_base, DISCONNECT_PATH)?;
        self.send(self.client.delete(url), DISCONNECT_PATH).await?;
        Ok(())
    }
}

#[async_trait]
impl IngestionBackend for HttpApi {
    async fn fetch(&self, uid: &str, mode: SyncMode) -> Result<FetchReport, ApiError> {
        let mut url = Self::endpoint(&self.ingestion_host, FETCH_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("uid", uid);
            if mode == SyncMode::Backfill {
                query.append_pair("backfill", "true");
            }
        }

        let body = self
            .send(
                self.client
                    .post(url)
                    .header("content-type", "application/json"),
                FETCH_PATH,
            )
            .await?;

        if body.trim().is_empty() {
            return Ok(FetchReport::default());
        }
        match serde_json::from_str(&body) {
            Ok(report) => Ok(report),
            Err(error) => {
                warn!(
                    "ignoring undecodable ingestion response ({}): {}",
                    error,
                    redact_response_body(&body)
                );
                Ok(FetchReport::default())
            }
        }
    }
}

/// Extracts `error` or `message` from a JSON error body.
fn server_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["error", "message"]
        .iter()
        .filter_map(|key| value.get(*key))
        .find_map(|field| match field {
            Value::String(text) => Some(text.trim().to_string()),
            Value::Object(inner) => inner
                .get("message")
                .and_then(Value::as_str)
                .map(|text| text.trim().to_string()),
            _ => None,
        })
        .filter(|text| !text.is_empty())
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}…[truncated {} bytes]",
        &trimmed[..cut],
        trimmed.len()
    )
}
