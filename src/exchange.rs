use std::sync::Arc;

use tracing::info;

use crate::api::GmailBackend;
use crate::error::ConnectError;
use crate::handshake::Artifact;

/// Redeems an authorization artifact with the token service, which stores the
/// durable Gmail credentials server-side.
///
/// The endpoints are not assumed to be idempotent; callers must hold the
/// [`PendingArtifactGuard`](crate::guard::PendingArtifactGuard) entry for the
/// artifact before calling [`exchange`](Self::exchange).
#[derive(Clone)]
pub struct TokenExchange {
    backend: Arc<dyn GmailBackend>,
}

impl TokenExchange {
    pub fn new(backend: Arc<dyn GmailBackend>) -> Self {
        Self { backend }
    }

    pub async fn exchange(&self, artifact: &Artifact) -> Result<(), ConnectError> {
        info!(artifact = %artifact.redacted(), "redeeming gmail authorization artifact");
        let result = match artifact {
            Artifact::Code(code) => self.backend.exchange_code(code).await,
            Artifact::TempToken(temp_token_id) => self.backend.finalize_tokens(temp_token_id).await,
        };
        result.map_err(ConnectError::from_exchange)
    }
}
