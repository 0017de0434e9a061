use std::sync::Arc;

use tracing::{info, warn};

use crate::api::{FetchReport, IngestionBackend};
use crate::error::ConnectError;

pub use crate::api::SyncMode;

/// Asks the ingestion service to pull mail for a user. Failures are reported
/// as [`ConnectError::SyncFailed`] and never affect the connection itself.
#[derive(Clone)]
pub struct SyncTrigger {
    ingestion: Arc<dyn IngestionBackend>,
}

impl SyncTrigger {
    pub fn new(ingestion: Arc<dyn IngestionBackend>) -> Self {
        Self { ingestion }
    }

    pub async fn trigger(&self, uid: &str, mode: SyncMode) -> Result<FetchReport, ConnectError> {
        if uid.trim().is_empty() {
            return Err(ConnectError::SyncFailed(
                ConnectError::Unauthenticated.to_string(),
            ));
        }

        info!(uid, %mode, "triggering gmail fetch");
        match self.ingestion.fetch(uid, mode).await {
            Ok(report) => Ok(report),
            Err(error) => {
                warn!(uid, %mode, "gmail fetch failed: {error}");
                Err(ConnectError::from_sync(error))
            }
        }
    }
}
