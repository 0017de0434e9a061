use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::api::GmailBackend;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    status: ConnectionStatus,
    last_error: Option<String>,
    /// Bumped by `clear`; a refresh started under an older epoch is dropped.
    epoch: u64,
}

/// Last-known mailbox connection state for the current user. The backend is
/// authoritative; this is only a cache for the lifetime of the process.
pub struct ConnectionStatusStore {
    backend: Arc<dyn GmailBackend>,
    snapshot: Mutex<Snapshot>,
}

impl ConnectionStatusStore {
    pub fn new(backend: Arc<dyn GmailBackend>) -> Self {
        Self {
            backend,
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    /// Best-effort health check. Any failure degrades to disconnected and is
    /// kept in [`last_error`](Self::last_error) instead of being returned.
    pub async fn refresh(&self) -> ConnectionStatus {
        let epoch = self.lock().epoch;
        let now = Utc::now();
        let (status, error) = match self.backend.status().await {
            Ok(response) => (
                ConnectionStatus {
                    connected: response.connected,
                    account_email: response.email.filter(|email| !email.trim().is_empty()),
                    checked_at: Some(now),
                },
                None,
            ),
            Err(error) => {
                warn!("gmail status check failed, treating as disconnected: {error}");
                (
                    ConnectionStatus {
                        connected: false,
                        account_email: None,
                        checked_at: Some(now),
                    },
                    Some(error.to_string()),
                )
            }
        };

        let mut snapshot = self.lock();
        if snapshot.epoch != epoch {
            debug!("status was cleared during refresh, discarding result");
            return snapshot.status.clone();
        }
        debug!(connected = status.connected, "gmail connection status refreshed");
        snapshot.status = status.clone();
        snapshot.last_error = error;
        status
    }

    pub fn get(&self) -> ConnectionStatus {
        self.lock().status.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn clear(&self) {
        let mut snapshot = self.lock();
        snapshot.status = ConnectionStatus::disconnected();
        snapshot.last_error = None;
        snapshot.epoch += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
