use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{FetchReport, GmailBackend, HttpApi, IngestionBackend};
use crate::config::ConnectConfig;
use crate::error::ConnectError;
use crate::guard::PendingArtifactGuard;
use crate::handshake::Coordinator;
use crate::identity::IdentitySession;
use crate::status::{ConnectionStatus, ConnectionStatusStore};
use crate::sync::{SyncMode, SyncTrigger};

/// Everything a settings surface needs for one user's Gmail connection:
/// the handshake coordinator, cached status, manual sync and disconnect.
pub struct GmailConnection {
    identity: Arc<dyn IdentitySession>,
    backend: Arc<dyn GmailBackend>,
    status: Arc<ConnectionStatusStore>,
    sync: SyncTrigger,
    coordinator: Arc<Coordinator>,
}

impl GmailConnection {
    pub fn new(
        config: ConnectConfig,
        identity: Arc<dyn IdentitySession>,
        backend: Arc<dyn GmailBackend>,
        ingestion: Arc<dyn IngestionBackend>,
        guard: PendingArtifactGuard,
    ) -> Self {
        let status = Arc::new(ConnectionStatusStore::new(Arc::clone(&backend)));
        let sync = SyncTrigger::new(ingestion);
        let coordinator = Arc::new(Coordinator::new(
            config,
            Arc::clone(&identity),
            Arc::clone(&backend),
            Arc::clone(&status),
            sync.clone(),
            guard,
        ));
        Self {
            identity,
            backend,
            status,
            sync,
            coordinator,
        }
    }

    /// Wires both backends to the HTTP client.
    pub fn over_http(
        config: ConnectConfig,
        identity: Arc<dyn IdentitySession>,
    ) -> Result<Self, ConnectError> {
        let api = Arc::new(HttpApi::new(&config, Arc::clone(&identity))?);
        Ok(Self::new(
            config,
            identity,
            api.clone(),
            api,
            PendingArtifactGuard::new(),
        ))
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    pub fn last_status_error(&self) -> Option<String> {
        self.status.last_error()
    }

    pub async fn refresh_status(&self) -> ConnectionStatus {
        self.status.refresh().await
    }

    /// Manual fetch for the signed-in user, independent of any handshake.
    pub async fn sync_now(&self, mode: SyncMode) -> Result<FetchReport, ConnectError> {
        let uid = self
            .identity
            .current_user()
            .map(|session| session.user_id)
            .unwrap_or_default();
        self.sync.trigger(&uid, mode).await
    }

    /// Revokes the stored credentials. Local state is cleared even when the
    /// server call fails, and that failure is still returned.
    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        let result = self.backend.disconnect().await.map_err(ConnectError::from);
        self.status.clear();
        self.coordinator.reset();
        match &result {
            Ok(()) => info!("gmail account disconnected"),
            Err(error) => warn!("gmail disconnect failed, local state cleared anyway: {error}"),
        }
        result
    }

    /// Follows sign-in and sign-out: each change resets the handshake, and
    /// status is refreshed for a signed-in user or cleared otherwise. The
    /// task stops when the returned handle is dropped.
    pub fn watch_identity(&self) -> IdentityWatch {
        let mut updates = self.identity.subscribe();
        let coordinator = Arc::clone(&self.coordinator);
        let status = Arc::clone(&self.status);

        let task = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let signed_in = updates.borrow_and_update().is_some();
                debug!(signed_in, "identity changed");
                coordinator.reset();
                if signed_in {
                    status.refresh().await;
                } else {
                    status.clear();
                }
            }
        });
        IdentityWatch { task }
    }
}

pub struct IdentityWatch {
    task: JoinHandle<()>,
}

impl IdentityWatch {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for IdentityWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
