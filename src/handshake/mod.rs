//! Gmail OAuth handshake.
//!
//! [`Coordinator`] owns the [`HandshakeState`] of one connection attempt and
//! drives it from consent through artifact redemption. The consent page is
//! presented either by navigating away ([`Navigator`]) and later receiving the
//! callback route, or inside a popup window ([`popup::PopupHost`]).

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::api::{FetchReport, GmailBackend};
use crate::config::ConnectConfig;
use crate::error::ConnectError;
use crate::exchange::TokenExchange;
use crate::guard::PendingArtifactGuard;
use crate::identity::{wait_for_user, IdentitySession};
use crate::status::{ConnectionStatus, ConnectionStatusStore};
use crate::sync::{SyncMode, SyncTrigger};

pub mod callback;
pub mod loopback;
pub mod popup;

pub use callback::{settings_location, CallbackParams, SUCCESS_MARKER};
pub use loopback::CallbackListener;
pub use popup::{
    ConsentWindow, CrossOriginAccess, PopupFeatures, PopupHandle, PopupHost, ScreenGeometry,
    WindowMessage,
};

const REDACTED_ARTIFACT_PREFIX: usize = 8;

/// Proof of consent handed back by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Artifact {
    /// Raw authorization code, exchanged directly by the token service.
    Code(String),
    /// Identifier of tokens the backend already obtained and parked.
    TempToken(String),
}

impl Artifact {
    /// Idempotency key; the kind is part of it so equal values of different
    /// kinds never collide.
    pub fn key(&self) -> String {
        match self {
            Self::Code(code) => format!("code:{code}"),
            Self::TempToken(id) => format!("temp_token_id:{id}"),
        }
    }

    pub fn redacted(&self) -> String {
        let (kind, value) = match self {
            Self::Code(code) => ("code", code),
            Self::TempToken(id) => ("temp_token_id", id),
        };
        let prefix: String = value.chars().take(REDACTED_ARTIFACT_PREFIX).collect();
        format!("{kind}={prefix}…")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePhase {
    Idle,
    AwaitingConsent,
    ArtifactReceived,
    Exchanging,
    Connected,
    Failed,
}

impl Display for HandshakePhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::AwaitingConsent => "awaiting consent",
            Self::ArtifactReceived => "artifact received",
            Self::Exchanging => "exchanging",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// State of the current handshake attempt. Only the transition methods
/// mutate it; each returns `false` (leaving the state untouched) when the
/// transition is not valid from the current phase.
///
/// `generation` identifies the attempt. It moves forward on `begin`, on a
/// `receive` and on `reset`; transitions made on behalf of an attempt carry
/// the generation they started under and are rejected once it has moved on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandshakeState {
    pub phase: HandshakePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ConnectError>,
    pub generation: u64,
}

impl Default for HandshakeState {
    fn default() -> Self {
        Self::idle()
    }
}

impl HandshakeState {
    pub fn idle() -> Self {
        Self {
            phase: HandshakePhase::Idle,
            artifact: None,
            error: None,
            generation: 0,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.phase,
            HandshakePhase::AwaitingConsent
                | HandshakePhase::ArtifactReceived
                | HandshakePhase::Exchanging
        )
    }

    pub fn is_connected(&self) -> bool {
        self.phase == HandshakePhase::Connected
    }

    fn begin(&mut self) -> bool {
        if self.is_in_progress() {
            return false;
        }
        self.phase = HandshakePhase::AwaitingConsent;
        self.artifact = None;
        self.error = None;
        self.generation += 1;
        true
    }

    /// Accepted while waiting for consent, or on a fresh state when the
    /// artifact arrives through the callback route.
    fn receive(&mut self, artifact: Artifact) -> bool {
        if !matches!(
            self.phase,
            HandshakePhase::Idle | HandshakePhase::AwaitingConsent
        ) {
            return false;
        }
        self.phase = HandshakePhase::ArtifactReceived;
        self.artifact = Some(artifact);
        self.error = None;
        self.generation += 1;
        true
    }

    fn start_exchange(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.phase != HandshakePhase::ArtifactReceived {
            return false;
        }
        self.phase = HandshakePhase::Exchanging;
        true
    }

    fn connect(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.phase != HandshakePhase::Exchanging {
            return false;
        }
        self.phase = HandshakePhase::Connected;
        true
    }

    fn fail(&mut self, generation: u64, error: ConnectError) -> bool {
        if self.generation != generation
            || matches!(
                self.phase,
                HandshakePhase::Connected | HandshakePhase::Failed
            )
        {
            return false;
        }
        self.phase = HandshakePhase::Failed;
        self.error = Some(error);
        true
    }

    /// Always retires the current generation; reports a change only when
    /// the visible state differs from Idle.
    fn reset(&mut self) -> bool {
        self.generation += 1;
        if self.phase == HandshakePhase::Idle && self.artifact.is_none() && self.error.is_none() {
            return false;
        }
        self.phase = HandshakePhase::Idle;
        self.artifact = None;
        self.error = None;
        true
    }
}

/// Sends the user agent to the consent page for the redirect strategy.
pub trait Navigator: Send + Sync {
    fn navigate(&self, url: &Url) -> Result<(), ConnectError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectReport {
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backfill: Option<FetchReport>,
    /// Set when the post-connection backfill failed; the connection stands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<ConnectError>,
}

impl ConnectReport {
    fn new(status: ConnectionStatus, backfill: Result<FetchReport, ConnectError>) -> Self {
        match backfill {
            Ok(report) => Self {
                status,
                backfill: Some(report),
                sync_error: None,
            },
            Err(error) => Self {
                status,
                backfill: None,
                sync_error: Some(error),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Connected(ConnectReport),
    /// The artifact was already claimed by another observer, arrived after
    /// this attempt had moved on, or its attempt was reset before the
    /// exchange finished. No status refresh or backfill was started for it.
    Ignored,
}

pub struct Coordinator {
    config: ConnectConfig,
    identity: Arc<dyn IdentitySession>,
    backend: Arc<dyn GmailBackend>,
    status: Arc<ConnectionStatusStore>,
    exchange: TokenExchange,
    sync: SyncTrigger,
    guard: PendingArtifactGuard,
    state: watch::Sender<HandshakeState>,
}

impl Coordinator {
    pub fn new(
        config: ConnectConfig,
        identity: Arc<dyn IdentitySession>,
        backend: Arc<dyn GmailBackend>,
        status: Arc<ConnectionStatusStore>,
        sync: SyncTrigger,
        guard: PendingArtifactGuard,
    ) -> Self {
        let (state, _) = watch::channel(HandshakeState::idle());
        Self {
            config,
            identity,
            exchange: TokenExchange::new(Arc::clone(&backend)),
            backend,
            status,
            sync,
            guard,
            state,
        }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    pub fn state(&self) -> HandshakeState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HandshakeState> {
        self.state.subscribe()
    }

    /// Returns to Idle so the user can retry. Any in-flight attempt keeps
    /// running but its later transitions are rejected.
    pub fn reset(&self) {
        if self.state.send_if_modified(HandshakeState::reset) {
            debug!("gmail handshake reset to idle");
        }
    }

    /// Redirect strategy: obtain the consent URL and hand it to `navigator`.
    /// The attempt continues in [`handle_callback`](Self::handle_callback).
    pub async fn begin_redirect(&self, navigator: &dyn Navigator) -> Result<Url, ConnectError> {
        let (generation, url) = self.request_consent().await?;
        if let Err(error) = navigator.navigate(&url) {
            return Err(self.fail(generation, error));
        }
        Ok(url)
    }

    /// Popup strategy: runs the whole attempt, from consent URL to backfill.
    pub async fn connect_with_popup(
        &self,
        host: &dyn PopupHost,
    ) -> Result<CallbackOutcome, ConnectError> {
        let (generation, url) = self.request_consent().await?;
        let features = PopupFeatures::centered(host.screen(), self.config.popup_size);
        let handle = match host.open_popup(&url, &features).await {
            Ok(handle) => handle,
            Err(error) => return Err(self.fail(generation, error)),
        };

        let observed = popup::await_artifact(
            handle,
            &self.config.app_origin_string(),
            self.config.poll_interval,
            self.config.popup_timeout,
        )
        .await;
        match observed {
            Ok(artifact) => self.complete(artifact).await,
            Err(error) => Err(self.fail(generation, error)),
        }
    }

    /// Callback route: the provider redirected back with query parameters.
    pub async fn handle_callback(
        &self,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, ConnectError> {
        match params.artifact() {
            Ok(artifact) => self.complete(artifact).await,
            Err(error) => {
                let generation = self.state.borrow().generation;
                Err(self.fail(generation, error))
            }
        }
    }

    /// Redeems `artifact` at most once across every holder of the shared
    /// guard, then refreshes status and triggers the initial backfill.
    pub async fn complete(&self, artifact: Artifact) -> Result<CallbackOutcome, ConnectError> {
        if !self.guard.try_acquire(&artifact) {
            debug!(artifact = %artifact.redacted(), "artifact already claimed, ignoring");
            return Ok(CallbackOutcome::Ignored);
        }
        let mut generation = 0;
        let received = self.state.send_if_modified(|state| {
            let accepted = state.receive(artifact.clone());
            generation = state.generation;
            accepted
        });
        if !received {
            self.guard.release(&artifact);
            debug!(
                artifact = %artifact.redacted(),
                phase = %self.state.borrow().phase,
                "late artifact ignored"
            );
            return Ok(CallbackOutcome::Ignored);
        }
        self.state
            .send_if_modified(|state| state.start_exchange(generation));

        if let Err(error) = self.redeem(&artifact).await {
            self.guard.release(&artifact);
            return Err(self.fail(generation, error));
        }

        if !self
            .state
            .send_if_modified(|state| state.connect(generation))
        {
            info!(
                artifact = %artifact.redacted(),
                "handshake was reset while exchanging; skipping status refresh and backfill"
            );
            return Ok(CallbackOutcome::Ignored);
        }
        info!(artifact = %artifact.redacted(), "gmail account connected");

        let status = self.status.refresh().await;
        let uid = self
            .identity
            .current_user()
            .map(|session| session.user_id)
            .unwrap_or_default();
        let backfill = self.sync.trigger(&uid, SyncMode::Backfill).await;
        if let Err(error) = &backfill {
            warn!("initial gmail backfill failed: {error}");
        }
        Ok(CallbackOutcome::Connected(ConnectReport::new(
            status, backfill,
        )))
    }

    async fn request_consent(&self) -> Result<(u64, Url), ConnectError> {
        let mut generation = 0;
        let begun = self.state.send_if_modified(|state| {
            let accepted = state.begin();
            generation = state.generation;
            accepted
        });
        if !begun {
            return Err(ConnectError::AlreadyInProgress);
        }

        let attempt = Uuid::new_v4();
        debug!(%attempt, "requesting gmail consent URL");
        match self.backend.auth_url().await {
            Ok(url) => {
                info!(%attempt, host = url.host_str().unwrap_or(""), "gmail consent URL issued");
                Ok((generation, url))
            }
            Err(error) => Err(self.fail(generation, ConnectError::from_exchange(error))),
        }
    }

    async fn redeem(&self, artifact: &Artifact) -> Result<(), ConnectError> {
        if matches!(artifact, Artifact::TempToken(_)) {
            wait_for_user(self.identity.as_ref(), self.config.session_wait).await?;
        }
        self.exchange.exchange(artifact).await
    }

    /// Records `error` against attempt `generation`. A superseded attempt
    /// leaves the state alone; the error still goes back to its caller.
    fn fail(&self, generation: u64, error: ConnectError) -> ConnectError {
        if self
            .state
            .send_if_modified(|state| state.fail(generation, error.clone()))
        {
            warn!("gmail handshake failed: {error}");
        } else {
            debug!(generation, "failure of a superseded attempt ignored: {error}");
        }
        error
    }
}
