//! Popup consent strategy.
//!
//! The consent page opens in a secondary window. The artifact can come back
//! two ways: the callback page posts a message to the opener, or the window
//! itself lands on an app URL carrying the query parameters. Both are raced
//! against the user closing the window and an overall deadline.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};
use url::Url;

use super::callback::CallbackParams;
use super::Artifact;
use crate::config::PopupSize;
use crate::error::ConnectError;

/// Message type posted by the callback page to its opener.
pub const CALLBACK_MESSAGE_TYPE: &str = "oauth-callback";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenGeometry {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopupFeatures {
    pub width: u32,
    pub height: u32,
    pub left: i32,
    pub top: i32,
}

impl PopupFeatures {
    /// Centers a window of `size` on `screen`. A window larger than the
    /// screen is pinned to its top-left corner.
    pub fn centered(screen: ScreenGeometry, size: PopupSize) -> Self {
        let offset = |outer: u32, inner: u32| {
            let centered = (i64::from(outer) - i64::from(inner)).max(0) / 2;
            i32::try_from(centered).unwrap_or(i32::MAX)
        };
        Self {
            width: size.width,
            height: size.height,
            left: screen.left.saturating_add(offset(screen.width, size.width)),
            top: screen.top.saturating_add(offset(screen.height, size.height)),
        }
    }

    pub fn to_feature_string(&self) -> String {
        format!(
            "width={},height={},left={},top={},scrollbars=yes,resizable=yes",
            self.width, self.height, self.left, self.top
        )
    }
}

/// Reading the location of a window on another origin is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("window location is not readable across origins")]
pub struct CrossOriginAccess;

pub trait ConsentWindow: Send + Sync {
    fn is_closed(&self) -> bool;

    fn current_url(&self) -> Result<Url, CrossOriginAccess>;

    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowMessage {
    pub origin: String,
    pub data: Value,
}

pub struct PopupHandle {
    pub window: Box<dyn ConsentWindow>,
    pub messages: mpsc::UnboundedReceiver<WindowMessage>,
}

#[async_trait]
pub trait PopupHost: Send + Sync {
    fn screen(&self) -> ScreenGeometry;

    /// Fails with [`ConnectError::UserCancelled`] when the window could not
    /// be opened, e.g. because it was blocked.
    async fn open_popup(
        &self,
        url: &Url,
        features: &PopupFeatures,
    ) -> Result<PopupHandle, ConnectError>;
}

/// Waits for the first artifact or terminal condition of a popup. The window
/// is closed on every exit path if it is still open.
pub async fn await_artifact(
    handle: PopupHandle,
    app_origin: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<Artifact, ConnectError> {
    let PopupHandle {
        mut window,
        mut messages,
    } = handle;

    let result = race(window.as_ref(), &mut messages, app_origin, poll_interval, timeout).await;
    if !window.is_closed() {
        window.close();
    }
    result
}

async fn race(
    window: &dyn ConsentWindow,
    messages: &mut mpsc::UnboundedReceiver<WindowMessage>,
    app_origin: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<Artifact, ConnectError> {
    let deadline = time::sleep_until(Instant::now() + timeout);
    tokio::pin!(deadline);

    let mut poll = time::interval_at(Instant::now() + poll_interval, poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut messages_open = true;

    loop {
        tokio::select! {
            biased;

            message = messages.recv(), if messages_open => match message {
                Some(message) => {
                    if let Some(result) = artifact_from_message(&message, app_origin) {
                        return result;
                    }
                }
                None => messages_open = false,
            },
            _ = poll.tick() => {
                if let Some(result) = artifact_from_location(window, app_origin) {
                    return result;
                }
                if window.is_closed() {
                    debug!("consent popup closed by the user");
                    return Err(ConnectError::UserCancelled);
                }
            }
            _ = &mut deadline => {
                debug!(timeout_secs = timeout.as_secs(), "consent popup timed out");
                return Err(ConnectError::Timeout);
            }
        }
    }
}

/// `None` means the message is not addressed to this handshake.
fn artifact_from_message(
    message: &WindowMessage,
    app_origin: &str,
) -> Option<Result<Artifact, ConnectError>> {
    if message.origin != app_origin {
        trace!(origin = %message.origin, "ignoring message from foreign origin");
        return None;
    }
    if message.data.get("type").and_then(Value::as_str) != Some(CALLBACK_MESSAGE_TYPE) {
        return None;
    }

    let field = |name: &str| {
        message
            .data
            .get(name)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let params = CallbackParams {
        code: field("code"),
        temp_token_id: field("temp_token_id"),
        error: field("error"),
    };
    params.has_any().then(|| params.artifact())
}

fn artifact_from_location(
    window: &dyn ConsentWindow,
    app_origin: &str,
) -> Option<Result<Artifact, ConnectError>> {
    // Still on the provider's pages.
    let url = window.current_url().ok()?;
    if url.origin().ascii_serialization() != app_origin {
        return None;
    }
    let params = CallbackParams::from_url(&url);
    params.has_any().then(|| params.artifact())
}
