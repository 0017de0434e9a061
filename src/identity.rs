//! Identity session capability.
//!
//! The identity provider is external; the rest of the crate only sees this
//! trait. Sign-in/out is published through a `watch` channel so consumers
//! hold an explicit subscription instead of registering global listeners.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{ConnectError, IdentityError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub user_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
}

#[async_trait]
pub trait IdentitySession: Send + Sync {
    fn current_user(&self) -> Option<Session>;

    /// A bearer token valid for the next outbound call.
    async fn bearer_token(&self) -> Result<String, ConnectError>;

    /// Receives the current session immediately and every change after it.
    fn subscribe(&self) -> watch::Receiver<Option<Session>>;
}

/// Resolves with the first authenticated session seen within `limit`.
pub async fn wait_for_user(
    identity: &dyn IdentitySession,
    limit: Duration,
) -> Result<Session, ConnectError> {
    let mut updates = identity.subscribe();
    let wait = async {
        loop {
            if let Some(session) = updates.borrow_and_update().clone() {
                return Ok(session);
            }
            debug!("waiting for an authenticated session");
            if updates.changed().await.is_err() {
                return Err(ConnectError::Unauthenticated);
            }
        }
    };

    match tokio::time::timeout(limit, wait).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Unauthenticated),
    }
}

#[derive(Debug, Clone)]
struct StoredToken {
    raw: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process identity holding a provider-issued token, signed in and out
/// explicitly by the host.
#[derive(Debug)]
pub struct LocalIdentity {
    session: watch::Sender<Option<Session>>,
    token: Mutex<Option<StoredToken>>,
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalIdentity {
    pub fn new() -> Self {
        let (session, _) = watch::channel(None);
        Self {
            session,
            token: Mutex::new(None),
        }
    }

    pub fn sign_in(&self, session: Session, token: impl Into<String>) {
        self.store(session, token.into(), None);
    }

    /// Signs in from a provider id token (JWT). Only the payload is read; the
    /// signature is verified by the backend on every call.
    pub fn sign_in_with_id_token(&self, raw: &str) -> Result<Session, IdentityError> {
        let claims = decode_id_token(raw)?;
        let expires_at = claims
            .exp
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single());
        if expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(IdentityError::Expired);
        }

        let user_id = claims
            .user_id
            .or(claims.sub)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| IdentityError::Malformed("missing user_id/sub claim".to_string()))?;
        let session = Session {
            user_id,
            email: claims.email,
            email_verified: claims.email_verified.unwrap_or(false),
        };

        self.store(session.clone(), raw.trim().to_string(), expires_at);
        Ok(session)
    }

    pub fn sign_out(&self) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.session.send_replace(None);
    }

    fn store(&self, session: Session, raw: String, expires_at: Option<DateTime<Utc>>) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(StoredToken { raw, expires_at });
        self.session.send_replace(Some(session));
    }
}

#[async_trait]
impl IdentitySession for LocalIdentity {
    fn current_user(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    async fn bearer_token(&self) -> Result<String, ConnectError> {
        let guard = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(token) = guard.as_ref() else {
            return Err(ConnectError::Unauthenticated);
        };
        if token.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(ConnectError::Unauthenticated);
        }
        Ok(token.raw.clone())
    }

    fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    user_id: Option<String>,
    sub: Option<String>,
    email: Option<String>,
    email_verified: Option<bool>,
    exp: Option<i64>,
}

fn decode_id_token(raw: &str) -> Result<IdTokenClaims, IdentityError> {
    let mut parts = raw.trim().split('.');
    let payload = match (parts.next(), parts.next(), parts.next()) {
        (Some(_header), Some(payload), Some(_signature)) if !payload.is_empty() => payload,
        _ => {
            return Err(IdentityError::Malformed(
                "expected three dot-separated segments".to_string(),
            ))
        }
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|error| IdentityError::Malformed(format!("payload is not base64url: {error}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|error| IdentityError::Malformed(format!("payload is not JSON: {error}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use chrono::Utc;
    use serde_json::json;

    use super::{wait_for_user, IdentitySession, LocalIdentity, Session};
    use crate::error::{ConnectError, IdentityError};

    fn jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.signature")
    }

    fn session(user_id: &str) -> Session {
        Session {
            user_id: user_id.to_string(),
            email: Some(format!("{user_id}@example.com")),
            email_verified: true,
        }
    }

    #[test]
    fn id_token_claims_become_session() {
        let identity = LocalIdentity::new();
        let token = jwt(json!({
            "user_id": "uid-42",
            "sub": "ignored-sub",
            "email": "seeker@example.com",
            "email_verified": true,
            "exp": Utc::now().timestamp() + 3600,
        }));

        let session = identity.sign_in_with_id_token(&token).expect("sign in");
        assert_eq!(session.user_id, "uid-42");
        assert_eq!(session.email.as_deref(), Some("seeker@example.com"));
        assert!(session.email_verified);
        assert_eq!(identity.current_user(), Some(session));
    }

    #[test]
    fn id_token_falls_back_to_sub_claim() {
        let identity = LocalIdentity::new();
        let session = identity
            .sign_in_with_id_token(&jwt(json!({ "sub": "uid-7" })))
            .expect("sign in");
        assert_eq!(session.user_id, "uid-7");
        assert!(!session.email_verified);
    }

    #[test]
    fn expired_or_malformed_tokens_are_rejected() {
        let identity = LocalIdentity::new();
        let expired = jwt(json!({ "sub": "uid-1", "exp": Utc::now().timestamp() - 10 }));
        assert_eq!(
            identity.sign_in_with_id_token(&expired),
            Err(IdentityError::Expired)
        );
        assert!(matches!(
            identity.sign_in_with_id_token("not-a-jwt"),
            Err(IdentityError::Malformed(_))
        ));
        assert!(identity.current_user().is_none());
    }

    #[tokio::test]
    async fn bearer_token_requires_a_session() {
        let identity = LocalIdentity::new();
        assert_eq!(
            identity.bearer_token().await,
            Err(ConnectError::Unauthenticated)
        );

        identity.sign_in(session("uid-1"), "token-1");
        assert_eq!(identity.bearer_token().await.as_deref(), Ok("token-1"));

        identity.sign_out();
        assert_eq!(
            identity.bearer_token().await,
            Err(ConnectError::Unauthenticated)
        );
    }

    #[tokio::test]
    async fn subscribers_observe_sign_in_and_sign_out() {
        let identity = LocalIdentity::new();
        let mut updates = identity.subscribe();

        identity.sign_in(session("uid-1"), "token-1");
        updates.changed().await.expect("sign-in notification");
        assert_eq!(
            updates.borrow_and_update().as_ref().map(|s| s.user_id.clone()),
            Some("uid-1".to_string())
        );

        identity.sign_out();
        updates.changed().await.expect("sign-out notification");
        assert!(updates.borrow_and_update().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_user_accepts_session_arriving_before_limit() {
        let identity = Arc::new(LocalIdentity::new());
        let signer = Arc::clone(&identity);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4900)).await;
            signer.sign_in(session("uid-late"), "token-late");
        });

        let session = wait_for_user(identity.as_ref(), Duration::from_secs(5))
            .await
            .expect("session within limit");
        assert_eq!(session.user_id, "uid-late");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_user_times_out_without_session() {
        let identity = Arc::new(LocalIdentity::new());
        let signer = Arc::clone(&identity);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(6)).await;
            signer.sign_in(session("uid-too-late"), "token");
        });

        let result = wait_for_user(identity.as_ref(), Duration::from_secs(5)).await;
        assert_eq!(result, Err(ConnectError::Unauthenticated));
    }

    #[tokio::test]
    async fn wait_for_user_returns_immediately_when_signed_in() {
        let identity = LocalIdentity::new();
        identity.sign_in(session("uid-1"), "token-1");
        let session = wait_for_user(&identity, Duration::from_millis(1))
            .await
            .expect("already signed in");
        assert_eq!(session.user_id, "uid-1");
    }
}
