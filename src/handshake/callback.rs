//! Callback route parameters and the settings page the user lands on after.

use url::Url;

use super::{Artifact, CallbackOutcome};
use crate::config::ConnectConfig;
use crate::error::ConnectError;

/// Query value appended to the settings page after a successful connection.
pub const SUCCESS_MARKER: &str = "gmail-connected";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub temp_token_id: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    /// Parses a raw query string. Repeated keys keep their first non-empty
    /// value; unknown keys are ignored.
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            if value.is_empty() {
                continue;
            }
            let slot = match &*key {
                "code" => &mut params.code,
                "temp_token_id" => &mut params.temp_token_id,
                "error" => &mut params.error,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }

    pub fn from_url(url: &Url) -> Self {
        url.query().map(Self::from_query).unwrap_or_default()
    }

    pub fn has_any(&self) -> bool {
        self.code.is_some() || self.temp_token_id.is_some() || self.error.is_some()
    }

    /// A provider error wins over any artifact in the same request. A
    /// temporary token is preferred over a raw code.
    pub fn artifact(&self) -> Result<Artifact, ConnectError> {
        if let Some(error) = &self.error {
            return Err(ConnectError::ProviderError(error.clone()));
        }
        if let Some(id) = &self.temp_token_id {
            return Ok(Artifact::TempToken(id.clone()));
        }
        if let Some(code) = &self.code {
            return Ok(Artifact::Code(code.clone()));
        }
        Err(ConnectError::ProviderError(
            "no authorization data received".to_string(),
        ))
    }
}

/// Where to send the user once a callback has been handled. `None` for a
/// duplicate callback, which should not move the user anywhere.
pub fn settings_location(
    config: &ConnectConfig,
    outcome: &Result<CallbackOutcome, ConnectError>,
) -> Option<Url> {
    let mut url = config.settings_url().ok()?;
    match outcome {
        Ok(CallbackOutcome::Connected(_)) => {
            url.query_pairs_mut().append_pair("success", SUCCESS_MARKER);
        }
        Ok(CallbackOutcome::Ignored) => return None,
        Err(error) => {
            url.query_pairs_mut()
                .append_pair("error", &error.to_string());
        }
    }
    Some(url)
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::{settings_location, CallbackParams};
    use crate::config::ConnectConfig;
    use crate::error::ConnectError;
    use crate::handshake::{Artifact, CallbackOutcome, ConnectReport};
    use crate::status::ConnectionStatus;

    #[test]
    fn parses_code_from_query() {
        let params = CallbackParams::from_query("?code=abc123&scope=gmail.readonly");
        assert_eq!(params.code.as_deref(), Some("abc123"));
        assert_eq!(params.artifact(), Ok(Artifact::Code("abc123".to_string())));
    }

    #[test]
    fn temp_token_is_preferred_over_code() {
        let params = CallbackParams::from_query("code=abc123&temp_token_id=tok1");
        assert_eq!(params.artifact(), Ok(Artifact::TempToken("tok1".to_string())));
    }

    #[test]
    fn provider_error_short_circuits() {
        let url = Url::parse("http://localhost:3000/gmail/callback?error=access_denied&code=abc123")
            .expect("callback url");
        let params = CallbackParams::from_url(&url);
        assert_eq!(
            params.artifact(),
            Err(ConnectError::ProviderError("access_denied".to_string()))
        );
    }

    #[test]
    fn empty_callback_reports_missing_data() {
        let params = CallbackParams::from_query("code=&state=xyz");
        assert!(!params.has_any());
        assert_eq!(
            params.artifact(),
            Err(ConnectError::ProviderError(
                "no authorization data received".to_string()
            ))
        );
    }

    #[test]
    fn settings_location_encodes_outcome() {
        let config = ConnectConfig::default();
        let connected = Ok(CallbackOutcome::Connected(ConnectReport {
            status: ConnectionStatus::disconnected(),
            backfill: None,
            sync_error: None,
        }));
        assert_eq!(
            settings_location(&config, &connected).map(String::from),
            Some("http://localhost:3000/settings?success=gmail-connected".to_string())
        );

        let failed = Err(ConnectError::ProviderError("access_denied".to_string()));
        assert_eq!(
            settings_location(&config, &failed).map(String::from),
            Some("http://localhost:3000/settings?error=OAuth+error%3A+access_denied".to_string())
        );

        assert!(settings_location(&config, &Ok(CallbackOutcome::Ignored)).is_none());
    }
}
