use anyhow::Result;

use crate::api::FetchReport;
use crate::handshake::CallbackOutcome;
use crate::status::ConnectionStatus;

pub fn format_status(status: &ConnectionStatus) -> Result<String> {
    Ok(serde_json::to_string_pretty(status)?)
}

pub fn format_fetch_report(report: &FetchReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn format_outcome(outcome: &CallbackOutcome) -> Result<String> {
    Ok(serde_json::to_string_pretty(outcome)?)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::format_outcome;
    use crate::error::ConnectError;
    use crate::handshake::{CallbackOutcome, ConnectReport};
    use crate::status::ConnectionStatus;

    #[test]
    fn outcome_json_is_tagged_and_carries_sync_error_text() {
        let rendered = format_outcome(&CallbackOutcome::Connected(ConnectReport {
            status: ConnectionStatus {
                connected: true,
                account_email: Some("seeker@gmail.com".to_string()),
                checked_at: None,
            },
            backfill: None,
            sync_error: Some(ConnectError::SyncFailed("quota".to_string())),
        }))
        .expect("render outcome");

        let value: Value = serde_json::from_str(&rendered).expect("valid json");
        assert_eq!(value["outcome"], "connected");
        assert_eq!(value["status"]["account_email"], "seeker@gmail.com");
        assert_eq!(value["sync_error"], "Gmail sync failed: quota");
        assert!(value.get("backfill").is_none());
    }
}
