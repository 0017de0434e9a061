pub mod json;
pub mod table;

use anyhow::Result;

use crate::api::FetchReport;
use crate::handshake::CallbackOutcome;
use crate::status::ConnectionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

pub fn format_status(format: OutputFormat, status: &ConnectionStatus) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_status(status)),
        OutputFormat::Json => json::format_status(status),
    }
}

pub fn format_fetch_report(format: OutputFormat, report: &FetchReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_fetch_report(report)),
        OutputFormat::Json => json::format_fetch_report(report),
    }
}

pub fn format_outcome(format: OutputFormat, outcome: &CallbackOutcome) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_outcome(outcome)),
        OutputFormat::Json => json::format_outcome(outcome),
    }
}
