use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::api::FetchReport;
use crate::handshake::CallbackOutcome;
use crate::status::ConnectionStatus;

const LABEL_WIDTH: usize = 10;
const VALUE_WIDTH: usize = 48;

pub fn format_status(status: &ConnectionStatus) -> String {
    let mut out = String::new();
    out.push_str("Gmail\n");
    out.push_str("=====\n");
    push_row(
        &mut out,
        "Status",
        if status.connected {
            "connected"
        } else {
            "not connected"
        },
    );
    if let Some(email) = &status.account_email {
        push_row(&mut out, "Account", email);
    }
    if let Some(checked_at) = &status.checked_at {
        push_row(&mut out, "Checked", &relative_date(checked_at));
    }
    out
}

pub fn format_fetch_report(report: &FetchReport) -> String {
    let mut out = String::new();
    out.push_str("Gmail fetch\n");
    out.push_str("-----------\n");
    push_row(&mut out, "Status", report.status.as_deref().unwrap_or("-"));
    push_row(
        &mut out,
        "Users",
        &report
            .users_processed
            .map(|count| count.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
    push_row(
        &mut out,
        "Mode",
        match report.backfill {
            Some(true) => "backfill",
            Some(false) => "incremental",
            None => "-",
        },
    );
    out
}

pub fn format_outcome(outcome: &CallbackOutcome) -> String {
    let report = match outcome {
        CallbackOutcome::Connected(report) => report,
        CallbackOutcome::Ignored => {
            return "Authorization already handled; nothing to do.".to_string();
        }
    };

    let mut out = format_status(&report.status);
    out.push('\n');
    match (&report.backfill, &report.sync_error) {
        (Some(backfill), _) => out.push_str(&format_fetch_report(backfill)),
        (None, Some(error)) => {
            out.push_str(&format!("Initial sync did not start: {error}\n"));
            out.push_str("Run `gmconnect sync --backfill` to retry.\n");
        }
        (None, None) => out.push_str("Initial sync not reported.\n"),
    }
    out
}

fn push_row(out: &mut String, label: &str, value: &str) {
    out.push_str(&format!(
        "{:<label$}  {}\n",
        format!("{label}:"),
        truncate_for_width(value, VALUE_WIDTH),
        label = LABEL_WIDTH
    ));
}

fn relative_date(at: &DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(*at);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    at.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}
