use roomsync_core::SyncService;

use crate::commands::common::{format_quota_lines, format_usage_lines};
use crate::error::CliError;

pub fn run_usage(service: &SyncService, as_json: bool) -> Result<(), CliError> {
    let report = service.usage_report();
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_usage_lines(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn run_quota(service: &SyncService, as_json: bool) -> Result<(), CliError> {
    let quota = service.quota_status();
    if as_json {
        println!("{}", serde_json::to_string_pretty(&quota)?);
    } else {
        for line in format_quota_lines(&quota) {
            println!("{line}");
        }
    }
    Ok(())
}
