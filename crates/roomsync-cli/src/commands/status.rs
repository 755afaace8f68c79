use roomsync_core::{ResourceKey, SyncService};

use crate::commands::common::{format_status_lines, now_ms};
use crate::error::CliError;

pub fn run_status(service: &SyncService, key: ResourceKey, as_json: bool) -> Result<(), CliError> {
    let status = service.sync_status(key);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{key}");
    for line in format_status_lines(&status, now_ms()) {
        println!("  {line}");
    }
    Ok(())
}
