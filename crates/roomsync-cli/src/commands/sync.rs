use roomsync_core::ingest::IngestReport;
use roomsync_core::{
    JobOutcome, Priority, QueueOutcome, ResourceKey, SyncRequest, SyncService,
};

use crate::commands::common::format_decision;
use crate::error::CliError;

pub async fn run_sync(
    service: &SyncService,
    key: ResourceKey,
    force: bool,
    priority: Priority,
    wait: bool,
) -> Result<(), CliError> {
    let decision = service.can_sync(key, force).await;
    println!("{}", format_decision(&decision));

    let request = SyncRequest { priority, force };
    match service.request_sync(key, request).await {
        QueueOutcome::Rejected { reason, detail } => {
            match detail {
                Some(detail) => println!("rejected: {reason} ({detail})"),
                None => println!("rejected: {reason}"),
            }
            Ok(())
        }
        QueueOutcome::Queued { job_id, completion } => {
            println!("queued: {job_id}");
            if !wait {
                return Ok(());
            }
            match completion.await {
                Ok(JobOutcome::Succeeded(report)) => {
                    for line in format_report_lines(&report) {
                        println!("{line}");
                    }
                    Ok(())
                }
                Ok(JobOutcome::Failed { error }) => Err(CliError::SyncFailed {
                    resource: key.to_string(),
                    error,
                }),
                Err(_) => Err(CliError::SyncAbandoned(key.to_string())),
            }
        }
    }
}

pub fn format_report_lines(report: &IngestReport) -> Vec<String> {
    let mut lines = vec![format!(
        "synced {}: {} playlists, {} pages, {} scores, {} participants",
        report.key, report.playlists, report.pages, report.scores, report.participants
    )];
    if !report.is_active {
        lines.push("room is closed; it will not be refreshed again".to_string());
    }
    for failure in &report.failed_playlists {
        lines.push(format!(
            "partial: playlist {} skipped ({})",
            failure.playlist_item_id, failure.error
        ));
    }
    if let Some(winner) = &report.winner {
        lines.push(format!(
            "winner: user {} with {}",
            winner.user_id, winner.total_score
        ));
    }
    lines
}
