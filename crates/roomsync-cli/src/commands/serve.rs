use std::sync::Arc;
use std::time::Duration;

use roomsync_core::{
    JobOutcome, Maintenance, QueueOutcome, RejectReason, ResourceKey, SyncRequest, SyncService,
};
use tokio::time::{interval, MissedTickBehavior};

use crate::error::CliError;

/// Runs maintenance and refreshes `watch` every `period` until Ctrl-C.
pub async fn run_serve(
    service: Arc<SyncService>,
    watch: Vec<ResourceKey>,
    period: Duration,
) -> Result<(), CliError> {
    let maintenance = Maintenance::spawn(Arc::clone(&service));
    tracing::info!(watched = watch.len(), ?period, "serving");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(error) = signal {
                    tracing::warn!(%error, "failed to listen for Ctrl-C");
                }
                tracing::info!("shutdown requested");
                break Ok(());
            }
            _ = ticker.tick() => {
                for key in &watch {
                    request_watched(&service, *key).await;
                }
            }
        }
    };

    maintenance.stop().await;
    result
}

async fn request_watched(service: &SyncService, key: ResourceKey) {
    match service.request_sync(key, SyncRequest::default()).await {
        QueueOutcome::Queued { job_id, completion } => {
            tracing::info!(resource = %key, %job_id, "watched resource queued");
            tokio::spawn(async move {
                match completion.await {
                    Ok(JobOutcome::Succeeded(report)) => tracing::info!(
                        resource = %key,
                        scores = report.scores,
                        partial = report.is_partial(),
                        "watched resource refreshed"
                    ),
                    Ok(JobOutcome::Failed { error }) => {
                        tracing::warn!(resource = %key, %error, "watched resource refresh failed");
                    }
                    Err(_) => tracing::warn!(resource = %key, "refresh ended without an outcome"),
                }
            });
        }
        QueueOutcome::Rejected {
            reason: RejectReason::QuotaCritical,
            ..
        } => tracing::warn!(resource = %key, "quota critical, skipping refresh"),
        QueueOutcome::Rejected { reason, .. } => {
            tracing::debug!(resource = %key, %reason, "refresh not needed");
        }
    }
}
