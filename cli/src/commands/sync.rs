use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use tokio::sync::broadcast::error::RecvError;

use fieldsync_core::connectivity::Connectivity;
use fieldsync_core::events::SyncEvent;
use fieldsync_core::service::FieldSyncService;
use fieldsync_core::sync::SyncOutcome;

use super::helpers::{describe_outcome, print_json};
use crate::session::Session;

pub(crate) async fn cmd_sync(svc: &FieldSyncService, json: bool) -> Result<()> {
    let outcome = svc.sync_now().await;
    if json {
        print_json(&outcome)?;
    } else {
        println!("{}", describe_outcome(&outcome));
    }
    if let SyncOutcome::Completed(report) = &outcome {
        if report.remaining.total() > 0 && !json {
            eprintln!(
                "{} change(s) still queued. Run `fieldsync pending` for details.",
                report.remaining.total()
            );
        }
    }
    Ok(())
}

fn describe_event(event: &SyncEvent) -> Option<String> {
    match event {
        SyncEvent::Status { message } => Some(message.clone()),
        SyncEvent::PendingCount { counts } => Some(format!(
            "Pending: {} field update(s), {} photo(s)",
            counts.field_updates, counts.photos
        )),
        SyncEvent::Refreshed { products } => Some(format!("Cache refreshed with {products} product(s)")),
        SyncEvent::Connectivity { state } => Some(
            match state {
                Connectivity::Online => "Connectivity: online",
                Connectivity::Offline => "Connectivity: offline",
            }
            .to_string(),
        ),
        SyncEvent::SyncAffordance { .. } => None,
    }
}

/// Stay running, sync on every return to connectivity and print what
/// happens until interrupted.
pub(crate) async fn cmd_watch(session: Session, interval: Duration, json: bool) -> Result<()> {
    let Some(probe) = session.probe else {
        bail!("Nothing to watch: no remote configured (set FIELDSYNC_REMOTE_URL and FIELDSYNC_ANON_KEY)");
    };
    let svc = session.service;

    let mut events = svc.feed().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if json => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        println!("[{}] {line}", Local::now().format("%H:%M:%S"));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    svc.load_products().await?;
    eprintln!(
        "Watching connectivity every {}s. Press Ctrl-C to stop.",
        interval.as_secs()
    );

    tokio::select! {
        () = svc.run_monitor(probe, interval) => {}
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl-C")?;
        }
    }

    printer.abort();
    let counts = svc.pending_counts()?;
    if counts.total() > 0 {
        eprintln!("{} change(s) still queued.", counts.total());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::models::PendingCounts;

    #[test]
    fn test_describe_event() {
        assert_eq!(
            describe_event(&SyncEvent::Status {
                message: "You are online.".into()
            })
            .as_deref(),
            Some("You are online.")
        );
        assert_eq!(
            describe_event(&SyncEvent::PendingCount {
                counts: PendingCounts {
                    photos: 2,
                    field_updates: 1
                }
            })
            .as_deref(),
            Some("Pending: 1 field update(s), 2 photo(s)")
        );
        assert_eq!(describe_event(&SyncEvent::SyncAffordance { visible: true }), None);
    }
}
