use crate::events::OptimizerEvent;
use crate::optimize::model::duration_ms;
use crate::optimize::scheduler::JobScheduler;
use log::{info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Periodically deletes terminal jobs older than `retention`.
pub fn spawn_retention_loop(
    scheduler: JobScheduler,
    retention: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match scheduler.cleanup(duration_ms(retention)).await {
                Ok(0) => {}
                Ok(n) => info!("✓ retention sweep removed {} jobs", n),
                Err(e) => warn!("⚠ retention sweep failed: {}", e),
            }
        }
    })
}

/// Writes every event to stdout as one JSON object per line.
pub fn spawn_event_printer(mut rx: mpsc::UnboundedReceiver<OptimizerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(line) = event_line(&event) {
                println!("{}", line);
            }
        }
    })
}

pub fn event_line(event: &OptimizerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(line) => Some(line),
        Err(e) => {
            warn!("⚠ dropping unserialisable {} event: {}", event.job_id(), e);
            None
        }
    }
}
