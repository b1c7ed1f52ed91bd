use crate::commands::app_command::{AppCommand, USAGE};
use crate::optimize::model::{duration_ms, JobRecord};
use crate::optimize::scheduler::JobScheduler;
use serde::Serialize;
use std::time::Duration;

/// Lines to print for one command, plus whether the session should end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub quit: bool,
}

impl Reply {
    fn line(msg: impl Into<String>) -> Self {
        Self {
            lines: vec![msg.into()],
            quit: false,
        }
    }

    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(s) => Self::line(s),
            Err(e) => Self::line(format!("✗ cannot render reply: {}", e)),
        }
    }
}

/// Runs one command against the scheduler. Failures become reply lines;
/// nothing here ends the session except `quit`.
pub async fn dispatch(cmd: AppCommand, scheduler: &JobScheduler, retention: Duration) -> Reply {
    match cmd {
        AppCommand::Submit(request) => match scheduler.schedule(*request).await {
            Ok(id) => Reply::line(format!("✓ queued {}", id)),
            Err(e) => Reply::line(format!("✗ {}", e)),
        },
        AppCommand::Get { id } => match scheduler.get_job(&id).await {
            Ok(Some(record)) => Reply::json(&record),
            Ok(None) => Reply::line(format!("✗ no job {}", id)),
            Err(e) => Reply::line(format!("✗ {}", e)),
        },
        AppCommand::List { state } => match scheduler.list_jobs().await {
            Ok(records) => {
                let lines: Vec<String> = records
                    .iter()
                    .filter(|r| state.map_or(true, |s| r.state == s))
                    .map(summary_line)
                    .collect();
                if lines.is_empty() {
                    Reply::line("no jobs")
                } else {
                    Reply {
                        lines,
                        quit: false,
                    }
                }
            }
            Err(e) => Reply::line(format!("✗ {}", e)),
        },
        AppCommand::Cancel { id } => match scheduler.stop_job(&id).await {
            Ok(true) => Reply::line(format!("■ stopped {}", id)),
            Ok(false) => Reply::line(format!("⚠ {} is not queued or running", id)),
            Err(e) => Reply::line(format!("✗ {}", e)),
        },
        AppCommand::Cleanup { max_age_secs } => {
            let max_age = max_age_secs.map(Duration::from_secs).unwrap_or(retention);
            match scheduler.cleanup(duration_ms(max_age)).await {
                Ok(n) => Reply::line(format!("✓ removed {} jobs", n)),
                Err(e) => Reply::line(format!("✗ {}", e)),
            }
        }
        AppCommand::Status { id: None } => Reply::json(&scheduler.get_status()),
        AppCommand::Status { id: Some(id) } => match scheduler.get_job_status(&id) {
            Some(view) => Reply::json(&view),
            None => Reply::line(format!("⚠ {} is unknown to this scheduler", id)),
        },
        AppCommand::Help => Reply::line(USAGE),
        AppCommand::Quit => Reply {
            lines: vec!["shutting down".to_string()],
            quit: true,
        },
        AppCommand::Unknown(msg) if msg.is_empty() => Reply::default(),
        AppCommand::Unknown(msg) => Reply::line(format!("✗ {}", msg)),
    }
}

fn summary_line(r: &JobRecord) -> String {
    let best = r
        .output
        .as_ref()
        .map(|o| format!(" best={:.4} trials={}", o.best.score, o.trials_run))
        .unwrap_or_default();
    format!(
        "{} {:<8} {:<8} {} p={}{}",
        r.id,
        r.state.as_str(),
        r.kind.as_str(),
        r.strategy_ref,
        r.priority,
        best
    )
}
