use anyhow::Context;
use chrono::Local;
use log::info;
use std::sync::Arc;
use stratopt::app_service::{spawn_event_printer, spawn_retention_loop};
use stratopt::commands::{dispatch, AppCommand};
use stratopt::storage::{establish_connection, JobStore};
use stratopt::{HttpEvaluator, JobScheduler, OptimizerConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = OptimizerConfig::from_env().context("invalid configuration")?;

    let ts = Local::now().format("%Y%m%d-%H%M%S").to_string();
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("cannot create log dir {}", config.log_dir.display()))?;
    let log_path = config.log_dir.join(format!("app-{}.log", ts));
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("cannot create log file {}", log_path.display()))?;
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .filter_level(log::LevelFilter::Warn)
        .filter_module("stratopt", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("sea_orm", log::LevelFilter::Error)
        .init();

    info!("starting with {:?}", config);

    let db = establish_connection(&config.database_url)
        .await
        .with_context(|| format!("cannot open database {}", config.database_url))?;
    let store = Arc::new(JobStore::new(Arc::new(db)));
    let evaluator = HttpEvaluator::new(&config.evaluator_url, config.evaluator_timeout)
        .context("cannot build evaluator client")?;
    let scheduler = JobScheduler::new(config.scheduler_config(), store, Arc::new(evaluator));

    let printer = spawn_event_printer(scheduler.subscribe());

    let report = scheduler
        .recover(config.resume_policy)
        .await
        .context("startup recovery failed")?;
    eprintln!(
        "✓ ready: {} requeued, {} interrupted, {} rescheduled (type `help`)",
        report.requeued,
        report.failed,
        report.rescheduled.len()
    );

    let sweeper = spawn_retention_loop(
        scheduler.clone(),
        config.retention,
        config.cleanup_interval,
    );

    // command replies go to stderr so stdout carries only the event stream
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("cannot read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let cmd: AppCommand = match line.parse() {
            Ok(cmd) => cmd,
            Err(()) => continue,
        };
        let reply = dispatch(cmd, &scheduler, config.retention).await;
        for l in &reply.lines {
            eprintln!("{}", l);
        }
        if reply.quit {
            break;
        }
    }

    sweeper.abort();
    let _ = sweeper.await;
    scheduler.shutdown().await;
    // last handle to the bus: the printer drains what is left and stops
    drop(scheduler);
    if let Err(e) = printer.await {
        log::warn!("⚠ event printer ended abnormally: {}", e);
    }
    info!("shutdown complete");
    Ok(())
}
