//! Command-line entry point for delivery-sync.
//!
//! ```bash
//! # Pull requests of one GitHub repository
//! GITHUB_API_KEY=ghp_... delivery-sync github --repo acme/api
//!
//! # Jira issues with changelogs, as JSON
//! delivery-sync --json jira --base-url https://acme.atlassian.net --project PROJ
//!
//! # Watermarks and recent runs
//! delivery-sync status
//! ```

use clap::Parser;
use delivery_sync_lib::config::{Cli, Command};
use delivery_sync_lib::db;
use delivery_sync_lib::{
    exit_code, EntityReport, StatusReport, SyncEngine, SyncError, SyncSummary, EXIT_CONFIG_ERROR,
};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("Error: {}", e);
            let code = if e.is_config() { EXIT_CONFIG_ERROR } else { 1 };
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<i32, SyncError> {
    // Configuration errors abort before the store is touched
    let source = cli.source_config()?;

    let pool = db::initialize(&db::get_db_path(&cli.db)).await?;

    let Some(source) = source else {
        return print_status(&cli, &pool).await.map(|_| 0);
    };
    let provider = source.into_provider()?;

    let cancel = CancellationToken::new();
    let engine = SyncEngine::new(pool, cli.fetch_policy()).with_cancellation(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, stopping at the next pipeline state boundary");
            cancel.cancel();
        }
    });

    let summary = engine.run(provider.as_ref()).await;
    print_summary(&cli, &summary)?;

    Ok(exit_code(&summary))
}

fn print_summary(cli: &Cli, summary: &SyncSummary) -> Result<(), SyncError> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("Sync summary for {} {}", summary.source, summary.scope);
    for report in &summary.reports {
        println!("  {}", report_line(report));
    }
    Ok(())
}

fn report_line(report: &EntityReport) -> String {
    let watermark = report
        .watermark_after
        .map(|w| w.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{:<16} {:<7} fetched {:>5}  merged {:>5}  new {:>5}  warnings {:>3}  watermark {} ({})",
        report.entity.as_str(),
        report.state,
        report.rows_fetched,
        report.rows_merged,
        report.rows_inserted,
        report.warnings,
        watermark,
        if report.advanced { "advanced" } else { "unchanged" }
    );
    if let (Some(stage), Some(error)) = (report.failed_at, &report.error) {
        line.push_str(&format!("\n{:<18}failed while {}: {}", "", stage, error));
    }
    line
}

async fn print_status(cli: &Cli, pool: &db::pool::DbPool) -> Result<(), SyncError> {
    let limit = match cli.command {
        Command::Status { limit } => limit,
        _ => 20,
    };
    let status = StatusReport::load(pool, limit).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", status.render());
    }
    Ok(())
}
