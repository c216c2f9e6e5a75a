use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use harvest_core::RunOutcome;
use harvest_sources::{build_registry, SourcesFile};
use harvest_sync::{build_scheduler, schedule_plan, HarvestConfig, Harvester, RunReport};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Incremental fetch runner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one source now.
    Run { source: String },
    /// Run every configured source concurrently.
    RunAll,
    /// Check a source's prerequisites without fetching or writing.
    DryRun { source: String },
    /// List configured sources and their schedules.
    Sources,
    /// Run sources on their cron schedules until interrupted.
    Schedule,
    /// Serve the JSON status API.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("HARVEST_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

fn load_harvester() -> Result<Harvester> {
    let config = HarvestConfig::from_env();
    let sources = SourcesFile::load(&config.sources_file)
        .with_context(|| format!("loading {}", config.sources_file.display()))?;
    let registry = build_registry(&sources)?;
    Harvester::new(config, registry)
}

fn print_report(report: &RunReport) {
    println!(
        "{} [{}] {}",
        report.run.source,
        report.run.run_id,
        report.result.message()
    );
    for error in &report.errors {
        println!("  {:?} {}", error.kind, error.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let harvester = Arc::new(load_harvester()?);

    match cli.command.unwrap_or(Commands::RunAll) {
        Commands::Run { source } => {
            let report = harvester.run_source(&source).await?;
            print_report(&report);
            if report.run.outcome == RunOutcome::Error {
                bail!("fetch for {source} failed");
            }
        }
        Commands::RunAll => {
            let reports = harvester.run_all().await;
            let failed = reports
                .iter()
                .filter(|r| r.run.outcome == RunOutcome::Error)
                .count();
            for report in &reports {
                print_report(report);
            }
            if failed > 0 {
                bail!("{failed} of {} sources failed", reports.len());
            }
        }
        Commands::DryRun { source } => {
            let result = harvester.dry_run_source(&source).await?;
            println!("{}", result.render());
            if !result.all_passed() {
                bail!("dry run for {source} has failing checks");
            }
        }
        Commands::Sources => {
            for (cron, names) in schedule_plan(harvester.registry(), &harvester.config().sync_cron) {
                println!("{cron}\t{}", names.join(", "));
            }
        }
        Commands::Schedule => {
            let mut sched = build_scheduler(Arc::clone(&harvester)).await?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let sched = harvest_sync::maybe_build_scheduler(Arc::clone(&harvester)).await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
            }
            harvest_web::serve(Arc::clone(&harvester)).await?;
            if let Some(mut sched) = sched {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
    }

    Ok(())
}
