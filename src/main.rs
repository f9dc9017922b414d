//! News Insights run trigger.
//! Executes one ingestion cycle (or a consistency check) and maps the outcome
//! to an exit code: 0 done, 2 done with degraded entries, 1 failed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use news_insights::config::PipelineConfig;
use news_insights::telemetry::{self, Metrics};
use news_insights::{Pipeline, RunStatus};

#[derive(Parser, Debug)]
#[command(
    name = "news-insights",
    version,
    about = "Feed → actors → versioned store, one cycle per invocation"
)]
struct Cli {
    /// Pipeline config (TOML). Falls back to $NEWS_PIPELINE_CONFIG, then config/pipeline.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Execute exactly one cycle.
    Run,
    /// Check that every processed id has exactly one raw row.
    Verify,
}

fn exit(status: RunStatus) -> ExitCode {
    ExitCode::from(status.exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    let cli = Cli::parse();
    let cfg = match PipelineConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = ?e, "config");
            return exit(RunStatus::Failed);
        }
    };

    let metrics = match Metrics::init() {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = ?e, "metrics recorder not installed");
            None
        }
    };

    let mut pipeline = match Pipeline::from_config(&cfg) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = ?e, "pipeline setup");
            return exit(RunStatus::Failed);
        }
    };

    let status = match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            // Commit and state advance contain no await point, so an interrupt
            // lands either before the commit or after the state advance.
            tokio::select! {
                res = pipeline.run() => match res {
                    Ok(report) => {
                        for (id, failure) in &report.degraded {
                            tracing::warn!(%id, %failure, "entry stored without actors");
                        }
                        report.status()
                    }
                    Err(_) => RunStatus::Failed,
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted; run abandoned before commit");
                    RunStatus::Failed
                }
            }
        }
        Command::Verify => match pipeline.verify() {
            Ok(report) if report.is_consistent() => {
                tracing::info!(
                    state_ids = report.state_ids,
                    raw_rows = report.raw_rows,
                    unadvanced = report.unadvanced.len(),
                    "state and store are consistent"
                );
                RunStatus::Success
            }
            Ok(report) => {
                tracing::error!(
                    missing = ?report.missing,
                    duplicated = ?report.duplicated,
                    "state and store disagree"
                );
                RunStatus::Failed
            }
            Err(e) => {
                tracing::error!(error = %e, "verify");
                RunStatus::Failed
            }
        },
    };

    if let (Some(m), Some(path)) = (&metrics, &cfg.metrics_textfile) {
        if let Err(e) = m.write_textfile(path) {
            tracing::warn!(error = ?e, "metrics textfile not written");
        }
    }
    exit(status)
}
