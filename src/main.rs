use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use patchline::config::PipelineConfig;
use patchline::dashboard::DashboardView;
use patchline::pipeline::orchestrator::record_skip;
use patchline::pipeline::{PipelineError, Provenance, RunRecord, TriggerKind};
use patchline::scheduler::Scheduler;

#[derive(Parser)]
#[command(
    name = "patchline",
    about = "Release pipeline orchestrator for patched app builds",
    version,
    long_about = None
)]
struct Cli {
    /// Config file [env: PATCHLINE_CONFIG] [default: patchline.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once over the enabled work items
    Run {
        #[arg(long, value_enum, default_value_t = TriggerArg::Auto)]
        trigger: TriggerArg,

        #[command(flatten)]
        provenance: ProvenanceArgs,

        /// Print the run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Record a run that was deliberately not executed
    Skip {
        #[arg(long, value_enum, default_value_t = TriggerArg::Auto)]
        trigger: TriggerArg,

        /// Why the run was skipped
        #[arg(long)]
        reason: String,

        #[command(flatten)]
        provenance: ProvenanceArgs,
    },

    /// Show pipeline statistics from history
    Summary {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Write the HTML dashboard
    Dashboard {
        /// Output file path
        #[arg(long, default_value = "logs/dashboard.html")]
        output: PathBuf,
    },

    /// List configured work items
    Items,

    /// Inspect the run schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Start the daemon (read-only API + scheduled runs)
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List configured cron expressions
    List,

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TriggerArg {
    /// Derive from GITHUB_EVENT_NAME
    Auto,
    Schedule,
    Manual,
    ConfigChange,
}

impl TriggerArg {
    fn resolve(self) -> TriggerKind {
        match self {
            TriggerArg::Auto => TriggerKind::from_ci_event(std::env::var("GITHUB_EVENT_NAME").ok().as_deref()),
            TriggerArg::Schedule => TriggerKind::Schedule,
            TriggerArg::Manual => TriggerKind::Manual,
            TriggerArg::ConfigChange => TriggerKind::ConfigChange,
        }
    }
}

#[derive(Args)]
struct ProvenanceArgs {
    /// Commit the run was started from
    #[arg(long, env = "GITHUB_SHA")]
    commit: Option<String>,

    /// Who started the run
    #[arg(long, env = "GITHUB_ACTOR")]
    actor: Option<String>,

    /// CI run identifier
    #[arg(long, env = "GITHUB_RUN_ID")]
    ci_run_id: Option<String>,

    /// CI run number
    #[arg(long, env = "GITHUB_RUN_NUMBER")]
    run_number: Option<String>,

    /// CI workflow name
    #[arg(long, env = "GITHUB_WORKFLOW")]
    workflow: Option<String>,
}

impl From<ProvenanceArgs> for Provenance {
    fn from(args: ProvenanceArgs) -> Self {
        Self {
            ci_run_id: args.ci_run_id,
            run_number: args.run_number,
            workflow: args.workflow,
            commit: args.commit,
            actor: args.actor,
        }
    }
}

fn init_tracing(config: &PipelineConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_run(record: &RunRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }
    println!(
        "Run {} [{}] {}: {}/{} item(s) succeeded, {} failed",
        record.run_id, record.trigger, record.status, record.items.succeeded, record.items.attempted, record.items.failed
    );
    if let Some(release) = &record.release_id {
        println!("Release: {}", release);
    }
    for failed in &record.failed_items {
        println!(
            "  FAILED {} at {} after {} attempt(s): {}",
            failed.name, failed.stage, failed.attempts, failed.diagnostic
        );
    }
    for diagnostic in &record.diagnostics {
        println!("  note: {}", diagnostic);
    }
    Ok(())
}

/// A finished run whose record could not be stored still prints, then fails.
fn finish_run(result: Result<RunRecord, PipelineError>, json: bool) -> Result<()> {
    match result {
        Ok(record) => print_run(&record, json),
        Err(PipelineError::HistoryUnsaved { record, source }) => {
            print_run(&record, json)?;
            Err(anyhow::Error::new(source).context(format!("run {} was not saved to history", record.run_id)))
        }
        Err(PipelineError::ReleaseUnsaved { record, source }) => {
            print_run(&record, json)?;
            Err(anyhow::Error::new(source).context(format!(
                "run {} was saved but its release record was not",
                record.run_id
            )))
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::discover(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Run {
            trigger,
            provenance,
            json,
        } => {
            let orchestrator = patchline::orchestrator(&config)?.with_provenance(provenance.into());
            let items = config.enabled_items();
            let result = orchestrator.run(&items, trigger.resolve()).await;
            finish_run(result, json)?;
        }
        Commands::Skip {
            trigger,
            reason,
            provenance,
        } => {
            let result = record_skip(config.open_history()?, trigger.resolve(), provenance.into(), &reason).await;
            finish_run(result, false)?;
        }
        Commands::Summary { json } => {
            let history = config.open_history()?.load()?;
            let view = patchline::pipeline::summary(&history);
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print!("{}", view.render_text());
            }
        }
        Commands::Dashboard { output } => {
            let history = config.open_history()?.load()?;
            let view = DashboardView::build(&patchline::pipeline::summary(&history), chrono::Utc::now());
            view.write(&output)?;
            println!("Dashboard written to {}", output.display());
        }
        Commands::Items => {
            if config.items.is_empty() {
                println!("No work items configured.");
            } else {
                println!("{:<20} | {:<35} | {:<7} | Options", "Name", "Target", "Enabled");
                println!("{:-<20}-|-{:-<35}-|-{:-<7}-|-{:-<20}", "", "", "", "");
                for item in &config.items {
                    let mut options = Vec::new();
                    options.extend(item.options.enable.iter().map(|p| format!("+{}", p)));
                    options.extend(item.options.disable.iter().map(|p| format!("-{}", p)));
                    println!(
                        "{:<20} | {:<35} | {:<7} | {}",
                        item.name,
                        item.target,
                        if item.enabled { "yes" } else { "no" },
                        options.join(" ")
                    );
                }
            }
        }
        Commands::Schedule { action } => {
            let scheduler = Scheduler::from_config(&config.schedule)?;
            match action {
                ScheduleAction::List => {
                    if scheduler.is_empty() {
                        println!("No schedules configured.");
                    }
                    for expr in scheduler.expressions() {
                        println!("{}", expr);
                    }
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(chrono::Utc::now(), hours);
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for (time, expr) in preview {
                            println!("{} : {}", time.to_rfc3339(), expr);
                        }
                    }
                }
            }
        }
        Commands::Serve { bind } => {
            tracing::info!(%bind, "Starting patchline daemon");
            patchline::serve(config, &bind).await?;
        }
    }

    Ok(())
}
