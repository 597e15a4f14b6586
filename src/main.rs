use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use clusterflow::config::ClusterConfig;
use clusterflow::dag::translate;
use clusterflow::ledger::sqlite::SqliteLedger;
use clusterflow::ledger::{Analysis, Ledger};
use clusterflow::monitor::handlers::HandlerRegistry;
use clusterflow::monitor::Monitor;
use clusterflow::pipeline::PipelineRegistry;
use clusterflow::scheduler::{self, SchedulerKind};

#[derive(Parser, Debug)]
#[command(name = "clusterflow")]
#[command(version = "0.1")]
#[command(about = "Submit job graphs to HTCondor or Slurm and monitor analyses until they're archived")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Override the configured scheduler
    #[arg(short, long, value_enum, global = true)]
    scheduler: Option<SchedulerKind>,
    /// Override the configured working directory (ledger database, translated graphs)
    #[arg(short, long, global = true)]
    work_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a job graph to the format another scheduler understands
    Translate {
        #[arg(short, long)]
        input: PathBuf,
        /// Scheduler whose native format to write
        #[arg(short, long, value_enum)]
        to: SchedulerKind,
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Defaults to the input file name
        #[arg(short, long)]
        batch_name: Option<String>,
    },
    /// Submit a job graph in either format, translating it if needed
    SubmitDag {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        batch_name: Option<String>,
    },
    /// Add an analysis to the ledger from a JSON manifest
    Add {
        #[arg(short, long)]
        manifest: PathBuf,
    },
    /// List tracked analyses and their states
    Status,
    /// Run monitor cycles over every tracked analysis
    Monitor {
        /// Report what would happen without submitting, removing or saving anything
        #[arg(long)]
        dry_run: bool,
        /// Keep running, one cycle every this many seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Cancel an analysis and remove its job
    Cancel { name: String },
}

fn main() -> Result<()> {
    env_logger::init();
    info!("terve! starting up :)");

    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Command::Translate { input, to, output_dir, batch_name } => {
            let batch_name = batch_name.unwrap_or_else(|| default_batch_name(&input));
            let partition = config.partition.as_deref();
            let written = translate::translate_file(&input, to.dag_format(), &output_dir, &batch_name, partition)
                .with_context(|| format!("failed to translate {}", input.display()))?;
            println!("{}", written.display());
        }
        Command::SubmitDag { input, batch_name } => {
            let batch_name = batch_name.unwrap_or_else(|| default_batch_name(&input));
            let scheduler = scheduler::from_config(&config);
            let id = scheduler
                .submit_dag(&input, &batch_name)
                .with_context(|| format!("failed to submit {}", input.display()))?;
            println!("{id}");
        }
        Command::Add { manifest } => {
            let json = fs::read_to_string(&manifest)
                .with_context(|| format!("can't read manifest {}", manifest.display()))?;
            let analysis: Analysis = serde_json::from_str(&json)
                .with_context(|| format!("invalid manifest {}", manifest.display()))?;
            let mut ledger = open_ledger(&config)?;
            ledger.insert(&analysis)?;
            ledger.finish(false)?;
            println!("{} added in state {}", analysis.name, analysis.state);
        }
        Command::Status => {
            let ledger = open_ledger(&config)?;
            for analysis in ledger.analyses()? {
                let job = analysis.job_id.as_ref().map(|id| id.to_string()).unwrap_or_else(|| "-".into());
                println!("{:<30} {:<12} {:<12} {}", analysis.name, analysis.pipeline, analysis.state, job);
            }
            ledger.finish(false)?;
        }
        Command::Monitor { dry_run, interval } => {
            let monitor = Monitor::new(
                scheduler::from_config(&config),
                HandlerRegistry::default(),
                PipelineRegistry::standard(),
                config.retry_policy(),
                dry_run,
            );
            loop {
                let mut ledger = open_ledger(&config)?;
                monitor.run_cycle(&mut ledger)?;
                ledger.finish(dry_run)?;

                match interval {
                    Some(secs) => thread::sleep(Duration::from_secs(secs)),
                    None => break,
                }
            }
        }
        Command::Cancel { name } => {
            let monitor = Monitor::new(
                scheduler::from_config(&config),
                HandlerRegistry::default(),
                PipelineRegistry::standard(),
                config.retry_policy(),
                false,
            );
            let mut ledger = open_ledger(&config)?;
            let analysis = monitor.cancel(&mut ledger, &name)?;
            ledger.finish(false)?;
            println!("{} is {}", analysis.name, analysis.state);
        }
    }

    info!("finished :D");
    Ok(())
}

/// Config file, then command line overrides, then the `$USER` fallback
fn load_config(args: &Args) -> Result<ClusterConfig> {
    let mut config = ClusterConfig::load(args.config.as_deref())?;
    if let Some(kind) = args.scheduler {
        config.scheduler = kind;
    }
    if let Some(dir) = &args.work_dir {
        config.work_dir = dir.clone();
    }
    if config.user.is_empty() {
        config.user = std::env::var("USER").unwrap_or_default();
    }
    Ok(config)
}

fn open_ledger(config: &ClusterConfig) -> Result<SqliteLedger> {
    if !config.work_dir.is_dir() {
        bail!("working directory {} doesn't exist", config.work_dir.display());
    }
    SqliteLedger::open(&config.work_dir)
        .with_context(|| format!("can't open ledger in {}", config.work_dir.display()))
}

fn default_batch_name(input: &Path) -> String {
    input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clusterflow".to_string())
}
