//! CLI entry point for the tiered media backup pipeline
//!
//! Thin surface over the job submission interface. Data views are printed as
//! pretty JSON on stdout; logs go to stderr.

mod logging;

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tiered_backup::config::ConfigError;
use tiered_backup::{BackupService, Config, JobSettings, JobStatus, NewJob};

/// Tiered media backup - age and space aware photo/video archiving
#[derive(Parser, Debug)]
#[command(name = "tiered-backup")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the default configuration document
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Check the configuration and list every problem found
    Validate,
    /// Create a pending backup job
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        dest: PathBuf,
        /// Glob pattern a file must match (repeatable)
        #[arg(long)]
        include: Vec<String>,
        /// Glob pattern that excludes a file (repeatable, wins over --include)
        #[arg(long)]
        exclude: Vec<String>,
        /// Worker count (0 = configured default)
        #[arg(long, default_value_t = 0)]
        concurrency: u32,
        #[arg(long)]
        verify_checksums: bool,
        #[arg(long)]
        delete_originals: bool,
    },
    /// Run a pending job to completion
    Run { id: String },
    /// List jobs, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Show a job and its live progress
    Status { id: String },
    /// Cancel a running job
    Cancel { id: String },
    /// Archive a job definition
    Delete { id: String },
    /// Apply the retention horizon to jobs, registry and progress state
    Cleanup,
    /// Registry, history and tier statistics
    Stats,
    /// Archive space usage and pressure
    Storage,
}

#[derive(Debug)]
enum CliError {
    Config(ConfigError),
    Service(tiered_backup::RunnerError),
    Output(serde_json::Error),
    Usage(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(e) => write!(f, "{}", e),
            CliError::Service(e) => write!(f, "{}", e),
            CliError::Output(e) => write!(f, "Failed to render output: {}", e),
            CliError::Usage(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}

impl From<tiered_backup::RunnerError> for CliError {
    fn from(e: tiered_backup::RunnerError) -> Self {
        CliError::Service(e)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Output(e)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Usage(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn validate(path: &Path) -> Result<(), CliError> {
    match Config::load(path) {
        Ok(_) => {
            println!("{} is valid", path.display());
            Ok(())
        }
        Err(ConfigError::Invalid(errors)) => {
            eprintln!("{} has {} problem(s):", path.display(), errors.len());
            for error in errors.iter() {
                eprintln!("  {}", error);
            }
            Err(CliError::Usage("configuration is invalid".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn execute(args: Args) -> Result<(), CliError> {
    match &args.command {
        Command::InitConfig { force } => return init_config(&args.config, *force),
        Command::Validate => return validate(&args.config),
        _ => {}
    }

    let config = Config::load(&args.config)?;
    logging::init_logger(&config.log_level);
    let service = BackupService::new(Arc::new(config))?;

    match args.command {
        Command::InitConfig { .. } | Command::Validate => Ok(()),
        Command::Create {
            name,
            source,
            dest,
            include,
            exclude,
            concurrency,
            verify_checksums,
            delete_originals,
        } => {
            let job = service.create_job(NewJob {
                name,
                source_path: source,
                destination_path: dest,
                include_patterns: include,
                exclude_patterns: exclude,
                settings: JobSettings {
                    max_concurrency: concurrency,
                    verify_checksums,
                    delete_originals,
                    ..Default::default()
                },
            })?;
            print_json(&job)
        }
        Command::Run { id } => {
            let outcome = service.run_job(&id).await?;
            print_json(&outcome)
        }
        Command::List { status } => print_json(&service.list_jobs(status)?),
        Command::Status { id } => print_json(&service.job_status(&id)?),
        Command::Cancel { id } => print_json(&service.cancel_job(&id)?),
        Command::Delete { id } => {
            service.delete_job(&id)?;
            println!("Deleted job {}", id);
            Ok(())
        }
        Command::Cleanup => print_json(&service.cleanup()?),
        Command::Stats => print_json(&service.statistics()?),
        Command::Storage => print_json(&service.storage_status()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match execute(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
