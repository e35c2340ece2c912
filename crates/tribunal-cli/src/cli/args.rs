use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tribunal",
    version,
    about = "Queue worker and admin tooling for the evaluation core"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create or upgrade the database schema
    Migrate(MigrateArgs),
    /// Import suites and cases from a YAML seed file
    Seed(SeedArgs),
    /// Write a sample seed file to get started
    Init(InitArgs),
    /// Consume RunExecution jobs from the work queue
    Worker(WorkerArgs),
    Version,
}

#[derive(Parser, Clone)]
pub struct MigrateArgs {
    #[arg(long, env = "DB_URL", default_value = ".tribunal/tribunal.db")]
    pub db: PathBuf,
}

#[derive(Parser, Clone)]
pub struct SeedArgs {
    #[arg(long, env = "DB_URL", default_value = ".tribunal/tribunal.db")]
    pub db: PathBuf,

    #[arg(long, default_value = "suites.yaml")]
    pub file: PathBuf,
}

#[derive(Parser, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "suites.yaml")]
    pub file: PathBuf,
}

#[derive(Parser, Clone)]
pub struct WorkerArgs {
    /// Exit once the queue is empty instead of polling forever
    #[arg(long)]
    pub drain: bool,

    /// Idle poll interval in milliseconds
    #[arg(long, default_value_t = 500)]
    pub poll_ms: u64,

    /// Model provider: http (uses MODEL_PROVIDER_ENDPOINT/KEY) or echo
    #[arg(long, default_value = "http", env = "MODEL_PROVIDER")]
    pub provider: String,
}
