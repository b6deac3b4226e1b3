//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one command on a worker and print its result
    Exec {
        /// Worker category (device, memory, training, postprocessing, ...)
        #[arg(long, value_name = "CATEGORY")]
        category: String,

        /// Command name understood by the worker
        #[arg(long, value_name = "NAME")]
        command: String,

        /// JSON payload (example: --payload='{"sizeBytes":1024}')
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,

        /// Response timeout; defaults to the configured timeout
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Start workers and print their health as JSON
    Health {
        /// Category to start; repeatable. Defaults to the configured pre-warm list
        #[arg(long = "category", value_name = "CATEGORY")]
        categories: Vec<String>,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        path: PathBuf,
    },

    /// Print or write a sample configuration
    Generate {
        /// Output file path; prints to stdout when omitted
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Overwrite an existing output file
        #[arg(long)]
        force: bool,
    },
}
