//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Orchestration core for notebook interpreter processes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an interpreter process (normally started by a controller)
    Interpreter {
        /// Controller event host to register with
        #[arg(long)]
        event_host: Option<String>,

        /// Controller event port to register with
        #[arg(long)]
        event_port: Option<u16>,

        /// Process group this process hosts
        #[arg(long)]
        group_id: String,

        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on (0 picks a free one)
        #[arg(long, default_value_t = 0)]
        port: u16,
    },

    /// Launch (or restore) a process group and run one script in it
    Run {
        /// Script to run
        script: String,

        /// Process group id (generated when omitted)
        #[arg(short, long)]
        group: Option<String>,

        /// Interpreter class
        #[arg(short, long, default_value = "sh")]
        class: String,

        /// Note (session) the paragraph belongs to
        #[arg(long, default_value = "note")]
        note: String,

        /// Leave the process running for a later `run` to reuse
        #[arg(long)]
        keep: bool,
    },

    /// List recorded interpreter processes
    Registrations {
        /// Recovery directory (defaults to ~/.atelier)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Stop every recorded interpreter process and forget it
    Cleanup {
        /// Recovery directory (defaults to ~/.atelier)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}
