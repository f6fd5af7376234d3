//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: drive the experiment loop for one case
//! - analyze: re-analyze a captured uart.log offline
//! - cases: list the known cases

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hilloop::config::ExecutionMode;
use hilloop::flash::FlashMethod;
use hilloop::orchestrator::RunMode;

/// hilloop - hardware-in-the-loop bring-up: build, flash, capture, analyze, decide
#[derive(Parser, Debug)]
#[command(name = "hilloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the experiment loop for a case
    Run {
        /// Case id (see `hilloop cases`)
        #[arg(long)]
        case: String,

        /// Maximum number of attempts
        #[arg(long, default_value_t = 8)]
        max_attempts: u32,

        /// mock (simulated device) or real (hardware)
        #[arg(long, default_value = "mock")]
        mode: RunMode,

        /// Parameter override, key=value (decimal, 0x hex or text); repeatable
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Preferred flash method (auto, uf2, picotool, openocd)
        #[arg(long)]
        flash_method: Option<FlashMethod>,

        /// Decision panel scheduling (sequential, fan-out)
        #[arg(long)]
        execution_mode: Option<ExecutionMode>,

        /// Print the run outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Analyze a captured uart.log and print the result as JSON
    Analyze {
        /// Path to uart.log
        log: PathBuf,

        /// Case id, enables case-specific checks
        #[arg(long)]
        case: Option<String>,

        /// Only accept run markers for this run id
        #[arg(long)]
        run_id: Option<String>,

        /// Expected parameter, key=value; repeatable
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// List known cases
    Cases,
}
