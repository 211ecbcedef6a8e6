//! Command line argument parsing.
//!
//! Subcommands:
//! - `analyze`: upload+run a document through the pipeline (automatic or manual mode)
//! - `status`: print a task's current stage/progress snapshot
//! - `result`: print the assembled architecture design for a completed task

use crate::model::ExecutionMode as PipelineExecutionMode;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Automatic,
    Manual,
}

impl From<ModeArg> for PipelineExecutionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Automatic => PipelineExecutionMode::Automatic,
            ModeArg::Manual => PipelineExecutionMode::Manual,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "doc-architect")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Parses a document, analyzes its content, and drafts an architecture design")]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (defaults to the standard discovery hierarchy)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the pipeline against a file
    Analyze {
        /// Path to the document to analyze
        file: PathBuf,
        /// Execution mode: automatic chains all three stages, manual requires `advance` calls
        #[arg(long = "mode", value_enum, default_value = "automatic")]
        mode: ModeArg,
    },
    /// Advance a manual-mode task by one stage
    Advance {
        /// Task id returned by `analyze --mode manual`
        task_id: String,
    },
    /// Show a task's current status
    Status {
        /// Task id returned by `analyze`
        task_id: String,
    },
    /// Print the assembled architecture design for a completed task
    Result {
        /// Task id returned by `analyze`
        task_id: String,
    },
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_arg_maps_to_pipeline_execution_mode() {
        assert_eq!(PipelineExecutionMode::from(ModeArg::Automatic), PipelineExecutionMode::Automatic);
        assert_eq!(PipelineExecutionMode::from(ModeArg::Manual), PipelineExecutionMode::Manual);
    }
}
