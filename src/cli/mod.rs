//! Command-line interface for exercising the pipeline from a terminal.
//!
//! Thin wiring only: argument parsing lives in [`args`]; the dispatch logic that turns parsed
//! arguments into pipeline calls lives in `main.rs`.

pub mod args;

pub use args::{Args, Commands, ModeArg};
