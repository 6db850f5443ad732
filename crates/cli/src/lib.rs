pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "dialectic",
    about = "Dialectic operator CLI",
    long_about = "Inspect configuration, check provider readiness, and run research sessions in-process.",
    after_help = "Examples:\n  dialectic doctor --json\n  dialectic config\n  dialectic research \"grid-scale storage\" --max-rounds 2 --answer \"focus on ERCOT\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, provider credentials, and search routing")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run one research session to completion and print the report as JSON")]
    Research {
        #[arg(help = "Research question")]
        query: String,
        #[arg(long, help = "Dialogue round limit (1-15); defaults to pipeline.max_rounds")]
        max_rounds: Option<u32>,
        #[arg(
            long = "answer",
            help = "Clarification answer, submitted in order each time the session pauses"
        )]
        answers: Vec<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Research { query, max_rounds, answers } => {
            commands::research::run(&query, max_rounds, answers)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
