pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "tandem",
    about = "Tandem operator CLI",
    long_about = "Run Tandem migrations, maintenance jobs, config checks and readiness checks.",
    after_help = concat!(
        "Examples:\n",
        "  tandem doctor --json\n",
        "  tandem sync-calendars\n",
        "  tandem expire-proposals"
    )
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Refresh the external calendar cache for every connected integration")]
    SyncCalendars,
    #[command(about = "Mark pending slot proposals past their expiry as expired")]
    ExpireProposals,
    #[command(about = "Validate config, LLM provider settings, and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::SyncCalendars => commands::sync_calendars::run(),
        Command::ExpireProposals => commands::expire_proposals::run(),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
