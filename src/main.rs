use std::path::PathBuf;

use clap::{Parser, Subcommand};

use relay::config::Config;
use relay::sim::{self, SimulationConfig};
use relay::{rlog, Result};

/// Relay - lease-fenced task dispatch for remote delegates
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RELAY_DEBUG=1   Enable debug logging (alternative to --debug)\n    RELAY_LOG=LVL   Set the log level (error, warn, info, debug, trace)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.relay/relay.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (defaults to ~/.relay/relay.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the effective configuration as TOML
    Config,

    /// Run delegates, chained steps, and a restraint in-process and print a JSON summary
    Simulate {
        /// Number of delegate workers
        #[arg(long, default_value_t = 4)]
        delegates: usize,

        /// Number of queue-then-poll steps to run
        #[arg(long, default_value_t = 8)]
        steps: usize,

        /// Capacity of the shared restraint
        #[arg(long, default_value_t = 2)]
        capacity: u32,

        /// Polls each simulated job takes before finishing
        #[arg(long, default_value_t = 2)]
        polls: u32,

        /// Fail the first job of every n-th step (0 disables)
        #[arg(long, default_value_t = 3)]
        fail_every: usize,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        deadline: u64,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    relay::log::init_with_debug(cli.debug);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Simulate {
            delegates,
            steps,
            capacity,
            polls,
            fail_every,
            deadline,
        } => {
            let sim = SimulationConfig {
                delegates,
                steps,
                capacity,
                polls_per_job: polls,
                fail_every,
                deadline_secs: deadline,
                ..SimulationConfig::default()
            };
            rlog!("Simulate command: {:?}", sim);
            let rt = tokio::runtime::Runtime::new()?;
            let report = rt.block_on(sim::run(&config, &sim))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
