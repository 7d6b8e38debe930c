mod run_conservation;
mod run_extract;
mod run_fit;
mod run_simulate;

use run_conservation::*;
use run_extract::*;
use run_fit::*;
use run_simulate::*;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lentil")]
#[command(
    about = "Conservation of expression overdispersion along single-cell trajectories"
)]
struct Cli {
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate trajectory counts with batch-specific dispersion
    Simulate(SimulateArgs),
    /// Fit one negative binomial GAM per gene and store batch weights
    Fit(FitArgs),
    /// Write one stored metric as a batch x gene table
    Extract(ExtractArgs),
    /// Score and rank genes by the conservation of a stored metric
    Conservation(ConservationArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
        Commands::Fit(args) => {
            run_fit(args)?;
        }
        Commands::Extract(args) => {
            run_extract(args)?;
        }
        Commands::Conservation(args) => {
            run_conservation(args)?;
        }
    }

    Ok(())
}
