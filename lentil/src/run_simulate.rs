use anyhow::Result;
use clap::Args;
use log::info;

use lentil::common::write_parameters;
use lentil::simulate::{generate_trajectory_data, SimArgs};

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[arg(short, long, help = "Output prefix")]
    pub output: String,

    #[arg(long, default_value = "50", help = "Number of genes")]
    pub genes: usize,

    #[arg(long, default_value = "4", help = "Number of batches")]
    pub batches: usize,

    #[arg(long, default_value = "500", help = "Number of cells per batch")]
    pub cells_per_batch: usize,

    #[arg(
        long,
        default_value = "0.3",
        help = "Fraction of genes sharing one dispersion across batches"
    )]
    pub conserved_fraction: f32,

    #[arg(long, default_value = "10", help = "Baseline mean count")]
    pub depth: f32,

    #[arg(long, default_value = "42", help = "Random seed")]
    pub seed: u64,
}

pub fn run_simulate(args: &SimulateArgs) -> Result<()> {
    info!("Starting simulate");

    let sim_args = SimArgs {
        genes: args.genes,
        batches: args.batches,
        cells_per_batch: args.cells_per_batch,
        conserved_fraction: args.conserved_fraction,
        depth: args.depth,
        rseed: args.seed,
    };

    let files = generate_trajectory_data(&sim_args, &args.output)?;

    let params = serde_json::json!({
        "command": "simulate",
        "output": args.output,
        "genes": args.genes,
        "batches": args.batches,
        "cells_per_batch": args.cells_per_batch,
        "conserved_fraction": args.conserved_fraction,
        "depth": args.depth,
        "seed": args.seed,
        "mtx": files.mtx,
        "gene_names": files.genes,
        "cell_names": files.cells,
        "metadata": files.metadata,
        "true_shape": files.truth,
    });
    write_parameters(&format!("{}.parameters.json", args.output), &params)?;

    info!("simulate completed successfully");
    Ok(())
}
