use anyhow::Result;
use clap::Args;
use log::{info, warn};
use std::path::PathBuf;

use lentil::batch_fit::{run_gene_models, ExecutionMode, PersistConfig};
use lentil::common::write_parameters;
use lentil::ess_engine::EssEngine;
use lentil::gam_model::ModelPriors;
use lentil::gene_model::FitConfig;
use lentil::input::{read_trajectory_data, MetadataColumns};
use lentil::tensor_builder::{build_tensor, TailCheck, TensorConfig};
use matrix_util::common_io::write_table;

#[derive(Args, Debug, Clone)]
pub struct FitArgs {
    #[arg(long, help = "Gene x cell MatrixMarket file (.mtx or .mtx.gz)")]
    pub mtx: String,

    #[arg(long, help = "Gene names, one per line")]
    pub genes: String,

    #[arg(long, help = "Cell names, one per line")]
    pub cells: String,

    #[arg(long, help = "Cell metadata table with a header line")]
    pub metadata: String,

    #[arg(long, default_value = "cell", help = "Cell name column of the metadata")]
    pub cell_column: String,

    #[arg(long, default_value = "pseudotime", help = "Pseudotime column of the metadata")]
    pub time_column: String,

    #[arg(long, default_value = "batch", help = "Batch column of the metadata")]
    pub batch_column: String,

    #[arg(short, long, help = "Output prefix")]
    pub output: String,

    #[arg(long, default_value = "100", help = "Number of pseudotime bins")]
    pub n_bins: usize,

    #[arg(
        long,
        default_value = "0.1",
        help = "Keep genes positive in more than this fraction of (batch, bin) columns"
    )]
    pub gene_threshold: f32,

    #[arg(
        long,
        default_value = "0.3",
        help = "Keep batches covering more than this fraction of bins"
    )]
    pub batch_threshold: f32,

    #[arg(long, help = "Do not require batches to cover the end of the trajectory")]
    pub no_tail_check: bool,

    #[arg(long, default_value = "0.3", help = "Fraction of bins counted as the tail")]
    pub tail_width: f32,

    #[arg(
        long,
        default_value = "0.02",
        help = "Batches need more than this fraction of bins in the tail"
    )]
    pub tail_num: f32,

    #[arg(long, value_delimiter = ',', help = "Fit only these genes (comma separated)")]
    pub select_genes: Option<Vec<String>>,

    #[arg(long, default_value = "5", help = "Number of spline knots")]
    pub n_knots: usize,

    #[arg(long, default_value = "2000", help = "Iterations per chain, half of them warm-up")]
    pub n_samples: usize,

    #[arg(long, default_value = "4", help = "Number of chains")]
    pub chains: usize,

    #[arg(long, default_value = "0.95", help = "Target acceptance rate")]
    pub adapt_delta: f32,

    #[arg(long, default_value = "12", help = "Log2 of the work bound per transition")]
    pub max_treedepth: usize,

    #[arg(long, default_value = "1.1", help = "Genes above this split R-hat fail")]
    pub max_rhat: f32,

    #[arg(long, help = "Keep genes above --max-rhat with a warning")]
    pub allow_poor_mixing: bool,

    #[arg(long, default_value = "42", help = "Random seed")]
    pub seed: u64,

    #[arg(long, help = "Fit genes on a worker pool")]
    pub parallel: bool,

    #[arg(long, help = "Number of workers (default: number of CPUs)")]
    pub num_workers: Option<usize>,

    #[arg(long, help = "Skip per-gene SVG plots")]
    pub no_plots: bool,

    #[arg(long, help = "Skip per-gene model JSON files")]
    pub no_models: bool,
}

pub fn run_fit(args: &FitArgs) -> Result<()> {
    info!("Starting fit");

    let columns = MetadataColumns {
        cell: args.cell_column.clone().into(),
        pseudotime: args.time_column.clone().into(),
        batch: args.batch_column.clone().into(),
    };

    let data = read_trajectory_data(&args.mtx, &args.genes, &args.cells, &args.metadata, &columns)?;

    let tensor_config = TensorConfig {
        n_bins: args.n_bins,
        gene_threshold: args.gene_threshold,
        batch_threshold: args.batch_threshold,
        tail_check: (!args.no_tail_check).then_some(TailCheck {
            tail_width: args.tail_width,
            tail_num: args.tail_num,
        }),
    };

    let tensor = build_tensor(
        &data.counts,
        &data.genes,
        &data.pseudotime,
        &data.batches,
        &tensor_config,
    )?;

    let gene_indices: Option<Vec<usize>> = match args.select_genes.as_ref() {
        Some(select) => {
            let idx: Vec<usize> = select
                .iter()
                .filter_map(|g| {
                    let i = tensor.gene_index(g);
                    if i.is_none() {
                        warn!("{} is not in the tensor", g);
                    }
                    i
                })
                .collect();
            if idx.is_empty() {
                anyhow::bail!("none of the selected genes passed the filters");
            }
            Some(idx)
        }
        None => None,
    };

    let fit_config = FitConfig {
        n_knots: args.n_knots,
        n_samples: args.n_samples,
        chains: args.chains,
        adapt_delta: args.adapt_delta,
        max_treedepth: args.max_treedepth,
        max_rhat: args.max_rhat,
        allow_poor_mixing: args.allow_poor_mixing,
        seed: args.seed,
        priors: ModelPriors::default(),
    };

    let mode = if args.parallel || args.num_workers.is_some() {
        ExecutionMode::parallel(args.num_workers)
    } else {
        ExecutionMode::Sequential
    };

    let store_file = format!("{}.h5", args.output);
    let persist = PersistConfig {
        store_file: Some(PathBuf::from(&store_file)),
        plot_dir: (!args.no_plots).then(|| PathBuf::from(format!("{}_plots", args.output))),
        model_dir: (!args.no_models).then(|| PathBuf::from(format!("{}_models", args.output))),
    };

    let output = run_gene_models(
        &tensor,
        gene_indices.as_deref(),
        &EssEngine::default(),
        &fit_config,
        mode,
        &persist,
    )?;

    let rows: Vec<Vec<Box<str>>> = output
        .results
        .iter()
        .map(|(gene, res)| {
            let (status, rhat) = match res {
                Some(r) => ("ok", format!("{}", r.posterior.max_rhat())),
                None => ("failed", "NaN".to_string()),
            };
            vec![gene.clone(), status.into(), rhat.into()]
        })
        .collect();
    let status_file = format!("{}.fit_status.tsv.gz", args.output);
    write_table(&["gene", "status", "max_rhat"], &rows, "\t", &status_file)?;

    let failed = output.failed_genes();
    if !failed.is_empty() {
        warn!("{} genes failed: see {}", failed.len(), status_file);
    }

    let params = serde_json::json!({
        "command": "fit",
        "mtx": args.mtx,
        "genes": args.genes,
        "cells": args.cells,
        "metadata": args.metadata,
        "tensor": &tensor_config,
        "n_batches": tensor.n_batches(),
        "n_genes": tensor.n_genes(),
        "batches": &tensor.batches,
        "model": &fit_config,
        "formula": fit_config.gam_spec().formula(),
        "execution": format!("{:?}", mode),
        "store": store_file,
        "fit_status": status_file,
        "num_fitted": output.num_succeeded(),
        "num_failed": failed.len(),
    });
    write_parameters(&format!("{}.parameters.json", args.output), &params)?;

    info!("fit completed successfully");
    Ok(())
}
