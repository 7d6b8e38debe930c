use anyhow::Result;
use clap::Args;
use log::info;

use lentil::common::write_parameters;
use lentil::conservation::{
    calculate_conservation_from_store, ConservationConfig, ConservationRecord,
};
use lentil::metric_store::Hdf5MetricStore;
use matrix_util::common_io::write_table;

#[derive(Args, Debug, Clone)]
pub struct ConservationArgs {
    #[arg(long, help = "HDF5 metric store written by `fit`")]
    pub store: String,

    #[arg(long, default_value = "Estimate", help = "Metric to score")]
    pub metric: String,

    #[arg(long, default_value = "0.5", help = "Weight of the mean across batches")]
    pub mean_weight: f32,

    #[arg(
        long,
        default_value = "0.5",
        help = "Weight of the (inverse) variability across batches"
    )]
    pub variability_weight: f32,

    #[arg(long, default_value = "0.6", help = "Genes scoring at least this are conserved")]
    pub threshold: f32,

    #[arg(long, help = "Use raw mean and 1/cv instead of min-max scaled values")]
    pub no_normalize: bool,

    #[arg(short, long, help = "Output prefix")]
    pub output: String,
}

pub fn run_conservation(args: &ConservationArgs) -> Result<()> {
    info!("Starting conservation");

    let config = ConservationConfig {
        mean_weight: args.mean_weight,
        variability_weight: args.variability_weight,
        conservation_threshold: args.threshold,
        normalize_scores: !args.no_normalize,
    };

    let store = Hdf5MetricStore::open(&args.store)?;
    let records = calculate_conservation_from_store(&store, &args.metric, &config)?;

    let rows: Vec<Vec<Box<str>>> = records.iter().map(|r| r.to_row()).collect();
    let out_file = format!("{}.conservation.tsv.gz", args.output);
    write_table(&ConservationRecord::HEADER, &rows, "\t", &out_file)?;

    let num_conserved = records.iter().filter(|r| r.is_conserved).count();
    info!("{} of {} genes conserved: {}", num_conserved, records.len(), out_file);

    let params = serde_json::json!({
        "command": "conservation",
        "store": args.store,
        "metric": args.metric,
        "config": &config,
        "output": out_file,
        "num_genes": records.len(),
        "num_conserved": num_conserved,
    });
    write_parameters(&format!("{}.parameters.json", args.output), &params)?;

    info!("conservation completed successfully");
    Ok(())
}
