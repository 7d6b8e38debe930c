use anyhow::Result;
use clap::Args;
use log::info;

use lentil::common::write_parameters;
use lentil::metric_extract::extract_metric_matrix;
use lentil::metric_store::Hdf5MetricStore;
use matrix_util::common_io::write_table;

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[arg(long, help = "HDF5 metric store written by `fit`")]
    pub store: String,

    #[arg(
        long,
        default_value = "Estimate",
        help = "Metric: Estimate, Est.Error, Q2.5, Q97.5, shape, weight or weight_norm"
    )]
    pub metric: String,

    #[arg(short, long, help = "Output prefix")]
    pub output: String,
}

pub fn run_extract(args: &ExtractArgs) -> Result<()> {
    info!("Starting extract");

    let store = Hdf5MetricStore::open(&args.store)?;
    let matrix = extract_metric_matrix(&store, &args.metric)?;

    let mut header = vec!["batch"];
    header.extend(matrix.genes.iter().map(|g| g.as_ref()));

    let out_file = format!("{}.{}.tsv.gz", args.output, args.metric);
    write_table(&header, &matrix.to_rows(), "\t", &out_file)?;
    info!(
        "Wrote {} x {} {} matrix: {}",
        matrix.n_batches(),
        matrix.n_genes(),
        args.metric,
        out_file
    );

    let skipped: Vec<&str> = matrix.skipped.iter().map(|(g, _)| g.as_ref()).collect();

    let params = serde_json::json!({
        "command": "extract",
        "store": args.store,
        "metric": args.metric,
        "output": out_file,
        "batches": &matrix.batches,
        "num_genes": matrix.n_genes(),
        "skipped_genes": skipped,
    });
    write_parameters(&format!("{}.parameters.json", args.output), &params)?;

    info!("extract completed successfully");
    Ok(())
}
