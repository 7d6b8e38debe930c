use crate::common::*;
use crate::gam_model::InferenceEngine;
use crate::gene_model::{fit_gene_model, FitConfig, GeneModelResult};
use crate::gene_plot::plot_gene_model;
use crate::metric_store::{initialize_store, write_array_weights, Hdf5MetricStore, MetricStore};
use crate::tensor_builder::ExpressionTensor;

use indicatif::{ParallelProgressIterator, ProgressBar, ProgressIterator};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// How to run many gene fits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Sequential,
    /// a worker pool of this size, built for one batch call
    Parallel { num_workers: usize },
}

impl ExecutionMode {
    /// `Parallel` with as many workers as CPUs unless given
    pub fn parallel(num_workers: Option<usize>) -> Self {
        ExecutionMode::Parallel {
            num_workers: num_workers.unwrap_or_else(num_cpus::get),
        }
    }
}

/// Where per-gene results go; every destination is optional
#[derive(Debug, Clone, Default)]
pub struct PersistConfig {
    /// HDF5 metric store
    pub store_file: Option<PathBuf>,
    /// per-gene SVG plots
    pub plot_dir: Option<PathBuf>,
    /// per-gene model JSON
    pub model_dir: Option<PathBuf>,
}

/// gene name -> fitted model, `None` for failed genes, in input order
#[derive(Debug, Default)]
pub struct BatchFitOutput {
    pub results: Vec<(Box<str>, Option<GeneModelResult>)>,
}

impl BatchFitOutput {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, gene: &str) -> Option<&GeneModelResult> {
        self.results
            .iter()
            .find(|(g, _)| g.as_ref() == gene)
            .and_then(|(_, r)| r.as_ref())
    }

    pub fn num_succeeded(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_some()).count()
    }

    pub fn failed_genes(&self) -> Vec<Box<str>> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_none())
            .map(|(g, _)| g.clone())
            .collect()
    }
}

/// Outcome of one gene in a batch run
type GeneOutcome = (Box<str>, std::result::Result<GeneModelResult, String>);

fn safe_file_name(gene: &str) -> String {
    gene.chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Plot and model JSON of one gene
pub fn save_gene_artifacts(result: &GeneModelResult, persist: &PersistConfig) -> Result<()> {
    let name = safe_file_name(&result.gene);

    if let Some(dir) = persist.plot_dir.as_ref() {
        plot_gene_model(result, &dir.join(format!("{}.svg", name)))?;
    }

    if let Some(dir) = persist.model_dir.as_ref() {
        let file = std::fs::File::create(dir.join(format!("{}.model.json", name)))?;
        serde_json::to_writer(std::io::BufWriter::new(file), result)?;
    }
    Ok(())
}

/// `pos` of `ngenes` is only for the log
fn fit_and_save<E: InferenceEngine + ?Sized>(
    tensor: &ExpressionTensor,
    (pos, ngenes): (usize, usize),
    gene_idx: usize,
    engine: &E,
    config: &FitConfig,
    persist: &PersistConfig,
) -> GeneOutcome {
    let gene = tensor.genes[gene_idx].clone();
    let res = fit_gene_model(
        &gene,
        tensor.gene_slice(gene_idx),
        &tensor.batches,
        engine,
        config,
    )
    .and_then(|result| {
        save_gene_artifacts(&result, persist)?;
        Ok(result)
    })
    .map_err(|e| e.to_string());

    match res.as_ref() {
        Ok(_) => info!("[{}/{}] {} fitted", pos + 1, ngenes, gene),
        Err(reason) => warn!("[{}/{}] {}: {}", pos + 1, ngenes, gene, reason),
    }
    (gene, res)
}

fn open_store(file: &Path) -> Result<Hdf5MetricStore> {
    let mut store = Hdf5MetricStore::open_or_create(file)?;
    initialize_store(&mut store)?;
    Ok(store)
}

/// Fit one model per gene and persist what succeeded
///
/// * `tensor` - `[batch, bin, gene]` expression
/// * `gene_indices` - genes to fit, all if `None`
/// * `engine` - inference backend
/// * `config` - model and sampling settings
/// * `mode` - sequential or on a worker pool
/// * `persist` - store file, plot and model directories
pub fn run_gene_models<E: InferenceEngine + ?Sized>(
    tensor: &ExpressionTensor,
    gene_indices: Option<&[usize]>,
    engine: &E,
    config: &FitConfig,
    mode: ExecutionMode,
    persist: &PersistConfig,
) -> Result<BatchFitOutput> {
    let gene_indices: Vec<usize> = match gene_indices {
        Some(idx) => idx.to_vec(),
        None => (0..tensor.n_genes()).collect(),
    };

    if let Some(&bad) = gene_indices.iter().find(|&&g| g >= tensor.n_genes()) {
        return Err(LentilError::DataShape(format!(
            "gene index {} out of {} genes",
            bad,
            tensor.n_genes()
        )));
    }

    if let ExecutionMode::Parallel { num_workers: 0 } = mode {
        return Err(LentilError::Configuration(
            "a parallel run needs at least one worker".into(),
        ));
    }

    for dir in [persist.plot_dir.as_ref(), persist.model_dir.as_ref()]
        .into_iter()
        .flatten()
    {
        std::fs::create_dir_all(dir)?;
    }

    let mut store = match persist.store_file.as_ref() {
        Some(file) => Some(open_store(file)?),
        None => None,
    };

    let ngenes = gene_indices.len();
    info!("fitting {} genes ({:?})", ngenes, mode);

    let outcomes: Vec<GeneOutcome> = match mode {
        ExecutionMode::Sequential => {
            let mut outcomes = Vec::with_capacity(ngenes);
            for (pos, &g) in gene_indices.iter().enumerate().progress_count(ngenes as u64) {
                let (gene, res) = fit_and_save(tensor, (pos, ngenes), g, engine, config, persist);
                if let (Some(store), Ok(result)) = (store.as_mut(), res.as_ref()) {
                    write_array_weights(store, &gene, &result.array_weights)?;
                }
                outcomes.push((gene, res));
            }
            outcomes
        }
        ExecutionMode::Parallel { num_workers } => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .build()
                .map_err(|e| LentilError::Configuration(e.to_string()))?;

            let pb = ProgressBar::new(ngenes as u64);
            let outcomes: Vec<GeneOutcome> = pool.install(|| {
                gene_indices
                    .par_iter()
                    .enumerate()
                    .map(|(pos, &g)| {
                        fit_and_save(tensor, (pos, ngenes), g, engine, config, persist)
                    })
                    .progress_with(pb)
                    .collect()
            });

            // the store is written from this thread only
            if let Some(store) = store.as_mut() {
                for (gene, res) in outcomes.iter() {
                    if let Ok(result) = res {
                        write_array_weights(store, gene, &result.array_weights)?;
                    }
                }
            }
            outcomes
        }
    };

    if let Some(store) = store.as_ref() {
        store.flush()?;
    }

    let output = BatchFitOutput {
        results: outcomes
            .into_iter()
            .map(|(gene, res)| (gene, res.ok()))
            .collect(),
    };

    info!(
        "{} of {} genes fitted",
        output.num_succeeded(),
        output.len()
    );
    Ok(output)
}

/// Same as [`run_gene_models`] writing to any [`MetricStore`]
pub fn run_gene_models_with_store<E, S>(
    tensor: &ExpressionTensor,
    gene_indices: Option<&[usize]>,
    engine: &E,
    config: &FitConfig,
    mode: ExecutionMode,
    persist: &PersistConfig,
    store: &mut S,
) -> Result<BatchFitOutput>
where
    E: InferenceEngine + ?Sized,
    S: MetricStore + ?Sized,
{
    let persist = PersistConfig {
        store_file: None,
        ..persist.clone()
    };
    let output = run_gene_models(tensor, gene_indices, engine, config, mode, &persist)?;

    initialize_store(store)?;
    for (gene, res) in output.results.iter() {
        if let Some(result) = res {
            write_array_weights(store, gene, &result.array_weights)?;
        }
    }
    Ok(output)
}
