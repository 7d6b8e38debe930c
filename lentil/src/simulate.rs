use crate::common::*;

use indicatif::ParallelProgressIterator;
use matrix_util::common_io::{write_lines, write_table};
use matrix_util::mtx_io::write_mtx_triplets;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, Normal, Poisson};
use rayon::prelude::*;

pub struct SimArgs {
    pub genes: usize,
    pub batches: usize,
    pub cells_per_batch: usize,
    /// fraction of genes with the same (high) shape in every batch
    pub conserved_fraction: f32,
    /// baseline mean count
    pub depth: f32,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            genes: 50,
            batches: 4,
            cells_per_batch: 500,
            conserved_fraction: 0.3,
            depth: 10.,
            rseed: 42,
        }
    }
}

pub struct SimOut {
    /// 0-based `(gene, cell, count)`
    pub triplets: Vec<(u64, u64, f32)>,
    pub genes: Vec<Box<str>>,
    pub cells: Vec<Box<str>>,
    pub pseudotime: Vec<f32>,
    pub cell_batches: Vec<Box<str>>,
    pub batches: Vec<Box<str>>,
    /// true negative binomial shape (gene x batch)
    pub shape: Mat,
    pub conserved: Vec<bool>,
}

const CONSERVED_SHAPE: f32 = 20.;

fn rand_err<E: std::fmt::Display>(e: E) -> LentilError {
    LentilError::Configuration(e.to_string())
}

/// Simulate counts along a trajectory with batch-specific
/// overdispersion
///
/// ```text
/// mu(g, t, b)  = depth * exp(amp(g) * sin(2 pi (t + phase(g))) + delta(g, b))
/// Y(g, j)      ~ Poisson(Gamma(shape(g, b), mu / shape(g, b)))
/// ```
///
/// Conserved genes share one large shape across batches; the others
/// draw `log(shape)` uniformly in `[log 0.5, log 20]` per batch.
pub fn simulate_trajectories(args: &SimArgs) -> Result<SimOut> {
    if args.genes == 0 || args.batches == 0 || args.cells_per_batch == 0 {
        return Err(LentilError::Configuration(
            "need at least one gene, batch and cell".into(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(args.rseed);
    let ncells = args.batches * args.cells_per_batch;

    let batches: Vec<Box<str>> = (1..=args.batches)
        .map(|b| format!("batch{}", b).into())
        .collect();
    let genes: Vec<Box<str>> = (1..=args.genes).map(|g| format!("gene{}", g).into()).collect();
    let cells: Vec<Box<str>> = (1..=ncells).map(|j| format!("cell{}", j).into()).collect();

    let cell_batch: Vec<usize> = (0..ncells).map(|j| j / args.cells_per_batch).collect();
    let pseudotime: Vec<f32> = (0..ncells).map(|_| rng.random::<f32>()).collect();

    let nconserved = ((args.genes as f32) * args.conserved_fraction).round() as usize;
    let conserved: Vec<bool> = (0..args.genes).map(|g| g < nconserved).collect();

    let (lb, ub) = (0.5f32.ln(), CONSERVED_SHAPE.ln());
    let shape = Mat::from_fn(args.genes, args.batches, |g, _| {
        if conserved[g] {
            CONSERVED_SHAPE
        } else {
            rng.random_range(lb..ub).exp()
        }
    });

    let batch_effect = Normal::new(0f32, 0.2).map_err(rand_err)?;

    let triplets = (0..args.genes)
        .into_par_iter()
        .progress_count(args.genes as u64)
        .map(|g| -> Result<Vec<(u64, u64, f32)>> {
            let mut rng = StdRng::seed_from_u64(args.rseed.wrapping_add(g as u64 + 1));
            let amp: f32 = rng.random_range(0.2..1.0);
            let phase: f32 = rng.random();
            let delta: Vec<f32> = (0..args.batches)
                .map(|_| batch_effect.sample(&mut rng))
                .collect();

            let mut ret = vec![];
            for j in 0..ncells {
                let b = cell_batch[j];
                let t = pseudotime[j];
                let mu = args.depth
                    * (amp * (2. * std::f32::consts::PI * (t + phase)).sin() + delta[b]).exp();
                let phi = shape[(g, b)];
                let lambda = Gamma::new(phi, mu / phi).map_err(rand_err)?.sample(&mut rng);
                if lambda > 0. {
                    let y = Poisson::new(lambda).map_err(rand_err)?.sample(&mut rng);
                    if y > 0. {
                        ret.push((g as u64, j as u64, y));
                    }
                }
            }
            Ok(ret)
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    info!(
        "simulated {} genes x {} cells, {} non-zeros",
        args.genes,
        ncells,
        triplets.len()
    );

    Ok(SimOut {
        triplets,
        genes,
        cells,
        pseudotime,
        cell_batches: cell_batch.iter().map(|&b| batches[b].clone()).collect(),
        batches,
        shape,
        conserved,
    })
}

/// Files of a simulated data set
pub struct SimFiles {
    pub mtx: Box<str>,
    pub genes: Box<str>,
    pub cells: Box<str>,
    pub metadata: Box<str>,
    pub truth: Box<str>,
}

impl SimFiles {
    pub fn new(out: &str) -> Self {
        Self {
            mtx: format!("{}.mtx.gz", out).into(),
            genes: format!("{}.genes.gz", out).into(),
            cells: format!("{}.cells.gz", out).into(),
            metadata: format!("{}.metadata.tsv.gz", out).into(),
            truth: format!("{}.shape.tsv.gz", out).into(),
        }
    }
}

/// Simulate and write MatrixMarket counts, names, cell metadata
/// (`cell`, `pseudotime`, `batch`) and the true shape per gene
pub fn generate_trajectory_data(args: &SimArgs, out: &str) -> anyhow::Result<SimFiles> {
    let sim = simulate_trajectories(args)?;
    let files = SimFiles::new(out);

    write_mtx_triplets(&sim.triplets, sim.genes.len(), sim.cells.len(), &files.mtx)?;
    write_lines(&sim.genes, &files.genes)?;
    write_lines(&sim.cells, &files.cells)?;

    let meta: Vec<Vec<Box<str>>> = sim
        .cells
        .iter()
        .zip(sim.pseudotime.iter())
        .zip(sim.cell_batches.iter())
        .map(|((c, t), b)| vec![c.clone(), format!("{}", t).into(), b.clone()])
        .collect();
    write_table(&["cell", "pseudotime", "batch"], &meta, "\t", &files.metadata)?;

    let mut header = vec!["gene", "conserved"];
    header.extend(sim.batches.iter().map(|b| b.as_ref()));
    let truth: Vec<Vec<Box<str>>> = (0..sim.genes.len())
        .map(|g| {
            let mut row: Vec<Box<str>> = vec![
                sim.genes[g].clone(),
                if sim.conserved[g] { "TRUE" } else { "FALSE" }.into(),
            ];
            row.extend(sim.shape.row(g).iter().map(|v| format!("{}", v).into()));
            row
        })
        .collect();
    write_table(&header, &truth, "\t", &files.truth)?;

    info!("wrote {}, {}, {}, {}", files.mtx, files.genes, files.cells, files.metadata);
    Ok(files)
}
