use crate::common::*;

use ndarray::{s, Array3, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// How to bin pseudotime and which genes and batches to keep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorConfig {
    /// number of equal-width pseudotime bins
    pub n_bins: usize,
    /// a gene needs positive means in more than this fraction of
    /// (batch, bin) columns
    pub gene_threshold: f32,
    /// a batch needs more than this fraction of `n_bins` covered
    pub batch_threshold: f32,
    /// require coverage of the late end of the trajectory
    pub tail_check: Option<TailCheck>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TailCheck {
    /// fraction of the trajectory counted as its tail
    pub tail_width: f32,
    /// a batch needs more than `tail_num * n_bins` bins in the tail
    pub tail_num: f32,
}

impl Default for TailCheck {
    fn default() -> Self {
        Self {
            tail_width: 0.3,
            tail_num: 0.02,
        }
    }
}

impl Default for TensorConfig {
    fn default() -> Self {
        Self {
            n_bins: 100,
            gene_threshold: 0.1,
            batch_threshold: 0.3,
            tail_check: Some(TailCheck::default()),
        }
    }
}

/// Gene expression averaged within pseudotime bins of each batch
///
/// ```text
/// data[batch, bin - 1, gene]   (NaN = no cell in this batch and bin)
/// ```
#[derive(Debug, Clone)]
pub struct ExpressionTensor {
    pub data: Array3<f32>,
    pub batches: Vec<Box<str>>,
    pub genes: Vec<Box<str>>,
}

impl ExpressionTensor {
    pub fn n_batches(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn n_bins(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn n_genes(&self) -> usize {
        self.data.shape()[2]
    }

    /// 1-based bin labels of the time axis
    pub fn bins(&self) -> Vec<usize> {
        (1..=self.n_bins()).collect()
    }

    /// `[batch, time]` slice of one gene
    pub fn gene_slice(&self, gene_idx: usize) -> ArrayView2<'_, f32> {
        self.data.slice(s![.., .., gene_idx])
    }

    pub fn gene_index(&self, gene: &str) -> Option<usize> {
        self.genes.iter().position(|g| g.as_ref() == gene)
    }

    /// fraction of (batch, bin) cells that carry an observation
    pub fn observed_fraction(&self) -> f32 {
        let nb = self.n_batches() * self.n_bins();
        if nb == 0 || self.n_genes() == 0 {
            return 0.;
        }
        let observed = self
            .data
            .slice(s![.., .., 0])
            .iter()
            .filter(|x| !x.is_nan())
            .count();
        observed as f32 / nb as f32
    }
}

/// One `(batch, bin)` combination observed in the data
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BinColumn {
    pub batch: Box<str>,
    pub bin: usize,
}

/// `gene x (batch, bin)` matrix of mean expression
#[derive(Debug, Clone)]
pub struct BinnedExpression {
    pub means: Mat,
    pub columns: Vec<BinColumn>,
    pub genes: Vec<Box<str>>,
    pub n_bins: usize,
}

/// Assign each value to one of `n_bins` equal-width intervals over
/// `[min, max]`. Returns 1-based bin indices. Intervals are closed on
/// the right, and the first one also includes the minimum.
pub fn bin_pseudotime(pseudotime: &[f32], n_bins: usize) -> Result<Vec<usize>> {
    if n_bins == 0 {
        return Err(LentilError::Configuration(
            "number of bins must be positive".into(),
        ));
    }
    if pseudotime.is_empty() {
        return Err(LentilError::DataShape("empty pseudotime".into()));
    }
    if let Some(i) = pseudotime.iter().position(|t| !t.is_finite()) {
        return Err(LentilError::DataShape(format!(
            "non-finite pseudotime at cell {}",
            i
        )));
    }

    let (lb, ub) = pseudotime
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lb, ub), &t| {
            (lb.min(t), ub.max(t))
        });

    if !(ub > lb) {
        return Err(LentilError::DataShape(format!(
            "degenerate pseudotime range: all values are {}",
            lb
        )));
    }

    let width = (ub as f64 - lb as f64) / n_bins as f64;

    Ok(pseudotime
        .iter()
        .map(|&t| {
            let k = ((t as f64 - lb as f64) / width).ceil() as usize;
            k.clamp(1, n_bins)
        })
        .collect())
}

/// Average expression of the cells that share a `(batch, bin)` key.
/// Columns are ordered by batch label and then by bin; combinations
/// without cells are not present.
///
/// * `counts` - gene x cell expression
/// * `genes` - gene names (rows of `counts`)
/// * `batches` - batch label of each cell
/// * `bins` - 1-based pseudotime bin of each cell
/// * `n_bins` - total number of bins
pub fn aggregate_bins(
    counts: &CscMat,
    genes: &[Box<str>],
    batches: &[Box<str>],
    bins: &[usize],
    n_bins: usize,
) -> Result<BinnedExpression> {
    let ncells = counts.ncols();
    if batches.len() != ncells || bins.len() != ncells {
        return Err(LentilError::DataShape(format!(
            "{} cells in the expression matrix, {} batch labels, {} bins",
            ncells,
            batches.len(),
            bins.len()
        )));
    }
    if genes.len() != counts.nrows() {
        return Err(LentilError::DataShape(format!(
            "{} gene names for {} rows",
            genes.len(),
            counts.nrows()
        )));
    }

    let mut groups: BTreeMap<BinColumn, Vec<usize>> = BTreeMap::new();
    for (j, (batch, &bin)) in batches.iter().zip(bins.iter()).enumerate() {
        groups
            .entry(BinColumn {
                batch: batch.clone(),
                bin,
            })
            .or_default()
            .push(j);
    }

    let ngenes = counts.nrows();
    let groups: Vec<(BinColumn, Vec<usize>)> = groups.into_iter().collect();

    let mean_columns: Vec<DVec> = groups
        .par_iter()
        .map(|(_, cells)| {
            let mut acc = DVec::zeros(ngenes);
            for &j in cells {
                let col = counts.col(j);
                for (&i, &x) in col.row_indices().iter().zip(col.values().iter()) {
                    acc[i] += x;
                }
            }
            acc / cells.len() as f32
        })
        .collect();

    let means = if mean_columns.is_empty() {
        Mat::zeros(ngenes, 0)
    } else {
        Mat::from_columns(&mean_columns)
    };

    Ok(BinnedExpression {
        means,
        columns: groups.into_iter().map(|(k, _)| k).collect(),
        genes: genes.to_vec(),
        n_bins,
    })
}

/// Indices of genes with more than `gene_threshold * ncols` positive
/// bin means
pub fn filter_genes(binned: &BinnedExpression, gene_threshold: f32) -> Vec<usize> {
    let cutoff = gene_threshold * binned.means.ncols() as f32;
    binned
        .means
        .row_iter()
        .enumerate()
        .filter(|(_, row)| row.iter().filter(|&&x| x > 0.).count() as f32 > cutoff)
        .map(|(i, _)| i)
        .collect()
}

/// Batches covering enough of the trajectory, in label order
pub fn filter_batches(
    binned: &BinnedExpression,
    batch_threshold: f32,
    tail_check: Option<&TailCheck>,
) -> Vec<Box<str>> {
    let n_bins = binned.n_bins as f32;

    let mut n_present: BTreeMap<&str, usize> = BTreeMap::new();
    let mut n_tail: HashMap<&str, usize> = HashMap::new();

    for col in binned.columns.iter() {
        *n_present.entry(col.batch.as_ref()).or_default() += 1;
        if let Some(tail) = tail_check {
            if col.bin as f32 > (1. - tail.tail_width) * n_bins {
                *n_tail.entry(col.batch.as_ref()).or_default() += 1;
            }
        }
    }

    n_present
        .into_iter()
        .filter(|&(_, n)| n as f32 > batch_threshold * n_bins)
        .filter(|&(batch, _)| match tail_check {
            Some(tail) => {
                let nt = n_tail.get(batch).copied().unwrap_or(0);
                nt as f32 > tail.tail_num * n_bins
            }
            None => true,
        })
        .map(|(batch, _)| batch.into())
        .collect()
}

/// Place each `(batch, bin)` column of the selected genes at
/// `[batch, bin - 1, :]`. Cells without a column remain `NaN`.
pub fn reshape_to_3d(
    binned: &BinnedExpression,
    batches: &[Box<str>],
    gene_idx: &[usize],
) -> ExpressionTensor {
    let batch_pos: HashMap<&str, usize> = batches
        .iter()
        .enumerate()
        .map(|(b, x)| (x.as_ref(), b))
        .collect();

    let mut data = Array3::<f32>::from_elem(
        (batches.len(), binned.n_bins, gene_idx.len()),
        f32::NAN,
    );

    for (j, col) in binned.columns.iter().enumerate() {
        let Some(&b) = batch_pos.get(col.batch.as_ref()) else {
            continue;
        };
        if col.bin == 0 || col.bin > binned.n_bins {
            continue;
        }
        for (g, &i) in gene_idx.iter().enumerate() {
            data[[b, col.bin - 1, g]] = binned.means[(i, j)];
        }
    }

    ExpressionTensor {
        data,
        batches: batches.to_vec(),
        genes: gene_idx.iter().map(|&i| binned.genes[i].clone()).collect(),
    }
}

/// Bin pseudotime, average within bins, filter genes and batches, and
/// build the `[batch, bin, gene]` tensor
///
/// * `counts` - gene x cell expression
/// * `genes` - gene names
/// * `pseudotime` - pseudotime of each cell
/// * `batches` - batch label of each cell
/// * `config` - binning and filtering parameters
pub fn build_tensor(
    counts: &CscMat,
    genes: &[Box<str>],
    pseudotime: &[f32],
    batches: &[Box<str>],
    config: &TensorConfig,
) -> Result<ExpressionTensor> {
    let bins = bin_pseudotime(pseudotime, config.n_bins)?;
    let binned = aggregate_bins(counts, genes, batches, &bins, config.n_bins)?;
    info!(
        "{} genes x {} (batch, bin) columns",
        binned.means.nrows(),
        binned.means.ncols()
    );

    let gene_idx = filter_genes(&binned, config.gene_threshold);
    if gene_idx.is_empty() {
        return Err(LentilError::DataShape(format!(
            "no gene is positive in more than {} of the bins",
            config.gene_threshold
        )));
    }

    let kept_batches = filter_batches(&binned, config.batch_threshold, config.tail_check.as_ref());
    if kept_batches.is_empty() {
        return Err(LentilError::DataShape(format!(
            "no batch covers more than {} of {} bins",
            config.batch_threshold, config.n_bins
        )));
    }

    let tensor = reshape_to_3d(&binned, &kept_batches, &gene_idx);
    info!(
        "tensor: {} batches x {} bins x {} genes ({:.1}% observed)",
        tensor.n_batches(),
        tensor.n_bins(),
        tensor.n_genes(),
        100. * tensor.observed_fraction()
    );
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn names(prefix: &str, n: usize) -> Vec<Box<str>> {
        (1..=n).map(|i| format!("{}{}", prefix, i).into()).collect()
    }

    #[test]
    fn evenly_spaced_into_five_bins() -> Result<()> {
        let x: Vec<f32> = (1..=10).map(|i| i as f32).collect();
        let bins = bin_pseudotime(&x, 5)?;
        assert_eq!(bins, vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5]);

        let mut distinct = bins.clone();
        distinct.dedup();
        assert_eq!(distinct.len(), 5);
        Ok(())
    }

    #[test]
    fn degenerate_pseudotime_fails() {
        let x = vec![0.3f32; 7];
        assert!(matches!(
            bin_pseudotime(&x, 4),
            Err(LentilError::DataShape(_))
        ));
        assert!(bin_pseudotime(&[0.1, f32::NAN], 2).is_err());
        assert!(bin_pseudotime(&[0.1, 0.2], 0).is_err());
    }

    #[test]
    fn aggregate_means_per_batch_and_bin() -> Result<()> {
        // 2 genes x 4 cells
        let dense = Mat::from_row_slice(2, 4, &[1., 3., 5., 0., 0., 2., 0., 4.]);
        let counts = CscMat::from(&dense);
        let batches: Vec<Box<str>> = vec!["b".into(), "a".into(), "a".into(), "b".into()];
        let bins = vec![2, 1, 1, 2];

        let binned = aggregate_bins(&counts, &names("g", 2), &batches, &bins, 3)?;
        assert_eq!(binned.columns.len(), 2);
        assert_eq!(binned.columns[0].batch.as_ref(), "a");
        assert_eq!(binned.columns[0].bin, 1);

        // (a, 1) = cells 1 and 2; (b, 2) = cells 0 and 3
        assert_abs_diff_eq!(binned.means[(0, 0)], 4.0);
        assert_abs_diff_eq!(binned.means[(1, 0)], 1.0);
        assert_abs_diff_eq!(binned.means[(0, 1)], 0.5);
        assert_abs_diff_eq!(binned.means[(1, 1)], 2.0);
        Ok(())
    }

    #[test]
    fn reshape_places_columns_and_leaves_gaps() {
        let columns = vec![
            BinColumn { batch: "b1".into(), bin: 1 },
            BinColumn { batch: "b1".into(), bin: 3 },
            BinColumn { batch: "b2".into(), bin: 2 },
        ];
        let means = Mat::from_row_slice(2, 3, &[1., 2., 3., 10., 20., 30.]);
        let binned = BinnedExpression {
            means,
            columns,
            genes: names("g", 2),
            n_bins: 3,
        };

        let tensor = reshape_to_3d(&binned, &["b1".into(), "b2".into()], &[0, 1]);
        assert_eq!(tensor.data.shape(), &[2, 3, 2]);
        assert_eq!(tensor.data[[0, 0, 0]], 1.);
        assert_eq!(tensor.data[[0, 2, 1]], 20.);
        assert_eq!(tensor.data[[1, 1, 0]], 3.);
        assert_eq!(tensor.data[[1, 1, 1]], 30.);

        for (b, t) in [(0, 1), (1, 0), (1, 2)] {
            assert!(tensor.data[[b, t, 0]].is_nan());
            assert!(tensor.data[[b, t, 1]].is_nan());
        }
        assert_abs_diff_eq!(tensor.observed_fraction(), 0.5);
    }

    #[test]
    fn gene_and_batch_filters() {
        let mut columns = vec![];
        for bin in 1..=10 {
            columns.push(BinColumn { batch: "full".into(), bin });
        }
        for bin in 1..=5 {
            columns.push(BinColumn { batch: "early".into(), bin });
        }
        for bin in [1, 2, 9] {
            columns.push(BinColumn { batch: "sparse".into(), bin });
        }
        let ncols = columns.len();
        let mut means = Mat::zeros(2, ncols);
        means.row_mut(0).fill(1.);
        means[(1, 0)] = 1.;

        let binned = BinnedExpression {
            means,
            columns,
            genes: names("g", 2),
            n_bins: 10,
        };

        assert_eq!(filter_genes(&binned, 0.1), vec![0]);

        // presence only: full (10) and early (5) exceed 3 bins
        let kept = filter_batches(&binned, 0.3, None);
        assert_eq!(kept, vec!["early".into(), "full".into()] as Vec<Box<str>>);

        // tail: bins > 7 must be more than 0.02 * 10; early has none
        let tail = TailCheck::default();
        let kept = filter_batches(&binned, 0.3, Some(&tail));
        assert_eq!(kept, vec!["full".into()] as Vec<Box<str>>);
    }
}
