use crate::common::*;
use crate::metric_extract::{extract_metric_matrix, MetricMatrix};
use crate::metric_store::MetricStore;

use matrix_util::dmatrix_stat::{finite_column_stat, minmax_scale};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const MIN_ABS_MEAN: f32 = 1e-8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConservationConfig {
    pub mean_weight: f32,
    pub variability_weight: f32,
    pub conservation_threshold: f32,
    /// min-max scale the mean, the variability and the score
    pub normalize_scores: bool,
}

impl Default for ConservationConfig {
    fn default() -> Self {
        Self {
            mean_weight: 0.5,
            variability_weight: 0.5,
            conservation_threshold: 0.6,
            normalize_scores: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConservationRecord {
    pub gene: Box<str>,
    pub mean_estimate: f32,
    pub sd_estimate: f32,
    pub cv_estimate: f32,
    pub range_estimate: f32,
    pub mean_norm: f32,
    pub cv_norm: f32,
    pub conservation_score: f32,
    pub is_conserved: bool,
}

impl ConservationRecord {
    pub const HEADER: [&'static str; 9] = [
        "gene",
        "mean_estimate",
        "sd_estimate",
        "cv_estimate",
        "range_estimate",
        "mean_norm",
        "cv_norm",
        "conservation_score",
        "is_conserved",
    ];

    pub fn to_row(&self) -> Vec<Box<str>> {
        let mut ret: Vec<Box<str>> = vec![self.gene.clone()];
        for v in [
            self.mean_estimate,
            self.sd_estimate,
            self.cv_estimate,
            self.range_estimate,
            self.mean_norm,
            self.cv_norm,
            self.conservation_score,
        ] {
            ret.push(format!("{}", v).into());
        }
        ret.push(if self.is_conserved { "TRUE" } else { "FALSE" }.into());
        ret
    }
}

/// higher first; `NaN` last
fn by_score_desc(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// Score how consistently high a metric is across batches
///
/// ```text
/// cv    = sd / mean
/// score = mean_weight * mean_norm + variability_weight * cv_norm
/// ```
///
/// With normalization, `mean_norm = minmax(mean)`, `cv_norm = 1 -
/// minmax(cv)` and the score itself is min-max scaled again;
/// otherwise `mean_norm = mean` and `cv_norm = 1 / cv`.
pub fn calculate_conservation(
    matrix: &MetricMatrix,
    config: &ConservationConfig,
) -> Vec<ConservationRecord> {
    let stats = finite_column_stat(&matrix.values);

    let means: Vec<f32> = stats.iter().map(|s| s.mean()).collect();
    let sds: Vec<f32> = stats.iter().map(|s| s.sd()).collect();
    let ranges: Vec<f32> = stats.iter().map(|s| s.range()).collect();

    let cvs: Vec<f32> = means
        .iter()
        .zip(sds.iter())
        .zip(matrix.genes.iter())
        .map(|((&mu, &sd), gene)| {
            if mu.abs() < MIN_ABS_MEAN {
                warn!("{}: mean {} is too close to zero for a CV", gene, mu);
                f32::NAN
            } else {
                sd / mu
            }
        })
        .collect();

    let (mean_norm, cv_norm) = if config.normalize_scores {
        let cv_scaled = minmax_scale(&cvs);
        (
            minmax_scale(&means),
            cv_scaled.iter().map(|&c| 1. - c).collect::<Vec<_>>(),
        )
    } else {
        let inv = cvs
            .iter()
            .map(|&c| if c.is_finite() && c != 0. { 1. / c } else { f32::NAN })
            .collect::<Vec<_>>();
        (means.clone(), inv)
    };

    let raw_score: Vec<f32> = mean_norm
        .iter()
        .zip(cv_norm.iter())
        .map(|(&m, &c)| config.mean_weight * m + config.variability_weight * c)
        .collect();

    let score = if config.normalize_scores {
        minmax_scale(&raw_score)
    } else {
        raw_score
    };

    let mut ret: Vec<ConservationRecord> = (0..matrix.n_genes())
        .map(|j| ConservationRecord {
            gene: matrix.genes[j].clone(),
            mean_estimate: means[j],
            sd_estimate: sds[j],
            cv_estimate: cvs[j],
            range_estimate: ranges[j],
            mean_norm: mean_norm[j],
            cv_norm: cv_norm[j],
            conservation_score: score[j],
            is_conserved: score[j] >= config.conservation_threshold,
        })
        .collect();

    ret.sort_by(|a, b| by_score_desc(a.conservation_score, b.conservation_score));
    ret
}

/// Extract `metric` from the store, then score
pub fn calculate_conservation_from_store<S: MetricStore + ?Sized>(
    store: &S,
    metric: &str,
    config: &ConservationConfig,
) -> Result<Vec<ConservationRecord>> {
    let matrix = extract_metric_matrix(store, metric)?;
    let ret = calculate_conservation(&matrix, config);
    info!(
        "{} of {} genes conserved on {}",
        ret.iter().filter(|r| r.is_conserved).count(),
        ret.len(),
        metric
    );
    Ok(ret)
}
