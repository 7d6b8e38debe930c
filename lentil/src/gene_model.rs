use crate::common::*;
use crate::gam_model::*;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Settings of one gene's model fit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitConfig {
    /// number of knots (basis functions) of the smooth
    pub n_knots: usize,
    /// iterations per chain; the first half is warm-up
    pub n_samples: usize,
    pub chains: usize,
    pub adapt_delta: f32,
    pub max_treedepth: usize,
    /// a gene fails when the largest split R-hat exceeds this
    pub max_rhat: f32,
    /// keep genes above `max_rhat` with a warning instead
    #[serde(default)]
    pub allow_poor_mixing: bool,
    pub seed: u64,
    pub priors: ModelPriors,
}

impl Default for FitConfig {
    fn default() -> Self {
        let sampling = SamplingConfig::default();
        Self {
            n_knots: 5,
            n_samples: 2000,
            chains: sampling.chains,
            adapt_delta: sampling.adapt_delta,
            max_treedepth: sampling.max_treedepth,
            max_rhat: sampling.max_rhat,
            allow_poor_mixing: false,
            seed: sampling.seed,
            priors: ModelPriors::default(),
        }
    }
}

impl FitConfig {
    pub fn gam_spec(&self) -> GamSpec {
        GamSpec {
            n_knots: self.n_knots,
        }
    }

    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            chains: self.chains,
            iter: self.n_samples,
            warmup: self.n_samples / 2,
            adapt_delta: self.adapt_delta,
            max_treedepth: self.max_treedepth,
            seed: self.seed,
            max_rhat: self.max_rhat,
        }
    }
}

/// Flattened `(x, y, array)` records of one gene
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneDataset {
    /// 1-based pseudotime bin
    pub x: Vec<f32>,
    /// rounded mean expression
    pub y: Vec<f32>,
    /// index into `levels`
    pub level: Vec<usize>,
    /// batch labels with at least one record, in tensor order
    pub levels: Vec<Box<str>>,
}

impl GeneDataset {
    /// Flatten a `[batch, time]` slice, dropping `NaN` cells
    ///
    /// * `slice` - one gene of the expression tensor
    /// * `batches` - labels of the slice rows
    pub fn from_slice(slice: ArrayView2<f32>, batches: &[Box<str>]) -> Result<Self> {
        if slice.nrows() != batches.len() {
            return Err(LentilError::DataShape(format!(
                "{} batch labels for {} rows",
                batches.len(),
                slice.nrows()
            )));
        }

        let mut ret = GeneDataset {
            x: vec![],
            y: vec![],
            level: vec![],
            levels: vec![],
        };

        for (b, row) in slice.outer_iter().enumerate() {
            let mut seen = false;
            for (t, &v) in row.iter().enumerate() {
                if v.is_nan() {
                    continue;
                }
                if !seen {
                    ret.levels.push(batches[b].clone());
                    seen = true;
                }
                ret.x.push((t + 1) as f32);
                ret.y.push(v.round());
                ret.level.push(ret.levels.len() - 1);
            }
        }
        Ok(ret)
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn array(&self, i: usize) -> &str {
        &self.levels[self.level[i]]
    }
}

/// One batch's row of the `array_weights` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayWeight {
    pub array: Box<str>,
    pub estimate: f32,
    pub est_error: f32,
    pub q2_5: f32,
    pub q97_5: f32,
    pub shape: f32,
    pub weight: f32,
    pub weight_norm: f32,
    pub rhat: f32,
}

/// Per-batch reliability weights derived from the shape posterior
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArrayWeights {
    pub rows: Vec<ArrayWeight>,
}

impl ArrayWeights {
    pub fn arrays(&self) -> Vec<Box<str>> {
        self.rows.iter().map(|r| r.array.clone()).collect()
    }

    /// A numeric column by its persisted name
    pub fn column(&self, name: &str) -> Option<Vec<f32>> {
        let get: fn(&ArrayWeight) -> f32 = match name {
            "Estimate" => |r: &ArrayWeight| r.estimate,
            "Est.Error" => |r: &ArrayWeight| r.est_error,
            "Q2.5" => |r: &ArrayWeight| r.q2_5,
            "Q97.5" => |r: &ArrayWeight| r.q97_5,
            "shape" => |r: &ArrayWeight| r.shape,
            "weight" => |r: &ArrayWeight| r.weight,
            "weight_norm" => |r: &ArrayWeight| r.weight_norm,
            _ => return None,
        };
        Some(self.rows.iter().map(get).collect())
    }

    pub fn get(&self, array: &str) -> Option<&ArrayWeight> {
        self.rows.iter().find(|r| r.array.as_ref() == array)
    }
}

/// Observed per-batch statistics of the regression data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDiagnostic {
    pub array: Box<str>,
    pub mean: f32,
    pub variance: f32,
    /// variance / mean
    pub overdispersion: f32,
    pub n_obs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneModelResult {
    pub gene: Box<str>,
    pub posterior: GamPosterior,
    pub array_weights: ArrayWeights,
    pub diagnostics: Vec<BatchDiagnostic>,
    pub dataset: GeneDataset,
}

impl GeneModelResult {
    /// weights and observed diagnostics matched by batch label
    pub fn joined_by_array(&self) -> Vec<(&ArrayWeight, Option<&BatchDiagnostic>)> {
        let diag: HashMap<&str, &BatchDiagnostic> = self
            .diagnostics
            .iter()
            .map(|d| (d.array.as_ref(), d))
            .collect();

        self.array_weights
            .rows
            .iter()
            .map(|w| (w, diag.get(w.array.as_ref()).copied()))
            .collect()
    }
}

/// Fit the negative binomial GAM of one gene
///
/// * `gene` - gene name, carried into errors
/// * `slice` - `[batch, time]` expression of this gene
/// * `batches` - row labels of `slice`
/// * `engine` - inference backend
/// * `config` - model and sampling settings
pub fn fit_gene_model<E>(
    gene: &str,
    slice: ArrayView2<f32>,
    batches: &[Box<str>],
    engine: &E,
    config: &FitConfig,
) -> Result<GeneModelResult>
where
    E: InferenceEngine + ?Sized,
{
    let dataset = GeneDataset::from_slice(slice, batches)?;

    if dataset.n_obs() == 0 {
        return Err(LentilError::model_fit(gene, "no observed time bin"));
    }

    if let Some(y) = dataset.y.iter().find(|&&y| y < 0.) {
        return Err(LentilError::model_fit(
            gene,
            format!("negative count {} for a negative binomial model", y),
        ));
    }

    let sampling = config.sampling();
    let posterior = engine
        .fit(&config.gam_spec(), &dataset, &config.priors, &sampling)
        .map_err(|e| LentilError::model_fit(gene, e))?;

    let array_weights =
        compute_array_weights(&posterior, &dataset.levels).map_err(|e| match e {
            LentilError::DataShape(reason) => LentilError::model_fit(gene, reason),
            e => e,
        })?;

    let rhat = posterior.max_rhat();
    if rhat > sampling.max_rhat {
        if !config.allow_poor_mixing {
            return Err(LentilError::model_fit(
                gene,
                format!("max R-hat {:.3} > {}", rhat, sampling.max_rhat),
            ));
        }
        warn!(
            "{}: chains may not have mixed, max R-hat = {:.3} > {}",
            gene, rhat, sampling.max_rhat
        );
    }

    let diagnostics = compute_diagnostics(&dataset);

    Ok(GeneModelResult {
        gene: gene.into(),
        posterior,
        array_weights,
        diagnostics,
        dataset,
    })
}

/// Summaries of `b_shape_array<label>` turned into reliability weights
///
/// ```text
/// shape       = exp(Estimate)
/// weight      = shape
/// weight_norm = weight / max(weight)
/// ```
pub fn compute_array_weights(
    posterior: &GamPosterior,
    levels: &[Box<str>],
) -> Result<ArrayWeights> {
    let mut rows = Vec::with_capacity(levels.len());

    for lvl in levels {
        let name = shape_param_name(lvl);
        let s = posterior
            .summary(&name)
            .ok_or(LentilError::DataShape(format!("no posterior for {}", name)))?;

        if !s.is_finite() {
            return Err(LentilError::DataShape(format!(
                "non-finite posterior summary of {}",
                name
            )));
        }

        let shape = s.estimate.exp();
        rows.push(ArrayWeight {
            array: lvl.clone(),
            estimate: s.estimate,
            est_error: s.est_error,
            q2_5: s.q2_5,
            q97_5: s.q97_5,
            shape,
            weight: shape,
            weight_norm: f32::NAN,
            rhat: s.rhat,
        });
    }

    let max_weight = rows.iter().map(|r| r.weight).fold(f32::NAN, f32::max);
    for r in rows.iter_mut() {
        r.weight_norm = r.weight / max_weight;
    }

    Ok(ArrayWeights { rows })
}

/// Mean, sample variance and variance/mean ratio of `y` per batch
pub fn compute_diagnostics(dataset: &GeneDataset) -> Vec<BatchDiagnostic> {
    dataset
        .levels
        .iter()
        .enumerate()
        .map(|(l, array)| {
            let y: Vec<f32> = dataset
                .y
                .iter()
                .zip(dataset.level.iter())
                .filter_map(|(&y, &k)| (k == l).then_some(y))
                .collect();

            let stat = matrix_util::dmatrix_stat::FiniteStat::from_values(y.iter().copied());
            let mean = stat.mean();
            let variance = stat.variance();
            BatchDiagnostic {
                array: array.clone(),
                mean,
                variance,
                overdispersion: variance / mean,
                n_obs: y.len(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn labels(xs: &[&str]) -> Vec<Box<str>> {
        xs.iter().map(|&x| x.into()).collect()
    }

    #[test]
    fn dataset_drops_missing_and_rounds() -> Result<()> {
        let slice = array![
            [1.4, f32::NAN, 3.6],
            [f32::NAN, f32::NAN, f32::NAN],
            [0.2, 2.5, f32::NAN]
        ];
        let data = GeneDataset::from_slice(slice.view(), &labels(&["a", "b", "c"]))?;

        assert_eq!(data.levels, labels(&["a", "c"]));
        assert_eq!(data.x, vec![1., 3., 1., 2.]);
        assert_eq!(data.y, vec![1., 4., 0., 3.]);
        assert_eq!(data.array(3), "c");
        Ok(())
    }

    #[test]
    fn diagnostics_by_batch() -> Result<()> {
        let slice = array![[1., 2., 3.], [4., 4., f32::NAN]];
        let data = GeneDataset::from_slice(slice.view(), &labels(&["a", "b"]))?;
        let diag = compute_diagnostics(&data);

        assert_eq!(diag.len(), 2);
        assert_abs_diff_eq!(diag[0].mean, 2.0);
        assert_abs_diff_eq!(diag[0].variance, 1.0);
        assert_abs_diff_eq!(diag[0].overdispersion, 0.5);
        assert_eq!(diag[1].n_obs, 2);
        assert_abs_diff_eq!(diag[1].variance, 0.0);
        Ok(())
    }

    struct FailingEngine;

    impl InferenceEngine for FailingEngine {
        fn fit(
            &self,
            _: &GamSpec,
            _: &GeneDataset,
            _: &ModelPriors,
            _: &SamplingConfig,
        ) -> anyhow::Result<GamPosterior> {
            anyhow::bail!("divergent transitions")
        }
    }

    #[test]
    fn engine_failure_names_the_gene() {
        let slice = array![[1., 2., 3., 4., 5., 6.]];
        let res = fit_gene_model(
            "Sox2",
            slice.view(),
            &labels(&["a"]),
            &FailingEngine,
            &FitConfig::default(),
        );
        match res {
            Err(LentilError::ModelFit { gene, reason }) => {
                assert_eq!(gene.as_ref(), "Sox2");
                assert!(reason.contains("divergent"));
            }
            _ => panic!("expected a model fit error"),
        }
    }

    /// chain `c` wanders around `10 c`
    struct SplitChainsEngine;

    impl InferenceEngine for SplitChainsEngine {
        fn fit(
            &self,
            spec: &GamSpec,
            data: &GeneDataset,
            _: &ModelPriors,
            sampling: &SamplingConfig,
        ) -> anyhow::Result<GamPosterior> {
            let design = GamDesign::new(spec, data)?;
            let draws_per_chain = 50;
            let n = sampling.chains * draws_per_chain;
            let draws = Mat::from_fn(n, design.n_params(), |i, _| {
                10. * (i / draws_per_chain) as f32 + 0.01 * (i % 5) as f32
            });
            Ok(GamPosterior {
                formula: spec.formula(),
                param_names: design.param_names(),
                n_chains: sampling.chains,
                draws_per_chain,
                draws,
                design,
            })
        }
    }

    #[test]
    fn unmixed_chains_fail_the_gene() -> Result<()> {
        let slice = array![[1., 2., 3., 4., 5., 6.], [2., 3., 4., 5., 6., 7.]];
        let batches = labels(&["a", "b"]);

        let strict = FitConfig::default();
        let res = fit_gene_model(
            "Nanog",
            slice.view(),
            &batches,
            &SplitChainsEngine,
            &strict,
        );
        match res {
            Err(LentilError::ModelFit { gene, reason }) => {
                assert_eq!(gene.as_ref(), "Nanog");
                assert!(reason.contains("R-hat"), "{}", reason);
            }
            _ => panic!("expected a model fit error"),
        }

        let lenient = FitConfig {
            allow_poor_mixing: true,
            ..FitConfig::default()
        };
        let result = fit_gene_model(
            "Nanog",
            slice.view(),
            &batches,
            &SplitChainsEngine,
            &lenient,
        )?;
        assert!(result.posterior.max_rhat() > lenient.max_rhat);
        assert_eq!(result.array_weights.rows.len(), 2);
        Ok(())
    }

    #[test]
    fn negative_counts_are_rejected() {
        let slice = array![[1., -2., 3., 4., 5., 6.]];
        let res = fit_gene_model(
            "g",
            slice.view(),
            &labels(&["a"]),
            &FailingEngine,
            &FitConfig::default(),
        );
        assert!(matches!(res, Err(LentilError::ModelFit { .. })));
    }

    #[test]
    fn sampling_uses_half_for_warmup() {
        let config = FitConfig {
            n_samples: 300,
            ..FitConfig::default()
        };
        let s = config.sampling();
        assert_eq!(s.iter, 300);
        assert_eq!(s.warmup, 150);
        assert_eq!(s.chains, 4);
    }
}
