use crate::common::*;
use crate::gam_spline::CubicRegressionSpline;
use crate::gene_model::GeneDataset;

use mcmc_util::diagnostics::ParamSummary;
use serde::{Deserialize, Serialize};

/// Negative binomial GAM with batch-specific dispersion
///
/// ```text
/// y ~ NegBinomial(mu, shape)
/// log(mu)    = Intercept + s(x, bs = "cr", k = n_knots) + array
/// log(shape) = 0 + array
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamSpec {
    pub n_knots: usize,
}

impl GamSpec {
    pub fn formula(&self) -> String {
        format!(
            "y ~ s(x, bs = \"cr\", k = {}) + array; shape ~ 0 + array",
            self.n_knots
        )
    }
}

/// Standard deviations of zero-mean Gaussian priors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPriors {
    /// Intercept, centered at `log(mean(y) + 1)`
    pub intercept_sd: f32,
    /// smooth's linear term and batch offsets of the mean
    pub coef_sd: f32,
    /// per-batch log shape
    pub shape_sd: f32,
    /// half-normal scale of the smooth's wiggliness (`sds`)
    pub sds_sd: f32,
}

impl Default for ModelPriors {
    fn default() -> Self {
        Self {
            intercept_sd: 2.5,
            coef_sd: 5.0,
            shape_sd: 2.5,
            sds_sd: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub chains: usize,
    /// iterations per chain, warm-up included
    pub iter: usize,
    pub warmup: usize,
    /// target acceptance rate for gradient-based engines
    pub adapt_delta: f32,
    /// bounds the work per transition: `2^max_treedepth` steps
    pub max_treedepth: usize,
    pub seed: u64,
    /// split R-hat above this means the chains did not mix
    pub max_rhat: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            iter: 2000,
            warmup: 1000,
            adapt_delta: 0.95,
            max_treedepth: 12,
            seed: 42,
            max_rhat: 1.1,
        }
    }
}

/// A Bayesian inference backend for the GAM
pub trait InferenceEngine: Sync {
    fn fit(
        &self,
        spec: &GamSpec,
        data: &GeneDataset,
        priors: &ModelPriors,
        sampling: &SamplingConfig,
    ) -> anyhow::Result<GamPosterior>;
}

/// Layout of the named parameters and the design of the smooth
///
/// ```text
/// b_Intercept, bs_sx_1, b_array<l2..lL>, sds_sx_1, s_sx_1[1..k-2], b_shape_array<l1..lL>
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamDesign {
    pub spline: CubicRegressionSpline,
    pub levels: Vec<Box<str>>,
    pub intercept_center: f32,
}

impl GamDesign {
    pub fn new(spec: &GamSpec, data: &GeneDataset) -> Result<Self> {
        if data.n_obs() == 0 {
            return Err(LentilError::DataShape("no observation to fit".into()));
        }
        let spline = CubicRegressionSpline::new(&data.x, spec.n_knots)?;
        let ybar = data.y.iter().sum::<f32>() / data.n_obs() as f32;
        Ok(Self {
            spline,
            levels: data.levels.clone(),
            intercept_center: (ybar + 1.).ln(),
        })
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn n_random(&self) -> usize {
        self.spline.n_random()
    }

    pub fn n_params(&self) -> usize {
        2 + (self.n_levels() - 1) + 1 + self.n_random() + self.n_levels()
    }

    fn offset_start(&self) -> usize {
        2
    }

    pub fn sds_index(&self) -> usize {
        self.offset_start() + self.n_levels() - 1
    }

    pub fn random_start(&self) -> usize {
        self.sds_index() + 1
    }

    pub fn shape_start(&self) -> usize {
        self.random_start() + self.n_random()
    }

    pub fn param_names(&self) -> Vec<Box<str>> {
        let mut names: Vec<Box<str>> = vec!["b_Intercept".into(), "bs_sx_1".into()];
        for l in self.levels.iter().skip(1) {
            names.push(format!("b_array{}", l).into());
        }
        names.push("sds_sx_1".into());
        for r in 1..=self.n_random() {
            names.push(format!("s_sx_1[{}]", r).into());
        }
        for l in self.levels.iter() {
            names.push(shape_param_name(l).into());
        }
        names
    }

    /// `log(mu)` for a design row `(fixed, random)` in batch `level`
    pub fn log_mu(&self, theta: &[f32], fixed: f32, random: &[f32], level: usize) -> f32 {
        let mut eta = theta[0] + theta[1] * fixed;
        if level > 0 {
            eta += theta[self.offset_start() + level - 1];
        }
        let rs = self.random_start();
        for (r, &z) in random.iter().enumerate() {
            eta += theta[rs + r] * z;
        }
        eta
    }

    pub fn log_shape(&self, theta: &[f32], level: usize) -> f32 {
        theta[self.shape_start() + level]
    }
}

pub fn shape_param_name(level: &str) -> String {
    format!("b_shape_array{}", level)
}

/// Posterior draws of the named parameters
///
/// `draws` holds one row per draw, chains stacked one after another,
/// each with `draws_per_chain` rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamPosterior {
    pub formula: String,
    pub param_names: Vec<Box<str>>,
    pub n_chains: usize,
    pub draws_per_chain: usize,
    pub draws: Mat,
    pub design: GamDesign,
}

impl GamPosterior {
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.param_names.iter().position(|p| p.as_ref() == name)
    }

    pub fn n_draws(&self) -> usize {
        self.draws.nrows()
    }

    fn draws_by_chain(&self, k: usize) -> Vec<Vec<f32>> {
        let col = self.draws.column(k);
        (0..self.n_chains)
            .map(|c| {
                let lb = c * self.draws_per_chain;
                let ub = (lb + self.draws_per_chain).min(col.len());
                col.rows(lb, ub - lb).iter().copied().collect()
            })
            .collect()
    }

    /// mean, sd, 2.5% and 97.5% quantiles and split R-hat of a
    /// parameter
    pub fn summary(&self, name: &str) -> Option<ParamSummary> {
        let k = self.param_index(name)?;
        Some(ParamSummary::from_draws(&self.draws_by_chain(k)))
    }

    /// the largest split R-hat over all parameters
    pub fn max_rhat(&self) -> f32 {
        (0..self.param_names.len())
            .map(|k| mcmc_util::diagnostics::split_rhat(&self.draws_by_chain(k)))
            .filter(|r| r.is_finite())
            .fold(f32::NAN, f32::max)
    }

    /// Posterior draws of the expected count `mu` at covariate values
    /// `x` in one batch (draw x point). With `max_draws`, draws are
    /// thinned evenly.
    pub fn predict_mu(&self, x: &[f32], batch: &str, max_draws: Option<usize>) -> Result<Mat> {
        let level = self
            .design
            .levels
            .iter()
            .position(|l| l.as_ref() == batch)
            .ok_or(LentilError::DataShape(format!("unknown batch {}", batch)))?;

        let n = self.n_draws();
        let take = max_draws.unwrap_or(n).clamp(1, n.max(1));
        let step = (n / take).max(1);
        let rows: Vec<usize> = (0..n).step_by(step).take(take).collect();

        let design_rows: Vec<(f32, Vec<f32>)> =
            x.iter().map(|&v| self.design.spline.design_row(v)).collect();

        let mut ret = Mat::zeros(rows.len(), x.len());
        for (i, &d) in rows.iter().enumerate() {
            let theta: Vec<f32> = self.draws.row(d).iter().copied().collect();
            for (j, (fixed, random)) in design_rows.iter().enumerate() {
                ret[(i, j)] = self.design.log_mu(&theta, *fixed, random, level).exp();
            }
        }
        Ok(ret)
    }
}
