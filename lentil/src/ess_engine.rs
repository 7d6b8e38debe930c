//! Elliptical slice sampling backend of the negative binomial GAM
//!
//! Every prior is a zero-mean Gaussian on an unconstrained vector
//! `u`, which is mapped to the named parameters:
//!
//! ```text
//! b_Intercept          = log(mean(y) + 1) + u[0]
//! bs_sx_1, b_array*    = u[..]
//! sds_sx_1             = |u[sds]|              (half-normal)
//! s_sx_1[r]            = sds_sx_1 * u[z_r]     (z ~ N(0, 1))
//! b_shape_array*       = u[..]
//! ```

use crate::common::*;
use crate::gam_model::*;
use crate::gene_model::GeneDataset;

use mcmc_util::ess::EssSampler;
use rand::rngs::SmallRng;
use rand_distr::{Distribution, StandardNormal};
use special::Gamma as SpecialGamma;

#[derive(Debug, Clone, Default)]
pub struct EssEngine {}

/// Negative binomial log-likelihood with mean `exp(log_mu)` and
/// shape `exp(log_shape)`, without the `lgamma(y + 1)` term
#[inline]
pub fn nb_log_likelihood(y: f64, log_mu: f64, log_shape: f64) -> f64 {
    let shape = log_shape.exp();
    let lse = log_sum_exp(log_mu, log_shape);
    SpecialGamma::ln_gamma(y + shape).0 - SpecialGamma::ln_gamma(shape).0
        + shape * (log_shape - lse)
        + y * (log_mu - lse)
}

#[inline]
fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

struct PreparedData {
    y: Vec<f64>,
    level: Vec<usize>,
    fixed: Vec<f32>,
    random: Vec<Vec<f32>>,
    /// sum of `lgamma(y + 1)`
    log_norm: f64,
}

impl PreparedData {
    fn new(design: &GamDesign, data: &GeneDataset) -> Self {
        let (fixed, random): (Vec<f32>, Vec<Vec<f32>>) =
            data.x.iter().map(|&x| design.spline.design_row(x)).unzip();
        let y: Vec<f64> = data.y.iter().map(|&v| v as f64).collect();
        let log_norm = y.iter().map(|&v| SpecialGamma::ln_gamma(v + 1.).0).sum();
        Self {
            y,
            level: data.level.clone(),
            fixed,
            random,
            log_norm,
        }
    }
}

/// The unconstrained `u` and its map to the named parameters
struct Reparam<'a> {
    design: &'a GamDesign,
    prior_sd: Vec<f32>,
}

impl<'a> Reparam<'a> {
    fn new(design: &'a GamDesign, priors: &ModelPriors) -> Self {
        let mut prior_sd = vec![priors.intercept_sd, priors.coef_sd];
        prior_sd.extend(std::iter::repeat_n(priors.coef_sd, design.n_levels() - 1));
        prior_sd.push(priors.sds_sd);
        prior_sd.extend(std::iter::repeat_n(1., design.n_random()));
        prior_sd.extend(std::iter::repeat_n(priors.shape_sd, design.n_levels()));
        debug_assert_eq!(prior_sd.len(), design.n_params());
        Self { design, prior_sd }
    }

    fn to_named(&self, u: &DVec) -> Vec<f32> {
        let d = self.design;
        let mut theta: Vec<f32> = u.iter().copied().collect();
        theta[0] += d.intercept_center;

        let sds = u[d.sds_index()].abs();
        theta[d.sds_index()] = sds;
        for r in 0..d.n_random() {
            theta[d.random_start() + r] = sds * u[d.random_start() + r];
        }
        theta
    }

    fn draw(&self, rng: &mut SmallRng) -> DVec {
        DVec::from_iterator(
            self.prior_sd.len(),
            self.prior_sd.iter().map(|&sd| {
                let z: f32 = StandardNormal.sample(rng);
                z * sd
            }),
        )
    }
}

impl InferenceEngine for EssEngine {
    fn fit(
        &self,
        spec: &GamSpec,
        data: &GeneDataset,
        priors: &ModelPriors,
        sampling: &SamplingConfig,
    ) -> anyhow::Result<GamPosterior> {
        if sampling.chains == 0 || sampling.iter <= sampling.warmup {
            return Err(LentilError::Configuration(format!(
                "{} chains of {} iterations with {} warm-up",
                sampling.chains, sampling.iter, sampling.warmup
            ))
            .into());
        }

        let design = GamDesign::new(spec, data)?;
        let prepared = PreparedData::new(&design, data);
        let reparam = Reparam::new(&design, priors);

        let lnpdf = |u: &DVec| -> f32 {
            let theta = reparam.to_named(u);
            let mut llik = -prepared.log_norm;
            for i in 0..prepared.y.len() {
                let l = prepared.level[i];
                let log_mu = design.log_mu(&theta, prepared.fixed[i], &prepared.random[i], l);
                let log_shape = design.log_shape(&theta, l);
                llik += nb_log_likelihood(prepared.y[i], log_mu as f64, log_shape as f64);
            }
            llik as f32
        };

        let prior_draw = |rng: &mut SmallRng| reparam.draw(rng);

        let sampler = EssSampler {
            seed: sampling.seed,
            max_shrink: 1_usize << sampling.max_treedepth.min(30),
            ..EssSampler::new(sampling.iter - sampling.warmup, sampling.warmup)
        };

        debug!(
            "ESS: {} chains x {} draws, {} parameters, {} observations",
            sampling.chains,
            sampling.iter - sampling.warmup,
            design.n_params(),
            data.n_obs()
        );

        let init = DVec::zeros(design.n_params());
        let chains = sampler.run_parallel(sampling.chains, &lnpdf, &prior_draw, &init)?;

        let draws_per_chain = chains.iter().map(|c| c.n_samples()).min().unwrap_or(0);
        let n_params = design.n_params();
        let mut draws = Mat::zeros(chains.len() * draws_per_chain, n_params);

        for (c, chain) in chains.iter().enumerate() {
            for (s, u) in chain.samples.iter().take(draws_per_chain).enumerate() {
                let theta = reparam.to_named(u);
                for (k, &v) in theta.iter().enumerate() {
                    draws[(c * draws_per_chain + s, k)] = v;
                }
            }
        }

        if draws.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("non-finite posterior draws");
        }

        Ok(GamPosterior {
            formula: spec.formula(),
            param_names: design.param_names(),
            n_chains: chains.len(),
            draws_per_chain,
            draws,
            design,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_distr::{Gamma, Poisson};

    #[test]
    fn nb_reduces_to_geometric() {
        // shape = 1: P(y) = p (1 - p)^y with p = 1 / (1 + mu)
        let mu: f64 = 3.0;
        for y in 0..5 {
            let p: f64 = 1. / (1. + mu);
            let expected = p.ln() + y as f64 * (1. - p).ln();
            let ll = nb_log_likelihood(y as f64, mu.ln(), 0.0)
                - SpecialGamma::ln_gamma(y as f64 + 1.).0;
            assert_abs_diff_eq!(ll, expected, epsilon = 1e-9);
        }
    }

    fn simulate_two_batches(n_bins: usize, shapes: [f32; 2]) -> GeneDataset {
        let mut rng = SmallRng::seed_from_u64(17);
        let mut ret = GeneDataset {
            x: vec![],
            y: vec![],
            level: vec![],
            levels: vec!["calm".into(), "noisy".into()],
        };
        for (l, &shape) in shapes.iter().enumerate() {
            for t in 1..=n_bins {
                let mu = 20. + 10. * (t as f32 / n_bins as f32 * 3.).sin();
                let lambda = Gamma::new(shape, mu / shape)
                    .map(|g| g.sample(&mut rng))
                    .unwrap_or(mu);
                let y = Poisson::new(lambda.max(1e-3))
                    .map(|p| p.sample(&mut rng))
                    .unwrap_or(0.);
                ret.x.push(t as f32);
                ret.y.push(y);
                ret.level.push(l);
            }
        }
        ret
    }

    #[test]
    fn shape_separates_noisy_batch() -> anyhow::Result<()> {
        let data = simulate_two_batches(60, [50.0, 1.0]);
        let sampling = SamplingConfig {
            chains: 2,
            iter: 600,
            warmup: 300,
            ..SamplingConfig::default()
        };
        let post = EssEngine::default().fit(
            &GamSpec { n_knots: 5 },
            &data,
            &ModelPriors::default(),
            &sampling,
        )?;

        assert_eq!(post.n_chains, 2);
        assert_eq!(post.n_draws(), 600);
        assert_eq!(post.param_names.len(), post.draws.ncols());

        let calm = post.summary("b_shape_arraycalm").expect("calm");
        let noisy = post.summary("b_shape_arraynoisy").expect("noisy");
        assert!(calm.estimate > noisy.estimate, "{:?} vs {:?}", calm, noisy);

        let sds = post.param_index("sds_sx_1").expect("sds");
        assert!(post.draws.column(sds).iter().all(|&v| v >= 0.));

        let mu = post.predict_mu(&[1., 30., 60.], "calm", Some(50))?;
        assert_eq!(mu.nrows(), 50);
        assert!(mu.iter().all(|v| v.is_finite() && *v > 0.));
        Ok(())
    }

    #[test]
    fn zero_chains_is_a_configuration_error() {
        let data = simulate_two_batches(10, [5.0, 5.0]);
        let sampling = SamplingConfig {
            chains: 0,
            ..SamplingConfig::default()
        };
        let res = EssEngine::default().fit(
            &GamSpec { n_knots: 5 },
            &data,
            &ModelPriors::default(),
            &sampling,
        );
        assert!(res.is_err());
    }
}
