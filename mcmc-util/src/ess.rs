use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::f32::consts::PI;

use crate::chain::McmcChain;
use crate::traits::EssParam;

/// One ESS transition (Murray, Adams & MacKay, 2010). Returns
/// `(new_params, new_lnpdf)`, or an error if the bracket has been
/// shrunk `max_shrink` times without finding an acceptable point.
///
/// - `current`: current parameter value f
/// - `prior_sample`: a draw ν from the prior (caller handles scaling)
/// - `lnpdf`: log-likelihood function (just likelihood, not prior)
/// - `cur_lnpdf`: cached log-likelihood at `current`
/// - `max_shrink`: the maximum number of bracket shrinkage steps
/// - `rng`: random number generator
pub fn elliptical_slice_step<P: EssParam>(
    current: &P,
    prior_sample: &P,
    lnpdf: &impl Fn(&P) -> f32,
    cur_lnpdf: f32,
    max_shrink: usize,
    rng: &mut impl Rng,
) -> anyhow::Result<(P, f32)> {
    // 1. log-likelihood threshold
    let u: f32 = rng.random::<f32>().max(f32::MIN_POSITIVE);
    let hh = u.ln() + cur_lnpdf;

    // 2. initial proposal angle and the bracket around it
    let phi: f32 = rng.random_range(0.0..2.0 * PI);
    let mut phi_min = phi - 2.0 * PI;
    let mut phi_max = phi;

    // 3. shrink until we land on the slice
    let mut angle = phi;
    for _ in 0..max_shrink {
        let proposal = current.linear_combine(angle.cos(), prior_sample, angle.sin());
        let new_lnpdf = lnpdf(&proposal);

        if new_lnpdf.is_finite() && new_lnpdf > hh {
            return Ok((proposal, new_lnpdf));
        }

        if angle < 0.0 {
            phi_min = angle;
        } else {
            phi_max = angle;
        }

        if phi_max - phi_min <= f32::EPSILON {
            break;
        }
        angle = rng.random_range(phi_min..phi_max);
    }

    Err(anyhow::anyhow!(
        "elliptical slice bracket collapsed (threshold {})",
        hh
    ))
}

/// ESS chain runner configuration.
#[derive(Debug, Clone)]
pub struct EssSampler {
    pub n_samples: usize,
    pub warmup: usize,
    pub thin: usize,
    pub seed: u64,
    pub max_shrink: usize,
}

impl EssSampler {
    pub fn new(n_samples: usize, warmup: usize) -> Self {
        Self {
            n_samples,
            warmup,
            thin: 1,
            seed: 42,
            max_shrink: 1 << 12,
        }
    }

    /// Run a single ESS chain.
    ///
    /// - `lnpdf`: log-likelihood function
    /// - `prior_draw`: generates a sample from the zero-mean prior
    /// - `init`: initial parameter value
    pub fn run<P: EssParam>(
        &self,
        lnpdf: &impl Fn(&P) -> f32,
        prior_draw: &impl Fn(&mut SmallRng) -> P,
        init: &P,
    ) -> anyhow::Result<McmcChain<P>> {
        let thin = self.thin.max(1);
        let total = self.warmup + self.n_samples * thin;
        let mut rng = SmallRng::seed_from_u64(self.seed);

        let mut current = init.clone();
        let mut cur_lnpdf = lnpdf(&current);
        if !cur_lnpdf.is_finite() {
            anyhow::bail!("log-likelihood is not finite at the initial value");
        }

        let mut samples = Vec::with_capacity(self.n_samples);
        let mut log_likelihoods = Vec::with_capacity(self.n_samples);

        for i in 0..total {
            let nu = prior_draw(&mut rng);
            let (new, new_ll) = elliptical_slice_step(
                &current,
                &nu,
                lnpdf,
                cur_lnpdf,
                self.max_shrink,
                &mut rng,
            )
            .map_err(|e| anyhow::anyhow!("iteration {}: {}", i, e))?;
            current = new;
            cur_lnpdf = new_ll;

            if i >= self.warmup && (i - self.warmup) % thin == 0 {
                samples.push(current.clone());
                log_likelihoods.push(cur_lnpdf);
            }
        }

        log::debug!(
            "ESS chain (seed {}): {} draws after {} warm-up",
            self.seed,
            samples.len(),
            self.warmup
        );

        Ok(McmcChain {
            samples,
            log_likelihoods,
        })
    }

    /// Run multiple independent chains in parallel via rayon.
    /// Each chain gets `seed + chain_idx` for reproducibility.
    pub fn run_parallel<P: EssParam + Send + Sync>(
        &self,
        n_chains: usize,
        lnpdf: &(impl Fn(&P) -> f32 + Sync),
        prior_draw: &(impl Fn(&mut SmallRng) -> P + Sync),
        init: &P,
    ) -> anyhow::Result<Vec<McmcChain<P>>> {
        (0..n_chains)
            .into_par_iter()
            .map(|i| {
                let sampler = EssSampler {
                    seed: self.seed.wrapping_add(i as u64),
                    ..self.clone()
                };
                sampler
                    .run(lnpdf, prior_draw, init)
                    .map_err(|e| anyhow::anyhow!("chain {}: {}", i, e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{mean, variance};
    use crate::diagnostics::ParamSummary;
    use nalgebra::DVector;
    use rand_distr::{Distribution, StandardNormal};

    fn coordinate(chain: &McmcChain<DVector<f32>>, k: usize) -> Vec<f32> {
        chain.samples.iter().map(|s| s[k]).collect()
    }

    fn std_normal(d: usize) -> impl Fn(&mut SmallRng) -> DVector<f32> + Sync {
        move |rng: &mut SmallRng| {
            DVector::from_fn(d, |_, _| {
                let v: f64 = StandardNormal.sample(rng);
                v as f32
            })
        }
    }

    /// Prior: N(0,1), Likelihood: N(y_obs | f, σ²)
    #[test]
    fn conjugate_gaussian_1d() -> anyhow::Result<()> {
        let y_obs = 3.0f32;
        let sigma_sq = 2.0f32;

        let sigma_sq_post = 1.0 / (1.0 + 1.0 / sigma_sq);
        let mu_post = sigma_sq_post * y_obs / sigma_sq;

        let lnpdf = move |f: &DVector<f32>| -> f32 {
            let diff = f[0] - y_obs;
            -0.5 * diff * diff / sigma_sq
        };

        let sampler = EssSampler {
            seed: 123,
            ..EssSampler::new(10_000, 2_000)
        };

        let chain = sampler.run(&lnpdf, &std_normal(1), &DVector::zeros(1))?;
        let draws = coordinate(&chain, 0);
        let (m, v) = (mean(&draws), variance(&draws));

        assert!((m - mu_post).abs() < 0.1, "mean: {}", m);
        assert!((v - sigma_sq_post).abs() < 0.1, "var: {}", v);
        Ok(())
    }

    /// Non-conjugate Poisson regression on a log link, checking the
    /// slope sign and that pooled chains mix
    #[test]
    fn poisson_regression_chains_agree() -> anyhow::Result<()> {
        let x: Vec<f32> = (0..20).map(|i| i as f32 / 10.0 - 1.0).collect();
        let y: Vec<f32> = x.iter().map(|&xi| (1.0 + 1.5 * xi).exp().round()).collect();

        let lnpdf = move |f: &DVector<f32>| -> f32 {
            x.iter()
                .zip(y.iter())
                .map(|(&xi, &yi)| {
                    let eta = f[0] + f[1] * xi;
                    yi * eta - eta.exp()
                })
                .sum()
        };

        let sampler = EssSampler {
            seed: 7,
            ..EssSampler::new(2_000, 1_000)
        };
        let chains = sampler.run_parallel(4, &lnpdf, &std_normal(2), &DVector::zeros(2))?;
        assert_eq!(chains.len(), 4);

        let summary: Vec<ParamSummary> = (0..2)
            .map(|k| {
                let by_chain: Vec<Vec<f32>> = chains.iter().map(|c| coordinate(c, k)).collect();
                ParamSummary::from_draws(&by_chain)
            })
            .collect();
        assert!(summary[1].estimate > 0.5, "slope: {:?}", summary[1]);
        assert!(summary.iter().all(|s| s.rhat < 1.1), "{:?}", summary);
        Ok(())
    }

    #[test]
    fn non_finite_start_is_an_error() {
        let lnpdf = |_: &DVector<f32>| -> f32 { f32::NAN };
        let sampler = EssSampler::new(10, 10);
        assert!(sampler
            .run(&lnpdf, &std_normal(1), &DVector::zeros(1))
            .is_err());
    }

    #[test]
    fn impossible_slice_is_an_error() {
        // finite at the start only
        let lnpdf = |f: &DVector<f32>| -> f32 {
            if f[0] == 0.0 {
                0.0
            } else {
                f32::NEG_INFINITY
            }
        };
        let sampler = EssSampler {
            max_shrink: 64,
            ..EssSampler::new(10, 0)
        };
        assert!(sampler
            .run(&lnpdf, &std_normal(1), &DVector::zeros(1))
            .is_err());
    }
}
