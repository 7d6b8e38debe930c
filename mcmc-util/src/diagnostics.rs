use crate::chain::{mean, quantile_inplace, variance};

/// Posterior summary of one scalar parameter pooled over chains
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSummary {
    pub estimate: f32,
    pub est_error: f32,
    pub q2_5: f32,
    pub q97_5: f32,
    pub rhat: f32,
}

impl ParamSummary {
    pub fn from_draws(draws_by_chain: &[Vec<f32>]) -> Self {
        let mut pooled: Vec<f32> = draws_by_chain.iter().flatten().copied().collect();
        let estimate = mean(&pooled);
        let est_error = variance(&pooled).sqrt();
        let q2_5 = quantile_inplace(&mut pooled, 0.025);
        let q97_5 = quantile_inplace(&mut pooled, 0.975);
        Self {
            estimate,
            est_error,
            q2_5,
            q97_5,
            rhat: split_rhat(draws_by_chain),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.estimate.is_finite()
            && self.est_error.is_finite()
            && self.q2_5.is_finite()
            && self.q97_5.is_finite()
    }
}

/// Potential scale reduction factor on split chains (Gelman et al.).
/// Each chain is cut into two halves so that within-chain drift also
/// inflates the statistic. Returns `NaN` if fewer than two halves
/// with two draws each are available.
pub fn split_rhat(draws_by_chain: &[Vec<f32>]) -> f32 {
    let halves: Vec<&[f32]> = draws_by_chain
        .iter()
        .flat_map(|d| {
            let h = d.len() / 2;
            [&d[..h], &d[(d.len() - h)..]]
        })
        .filter(|h| h.len() >= 2)
        .collect();

    let m = halves.len();
    if m < 2 {
        return f32::NAN;
    }
    let n = halves.iter().map(|h| h.len()).min().unwrap_or(0) as f64;

    let means: Vec<f64> = halves.iter().map(|h| mean(h) as f64).collect();
    let grand = means.iter().sum::<f64>() / m as f64;
    let between = n / (m as f64 - 1.) * means.iter().map(|x| (x - grand).powi(2)).sum::<f64>();
    let within = halves.iter().map(|h| variance(h) as f64).sum::<f64>() / m as f64;

    if within <= 0. {
        return if between <= 0. { 1.0 } else { f32::INFINITY };
    }

    let var_plus = (n - 1.) / n * within + between / n;
    (var_plus / within).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rhat_near_one_for_identical_chains() {
        let draws: Vec<f32> = (0..200).map(|i| ((i * 37) % 101) as f32).collect();
        let rhat = split_rhat(&[draws.clone(), draws.clone(), draws]);
        assert!(rhat < 1.05, "rhat = {}", rhat);
    }

    #[test]
    fn rhat_large_for_separated_chains() {
        let a: Vec<f32> = (0..100).map(|i| (i % 7) as f32 * 0.1).collect();
        let b: Vec<f32> = a.iter().map(|x| x + 50.0).collect();
        assert!(split_rhat(&[a, b]) > 2.0);
    }

    #[test]
    fn summary_of_pooled_draws() {
        let draws: Vec<f32> = (0..=100).map(|i| i as f32).collect();
        let s = ParamSummary::from_draws(&[draws]);
        assert_abs_diff_eq!(s.estimate, 50.0);
        assert_abs_diff_eq!(s.q2_5, 2.5);
        assert_abs_diff_eq!(s.q97_5, 97.5);
        assert!(s.is_finite());
    }
}
