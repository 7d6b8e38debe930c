use crate::traits::EssParam;

/// Collected MCMC samples with log-likelihoods.
#[derive(Clone)]
pub struct McmcChain<P: EssParam> {
    pub samples: Vec<P>,
    pub log_likelihoods: Vec<f32>,
}

impl<P: EssParam> McmcChain<P> {
    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }
}

pub(crate) fn mean(xx: &[f32]) -> f32 {
    if xx.is_empty() {
        return f32::NAN;
    }
    (xx.iter().map(|&x| x as f64).sum::<f64>() / xx.len() as f64) as f32
}

pub(crate) fn variance(xx: &[f32]) -> f32 {
    let n = xx.len();
    if n < 2 {
        return f32::NAN;
    }
    let mu = mean(xx) as f64;
    let ss: f64 = xx.iter().map(|&x| (x as f64 - mu).powi(2)).sum();
    (ss / (n - 1) as f64) as f32
}

/// Linear interpolation between order statistics
pub fn quantile_inplace(vals: &mut [f32], q: f32) -> f32 {
    let n = vals.len();
    if n == 0 {
        return f32::NAN;
    }
    vals.sort_unstable_by(|a, b| a.total_cmp(b));
    let idx = (q * (n - 1) as f32).clamp(0.0, (n - 1) as f32);
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        vals[lo]
    } else {
        let frac = idx - lo as f32;
        vals[lo] * (1.0 - frac) + vals[hi] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn quantiles_interpolate_order_statistics() {
        let mut v = vec![3.0, 1.0, 2.0];
        assert_abs_diff_eq!(quantile_inplace(&mut v, 0.25), 1.5);
        assert_abs_diff_eq!(quantile_inplace(&mut v, 1.0), 3.0);
        assert!(quantile_inplace(&mut [], 0.5).is_nan());
    }

    #[test]
    fn sample_moments() {
        let xx = [10.0, 20.0, 30.0];
        assert_abs_diff_eq!(mean(&xx), 20.0);
        assert_abs_diff_eq!(variance(&xx), 100.0);
        assert!(variance(&[1.0]).is_nan());
    }
}
