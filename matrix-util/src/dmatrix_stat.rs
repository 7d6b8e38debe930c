use nalgebra::DMatrix;

/// Sufficient statistics of finite values, skipping `NaN` and
/// infinite entries
#[derive(Debug, Clone, Copy)]
pub struct FiniteStat {
    n: usize,
    s1: f64,
    s2: f64,
    min: f64,
    max: f64,
}

impl FiniteStat {
    pub fn new() -> Self {
        Self {
            n: 0,
            s1: 0.,
            s2: 0.,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn add(&mut self, x: f32) {
        if x.is_finite() {
            let x = x as f64;
            self.n += 1;
            self.s1 += x;
            self.s2 += x * x;
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
    }

    pub fn from_values<I: IntoIterator<Item = f32>>(xx: I) -> Self {
        let mut ret = Self::new();
        for x in xx {
            ret.add(x);
        }
        ret
    }

    /// number of finite values
    pub fn count(&self) -> usize {
        self.n
    }

    pub fn mean(&self) -> f32 {
        if self.n == 0 {
            return f32::NAN;
        }
        (self.s1 / self.n as f64) as f32
    }

    /// unbiased sample variance (`n - 1` denominator)
    pub fn variance(&self) -> f32 {
        if self.n < 2 {
            return f32::NAN;
        }
        let n = self.n as f64;
        let mu = self.s1 / n;
        ((self.s2 - n * mu * mu) / (n - 1.)).max(0.) as f32
    }

    pub fn sd(&self) -> f32 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f32 {
        if self.n == 0 {
            f32::NAN
        } else {
            self.min as f32
        }
    }

    pub fn max(&self) -> f32 {
        if self.n == 0 {
            f32::NAN
        } else {
            self.max as f32
        }
    }

    pub fn range(&self) -> f32 {
        self.max() - self.min()
    }
}

impl Default for FiniteStat {
    fn default() -> Self {
        Self::new()
    }
}

/// column-wise statistics of a matrix, ignoring non-finite cells
pub fn finite_column_stat(xx: &DMatrix<f32>) -> Vec<FiniteStat> {
    xx.column_iter()
        .map(|col| FiniteStat::from_values(col.iter().copied()))
        .collect()
}

/// Min-max scale finite values into `[0, 1]`. Non-finite values stay
/// `NaN`. If all the finite values are equal, they all become `0.5`.
pub fn minmax_scale(xx: &[f32]) -> Vec<f32> {
    let stat = FiniteStat::from_values(xx.iter().copied());
    let (lb, ub) = (stat.min(), stat.max());
    let denom = ub - lb;
    xx.iter()
        .map(|&x| {
            if !x.is_finite() {
                f32::NAN
            } else if !(denom > 0.) {
                0.5
            } else {
                ((x - lb) / denom).clamp(0., 1.)
            }
        })
        .collect()
}
