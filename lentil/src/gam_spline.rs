use crate::common::*;

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};

type Mat64 = DMatrix<f64>;
type DVec64 = DVector<f64>;

/// Cubic regression spline smooth `s(x, bs = "cr", k)` in its mixed
/// model form.
///
/// The `k` cardinal basis functions are parameterized by function
/// values at the knots. After the sum-to-zero (identifiability)
/// constraint, the wiggliness penalty is diagonalized into
///
/// ```text
/// s(x) = x_fixed(x) * b_fixed + x_random(x) * (sds * z),  z ~ N(0, I)
/// ```
///
/// with one unpenalized linear direction and `k - 2` penalized ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubicRegressionSpline {
    pub knots: Vec<f64>,
    /// maps knot values to second derivatives at the knots (k x k)
    second_deriv: Mat64,
    /// basis -> the unpenalized column (k)
    fixed_map: DVec64,
    /// basis -> the penalized columns (k x (k - 2))
    random_map: Mat64,
}

impl CubicRegressionSpline {
    /// Set up knots, constraint and penalty from the observed `x`
    ///
    /// * `x` - covariate values of the data
    /// * `k` - number of basis functions (knots)
    pub fn new(x: &[f32], k: usize) -> Result<Self> {
        if k < 3 {
            return Err(LentilError::Configuration(format!(
                "a cubic regression spline needs at least 3 knots, got {}",
                k
            )));
        }

        let mut uniq: Vec<f64> = x.iter().map(|&v| v as f64).collect();
        uniq.sort_by(|a, b| a.total_cmp(b));
        uniq.dedup();

        if uniq.len() < k {
            return Err(LentilError::DataShape(format!(
                "{} unique covariate values for {} knots",
                uniq.len(),
                k
            )));
        }

        let knots = place_knots(&uniq, k);
        let (second_deriv, penalty) = cardinal_second_derivatives(&knots)?;

        let mut ret = Self {
            knots,
            second_deriv,
            fixed_map: DVec64::zeros(k),
            random_map: Mat64::zeros(k, k - 2),
        };

        // constraint: the smooth sums to zero over the data
        let xx = ret.basis_matrix(x);
        let colsum: DVec64 = xx.row_sum().transpose();
        let zz = householder_complement(&colsum);

        let s_c = zz.transpose() * &penalty * &zz;
        let eig = SymmetricEigen::new(s_c);

        let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

        // k - 1 constrained directions: k - 2 penalized + 1 null
        let null_dir = eig.eigenvectors.column(order[k - 2]).into_owned();
        let fixed_map = &zz * null_dir;

        let mut random_map = Mat64::zeros(k, k - 2);
        for (r, &o) in order[..(k - 2)].iter().enumerate() {
            let lambda = eig.eigenvalues[o];
            if !(lambda > 0.) {
                return Err(LentilError::DataShape(format!(
                    "spline penalty is not positive definite (eigenvalue {})",
                    lambda
                )));
            }
            let col = (&zz * eig.eigenvectors.column(o)) / lambda.sqrt();
            random_map.set_column(r, &col);
        }

        // put the unpenalized column on the unit scale over the data
        let fixed_col = &xx * &fixed_map;
        let n = fixed_col.len() as f64;
        let mu = fixed_col.sum() / n;
        let sd = (fixed_col.map(|v| (v - mu).powi(2)).sum() / n).sqrt();
        let scale = if sd > 0. { sd } else { 1. };

        ret.fixed_map = fixed_map / scale;
        ret.random_map = random_map;
        Ok(ret)
    }

    pub fn n_knots(&self) -> usize {
        self.knots.len()
    }

    /// number of penalized coefficients
    pub fn n_random(&self) -> usize {
        self.random_map.ncols()
    }

    /// Cardinal basis at `x`; values outside the knot range are
    /// clamped to the boundary knots
    pub fn basis(&self, x: f64) -> DVec64 {
        let k = self.knots.len();
        let x = x.clamp(self.knots[0], self.knots[k - 1]);

        let j = match self.knots.iter().position(|&t| t > x) {
            Some(p) => p.saturating_sub(1).min(k - 2),
            None => k - 2,
        };

        let h = self.knots[j + 1] - self.knots[j];
        let dm = self.knots[j + 1] - x;
        let dp = x - self.knots[j];

        let a_minus = dm / h;
        let a_plus = dp / h;
        let c_minus = (dm.powi(3) / h - h * dm) / 6.;
        let c_plus = (dp.powi(3) / h - h * dp) / 6.;

        let mut ret: DVec64 = self.second_deriv.row(j).transpose() * c_minus
            + self.second_deriv.row(j + 1).transpose() * c_plus;
        ret[j] += a_minus;
        ret[j + 1] += a_plus;
        ret
    }

    fn basis_matrix(&self, x: &[f32]) -> Mat64 {
        let k = self.knots.len();
        let mut xx = Mat64::zeros(x.len(), k);
        for (i, &v) in x.iter().enumerate() {
            xx.set_row(i, &self.basis(v as f64).transpose());
        }
        xx
    }

    /// `(fixed, random)` design of one covariate value
    pub fn design_row(&self, x: f32) -> (f32, Vec<f32>) {
        let b = self.basis(x as f64);
        let fixed = b.dot(&self.fixed_map) as f32;
        let random = (self.random_map.transpose() * b)
            .iter()
            .map(|&v| v as f32)
            .collect();
        (fixed, random)
    }
}

/// Knots spread evenly over the sorted unique values
fn place_knots(uniq: &[f64], k: usize) -> Vec<f64> {
    let n = uniq.len();
    (0..k)
        .map(|i| {
            let pos = i as f64 * (n - 1) as f64 / (k - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            uniq[lo] * (1. - frac) + uniq[hi] * frac
        })
        .collect()
}

/// For knots `x_1 < ... < x_k` returns `F` (k x k) mapping function
/// values to second derivatives (natural boundary: zero at both ends)
/// and the penalty `S = D' B^{-1} D`.
fn cardinal_second_derivatives(knots: &[f64]) -> Result<(Mat64, Mat64)> {
    let k = knots.len();
    let h: Vec<f64> = knots.windows(2).map(|w| w[1] - w[0]).collect();

    let mut dd = Mat64::zeros(k - 2, k);
    let mut bb = Mat64::zeros(k - 2, k - 2);

    for i in 0..(k - 2) {
        dd[(i, i)] = 1. / h[i];
        dd[(i, i + 1)] = -1. / h[i] - 1. / h[i + 1];
        dd[(i, i + 2)] = 1. / h[i + 1];

        bb[(i, i)] = (h[i] + h[i + 1]) / 3.;
        if i + 1 < k - 2 {
            bb[(i, i + 1)] = h[i + 1] / 6.;
            bb[(i + 1, i)] = h[i + 1] / 6.;
        }
    }

    let chol = bb
        .cholesky()
        .ok_or(LentilError::DataShape("knots are not distinct".into()))?;
    let f_minus = chol.solve(&dd);

    let mut ff = Mat64::zeros(k, k);
    for i in 0..(k - 2) {
        ff.set_row(i + 1, &f_minus.row(i));
    }

    let penalty = dd.transpose() * f_minus;
    Ok((ff, penalty))
}

/// Orthonormal basis (k x (k - 1)) of the complement of `c`
fn householder_complement(c: &DVec64) -> Mat64 {
    let k = c.len();
    let mut v = c.clone();
    let sign = if c[0] >= 0. { 1. } else { -1. };
    v[0] += sign * c.norm();
    let vtv = v.dot(&v);
    let hh = if vtv > 0. {
        Mat64::identity(k, k) - (&v * v.transpose()) * (2. / vtv)
    } else {
        Mat64::identity(k, k)
    };
    hh.columns(1, k - 1).into_owned()
}
