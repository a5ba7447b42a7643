use nalgebra::{DMatrix, DVector};
use ndarray::Array1;

use crate::error::Error;
use crate::math::vandermonde;
use crate::Result;

/// Result of a least squares polynomial fit
///
/// The solution holds the coefficients in ascending order of power, so `solution()[0]` is the
/// constant term.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    solution: Array1<f64>,
    residual_sum_of_squares: f64,
}

impl FitResult {
    pub const fn solution(&self) -> &Array1<f64> {
        &self.solution
    }

    pub const fn residual_sum_of_squares(&self) -> f64 {
        self.residual_sum_of_squares
    }
}

/// Least squares fit of a polynomial of `degree` through `(x, y)`
///
/// The columns of the Vandermonde matrix are normalised before the SVD solve, which keeps cubic
/// fits over several decades of input well conditioned.
///
/// # Errors
/// Returns [`Error::Fit`] if the inputs differ in length, contain fewer points than coefficients
/// or the system is rank deficient.
pub fn polyfit(x: &[f64], y: &[f64], degree: usize) -> Result<FitResult> {
    if x.len() != y.len() {
        return Err(Error::fit(format!(
            "x and y differ in length ({} != {})",
            x.len(),
            y.len()
        )));
    }
    let num_coeffs = degree + 1;
    if x.len() < num_coeffs {
        return Err(Error::fit(format!(
            "{} points cannot determine a degree {degree} polynomial",
            x.len()
        )));
    }

    let vander = vandermonde(x, degree)?;
    let mut lhs = DMatrix::from_fn(x.len(), num_coeffs, |i, j| vander[[i, j]]);
    let scale = lhs
        .column_iter()
        .map(|col| {
            let norm = col.norm();
            if norm == 0.0 {
                1.0
            } else {
                norm
            }
        })
        .collect::<Vec<_>>();
    for (mut col, s) in lhs.column_iter_mut().zip(&scale) {
        col /= *s;
    }
    let rhs = DVector::from_column_slice(y);

    let svd = lhs.clone().svd(true, true);
    let tolerance = 1e-12 * svd.singular_values.max();
    let rank = svd.rank(tolerance);
    if rank < num_coeffs {
        return Err(Error::fit(format!(
            "rank deficient system, rank {rank} for {num_coeffs} coefficients"
        )));
    }
    let scaled = svd
        .solve(&rhs, f64::EPSILON)
        .map_err(|e| Error::fit(e.to_owned()))?;

    let residual_sum_of_squares = (&lhs * &scaled - &rhs).norm_squared();
    let solution = scaled
        .iter()
        .zip(&scale)
        .map(|(c, s)| c / s)
        .collect::<Array1<f64>>();

    Ok(FitResult {
        solution,
        residual_sum_of_squares,
    })
}

/// Polynomial with coefficients in ascending order of power
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    coefficients: Vec<f64>,
}

impl Polynomial {
    pub fn new(coefficients: Vec<f64>) -> Self {
        Self { coefficients }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Evaluate with Horner's scheme
    pub fn evaluate(&self, x: f64) -> f64 {
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, c| acc.mul_add(x, *c))
    }
}

impl From<FitResult> for Polynomial {
    fn from(fit: FitResult) -> Self {
        Self::new(fit.solution.to_vec())
    }
}
