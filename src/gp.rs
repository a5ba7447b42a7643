//! Gaussian process regression of one input on one output
//!
//! The kernel is a squared exponential plus white noise. Both axes are standardised before the
//! fit, the three hyper-parameters are chosen by minimising the negative log marginal likelihood
//! with a Nelder-Mead search. Predictions come with the posterior standard deviation.

use argmin::core::{CostFunction, Executor, State};
use argmin::solver::neldermead::NelderMead;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::math::mean;
use crate::Result;

/// Returned for hyper-parameters whose kernel matrix cannot be factorised
const PENALTY: f64 = 1e300;

/// Allowed range of every log hyper-parameter
const LOG_BOUNDS: (f64, f64) = (-12.0, 8.0);

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Hyperparameters {
    /// Length scale in standardised input units
    pub length_scale: f64,
    pub signal_variance: f64,
    pub noise_variance: f64,
}

impl Hyperparameters {
    fn from_log(params: &[f64], noise_floor: f64) -> Self {
        let bounded = |v: f64| v.clamp(LOG_BOUNDS.0, LOG_BOUNDS.1).exp();
        Self {
            length_scale: bounded(params[0]),
            signal_variance: bounded(params[1]),
            noise_variance: bounded(params[2]).max(noise_floor),
        }
    }

    fn kernel(&self, a: f64, b: f64) -> f64 {
        self.signal_variance * (-(a - b).powi(2) / (2.0 * self.length_scale.powi(2))).exp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpOptions {
    pub max_iterations: u64,
    pub noise_floor: f64,
}

impl Default for GpOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            noise_floor: 1e-6,
        }
    }
}

/// Mean and spread used to standardise one axis
#[derive(Debug, Clone, Copy, PartialEq)]
struct Standardiser {
    mean: f64,
    scale: f64,
}

impl Standardiser {
    fn new(values: &[f64]) -> Self {
        let mu = mean(values);
        #[allow(clippy::cast_precision_loss)]
        let var = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64;
        let scale = if var > 0.0 { var.sqrt() } else { 1.0 };
        Self { mean: mu, scale }
    }

    fn forward(&self, v: f64) -> f64 {
        (v - self.mean) / self.scale
    }

    fn inverse(&self, v: f64) -> f64 {
        v.mul_add(self.scale, self.mean)
    }
}

/// Kernel factorisation for one set of hyper-parameters
#[derive(Clone)]
struct Posterior {
    cholesky: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
}

impl Posterior {
    fn new(x: &[f64], y: &DVector<f64>, hyper: &Hyperparameters) -> Option<Self> {
        let n = x.len();
        let mut k = DMatrix::from_fn(n, n, |i, j| hyper.kernel(x[i], x[j]));
        for i in 0..n {
            k[(i, i)] += hyper.noise_variance;
        }
        let cholesky = Cholesky::new(k)?;
        let alpha = cholesky.solve(y);
        Some(Self { cholesky, alpha })
    }

    fn negative_log_marginal_likelihood(&self, y: &DVector<f64>) -> f64 {
        let log_det: f64 = self.cholesky.l_dirty().diagonal().iter().map(|d| d.ln()).sum();
        #[allow(clippy::cast_precision_loss)]
        let n = y.len() as f64;
        0.5 * y.dot(&self.alpha) + log_det + 0.5 * n * (2.0 * std::f64::consts::PI).ln()
    }
}

struct MarginalLikelihood {
    x: Vec<f64>,
    y: DVector<f64>,
    noise_floor: f64,
}

impl CostFunction for MarginalLikelihood {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        let hyper = Hyperparameters::from_log(params, self.noise_floor);
        Ok(Posterior::new(&self.x, &self.y, &hyper)
            .map(|p| p.negative_log_marginal_likelihood(&self.y))
            .filter(|v| v.is_finite())
            .unwrap_or(PENALTY))
    }
}

#[derive(Clone)]
pub struct GaussianProcess {
    x_train: Vec<f64>,
    x_scaler: Standardiser,
    y_scaler: Standardiser,
    hyper: Hyperparameters,
    posterior: Posterior,
}

impl std::fmt::Debug for GaussianProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaussianProcess")
            .field("points", &self.x_train.len())
            .field("hyper", &self.hyper)
            .finish_non_exhaustive()
    }
}

impl GaussianProcess {
    /// Fit to `(x, y)` pairs
    ///
    /// # Errors
    /// Returns [`Error::Fit`] for fewer than two points, mismatched lengths or if no
    /// hyper-parameters give a positive definite kernel matrix.
    pub fn fit(x: &[f64], y: &[f64], options: &GpOptions) -> Result<Self> {
        if x.len() != y.len() {
            return Err(Error::fit(format!(
                "x and y differ in length ({} != {})",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(Error::fit("a gaussian process needs at least two points"));
        }

        let x_scaler = Standardiser::new(x);
        let y_scaler = Standardiser::new(y);
        let xs = x.iter().map(|v| x_scaler.forward(*v)).collect::<Vec<_>>();
        let ys = DVector::from_iterator(y.len(), y.iter().map(|v| y_scaler.forward(*v)));

        let initial = vec![0.0, 0.0, (1e-2f64).ln()];
        let best = optimise(&xs, &ys, &initial, options).unwrap_or_else(|e| {
            log::warn!("hyper-parameter search failed ({e}), using the initial guess");
            initial.clone()
        });

        let hyper = Hyperparameters::from_log(&best, options.noise_floor);
        let posterior = Posterior::new(&xs, &ys, &hyper)
            .ok_or_else(|| Error::fit("kernel matrix is not positive definite"))?;
        log::debug!("gaussian process fitted with {hyper:?}");

        Ok(Self {
            x_train: xs,
            x_scaler,
            y_scaler,
            hyper,
            posterior,
        })
    }

    pub const fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    fn cross_covariance(&self, x: f64) -> DVector<f64> {
        let xs = self.x_scaler.forward(x);
        DVector::from_iterator(
            self.x_train.len(),
            self.x_train.iter().map(|xi| self.hyper.kernel(xs, *xi)),
        )
    }

    pub fn predict(&self, x: f64) -> f64 {
        let k = self.cross_covariance(x);
        self.y_scaler.inverse(k.dot(&self.posterior.alpha))
    }

    /// Posterior mean and standard deviation at `x`
    pub fn predict_with_std(&self, x: f64) -> (f64, f64) {
        let k = self.cross_covariance(x);
        let mean = self.y_scaler.inverse(k.dot(&self.posterior.alpha));
        let variance = self
            .posterior
            .cholesky
            .l()
            .solve_lower_triangular(&k)
            .map_or(0.0, |v| self.hyper.signal_variance - v.norm_squared());
        (mean, variance.max(0.0).sqrt() * self.y_scaler.scale)
    }
}

fn optimise(
    x: &[f64],
    y: &DVector<f64>,
    initial: &[f64],
    options: &GpOptions,
) -> std::result::Result<Vec<f64>, argmin::core::Error> {
    let problem = MarginalLikelihood {
        x: x.to_vec(),
        y: y.clone(),
        noise_floor: options.noise_floor,
    };
    let mut simplex = vec![initial.to_vec()];
    for i in 0..initial.len() {
        let mut vertex = initial.to_vec();
        vertex[i] += 1.0;
        simplex.push(vertex);
    }
    let solver = NelderMead::new(simplex).with_sd_tolerance(1e-8)?;
    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(options.max_iterations))
        .run()?;
    Ok(result
        .state()
        .get_best_param()
        .cloned()
        .unwrap_or_else(|| initial.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_points_are_reproduced() -> Result<()> {
        let x = (0..15).map(|i| f64::from(i) * 0.5 - 3.5).collect::<Vec<_>>();
        let y = x.iter().map(|xi| 1.02 * xi + 0.003 * xi.powi(2) - 0.01).collect::<Vec<_>>();

        let gp = GaussianProcess::fit(&x, &y, &GpOptions::default())?;

        for (xi, yi) in x.iter().zip(&y) {
            approx::assert_abs_diff_eq!(gp.predict(*xi), *yi, epsilon = 5e-3);
        }
        Ok(())
    }

    #[test]
    fn uncertainty_grows_away_from_the_data() -> Result<()> {
        let x = (0..10).map(f64::from).collect::<Vec<_>>();
        let y = x.iter().map(|xi| (xi / 3.0).sin()).collect::<Vec<_>>();

        let gp = GaussianProcess::fit(&x, &y, &GpOptions::default())?;
        let (_, near) = gp.predict_with_std(4.0);
        let (_, far) = gp.predict_with_std(40.0);

        assert!(near < far, "{near} should be below {far}");
        Ok(())
    }

    #[test]
    fn prediction_with_and_without_std_agree() -> Result<()> {
        let x = [-1.0, -0.2, 0.3, 0.9, 1.4];
        let y = [-2.1, -0.4, 0.7, 1.7, 2.9];
        let gp = GaussianProcess::fit(&x, &y, &GpOptions::default())?;
        let (mean, std) = gp.predict_with_std(0.5);
        approx::assert_relative_eq!(mean, gp.predict(0.5));
        assert!(std >= 0.0);
        Ok(())
    }

    #[test]
    fn single_point_is_rejected() {
        assert!(GaussianProcess::fit(&[1.0], &[1.0], &GpOptions::default()).is_err());
    }
}
