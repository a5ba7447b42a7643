use ndarray::{Array, Array2};
use num_traits::Float;

use crate::error::Error;
use crate::Result;

/// Generate the Vandermode matrix of `degree` for observations `x`
///
/// The Vandermonde matrix is a (n x degree + 1) matrix. Each row of the matrix is a geometric
/// progression for an individual observation `x` from power `0` to `degree` inclusive.
///
/// # Errors
/// Returns an error if `degree` does not fit in an `i32`.
///
/// # Examples
///
/// ```
/// use unitcal::math::vandermonde;
/// use ndarray::arr2;
///
/// let observations: Vec<f64> = vec![2., 3.];
/// let vander = vandermonde(&observations, 2).unwrap();
///
/// let expected = arr2(&[[1., 2., 4.], [1., 3., 9.]]);
/// assert_eq!(vander, expected);
/// ```
pub fn vandermonde<T: Float>(x: &[T], degree: usize) -> Result<Array2<T>> {
    let max_power = i32::try_from(degree)
        .map_err(|_| Error::fit(format!("polynomial degree {degree} is too large")))?;
    let vals = x
        .iter()
        .flat_map(|xi| (0..=max_power).map(move |i| xi.powi(i)));

    Ok(Array::from_iter(vals).into_shape((x.len(), degree + 1))?)
}

/// Arithmetic mean, `NaN` for an empty slice
///
/// The values are accumulated relative to the first element so that a constant input returns
/// that constant exactly.
pub fn mean(x: &[f64]) -> f64 {
    let Some(&shift) = x.first() else {
        return f64::NAN;
    };
    #[allow(clippy::cast_precision_loss)]
    let n = x.len() as f64;
    shift + x.iter().map(|xi| xi - shift).sum::<f64>() / n
}

/// Sample standard deviation (one delta degree of freedom)
///
/// A single observation carries no spread information and yields zero.
pub fn std_dev(x: &[f64]) -> f64 {
    if x.len() < 2 {
        return 0.0;
    }
    let mu = mean(x);
    #[allow(clippy::cast_precision_loss)]
    let dof = (x.len() - 1) as f64;
    (x.iter().map(|xi| (xi - mu).powi(2)).sum::<f64>() / dof).sqrt()
}

/// Mean squared error between two equally long sequences
pub fn mean_squared_error(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let squares = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .collect::<Vec<_>>();
    mean(&squares)
}

/// Coefficient of determination $R^2 = 1 - SS_{res} / SS_{tot}$
///
/// A constant `y_true` has no variance to explain: the score is one for a perfect prediction and
/// zero otherwise.
pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let mu = mean(y_true);
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mu).powi(2)).sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// Numerical derivative of `f` sampled at the (not necessarily uniform) coordinates `x`
///
/// Interior points use the second order accurate central difference for non-uniform spacing,
/// the end points one-sided first order differences. Fewer than two samples have no gradient
/// and return an empty vector.
///
/// # Examples
///
/// ```
/// use unitcal::math::gradient;
///
/// let x = [0., 1., 3.];
/// let f = [0., 1., 9.];
/// let df = gradient(&f, &x);
/// assert_eq!(df, vec![1., 2., 4.]);
/// ```
pub fn gradient(f: &[f64], x: &[f64]) -> Vec<f64> {
    let n = f.len().min(x.len());
    if n < 2 {
        return vec![];
    }
    let mut out = Vec::with_capacity(n);
    out.push((f[1] - f[0]) / (x[1] - x[0]));
    for i in 1..n - 1 {
        let hs = x[i] - x[i - 1];
        let hd = x[i + 1] - x[i];
        let value = (hs.powi(2) * f[i + 1] + (hd.powi(2) - hs.powi(2)) * f[i]
            - hd.powi(2) * f[i - 1])
            / (hs * hd * (hd + hs));
        out.push(value);
    }
    out.push((f[n - 1] - f[n - 2]) / (x[n - 1] - x[n - 2]));
    out
}

/// Least squares straight line through `(x, y)`, returned as `(slope, intercept)`
pub fn line_fit(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let mx = mean(&x[..n]);
    let my = mean(&y[..n]);
    let sxx: f64 = x[..n].iter().map(|xi| (xi - mx).powi(2)).sum();
    if sxx == 0.0 {
        return None;
    }
    let sxy: f64 = x[..n]
        .iter()
        .zip(&y[..n])
        .map(|(xi, yi)| (xi - mx) * (yi - my))
        .sum();
    let slope = sxy / sxx;
    Some((slope, my - slope * mx))
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::isaac64::Isaac64Rng;

    #[test]
    fn vandermonde_matrices_are_generated_correctly() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let num_data_points = 10;
        let degree = 5;

        let data_points = (0..num_data_points)
            .map(|_| rng.gen())
            .collect::<Vec<f64>>();

        let vandermonde = vandermonde(&data_points, degree).unwrap();

        for (ii, data_point) in data_points.iter().enumerate() {
            for jj in 0..=degree {
                let expected = data_point.powi(i32::try_from(jj).unwrap());
                let actual = vandermonde[[ii, jj]];
                approx::assert_relative_eq!(expected, actual);
            }
        }
    }

    #[test]
    fn mean_of_constant_data_is_exact() {
        let data = vec![0.002; 1000];
        assert_eq!(mean(&data), 0.002);
        assert_eq!(std_dev(&data), 0.0);
        assert!(mean(&[]).is_nan());
    }

    #[test]
    fn sample_standard_deviation_uses_one_delta_degree_of_freedom() {
        let data = [1., 2., 3., 4.];
        approx::assert_relative_eq!(std_dev(&data), (5.0f64 / 3.0).sqrt());
        assert_eq!(std_dev(&[3.]), 0.0);
    }

    #[test]
    fn r2_of_perfect_prediction_is_one() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let y = (0..20).map(|_| rng.gen::<f64>()).collect::<Vec<_>>();
        approx::assert_relative_eq!(r2_score(&y, &y), 1.0);
        assert_eq!(mean_squared_error(&y, &y), 0.0);
    }

    #[test]
    fn r2_of_constant_truth_follows_residuals() {
        assert_eq!(r2_score(&[1., 1.], &[1., 1.]), 1.0);
        assert_eq!(r2_score(&[1., 1.], &[1., 2.]), 0.0);
    }

    #[test]
    fn r2_of_predicting_the_mean_is_zero() {
        let y = [1., 2., 3.];
        approx::assert_abs_diff_eq!(r2_score(&y, &[2., 2., 2.]), 0.0);
    }

    #[test]
    fn gradient_is_exact_for_quadratics_on_non_uniform_grids() {
        let x = [0., 0.5, 1.5, 1.75, 3.];
        let f = x.iter().map(|xi| xi * xi).collect::<Vec<_>>();
        let df = gradient(&f, &x);
        for (xi, dfi) in x.iter().zip(&df).skip(1).take(x.len() - 2) {
            approx::assert_relative_eq!(*dfi, 2. * xi, epsilon = 1e-12);
        }
        assert_eq!(df.len(), x.len());
        assert!(gradient(&[1.], &[1.]).is_empty());
    }

    #[test]
    fn line_fit_recovers_slope_and_intercept() {
        let x = (0..50).map(f64::from).collect::<Vec<_>>();
        let y = x.iter().map(|xi| -3.5 * xi + 0.25).collect::<Vec<_>>();
        let (slope, intercept) = line_fit(&x, &y).unwrap();
        approx::assert_relative_eq!(slope, -3.5, max_relative = 1e-12);
        approx::assert_relative_eq!(intercept, 0.25, max_relative = 1e-10);
        assert!(line_fit(&[1., 1.], &[2., 3.]).is_none());
    }
}
