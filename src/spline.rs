use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Drop points until `x` no longer decreases anywhere
///
/// Each pass removes the first point that is followed by a smaller `x`, together with its `y`.
/// Already monotonic input is returned unchanged.
pub fn repair_monotonic(x: &[f64], y: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut x = x.to_vec();
    let mut y = y.to_vec();
    while let Some(index) = x.windows(2).position(|w| w[1] - w[0] < 0.0) {
        log::debug!("dropping non-monotonic point {index} at x = {}", x[index]);
        x.remove(index);
        if index < y.len() {
            y.remove(index);
        }
    }
    (x, y)
}

/// Degree one interpolating spline
///
/// Passes through every knot and continues the end segments linearly outside of them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LinearSpline {
    knots: Vec<f64>,
    coeffs: Vec<f64>,
    degree: usize,
}

impl LinearSpline {
    /// # Errors
    /// Returns [`Error::Fit`] for fewer than two points, mismatched lengths or knots which are not
    /// strictly increasing.
    pub fn fit(x: &[f64], y: &[f64]) -> Result<Self> {
        if x.len() != y.len() {
            return Err(Error::fit(format!(
                "x and y differ in length ({} != {})",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(Error::fit("a spline needs at least two points"));
        }
        if let Some(w) = x.windows(2).find(|w| !(w[1] > w[0])) {
            return Err(Error::fit(format!(
                "knots must be strictly increasing, found {} followed by {}",
                w[0], w[1]
            )));
        }
        Ok(Self {
            knots: x.to_vec(),
            coeffs: y.to_vec(),
            degree: 1,
        })
    }

    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    pub const fn degree(&self) -> usize {
        self.degree
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let n = self.knots.len();
        let upper = self
            .knots
            .partition_point(|k| *k <= x)
            .clamp(1, n - 1);
        let lower = upper - 1;
        let (x0, x1) = (self.knots[lower], self.knots[upper]);
        let (y0, y1) = (self.coeffs[lower], self.coeffs[upper]);
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn decreasing_points_are_removed() {
        let x = [0., 1., 0.5, 2., 1.5, 3.];
        let y = [0., 10., 5., 20., 15., 30.];
        let (rx, ry) = repair_monotonic(&x, &y);
        assert_eq!(rx, vec![0., 0.5, 1.5, 3.]);
        assert_eq!(ry, vec![0., 5., 15., 30.]);
    }

    #[test]
    fn spline_interpolates_and_extrapolates_linearly() -> Result<()> {
        let spline = LinearSpline::fit(&[0., 1., 3.], &[0., 2., 3.])?;
        approx::assert_relative_eq!(spline.evaluate(0.5), 1.0);
        approx::assert_relative_eq!(spline.evaluate(2.0), 2.5);
        approx::assert_relative_eq!(spline.evaluate(3.0), 3.0);
        approx::assert_relative_eq!(spline.evaluate(-1.0), -2.0);
        approx::assert_relative_eq!(spline.evaluate(5.0), 4.0);
        assert_eq!(spline.degree(), 1);
        Ok(())
    }

    #[test]
    fn degenerate_knots_are_rejected() {
        assert!(LinearSpline::fit(&[1.], &[1.]).is_err());
        assert!(LinearSpline::fit(&[1., 1., 2.], &[1., 2., 3.]).is_err());
        assert!(LinearSpline::fit(&[1., f64::NAN], &[1., 2.]).is_err());
    }

    proptest! {
        #[test]
        fn repair_is_idempotent(x in prop::collection::vec(-10.0f64..10.0, 0..40)) {
            let y = x.iter().map(|xi| 2.0 * xi).collect::<Vec<_>>();
            let (once_x, once_y) = repair_monotonic(&x, &y);
            prop_assert!(once_x.windows(2).all(|w| w[1] >= w[0]));
            prop_assert_eq!(once_x.len(), once_y.len());

            let (twice_x, twice_y) = repair_monotonic(&once_x, &once_y);
            prop_assert_eq!(twice_x, once_x);
            prop_assert_eq!(twice_y, once_y);
        }
    }
}
