use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::FitConfig;
use crate::gp::{GaussianProcess, GpOptions, Hyperparameters};
use crate::polyfit::{polyfit, Polynomial};
use crate::spline::{repair_monotonic, LinearSpline};
use crate::types::{AggregatedTable, RangeKey};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    Linear,
    Cubic,
    Spline,
    #[serde(rename = "gp")]
    GaussianProcess,
}

impl ModelVariant {
    pub const ALL: [Self; 4] = [Self::Linear, Self::Cubic, Self::Spline, Self::GaussianProcess];

    pub const fn label(self) -> &'static str {
        match self {
            Self::Linear => "Linear",
            Self::Cubic => "Cubic",
            Self::Spline => "Spline",
            Self::GaussianProcess => "GP",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Maps a measured value to the corresponding reference value
pub trait RegressionModel {
    fn predict(&self, x: f64) -> f64;

    /// Prediction together with its standard deviation, zero for deterministic models
    fn predict_with_std(&self, x: f64) -> (f64, f64) {
        (self.predict(x), 0.0)
    }

    fn predict_all(&self, x: &[f64]) -> Vec<f64> {
        x.iter().map(|xi| self.predict(*xi)).collect()
    }
}

#[derive(Debug, Clone)]
pub enum FittedModel {
    /// `y = k x + d`
    Linear { k: f64, d: f64 },
    /// `y = a x^3 + b x^2 + c x + d`
    Cubic { a: f64, b: f64, c: f64, d: f64 },
    Spline(LinearSpline),
    GaussianProcess(GaussianProcess),
}

impl FittedModel {
    pub const fn variant(&self) -> ModelVariant {
        match self {
            Self::Linear { .. } => ModelVariant::Linear,
            Self::Cubic { .. } => ModelVariant::Cubic,
            Self::Spline(_) => ModelVariant::Spline,
            Self::GaussianProcess(_) => ModelVariant::GaussianProcess,
        }
    }

    pub fn summary(&self) -> ModelSummary {
        match self {
            Self::Linear { k, d } => ModelSummary::Linear { k: *k, d: *d },
            Self::Cubic { a, b, c, d } => ModelSummary::Cubic {
                a: *a,
                b: *b,
                c: *c,
                d: *d,
            },
            Self::Spline(spline) => ModelSummary::Spline {
                knots: spline.knots().to_vec(),
                coeffs: spline.coeffs().to_vec(),
                degree: spline.degree(),
            },
            Self::GaussianProcess(gp) => ModelSummary::GaussianProcess {
                hyperparameters: *gp.hyperparameters(),
            },
        }
    }
}

impl RegressionModel for FittedModel {
    fn predict(&self, x: f64) -> f64 {
        match self {
            Self::Linear { k, d } => k.mul_add(x, *d),
            Self::Cubic { a, b, c, d } => Polynomial::new(vec![*d, *c, *b, *a]).evaluate(x),
            Self::Spline(spline) => spline.evaluate(x),
            Self::GaussianProcess(gp) => gp.predict(x),
        }
    }

    fn predict_with_std(&self, x: f64) -> (f64, f64) {
        match self {
            Self::GaussianProcess(gp) => gp.predict_with_std(x),
            _ => (self.predict(x), 0.0),
        }
    }
}

/// Persistable description of a fitted model
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModelSummary {
    Linear {
        k: f64,
        d: f64,
    },
    Cubic {
        a: f64,
        b: f64,
        c: f64,
        d: f64,
    },
    Spline {
        knots: Vec<f64>,
        coeffs: Vec<f64>,
        degree: usize,
    },
    #[serde(rename = "gp")]
    GaussianProcess { hyperparameters: Hyperparameters },
}

/// Every model fitted for one [`RangeKey`]
pub type ModelSet = BTreeMap<ModelVariant, FittedModel>;

/// Fits correction models mapping `measured_mean` to `reference_value`
#[derive(Debug, Clone, Default)]
pub struct ModelFitter {
    gp: GpOptions,
}

impl ModelFitter {
    pub const fn new(config: &FitConfig) -> Self {
        Self {
            gp: GpOptions {
                max_iterations: config.gp_max_iterations,
                noise_floor: config.gp_noise_floor,
            },
        }
    }

    /// Fit a single variant
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Fit`] when the rows cannot support the requested model.
    pub fn fit(&self, table: &AggregatedTable, variant: ModelVariant) -> Result<FittedModel> {
        let x = table.measured_means();
        let y = table.reference_values();
        let model = match variant {
            ModelVariant::Linear => {
                let fit = polyfit(&x, &y, 1)?;
                log::debug!(
                    "linear fit for {} leaves {:.3e} residual",
                    table.key(),
                    fit.residual_sum_of_squares()
                );
                let c = fit.solution();
                FittedModel::Linear { k: c[1], d: c[0] }
            }
            ModelVariant::Cubic => {
                let c = polyfit(&x, &y, 3)?.solution().to_vec();
                FittedModel::Cubic {
                    a: c[3],
                    b: c[2],
                    c: c[1],
                    d: c[0],
                }
            }
            ModelVariant::Spline => {
                let (x, y) = repair_monotonic(&x, &y);
                if x.len() < table.len() {
                    log::info!(
                        "{} of {} points of {} dropped to make the data monotonic",
                        table.len() - x.len(),
                        table.len(),
                        table.key()
                    );
                }
                FittedModel::Spline(LinearSpline::fit(&x, &y)?)
            }
            ModelVariant::GaussianProcess => {
                log::debug!(
                    "fitting gaussian process for {} with metadata {:?}",
                    table.key(),
                    table.metadata()
                );
                FittedModel::GaussianProcess(GaussianProcess::fit(&x, &y, &self.gp)?)
            }
        };
        Ok(model)
    }

    /// Fit every requested variant, leaving out those which fail
    pub fn fit_variants(&self, table: &AggregatedTable, variants: &[ModelVariant]) -> ModelSet {
        let mut models = ModelSet::new();
        for variant in variants {
            match self.fit(table, *variant) {
                Ok(model) => {
                    models.insert(*variant, model);
                }
                Err(e) => log::warn!("{variant} fit skipped for {}: {e}", table.key()),
            }
        }
        models
    }

    pub fn fit_all(
        &self,
        tables: &BTreeMap<RangeKey, AggregatedTable>,
        variants: &[ModelVariant],
    ) -> BTreeMap<RangeKey, ModelSet> {
        tables
            .iter()
            .map(|(key, table)| {
                log::info!("fitting {key}");
                (key.clone(), self.fit_variants(table, variants))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::{AggregatedRow, RangeMetadata};

    fn table(points: &[(f64, f64)]) -> AggregatedTable {
        let rows = points
            .iter()
            .map(|(measured, reference)| AggregatedRow {
                setpoint: *reference,
                reference_value: *reference,
                measured_mean: *measured,
                measured_std: 0.0,
                measured_max: *measured,
                measured_min: *measured,
                error: reference - measured,
            })
            .collect();
        AggregatedTable::new(RangeKey::new(false, "AMP1", "0"), RangeMetadata::new(), rows)
    }

    #[test]
    fn linear_fit_recovers_slope_and_offset() -> Result<()> {
        let points = (0..7)
            .map(|i| {
                let measured = f64::from(i) * 0.25 - 0.75;
                (measured, 2.0 * measured + 0.5)
            })
            .collect::<Vec<_>>();

        let model = ModelFitter::default().fit(&table(&points), ModelVariant::Linear)?;

        let FittedModel::Linear { k, d } = model else {
            panic!("expected a linear model, got {model:?}");
        };
        approx::assert_abs_diff_eq!(k, 2.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(d, 0.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn cubic_fit_uses_descending_coefficient_names() -> Result<()> {
        let points = (0..12)
            .map(|i| {
                let x = f64::from(i) - 6.0;
                (x, 0.01 * x.powi(3) - 0.2 * x.powi(2) + 1.5 * x - 3.0)
            })
            .collect::<Vec<_>>();

        let model = ModelFitter::default().fit(&table(&points), ModelVariant::Cubic)?;

        let FittedModel::Cubic { a, b, c, d } = model else {
            panic!("expected a cubic model, got {model:?}");
        };
        approx::assert_relative_eq!(a, 0.01, max_relative = 1e-8);
        approx::assert_relative_eq!(b, -0.2, max_relative = 1e-8);
        approx::assert_relative_eq!(c, 1.5, max_relative = 1e-8);
        approx::assert_relative_eq!(d, -3.0, max_relative = 1e-8);
        Ok(())
    }

    #[test]
    fn spline_fit_survives_non_monotonic_measurements() -> Result<()> {
        let points = [(-1.0, -1.0), (0.1, 0.0), (0.0, 0.05), (1.0, 1.0)];
        let model = ModelFitter::default().fit(&table(&points), ModelVariant::Spline)?;
        let FittedModel::Spline(spline) = &model else {
            panic!("expected a spline, got {model:?}");
        };
        // sorting by setpoint gives measured [-1.0, 0.1, 0.0, 1.0], the 0.1 point goes
        assert_eq!(spline.knots(), &[-1.0, 0.0, 1.0]);
        approx::assert_relative_eq!(model.predict(0.5), 0.525);
        Ok(())
    }

    #[test]
    fn failing_variants_are_left_out() {
        let points = [(1.0, 1.0), (1.0, 1.1)];
        let models = ModelFitter::default().fit_variants(&table(&points), &ModelVariant::ALL);
        assert!(!models.contains_key(&ModelVariant::Spline));
        assert!(!models.contains_key(&ModelVariant::Cubic));
        assert!(!models.contains_key(&ModelVariant::Linear));
    }

    #[test]
    fn deterministic_models_report_zero_spread() {
        let model = FittedModel::Linear { k: 2.0, d: 0.5 };
        assert_eq!(model.predict_with_std(1.0), (2.5, 0.0));
        assert_eq!(model.predict_all(&[0.0, 1.0]), vec![0.5, 2.5]);
        assert_eq!(model.summary(), ModelSummary::Linear { k: 2.0, d: 0.5 });
    }
}
