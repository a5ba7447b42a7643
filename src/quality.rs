use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::artifacts::{Figure, Panel, Scale, Trace};
use crate::config::QualityConfig;
use crate::fitter::{ModelSet, ModelVariant, RegressionModel};
use crate::math::{gradient, mean, mean_squared_error, r2_score, std_dev};
use crate::types::{AggregatedTable, RangeKey};

/// What a set of predictions is compared against the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Series {
    /// The uncorrected measurement itself
    Measured,
    Fitted(ModelVariant),
    /// A fitted model applied to the independent verification data
    Verified(ModelVariant),
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measured => f.write_str("Measured"),
            Self::Fitted(variant) => write!(f, "{variant}"),
            Self::Verified(variant) => write!(f, "{variant} Verify"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Ok,
    Warn,
    Error,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityMetrics {
    pub series: Series,
    pub y_true: Vec<f64>,
    pub y_pred: Vec<f64>,
    /// `y_true - y_pred`
    pub error: Vec<f64>,
    /// Mean of the absolute error
    pub error_mean: f64,
    /// Standard deviation of the absolute error
    pub error_std: f64,
    /// `error / y_true`, infinite where the reference is zero
    pub error_percent: Vec<f64>,
    /// Mean over the finite entries of `error_percent`
    pub error_percent_mean: f64,
    pub mse: f64,
    pub r2: f64,
    /// Derivative of `y_true` with respect to `y_pred`
    pub gradient: Vec<f64>,
    pub verdict: Verdict,
    pub message: String,
}

/// Scores predictions against the reference values
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityAnalyzer {
    config: QualityConfig,
}

impl QualityAnalyzer {
    pub const fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Verdict for the R² of the uncorrected measurement
    ///
    /// Only an R² inside the warning band that is not at the same time inside the good band is
    /// flagged, anything else passes. A non-finite score is an error.
    pub fn baseline_verdict(&self, r2: f64) -> Verdict {
        if !r2.is_finite() {
            return Verdict::Error;
        }
        let inside = |band: [f64; 2]| band[0] < r2 && r2 < band[1];
        if inside(self.config.warn_band) && !inside(self.config.good_band) {
            Verdict::Warn
        } else {
            Verdict::Ok
        }
    }

    pub fn score(&self, series: Series, y_true: &[f64], y_pred: &[f64]) -> QualityMetrics {
        let error = y_true
            .iter()
            .zip(y_pred)
            .map(|(t, p)| t - p)
            .collect::<Vec<_>>();
        let abs_error = error.iter().map(|e| e.abs()).collect::<Vec<_>>();
        let error_percent = error
            .iter()
            .zip(y_true)
            .map(|(e, t)| e / t)
            .collect::<Vec<_>>();
        let finite_percent = error_percent
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect::<Vec<_>>();

        let mut grad = gradient(y_true, y_pred);
        if series == Series::Measured {
            let max = grad
                .iter()
                .filter(|g| g.is_finite())
                .fold(0.0f64, |acc, g| acc.max(g.abs()));
            if max > 0.0 {
                grad.iter_mut().for_each(|g| *g /= max);
            }
        }

        let error_mean = mean(&abs_error);
        let error_std = std_dev(&abs_error);
        let error_percent_mean = mean(&finite_percent);
        let mse = mean_squared_error(y_true, y_pred);
        let r2 = r2_score(y_true, y_pred);

        let mut message = format!(
            "{series} Values: Error Mean {error_mean:.3e}, Error Std {error_std:.3e}, \
             Error Mean % {error_percent_mean:.3e}, MSE {mse:.3e}, R2 {r2:.6}"
        );
        let verdict = if series == Series::Measured {
            self.baseline_verdict(r2)
        } else {
            Verdict::Ok
        };
        match verdict {
            Verdict::Ok => log::info!("{message}"),
            Verdict::Warn => {
                message.push_str(&format!(
                    ". R2 Score {r2:.6} out of line, check the measurement for analog errors."
                ));
                log::warn!("{message}");
            }
            Verdict::Error => {
                message.push_str(
                    ". Metrics are not finite, check the measurement for missing data.",
                );
                log::error!("{message}");
            }
        }

        QualityMetrics {
            series,
            y_true: y_true.to_vec(),
            y_pred: y_pred.to_vec(),
            error,
            error_mean,
            error_std,
            error_percent,
            error_percent_mean,
            mse,
            r2,
            gradient: grad,
            verdict,
            message,
        }
    }

    /// Score every prediction against the reference values of `table`
    pub fn analyze(
        &self,
        table: &AggregatedTable,
        predictions: &BTreeMap<Series, Vec<f64>>,
    ) -> BTreeMap<Series, QualityMetrics> {
        let y_true = table.reference_values();
        predictions
            .iter()
            .map(|(series, y_pred)| (*series, self.score(*series, &y_true, y_pred)))
            .collect()
    }

    /// Score the raw measurement and every fitted model of one range
    ///
    /// When verification data is supplied the Gaussian process is additionally scored on it.
    pub fn analyze_range(
        &self,
        table: &AggregatedTable,
        models: &ModelSet,
        verify: Option<&AggregatedTable>,
    ) -> RangeReport {
        let measured = table.measured_means();
        let mut predictions = BTreeMap::from([(Series::Measured, measured.clone())]);
        for (variant, model) in models {
            predictions.insert(Series::Fitted(*variant), model.predict_all(&measured));
        }
        let mut metrics = self.analyze(table, &predictions);

        if let (Some(verify), Some(gp)) = (verify, models.get(&ModelVariant::GaussianProcess)) {
            let series = Series::Verified(ModelVariant::GaussianProcess);
            let y_pred = gp.predict_all(&verify.measured_means());
            metrics.insert(
                series,
                self.score(series, &verify.reference_values(), &y_pred),
            );
        }

        RangeReport {
            key: table.key().clone(),
            metrics,
        }
    }
}

/// Quality of every series of one range
#[derive(Debug, Clone, PartialEq)]
pub struct RangeReport {
    pub key: RangeKey,
    pub metrics: BTreeMap<Series, QualityMetrics>,
}

impl RangeReport {
    /// Verdict of the uncorrected measurement
    pub fn verdict(&self) -> Verdict {
        self.metrics
            .get(&Series::Measured)
            .map_or(Verdict::Ok, |m| m.verdict)
    }

    /// Five panel diagnostic: linear and symlog comparison, absolute error, error percent and
    /// gradient, all against the reference value
    pub fn figure(&self) -> Figure {
        let mut linear = Panel::new("Linear", "reference", "value");
        let mut symlog = Panel::new("Symlog", "reference", "value").with_scale(Scale::SymLog);
        let mut absolute =
            Panel::new("Absolute Error", "reference", "|error|").with_scale(Scale::SymLog);
        let mut percent = Panel::new("Error %", "reference", "error / reference");
        let mut slope = Panel::new("Gradient", "reference", "d reference / d value");

        for (series, m) in &self.metrics {
            let label = series.to_string();
            linear.push(Trace::new(&label, m.y_true.clone(), m.y_pred.clone()));
            symlog.push(Trace::new(&label, m.y_true.clone(), m.y_pred.clone()));
            absolute.push(Trace::new(
                &label,
                m.y_true.clone(),
                m.error.iter().map(|e| e.abs()).collect(),
            ));
            percent.push(Trace::new(&label, m.y_true.clone(), m.error_percent.clone()));
            slope.push(Trace::new(&label, m.y_true.clone(), m.gradient.clone()));
        }

        Figure {
            title: format!("{}_analyze", self.key.stem()),
            panels: vec![linear, symlog, absolute, percent, slope],
        }
    }
}
