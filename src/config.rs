use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::fitter::ModelVariant;
use crate::Result;

/// Top level configuration, read from a toml file
///
/// Every section falls back to its defaults, so an empty file is a valid configuration for the
/// simulated bench.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub hardware: HardwareConfig,
    pub sweep: SweepConfig,
    pub fit: FitConfig,
    pub quality: QualityConfig,
    pub autocal: AutoCalConfig,
    pub files: FileNames,
}

impl Config {
    /// Read and validate a configuration file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid toml or contains inconsistent
    /// values.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// # Errors
    /// Returns an error if `contents` is not valid toml or fails validation.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values which deserialize fine but cannot be used
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] describing the first offending value.
    pub fn validate(&self) -> Result<()> {
        if self.sweep.burst_duration <= 0.0 || self.sweep.sample_period <= 0.0 {
            return Err(Error::configuration(
                "burst duration and sample period must be positive",
            ));
        }
        self.sweep.grid.validate()?;
        for channel in &self.sweep.channels {
            if channel.scale == 0.0 || !channel.scale.is_finite() {
                return Err(Error::configuration(format!(
                    "channel {} has an unusable scale factor {}",
                    channel.id, channel.scale
                )));
            }
            if let Some(grid) = &channel.grid {
                grid.validate()?;
            }
        }
        if !self.autocal.output_voltages.contains(&0.0) {
            return Err(Error::configuration(
                "autocal.output_voltages must contain 0 to measure the offset",
            ));
        }
        if self.autocal.max_iterations == 0 {
            return Err(Error::configuration("autocal.max_iterations must be at least 1"));
        }
        for (name, band) in [
            ("warn_band", self.quality.warn_band),
            ("good_band", self.quality.good_band),
        ] {
            if band[0] >= band[1] {
                return Err(Error::configuration(format!(
                    "quality.{name} must be ordered, found {band:?}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub reference_ip: Option<String>,
    pub serial: u32,
    /// Directory under which the per-unit artifact directories are created
    pub artifact_root: PathBuf,
    /// How long a task waits for the operator before giving up
    pub input_timeout_s: f64,
}

impl HardwareConfig {
    pub fn input_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.input_timeout_s.max(0.0))
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            reference_ip: None,
            serial: 0,
            artifact_root: PathBuf::from("."),
            input_timeout_s: 300.0,
        }
    }
}

/// Parameters of the symmetric log/linear setpoint grid
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SetpointGrid {
    pub max_value: f64,
    /// Number of decades covered by the logarithmic part below `max_value`
    pub decades: f64,
    /// Spacing of the logarithmic part, in decades
    pub delta_log: f64,
    /// Spacing of the linear part, as a fraction of `max_value`
    pub delta_lin: f64,
}

impl SetpointGrid {
    fn validate(&self) -> Result<()> {
        let positive = self.max_value > 0.0 && self.delta_log > 0.0 && self.delta_lin > 0.0;
        if !positive || self.decades < 0.0 {
            return Err(Error::configuration(format!("invalid setpoint grid {self:?}")));
        }
        Ok(())
    }
}

impl Default for SetpointGrid {
    fn default() -> Self {
        Self {
            max_value: 6.5,
            decades: 7.0,
            delta_log: 1. / 3.,
            delta_lin: 1. / 4.,
        }
    }
}

/// One amplifier path of the sampling unit
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChannelSpec {
    pub id: String,
    pub mode: bool,
    pub sub_range_id: String,
    /// Nominal gain of the range, stored with every sample
    pub range: f64,
    /// Nominal setpoints are divided by this factor to obtain device-native units
    pub scale: f64,
    /// Analog bandwidth in Hz, bounds the burst sample period
    pub bandwidth: f64,
    /// Replaces the requested setpoints when present
    #[serde(default)]
    pub grid: Option<SetpointGrid>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SweepConfig {
    pub burst_duration: f64,
    /// Base sample period, lengthened for channels whose bandwidth cannot support it
    pub sample_period: f64,
    pub grid: SetpointGrid,
    pub channels: Vec<ChannelSpec>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        let channel = |id: &str, scale: f64, grid: Option<SetpointGrid>| ChannelSpec {
            id: id.to_owned(),
            mode: false,
            sub_range_id: "0".to_owned(),
            range: scale,
            scale,
            bandwidth: 100e3,
            grid,
        };
        Self {
            burst_duration: 0.1,
            sample_period: 1e-4,
            grid: SetpointGrid::default(),
            channels: vec![
                channel("AMP01", 10.0, None),
                channel("AMP1", 1.0, None),
                channel(
                    "AMP2",
                    0.1,
                    Some(SetpointGrid {
                        max_value: 2.0,
                        decades: 7.0,
                        delta_log: 1. / 2.,
                        delta_lin: 1. / 6.,
                    }),
                ),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FitConfig {
    pub variants: Vec<ModelVariant>,
    /// Iteration budget of the Gaussian process hyper-parameter search
    pub gp_max_iterations: u64,
    /// Lower bound on the standardised noise level of the Gaussian process
    pub gp_noise_floor: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            variants: ModelVariant::ALL.to_vec(),
            gp_max_iterations: 200,
            gp_noise_floor: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Open interval of the raw baseline R² that triggers a warning
    pub warn_band: [f64; 2],
    /// Open interval of R² considered a good fit, never warned about
    pub good_band: [f64; 2],
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            warn_band: [-3.2, -2.8],
            good_band: [0.9, 1.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoCalConfig {
    pub max_iterations: usize,
    /// Relative slope error accepted by the ramp test
    pub slope_tolerance: f64,
    /// Zero offset accepted by the output test, in volts
    pub offset_tolerance: f64,
    /// Per-voltage deviation below which the output test logs a pass, in volts
    pub output_report_tolerance: f64,
    pub output_voltages: Vec<f64>,
    pub baseline_scale: f64,
    /// Ideal ramp slope for unit amplification, in V/s
    pub ramp_rate: f64,
    pub inverted_channels: Vec<String>,
    pub ramp_step: f64,
    /// Samples on each side of the ramp centre
    pub ramp_half_points: usize,
    /// Zero samples at both ends of the ramp table
    pub ramp_padding: usize,
    /// Time window, relative to the ramp start, used for the slope fit
    pub ramp_fit_window: [f64; 2],
    pub transient_step: f64,
    pub transient_step_20bit: f64,
    pub transient_amplitude: f64,
    pub transient_tolerance: f64,
    pub scope_points: usize,
}

impl Default for AutoCalConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            slope_tolerance: 1e-3,
            offset_tolerance: 2e-3,
            output_report_tolerance: 5e-3,
            output_voltages: vec![-0.75, -0.5, -0.25, 0.0, 0.25, 0.5, 0.75],
            baseline_scale: 1.0,
            ramp_rate: 20.0,
            inverted_channels: vec!["CH1".to_owned()],
            ramp_step: 1e-3,
            ramp_half_points: 250,
            ramp_padding: 50,
            ramp_fit_window: [5e-3, 0.395],
            transient_step: 5e-6,
            transient_step_20bit: 20e-6,
            transient_amplitude: 1.0,
            transient_tolerance: 0.5e-6,
            scope_points: 5000,
        }
    }
}

/// Names of the data sets kept in a calibration folder
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FileNames {
    pub raw_data: String,
    pub raw_data_verify: String,
    pub aggregated: String,
    pub aggregated_verify: String,
    pub figures: String,
    pub models: String,
}

impl Default for FileNames {
    fn default() -> Self {
        Self {
            raw_data: "raw_data".to_owned(),
            raw_data_verify: "raw_data_verify".to_owned(),
            aggregated: "aggregated".to_owned(),
            aggregated_verify: "aggregated_verify".to_owned(),
            figures: "figures".to_owned(),
            models: "models.toml".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() -> Result<()> {
        let config = Config::from_toml_str("")?;
        assert_eq!(config, Config::default());
        assert_eq!(config.sweep.channels.len(), 3);
        assert_eq!(config.autocal.max_iterations, 10);
        Ok(())
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() -> Result<()> {
        let config = Config::from_toml_str(
            r#"
            [hardware]
            reference_ip = "192.168.0.12"
            serial = 17

            [autocal]
            max_iterations = 4
            "#,
        )?;
        assert_eq!(config.hardware.reference_ip.as_deref(), Some("192.168.0.12"));
        assert_eq!(config.hardware.serial, 17);
        assert_eq!(config.autocal.max_iterations, 4);
        approx::assert_relative_eq!(config.autocal.offset_tolerance, 2e-3);
        Ok(())
    }

    #[test]
    fn channel_table_is_read() -> Result<()> {
        let config = Config::from_toml_str(
            r#"
            [[sweep.channels]]
            id = "AMP1"
            mode = true
            sub_range_id = "3"
            range = 1.0
            scale = 1.0
            bandwidth = 1000.0
            "#,
        )?;
        assert_eq!(config.sweep.channels.len(), 1);
        assert!(config.sweep.channels[0].mode);
        assert!(config.sweep.channels[0].grid.is_none());
        Ok(())
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        assert!(Config::from_toml_str("[autocal]\nmax_iterations = 0").is_err());
        assert!(Config::from_toml_str("[quality]\nwarn_band = [1.0, -1.0]").is_err());
        assert!(Config::from_toml_str("[sweep]\nburst_duration = -0.1").is_err());
    }
}
