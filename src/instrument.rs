//! Boundary to the hardware and to whoever watches a run
//!
//! Every call blocks until the instrument answers. Implementations report failures as
//! [`crate::error::Error::Hardware`].

use std::collections::BTreeMap;

use crate::coefficients::Coefficients;
use crate::Result;

/// Where the measurement device takes its input from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    /// The external input, driven by the reference instrument
    Input,
    /// The internal calibration path
    Internal,
}

/// A burst acquisition, sample times in seconds
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Burst {
    pub time: Vec<f64>,
    pub signal: Vec<f64>,
}

/// The device being calibrated in a sweep
pub trait MeasurementDevice {
    fn set_path(&mut self, source: SignalSource, amplifier: &str) -> Result<()>;
    fn start_burst(&mut self, duration: f64, sample_period: f64) -> Result<Burst>;
    fn temperature(&mut self) -> Result<f64>;
    fn set_output_voltage(&mut self, channel_id: &str, value: f64) -> Result<()>;
    fn enable_outputs(&mut self, enabled: bool) -> Result<()>;
    /// Remove any injected signal from the input paths
    fn disconnect_paths(&mut self) -> Result<()>;
    fn set_highpass(&mut self, enabled: bool) -> Result<()>;
}

/// Calibrated source providing the reference values
pub trait ReferenceInstrument {
    /// Drive `value` and return what the instrument actually measured
    fn set_voltage(&mut self, value: f64) -> Result<f64>;
    fn temperature(&mut self) -> Result<f64>;
    fn ping(&mut self, ip: &str) -> bool;
}

/// A device holding linear correction coefficients in persistent storage
pub trait CorrectionDevice {
    fn correction(&mut self, channel: &str) -> Result<Coefficients>;
    /// Device-native encoding of `offset` volts
    fn zero_word(&mut self, channel: &str, offset: f64) -> Result<u32>;
    fn store_correction(
        &mut self,
        channel: &str,
        coefficients: Coefficients,
        zero_word: u32,
        persist: bool,
    ) -> Result<()>;
}

/// Multi-channel voltage output unit
pub trait VoltageSource: CorrectionDevice {
    fn channels(&self) -> Vec<String>;
    /// Output amplification, signed
    fn amplification(&mut self, channel: &str) -> Result<f64>;
    fn dac_bits(&mut self) -> Result<u32>;
    fn enable_outputs(&mut self, enabled: bool) -> Result<()>;
    /// Static voltage on every channel
    fn set_voltages(&mut self, volts: &[f64]) -> Result<()>;
    /// Table played back per channel with `step` seconds between entries
    fn load_waveform(&mut self, tables: &BTreeMap<String, Vec<f64>>, step: f64) -> Result<()>;
    /// Stress at `-amplitude` for one `step`, recovery at `+amplitude` for one `step`, then zero
    fn load_step(&mut self, amplitude: f64, step: f64) -> Result<()>;
    fn start_waveform(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trigger {
    /// Zero based scope channel
    pub channel: usize,
    pub level: f64,
    pub edge: Edge,
}

/// Acquisition settings, the trigger sits at `t = 0`
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    pub points: usize,
    pub start: f64,
    pub stop: f64,
    /// Vertical scale per channel in volts per division
    pub volts_per_div: Vec<f64>,
    /// Free running when `None`
    pub trigger: Option<Trigger>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Waveform {
    pub time: Vec<f64>,
    pub data: Vec<f64>,
}

pub trait Oscilloscope {
    fn configure(&mut self, acquisition: &Acquisition) -> Result<()>;
    /// Arm, wait for the trigger and return one record per channel
    fn single(&mut self) -> Result<Vec<Waveform>>;
}

/// One point of a sweep, for live plotting
#[derive(Debug, Clone, PartialEq)]
pub struct PointMeasured {
    pub series: String,
    /// Reference value
    pub x: f64,
    /// Mean of the burst
    pub y: f64,
    pub setpoint: f64,
}

/// Receives what a run has to say while it is running
///
/// Called from the worker thread.
pub trait Observer: Send + Sync {
    fn log(&self, _line: &str) {}
    fn point(&self, _point: &PointMeasured) {}
    fn progress(&self, _done: usize, _total: usize) {}
}

/// Observer which discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl Observer for Silent {}

/// Log a status line and forward it to the observer
pub(crate) fn status(observer: &dyn Observer, line: &str) {
    log::info!("{line}");
    observer.log(line);
}
