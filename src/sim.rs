//! Simulated benches for running the pipeline without hardware
//!
//! A [`SamplingBench`] couples a sampling unit to a reference instrument through a shared
//! line: whatever the reference drives, the unit measures as `gain * drive + offset`.
//!
//! A [`VoltageBench`] wires a voltage unit to an oscilloscope. The physical output of channel
//! `i` for a drive `u` is `gain * slope * u + offset + offset_error`, where `slope` and `offset`
//! are the correction coefficients stored on the unit. Waveforms are played back with a first
//! order settling of time constant `tau`, and the scope adds its own offset.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::Array1;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::{Distribution, StandardNormal};
use parking_lot::Mutex;
use rand_isaac::Isaac64Rng;

use crate::coefficients::Coefficients;
use crate::error::Error;
use crate::instrument::{
    Acquisition, Burst, CorrectionDevice, MeasurementDevice, Oscilloscope, ReferenceInstrument,
    SignalSource, VoltageSource, Waveform,
};
use crate::Result;

/// Zero mean gaussian noise, silent when `sigma` is zero
#[derive(Debug)]
struct Noise {
    sigma: f64,
    rng: Isaac64Rng,
}

impl Noise {
    fn new(sigma: f64, seed: u64) -> Self {
        Self {
            sigma,
            rng: Isaac64Rng::seed_from_u64(seed),
        }
    }

    fn sample(&mut self) -> f64 {
        if self.sigma <= 0.0 {
            return 0.0;
        }
        let z: f64 = StandardNormal.sample(&mut self.rng);
        self.sigma * z
    }
}

#[derive(Debug)]
struct Line {
    drive: f64,
    gain: f64,
    offset: f64,
    noise: Noise,
    path: Option<String>,
    outputs: BTreeMap<String, f64>,
}

/// A sampling unit and a reference instrument sharing one signal line
#[derive(Debug, Clone)]
pub struct SamplingBench {
    line: Arc<Mutex<Line>>,
}

impl SamplingBench {
    pub fn new(gain: f64, offset: f64) -> Self {
        Self {
            line: Arc::new(Mutex::new(Line {
                drive: 0.0,
                gain,
                offset,
                noise: Noise::new(0.0, 0),
                path: None,
                outputs: BTreeMap::new(),
            })),
        }
    }

    #[must_use]
    pub fn with_noise(self, sigma: f64, seed: u64) -> Self {
        self.line.lock().noise = Noise::new(sigma, seed);
        self
    }

    pub fn unit(&self) -> SimulatedSamplingUnit {
        SimulatedSamplingUnit {
            line: Arc::clone(&self.line),
        }
    }

    pub fn reference(&self) -> SimulatedReference {
        SimulatedReference {
            line: Arc::clone(&self.line),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedSamplingUnit {
    line: Arc<Mutex<Line>>,
}

impl SimulatedSamplingUnit {
    /// Last voltage requested on each output
    pub fn outputs(&self) -> BTreeMap<String, f64> {
        self.line.lock().outputs.clone()
    }
}

impl MeasurementDevice for SimulatedSamplingUnit {
    fn set_path(&mut self, source: SignalSource, amplifier: &str) -> Result<()> {
        log::trace!("sim: {amplifier} connected to {source:?}");
        self.line.lock().path = Some(amplifier.to_owned());
        Ok(())
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn start_burst(&mut self, duration: f64, sample_period: f64) -> Result<Burst> {
        let mut line = self.line.lock();
        if line.path.is_none() {
            return Err(Error::hardware("burst started without a signal path"));
        }
        let n = (duration / sample_period).round().max(1.0) as usize;
        let level = line.gain.mul_add(line.drive, line.offset);
        let time = (0..n).map(|i| i as f64 * sample_period).collect();
        let signal = (0..n).map(|_| level + line.noise.sample()).collect();
        Ok(Burst { time, signal })
    }

    fn temperature(&mut self) -> Result<f64> {
        Ok(25.0)
    }

    fn set_output_voltage(&mut self, channel_id: &str, value: f64) -> Result<()> {
        self.line.lock().outputs.insert(channel_id.to_owned(), value);
        Ok(())
    }

    fn enable_outputs(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn disconnect_paths(&mut self) -> Result<()> {
        self.line.lock().path = None;
        Ok(())
    }

    fn set_highpass(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedReference {
    line: Arc<Mutex<Line>>,
}

impl ReferenceInstrument for SimulatedReference {
    fn set_voltage(&mut self, value: f64) -> Result<f64> {
        self.line.lock().drive = value;
        Ok(value)
    }

    fn temperature(&mut self) -> Result<f64> {
        Ok(23.0)
    }

    fn ping(&mut self, ip: &str) -> bool {
        !ip.is_empty()
    }
}

#[derive(Debug, Clone)]
enum Program {
    Static(Vec<f64>),
    Table { tables: Vec<Vec<f64>>, step: f64 },
    Step { amplitude: f64, step: f64 },
}

#[derive(Debug)]
struct Board {
    channels: Vec<String>,
    gain: f64,
    offset_error: f64,
    scope_offset: f64,
    tau: f64,
    dac_bits: u32,
    stored: BTreeMap<String, Coefficients>,
    writes: usize,
    enabled: bool,
    program: Program,
    running: bool,
    acquisition: Option<Acquisition>,
    noise: Noise,
}

impl Board {
    fn index(&self, channel: &str) -> Result<usize> {
        self.channels
            .iter()
            .position(|c| c == channel)
            .ok_or_else(|| Error::hardware(format!("no channel {channel} on the unit")))
    }

    fn physical(&self, channel: usize, drive: f64) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        let c = self.stored[&self.channels[channel]];
        (self.gain * c.slope).mul_add(drive, c.offset + self.offset_error)
    }

    /// Drive of `channel` at time `t` relative to the trigger
    #[allow(clippy::cast_precision_loss)]
    fn drive(&self, channel: usize, t: f64) -> f64 {
        match &self.program {
            Program::Static(levels) => levels.get(channel).copied().unwrap_or(0.0),
            _ if !self.running => 0.0,
            Program::Table { tables, step } => {
                let table = &tables[channel];
                // t = 0 is the first non zero entry of the table
                let start = table.iter().position(|v| *v != 0.0).unwrap_or(0);
                let position = start as f64 + t / step;
                interpolate(table, position)
            }
            Program::Step { amplitude, step } => {
                if (-step..0.0).contains(&t) {
                    -amplitude
                } else if (0.0..*step).contains(&t) {
                    *amplitude
                } else {
                    0.0
                }
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn interpolate(table: &[f64], position: f64) -> f64 {
    match table {
        [] => 0.0,
        [only] => *only,
        _ if position <= 0.0 => table[0],
        _ if position >= (table.len() - 1) as f64 => table[table.len() - 1],
        _ => {
            let i = position.floor() as usize;
            let frac = position - i as f64;
            (table[i + 1] - table[i]).mul_add(frac, table[i])
        }
    }
}

/// A voltage unit wired channel by channel to an oscilloscope
#[derive(Debug, Clone)]
pub struct VoltageBench {
    board: Arc<Mutex<Board>>,
}

impl VoltageBench {
    pub fn new<S: AsRef<str>>(channels: &[S]) -> Self {
        let channels = channels
            .iter()
            .map(|c| c.as_ref().to_owned())
            .collect::<Vec<_>>();
        let stored = channels
            .iter()
            .map(|c| (c.clone(), Coefficients::default()))
            .collect();
        let levels = vec![0.0; channels.len()];
        Self {
            board: Arc::new(Mutex::new(Board {
                channels,
                gain: 1.0,
                offset_error: 0.0,
                scope_offset: 0.0,
                tau: 0.1e-6,
                dac_bits: 18,
                stored,
                writes: 0,
                enabled: false,
                program: Program::Static(levels),
                running: false,
                acquisition: None,
                noise: Noise::new(0.0, 0),
            })),
        }
    }

    /// Gain error shared by every output
    #[must_use]
    pub fn with_gain(self, gain: f64) -> Self {
        self.board.lock().gain = gain;
        self
    }

    /// Offset error shared by every output, in volts
    #[must_use]
    pub fn with_offset(self, offset: f64) -> Self {
        self.board.lock().offset_error = offset;
        self
    }

    #[must_use]
    pub fn with_scope_offset(self, offset: f64) -> Self {
        self.board.lock().scope_offset = offset;
        self
    }

    #[must_use]
    pub fn with_dac_bits(self, bits: u32) -> Self {
        self.board.lock().dac_bits = bits;
        self
    }

    #[must_use]
    pub fn with_noise(self, sigma: f64, seed: u64) -> Self {
        self.board.lock().noise = Noise::new(sigma, seed);
        self
    }

    pub fn unit(&self) -> SimulatedVoltageUnit {
        SimulatedVoltageUnit {
            board: Arc::clone(&self.board),
        }
    }

    pub fn scope(&self) -> SimulatedScope {
        SimulatedScope {
            board: Arc::clone(&self.board),
        }
    }

    /// Coefficients currently persisted on the unit
    pub fn stored(&self) -> BTreeMap<String, Coefficients> {
        self.board.lock().stored.clone()
    }

    /// Number of coefficient writes received
    pub fn writes(&self) -> usize {
        self.board.lock().writes
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedVoltageUnit {
    board: Arc<Mutex<Board>>,
}

impl CorrectionDevice for SimulatedVoltageUnit {
    fn correction(&mut self, channel: &str) -> Result<Coefficients> {
        let board = self.board.lock();
        board.index(channel)?;
        Ok(board.stored[channel])
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn zero_word(&mut self, channel: &str, offset: f64) -> Result<u32> {
        let board = self.board.lock();
        board.index(channel)?;
        // offset binary over +-10 V
        let full_scale = f64::from((1_u32 << board.dac_bits) - 1);
        Ok(((offset / 10.0 + 1.0) / 2.0 * full_scale)
            .round()
            .clamp(0.0, full_scale) as u32)
    }

    fn store_correction(
        &mut self,
        channel: &str,
        coefficients: Coefficients,
        zero_word: u32,
        persist: bool,
    ) -> Result<()> {
        let mut board = self.board.lock();
        board.index(channel)?;
        log::trace!("sim: {channel} <- {coefficients:?} ({zero_word:#x}, persist {persist})");
        board.stored.insert(channel.to_owned(), coefficients);
        board.writes += 1;
        Ok(())
    }
}

impl VoltageSource for SimulatedVoltageUnit {
    fn channels(&self) -> Vec<String> {
        self.board.lock().channels.clone()
    }

    fn amplification(&mut self, channel: &str) -> Result<f64> {
        self.board.lock().index(channel)?;
        Ok(1.0)
    }

    fn dac_bits(&mut self) -> Result<u32> {
        Ok(self.board.lock().dac_bits)
    }

    fn enable_outputs(&mut self, enabled: bool) -> Result<()> {
        self.board.lock().enabled = enabled;
        Ok(())
    }

    fn set_voltages(&mut self, volts: &[f64]) -> Result<()> {
        let mut board = self.board.lock();
        if volts.len() != board.channels.len() {
            return Err(Error::hardware(format!(
                "{} voltages for {} channels",
                volts.len(),
                board.channels.len()
            )));
        }
        board.program = Program::Static(volts.to_vec());
        board.running = false;
        Ok(())
    }

    fn load_waveform(&mut self, tables: &BTreeMap<String, Vec<f64>>, step: f64) -> Result<()> {
        let mut board = self.board.lock();
        let tables = board
            .channels
            .iter()
            .map(|c| tables.get(c).cloned().unwrap_or_default())
            .collect();
        board.program = Program::Table { tables, step };
        board.running = false;
        Ok(())
    }

    fn load_step(&mut self, amplitude: f64, step: f64) -> Result<()> {
        let mut board = self.board.lock();
        board.program = Program::Step { amplitude, step };
        board.running = false;
        Ok(())
    }

    fn start_waveform(&mut self) -> Result<()> {
        self.board.lock().running = true;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedScope {
    board: Arc<Mutex<Board>>,
}

impl Oscilloscope for SimulatedScope {
    fn configure(&mut self, acquisition: &Acquisition) -> Result<()> {
        if acquisition.points < 2 || acquisition.stop <= acquisition.start {
            return Err(Error::hardware(format!("unusable acquisition {acquisition:?}")));
        }
        self.board.lock().acquisition = Some(acquisition.clone());
        Ok(())
    }

    fn single(&mut self) -> Result<Vec<Waveform>> {
        let mut board = self.board.lock();
        let acquisition = board
            .acquisition
            .clone()
            .ok_or_else(|| Error::hardware("scope armed before it was configured"))?;
        let time = Array1::linspace(acquisition.start, acquisition.stop, acquisition.points);
        let dt = time[1] - time[0];
        let settle = 1.0 - (-dt / board.tau).exp();

        let mut waveforms = Vec::with_capacity(board.channels.len());
        for channel in 0..board.channels.len() {
            let mut level = board.physical(channel, board.drive(channel, time[0]));
            let mut data = Vec::with_capacity(time.len());
            for t in &time {
                let target = board.physical(channel, board.drive(channel, *t));
                level += settle * (target - level);
                let noise = board.noise.sample();
                data.push(level + board.scope_offset + noise);
            }
            waveforms.push(Waveform {
                time: time.to_vec(),
                data,
            });
        }
        board.running = false;
        Ok(waveforms)
    }
}
