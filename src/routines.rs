//! Characterisation of a voltage output unit against an oscilloscope
//!
//! Output channel `i` of the unit is wired to scope channel `i`. The ramp and output tests
//! update the held correction coefficients of every channel whether or not the channel passed,
//! persisting them is left to the caller.

use std::collections::BTreeMap;
use std::path::PathBuf;

use itertools::{izip, Itertools};

use crate::artifacts::{ArtifactManager, Figure, Panel, Renderer, Trace};
use crate::coefficients::{CoefficientStore, Coefficients};
use crate::config::AutoCalConfig;
use crate::error::Error;
use crate::instrument::{
    status, Acquisition, Edge, Observer, Oscilloscope, Trigger, VoltageSource, Waveform,
};
use crate::math::{line_fit, mean};
use crate::Result;

/// Half width of the record used for static captures, in seconds
const STATIC_WINDOW: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TestKind {
    Output,
    Ramp,
    Transient,
}

impl TestKind {
    /// Stem of the artifact written by the test
    pub const fn name(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Ramp => "ramp",
            Self::Transient => "transient",
        }
    }
}

/// What a test found on one channel
#[derive(Debug, Clone, PartialEq)]
pub enum Finding {
    Output {
        /// Output at zero volts with the scope offset removed
        offset_error: f64,
        /// `(requested, measured - requested)` for every static voltage
        deviations: Vec<(f64, f64)>,
    },
    Ramp {
        ideal_slope: f64,
        slope: f64,
        relative_error: f64,
    },
    Transient {
        stress_time: f64,
        recovery_time: f64,
        /// Overshoot entering the stress, around the reversal and leaving the recovery
        overshoot: [f64; 3],
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReport {
    pub channel: String,
    pub ok: bool,
    pub finding: Finding,
    /// Coefficients held after the test
    pub coefficients: Coefficients,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub kind: TestKind,
    /// Every channel passed
    pub ok: bool,
    pub channels: Vec<ChannelReport>,
    pub artifact: Option<PathBuf>,
}

impl TestOutcome {
    pub fn new(kind: TestKind, channels: Vec<ChannelReport>, artifact: Option<PathBuf>) -> Self {
        Self {
            kind,
            ok: channels.iter().all(|c| c.ok),
            channels,
            artifact,
        }
    }
}

/// Outcomes of several tests run back to back
#[derive(Debug, Clone, PartialEq)]
pub struct TestSuite {
    /// Every test passed
    pub ok: bool,
    pub outcomes: Vec<TestOutcome>,
}

impl TestSuite {
    pub fn new(outcomes: Vec<TestOutcome>) -> Self {
        Self {
            ok: outcomes.iter().all(|t| t.ok),
            outcomes,
        }
    }
}

/// Ramp, output and transient tests of one voltage unit
pub struct VoltageUnitRoutines<'a, V: ?Sized, S: ?Sized> {
    unit: &'a mut V,
    scope: &'a mut S,
    store: &'a mut CoefficientStore,
    config: &'a AutoCalConfig,
    artifacts: &'a ArtifactManager,
    renderer: &'a dyn Renderer,
    observer: &'a dyn Observer,
}

impl<'a, V, S> VoltageUnitRoutines<'a, V, S>
where
    V: VoltageSource + ?Sized,
    S: Oscilloscope + ?Sized,
{
    pub fn new(
        unit: &'a mut V,
        scope: &'a mut S,
        store: &'a mut CoefficientStore,
        config: &'a AutoCalConfig,
        artifacts: &'a ArtifactManager,
        renderer: &'a dyn Renderer,
        observer: &'a dyn Observer,
    ) -> Self {
        Self {
            unit,
            scope,
            store,
            config,
            artifacts,
            renderer,
            observer,
        }
    }

    pub fn store(&self) -> &CoefficientStore {
        self.store
    }

    /// Replace the held coefficients of the named channels, nothing is written to the unit
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for an unknown channel, no value is changed then.
    pub fn set_coefficients(&mut self, values: &[(String, Coefficients)]) -> Result<()> {
        for (channel, _) in values {
            self.store.get(channel)?;
        }
        for (channel, coefficients) in values {
            self.store.set(channel, *coefficients)?;
        }
        Ok(())
    }

    /// # Errors
    /// Propagates device failures.
    pub fn read_coefficients(&mut self) -> Result<Vec<(String, Coefficients)>> {
        self.store.read(self.unit)
    }

    /// # Errors
    /// Propagates device failures.
    pub fn reset_coefficients(&mut self) -> Result<Vec<(String, Coefficients)>> {
        status(self.observer, "resetting coefficients to identity");
        self.store.reset(self.unit)
    }

    /// # Errors
    /// Propagates device failures.
    pub fn write_coefficients(&mut self) -> Result<()> {
        for (channel, c) in self.store.snapshot() {
            log::info!("{channel}: writing slope {:.6}, offset {:+.6}", c.slope, c.offset);
        }
        self.store.write(self.unit)
    }

    fn wired_channels(&self) -> Result<Vec<String>> {
        let channels = self.store.channels();
        if channels.is_empty() {
            return Err(Error::configuration("unit has no output channels"));
        }
        Ok(channels.to_vec())
    }

    fn capture(&mut self) -> Result<Vec<Waveform>> {
        let waveforms = self.scope.single()?;
        let needed = self.store.channels().len();
        if waveforms.len() < needed {
            return Err(Error::hardware(format!(
                "scope returned {} channels, {needed} are wired",
                waveforms.len()
            )));
        }
        Ok(waveforms)
    }

    fn render(&self, kind: TestKind, figure: &Figure) -> Result<Option<PathBuf>> {
        let path = self
            .renderer
            .render(figure, &self.artifacts.plot_path(kind.name()))?;
        Ok(Some(path))
    }

    /// Scope reading of every channel with the outputs disabled
    fn measure_offsets(&mut self) -> Result<Vec<f64>> {
        let channels = self.store.channels().len();
        self.unit.enable_outputs(false)?;
        self.scope.configure(&Acquisition {
            points: self.config.scope_points,
            start: -STATIC_WINDOW,
            stop: STATIC_WINDOW,
            volts_per_div: vec![0.1; channels],
            trigger: None,
        })?;
        let offsets = self
            .capture()?
            .iter()
            .map(|w| mean(&w.data))
            .collect::<Vec<_>>();
        log::debug!("scope offsets {offsets:?}");
        Ok(offsets)
    }

    fn switch_off(&mut self) -> Result<()> {
        let zeros = vec![0.0; self.store.channels().len()];
        self.unit.set_voltages(&zeros)?;
        self.unit.enable_outputs(false)
    }

    /// Static output accuracy, corrects the offset of every channel
    ///
    /// # Errors
    /// Propagates instrument failures and failures to write the artifact.
    pub fn output_test(&mut self) -> Result<TestOutcome> {
        status(self.observer, "output test");
        let channels = self.wired_channels()?;
        self.store.read(self.unit)?;
        let offsets = self.measure_offsets()?;

        self.scope.configure(&Acquisition {
            points: self.config.scope_points,
            start: -STATIC_WINDOW,
            stop: STATIC_WINDOW,
            volts_per_div: vec![self.config.baseline_scale.abs().max(0.1); channels.len()],
            trigger: None,
        })?;
        self.unit.enable_outputs(true)?;

        let voltages = self
            .config
            .output_voltages
            .iter()
            .map(|v| v * self.config.baseline_scale)
            .collect::<Vec<_>>();
        let mut deviations = vec![Vec::with_capacity(voltages.len()); channels.len()];
        let mut zero = vec![0.0; channels.len()];
        for &volts in &voltages {
            self.unit.set_voltages(&vec![volts; channels.len()])?;
            let waveforms = self.capture()?;
            for (i, (channel, waveform)) in channels.iter().zip(&waveforms).enumerate() {
                let measured = mean(&waveform.data) - offsets[i];
                let deviation = measured - volts;
                let mark = if deviation.abs() < self.config.output_report_tolerance {
                    "✓"
                } else {
                    "✗"
                };
                let line =
                    format!("{channel}: {volts:+.3} V off by {:+.3} mV {mark}", deviation * 1e3);
                status(self.observer, &line);
                if volts.abs() < f64::EPSILON {
                    zero[i] = measured;
                }
                deviations[i].push((volts, deviation));
            }
        }

        let mut panel = Panel::new("Output", "requested / V", "deviation / V");
        let mut reports = Vec::with_capacity(channels.len());
        for ((channel, offset_error), deviations) in channels.iter().zip(zero).zip(deviations) {
            let mut c = self.store.get(channel)?;
            let ok = offset_error.abs() < self.config.offset_tolerance;
            c.offset -= offset_error / c.slope;
            self.store.set(channel, c)?;
            status(
                self.observer,
                &format!(
                    "{channel}: offset {:+.3} mV, {}",
                    offset_error * 1e3,
                    if ok { "ok" } else { "out of tolerance" }
                ),
            );

            let (x, y) = deviations.iter().copied().unzip();
            panel.push(Trace::new(channel, x, y));
            reports.push(ChannelReport {
                channel: channel.clone(),
                ok,
                finding: Finding::Output {
                    offset_error,
                    deviations,
                },
                coefficients: c,
            });
        }
        self.switch_off()?;

        let figure = Figure {
            title: "Output".to_owned(),
            panels: vec![panel],
        };
        let artifact = self.render(TestKind::Output, &figure)?;
        Ok(TestOutcome::new(TestKind::Output, reports, artifact))
    }

    /// Drive table of a ramp with the given slope, zero in the padding at both ends
    #[allow(clippy::cast_precision_loss)]
    fn ramp_table(&self, slope: f64) -> Vec<f64> {
        let half = self.config.ramp_half_points;
        let padding = self.config.ramp_padding;
        (0..2 * half)
            .map(|j| {
                if j < padding || j > 2 * half - padding {
                    0.0
                } else {
                    (j as f64 - half as f64) * self.config.ramp_step * slope
                }
            })
            .collect()
    }

    /// Dynamic gain, corrects the slope of every channel
    ///
    /// # Errors
    /// Propagates instrument failures, a channel whose capture shows no ramp is a hardware error.
    #[allow(clippy::cast_precision_loss)]
    pub fn ramp_test(&mut self) -> Result<TestOutcome> {
        status(self.observer, "ramp test");
        let channels = self.wired_channels()?;
        self.store.read(self.unit)?;

        let mut ideal = Vec::with_capacity(channels.len());
        let mut scale = Vec::with_capacity(channels.len());
        for channel in &channels {
            let amplification = self.unit.amplification(channel)?;
            let sign = if self.config.inverted_channels.contains(channel) {
                -1.0
            } else {
                1.0
            };
            ideal.push(sign * self.config.ramp_rate * amplification);
            scale.push(amplification.abs());
        }
        let offsets = self.measure_offsets()?;

        let tables = channels
            .iter()
            .zip(&ideal)
            .map(|(channel, slope)| (channel.clone(), self.ramp_table(*slope)))
            .collect::<BTreeMap<_, _>>();
        self.unit.load_waveform(&tables, self.config.ramp_step)?;
        self.unit.enable_outputs(true)?;

        let step = self.config.ramp_step;
        let half_span = (self.config.ramp_half_points - self.config.ramp_padding) as f64 * step;
        let start = -(self.config.ramp_padding as f64) * step;
        let first = -half_span * ideal[0];
        self.scope.configure(&Acquisition {
            points: self.config.scope_points,
            start,
            stop: start + (2 * self.config.ramp_half_points) as f64 * step,
            volts_per_div: scale
                .iter()
                .map(|s| s * self.config.ramp_rate * half_span / 4.0)
                .collect(),
            trigger: Some(Trigger {
                channel: 0,
                level: 0.5 * first,
                edge: if first < 0.0 { Edge::Falling } else { Edge::Rising },
            }),
        })?;
        self.unit.start_waveform()?;
        let waveforms = self.capture()?;

        let [from, to] = self.config.ramp_fit_window;
        let mut panel = Panel::new("Ramp", "time / s", "output / V");
        let mut reports = Vec::with_capacity(channels.len());
        for (i, (channel, waveform)) in channels.iter().zip(&waveforms).enumerate() {
            let data = waveform
                .data
                .iter()
                .map(|d| d - offsets[i])
                .collect::<Vec<_>>();
            let (t, y): (Vec<f64>, Vec<f64>) = izip!(&waveform.time, &data)
                .filter(|(t, _)| **t > from && **t < to)
                .map(|(t, y)| (*t, *y))
                .unzip();
            let slope = line_fit(&t, &y)
                .map(|(slope, _)| slope)
                .filter(|slope| slope.abs() > f64::EPSILON)
                .ok_or_else(|| Error::hardware(format!("{channel}: no ramp in the capture")))?;

            let relative_error = (slope - ideal[i]) / ideal[i];
            let ok = relative_error.abs() < self.config.slope_tolerance;
            let mut c = self.store.get(channel)?;
            c.slope *= ideal[i] / slope;
            self.store.set(channel, c)?;
            status(
                self.observer,
                &format!(
                    "{channel}: slope {slope:.6} V/s, ideal {:.6} V/s, error {:+.4} %{}",
                    ideal[i],
                    relative_error * 1e2,
                    if ok { "" } else { " out of tolerance" }
                ),
            );

            let expected = waveform
                .time
                .iter()
                .map(|t| {
                    if (0.0..=2.0 * half_span).contains(t) {
                        (t - half_span) * ideal[i]
                    } else {
                        0.0
                    }
                })
                .collect();
            panel.push(Trace::new(channel, waveform.time.clone(), data));
            panel.push(Trace::new(format!("{channel} ideal"), waveform.time.clone(), expected));
            reports.push(ChannelReport {
                channel: channel.clone(),
                ok,
                finding: Finding::Ramp {
                    ideal_slope: ideal[i],
                    slope,
                    relative_error,
                },
                coefficients: c,
            });
        }
        self.switch_off()?;

        let figure = Figure {
            title: "Ramp".to_owned(),
            panels: vec![panel],
        };
        let artifact = self.render(TestKind::Ramp, &figure)?;
        Ok(TestOutcome::new(TestKind::Ramp, reports, artifact))
    }

    /// Settling after a full scale reversal, leaves the coefficients untouched
    ///
    /// # Errors
    /// Propagates instrument failures.
    pub fn transient_test(&mut self) -> Result<TestOutcome> {
        status(self.observer, "transient test");
        let channels = self.wired_channels()?;
        let step = if self.unit.dac_bits()? == 20 {
            self.config.transient_step_20bit
        } else {
            self.config.transient_step
        };
        let amplitude = self.config.transient_amplitude;

        self.unit.load_step(amplitude, step)?;
        self.unit.enable_outputs(true)?;
        self.scope.configure(&Acquisition {
            points: self.config.scope_points,
            start: -1.5 * step,
            stop: 1.5 * step,
            volts_per_div: vec![amplitude.abs() / 2.0; channels.len()],
            trigger: Some(Trigger {
                channel: 0,
                level: 0.0,
                edge: Edge::Rising,
            }),
        })?;
        self.unit.start_waveform()?;
        let waveforms = self.capture()?;

        let mut panel = Panel::new("Transient", "time / s", "output / amplitude");
        let mut reports = Vec::with_capacity(channels.len());
        for (channel, waveform) in channels.iter().zip(&waveforms) {
            let points = waveform
                .time
                .iter()
                .zip(&waveform.data)
                .map(|(t, d)| (*t, d / amplitude))
                .collect::<Vec<_>>();

            let too_short = || Error::hardware(format!("{channel}: transient record too short"));
            let stress_time = -crossing(&window(&points, |t| t < -0.6 * step), -0.5)
                .ok_or_else(too_short)?;
            let recovery_time =
                crossing(&window(&points, |t| t > 0.6 * step), 0.5).ok_or_else(too_short)?;
            let overshoot = [
                lowest(&window(&points, |t| t < -0.8 * step)) + 1.0,
                highest(&window(&points, |t| t.abs() < 0.2 * step)) - 1.0,
                lowest(&window(&points, |t| t > 0.8 * step)),
            ];

            let tolerance = self.config.transient_tolerance;
            let ok = (stress_time - step).abs() < tolerance
                && (recovery_time - step).abs() < tolerance;
            status(
                self.observer,
                &format!(
                    "{channel}: stress {:.3} us, recovery {:.3} us, overshoot {:+.3} / {:+.3} / {:+.3}{}",
                    stress_time * 1e6,
                    recovery_time * 1e6,
                    overshoot[0],
                    overshoot[1],
                    overshoot[2],
                    if ok { "" } else { " out of tolerance" }
                ),
            );

            let (t, d) = points.into_iter().unzip();
            panel.push(Trace::new(channel, t, d));
            reports.push(ChannelReport {
                channel: channel.clone(),
                ok,
                finding: Finding::Transient {
                    stress_time,
                    recovery_time,
                    overshoot,
                },
                coefficients: self.store.get(channel)?,
            });
        }
        self.unit.enable_outputs(false)?;

        let figure = Figure {
            title: "Transient".to_owned(),
            panels: vec![panel],
        };
        let artifact = self.render(TestKind::Transient, &figure)?;
        Ok(TestOutcome::new(TestKind::Transient, reports, artifact))
    }

    /// Output, ramp and transient test in turn
    ///
    /// # Errors
    /// Stops at the first test that cannot be carried out.
    pub fn test_all(&mut self) -> Result<TestSuite> {
        let outcomes = vec![
            self.output_test()?,
            self.ramp_test()?,
            self.transient_test()?,
        ];
        Ok(TestSuite::new(outcomes))
    }
}

fn window(points: &[(f64, f64)], keep: impl Fn(f64) -> bool) -> Vec<(f64, f64)> {
    points.iter().copied().filter(|(t, _)| keep(*t)).collect()
}

/// Time at which the record comes closest to `level`
fn crossing(points: &[(f64, f64)], level: f64) -> Option<f64> {
    points
        .iter()
        .position_min_by(|a, b| (a.1 - level).abs().total_cmp(&(b.1 - level).abs()))
        .map(|i| points[i].0)
}

fn lowest(points: &[(f64, f64)]) -> f64 {
    points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min)
}

fn highest(points: &[(f64, f64)]) -> f64 {
    points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max)
}
