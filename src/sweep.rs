use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{ChannelSpec, SetpointGrid, SweepConfig};
use crate::instrument::{
    status, MeasurementDevice, Observer, PointMeasured, ReferenceInstrument, SignalSource,
};
use crate::math::mean;
use crate::types::{RangeMetadata, RawSample, SampleAttrs};
use crate::Result;

/// Symmetric setpoint grid: logarithmic towards zero, linear towards full scale
///
/// The logarithmic part covers `decades` decades below `max_value` in steps of `delta_log`
/// decades, the linear part steps through full scale in fractions of `delta_lin`. Both are
/// mirrored to negative values and zero is included. The result is sorted and free of
/// duplicates.
///
/// # Examples
///
/// ```
/// use unitcal::config::SetpointGrid;
/// use unitcal::sweep::prepare_measurement_values;
///
/// let grid = SetpointGrid { max_value: 1.0, decades: 1.0, delta_log: 1.0, delta_lin: 0.5 };
/// let values = prepare_measurement_values(&grid);
/// assert_eq!(values, vec![-1.0, -0.5, -0.1, 0.0, 0.1, 0.5, 1.0]);
/// ```
pub fn prepare_measurement_values(grid: &SetpointGrid) -> Vec<f64> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let log_steps = (grid.decades / grid.delta_log).round() as u32;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let lin_steps = (1.0 / grid.delta_lin).round() as u32;

    let logarithmic =
        (0..=log_steps).map(|k| grid.max_value / 10f64.powf(f64::from(k) * grid.delta_log));
    let linear = (1..=lin_steps).map(|j| grid.max_value * (f64::from(j) * grid.delta_lin).min(1.0));

    let mut values = logarithmic
        .chain(linear)
        .flat_map(|v| [v, -v])
        .chain(std::iter::once(0.0))
        .collect::<Vec<_>>();
    values.sort_by(f64::total_cmp);
    values.dedup_by(|a, b| (*a - *b).abs() <= 1e-12 * grid.max_value);
    values
}

/// Counter of measured points, cloned handles share the same count
#[derive(Debug, Clone, Default)]
pub struct Progress {
    done: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        let progress = Self::default();
        progress.total.store(total, Ordering::SeqCst);
        progress
    }

    pub fn add_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::SeqCst);
    }

    /// Count one point and return the new count
    pub fn increment(&self) -> usize {
        self.done.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Drives the reference instrument and the device across the setpoints of every channel
pub struct CalibrationSweep<'a, D: ?Sized, R: ?Sized> {
    device: &'a mut D,
    reference: &'a mut R,
    config: &'a SweepConfig,
    observer: &'a dyn Observer,
    progress: Progress,
}

impl<'a, D, R> CalibrationSweep<'a, D, R>
where
    D: MeasurementDevice + ?Sized,
    R: ReferenceInstrument + ?Sized,
{
    pub fn new(
        device: &'a mut D,
        reference: &'a mut R,
        config: &'a SweepConfig,
        observer: &'a dyn Observer,
    ) -> Self {
        Self {
            device,
            reference,
            config,
            observer,
            progress: Progress::default(),
        }
    }

    /// Count into an existing progress counter instead of a private one
    #[must_use]
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub const fn progress(&self) -> &Progress {
        &self.progress
    }

    fn channel(&self, channel_id: &str) -> Option<&'a ChannelSpec> {
        self.config.channels.iter().find(|c| c.id == channel_id)
    }

    /// Setpoints actually measured on `spec` when `requested` is asked for
    fn setpoints_for(spec: &ChannelSpec, requested: &[f64]) -> Vec<f64> {
        spec.grid
            .as_ref()
            .map_or_else(|| requested.to_vec(), prepare_measurement_values)
    }

    /// Measure one channel at every setpoint
    ///
    /// An unknown channel is logged and yields no samples. Instrument failures abort the sweep.
    ///
    /// # Errors
    /// Propagates hardware errors.
    pub fn measure_range(&mut self, channel_id: &str, setpoints: &[f64]) -> Result<Vec<RawSample>> {
        if let Some(spec) = self.channel(channel_id) {
            self.progress.add_total(Self::setpoints_for(spec, setpoints).len());
        }
        self.measure_channel(channel_id, setpoints)
    }

    fn measure_channel(&mut self, channel_id: &str, setpoints: &[f64]) -> Result<Vec<RawSample>> {
        let Some(spec) = self.channel(channel_id) else {
            log::error!("unknown channel {channel_id}, skipping it");
            self.observer.log(&format!("unknown channel {channel_id}"));
            return Ok(vec![]);
        };
        let setpoints = Self::setpoints_for(spec, setpoints);
        if spec.grid.is_some() {
            log::warn!("{channel_id}: measurement values are reset to the channel grid");
        }
        let sample_period = self.config.sample_period.max(0.5 / spec.bandwidth);
        status(
            self.observer,
            &format!("measuring {channel_id} at {} setpoints", setpoints.len()),
        );

        self.device.set_path(SignalSource::Input, &spec.id)?;
        if spec.mode {
            self.device.enable_outputs(true)?;
        }

        let mut metadata = RangeMetadata::new();
        metadata.insert("range".to_owned(), spec.range);
        metadata.insert("scale".to_owned(), spec.scale);
        metadata.insert("sample_period".to_owned(), sample_period);

        let mut samples = Vec::with_capacity(setpoints.len());
        for setpoint in setpoints {
            let drive = setpoint / spec.scale;
            if spec.mode {
                self.device.set_output_voltage(&spec.id, drive)?;
            }
            let reference_value = self.reference.set_voltage(drive)?;
            let burst = self.device.start_burst(self.config.burst_duration, sample_period)?;
            let attrs = SampleAttrs {
                setpoint,
                reference_value,
                mode: spec.mode,
                channel_id: spec.id.clone(),
                sub_range_id: spec.sub_range_id.clone(),
                temperature_device: self.device.temperature()?,
                temperature_reference: self.reference.temperature()?,
                range_metadata: metadata.clone(),
            };
            let sample = RawSample::new(burst.time, burst.signal, attrs)?;

            let point = PointMeasured {
                series: spec.id.clone(),
                x: reference_value,
                y: mean(sample.signal()),
                setpoint,
            };
            log::debug!("{channel_id}: {point:?}");
            self.observer.point(&point);
            let done = self.progress.increment();
            self.observer.progress(done, self.progress.total());

            samples.push(sample);
        }
        Ok(samples)
    }

    /// Measure every configured channel, sharing one progress counter
    ///
    /// # Errors
    /// Propagates hardware errors, samples of channels measured before the failure are lost.
    pub fn measure_all_ranges(&mut self, setpoints: &[f64]) -> Result<Vec<RawSample>> {
        let total = self
            .config
            .channels
            .iter()
            .map(|spec| Self::setpoints_for(spec, setpoints).len())
            .sum();
        self.progress.add_total(total);

        let config = self.config;
        let mut samples = vec![];
        for spec in &config.channels {
            samples.extend(self.measure_channel(&spec.id, setpoints)?);
        }
        Ok(samples)
    }

    /// Return the device to a passive state
    ///
    /// # Errors
    /// Propagates hardware errors.
    pub fn cleanup(&mut self) -> Result<()> {
        self.device.enable_outputs(false)?;
        self.device.disconnect_paths()?;
        self.device.set_highpass(false)?;
        log::debug!("sweep cleanup done");
        Ok(())
    }

    /// Run `run` and clean up afterwards, whether or not it succeeded
    ///
    /// # Errors
    /// Returns the error of `run`, or the cleanup error if `run` succeeded.
    pub fn guarded<T>(&mut self, run: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = run(self);
        let cleanup = self.cleanup();
        match (result, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), cleaned) => {
                if let Err(cleanup_error) = cleaned {
                    log::error!("cleanup after a failed sweep failed too: {cleanup_error}");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::config::SweepConfig;
    use crate::error::Error;
    use crate::instrument::{Burst, Silent};

    #[derive(Default)]
    struct Device {
        calls: Vec<String>,
        fail_after: Option<usize>,
        bursts: usize,
    }

    impl MeasurementDevice for Device {
        fn set_path(&mut self, _source: SignalSource, amplifier: &str) -> Result<()> {
            self.calls.push(format!("path {amplifier}"));
            Ok(())
        }

        fn start_burst(&mut self, duration: f64, sample_period: f64) -> Result<Burst> {
            self.bursts += 1;
            if self.fail_after.is_some_and(|n| self.bursts > n) {
                return Err(Error::hardware("burst timed out"));
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let n = (duration / sample_period).round() as usize;
            Ok(Burst {
                time: (0..n).map(|i| i as f64 * sample_period).collect(),
                signal: vec![0.002; n],
            })
        }

        fn temperature(&mut self) -> Result<f64> {
            Ok(35.0)
        }

        fn set_output_voltage(&mut self, channel_id: &str, value: f64) -> Result<()> {
            self.calls.push(format!("output {channel_id} {value}"));
            Ok(())
        }

        fn enable_outputs(&mut self, enabled: bool) -> Result<()> {
            self.calls.push(format!("outputs {enabled}"));
            Ok(())
        }

        fn disconnect_paths(&mut self) -> Result<()> {
            self.calls.push("disconnect".to_owned());
            Ok(())
        }

        fn set_highpass(&mut self, enabled: bool) -> Result<()> {
            self.calls.push(format!("highpass {enabled}"));
            Ok(())
        }
    }

    struct Reference;

    impl ReferenceInstrument for Reference {
        fn set_voltage(&mut self, value: f64) -> Result<f64> {
            Ok(value)
        }

        fn temperature(&mut self) -> Result<f64> {
            Ok(23.0)
        }

        fn ping(&mut self, _ip: &str) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct Points(Mutex<Vec<PointMeasured>>);

    impl Observer for Points {
        fn point(&self, point: &PointMeasured) {
            self.0.lock().unwrap().push(point.clone());
        }
    }

    fn config() -> SweepConfig {
        let mut config = SweepConfig::default();
        config.burst_duration = 1e-3;
        config
    }

    #[test]
    fn grid_is_symmetric_sorted_and_unique() {
        let values = prepare_measurement_values(&SetpointGrid::default());
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert!(values.contains(&0.0));
        assert_eq!(values.first().copied(), Some(-6.5));
        assert_eq!(values.last().copied(), Some(6.5));
        let positive = values.iter().filter(|v| **v > 0.0).count();
        let negative = values.iter().filter(|v| **v < 0.0).count();
        assert_eq!(positive, negative);
    }

    #[test]
    fn setpoints_are_scaled_and_reported() -> Result<()> {
        let config = config();
        let mut device = Device::default();
        let mut reference = Reference;
        let observer = Points::default();
        let setpoints = [-0.75, 0.0, 0.75];

        let samples = CalibrationSweep::new(&mut device, &mut reference, &config, &observer)
            .measure_range("AMP01", &setpoints)?;

        assert_eq!(samples.len(), 3);
        approx::assert_relative_eq!(samples[0].attrs().reference_value, -0.075);
        assert_eq!(samples[2].attrs().setpoint, 0.75);
        assert_eq!(samples[1].attrs().range_metadata["scale"], 10.0);
        let points = observer.0.lock().unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].series, "AMP01");
        Ok(())
    }

    #[test]
    fn unknown_channels_are_skipped() -> Result<()> {
        let config = config();
        let mut device = Device::default();
        let mut reference = Reference;

        let samples = CalibrationSweep::new(&mut device, &mut reference, &config, &Silent)
            .measure_range("AMP7", &[1.0])?;

        assert!(samples.is_empty());
        assert!(device.calls.is_empty());
        Ok(())
    }

    #[test]
    fn channel_grid_overrides_requested_setpoints() -> Result<()> {
        let config = config();
        let mut device = Device::default();
        let mut reference = Reference;

        let samples = CalibrationSweep::new(&mut device, &mut reference, &config, &Silent)
            .measure_range("AMP2", &[1.0])?;

        let expected = prepare_measurement_values(config.channels[2].grid.as_ref().unwrap());
        assert_eq!(samples.len(), expected.len());
        Ok(())
    }

    #[test]
    fn progress_is_shared_across_channels() -> Result<()> {
        let mut config = config();
        config.channels.truncate(2);
        let mut device = Device::default();
        let mut reference = Reference;
        let progress = Progress::default();

        let samples = CalibrationSweep::new(&mut device, &mut reference, &config, &Silent)
            .with_progress(progress.clone())
            .measure_all_ranges(&[-1.0, 0.0, 1.0])?;

        assert_eq!(samples.len(), 6);
        assert_eq!(progress.done(), 6);
        assert_eq!(progress.total(), 6);
        Ok(())
    }

    #[test]
    fn cleanup_runs_after_a_failure() {
        let config = config();
        let mut device = Device {
            fail_after: Some(1),
            ..Device::default()
        };
        let mut reference = Reference;

        let result = CalibrationSweep::new(&mut device, &mut reference, &config, &Silent)
            .guarded(|sweep| sweep.measure_range("AMP1", &[0.0, 1.0]));

        assert!(matches!(result, Err(Error::Hardware(_))));
        assert_eq!(
            device.calls[device.calls.len() - 3..],
            ["outputs false", "disconnect", "highpass false"]
        );
    }
}
