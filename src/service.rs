//! Entry points of the calibration core
//!
//! Each operation is started as a background task and returns its [`TaskHandle`] right away.
//! Hardware is reached through [`HardwareSlot`]s, so operations on the same unit run one after
//! the other however quickly they are requested.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::aggregate::aggregate;
use crate::artifacts::{ArtifactManager, CsvRenderer, Renderer};
use crate::autocal::{AutoCalOutcome, AutoCalibrationLoop};
use crate::coefficients::{CoefficientStore, Coefficients};
use crate::config::Config;
use crate::error::Error;
use crate::instrument::{
    status, MeasurementDevice, Observer, Oscilloscope, ReferenceInstrument, VoltageSource,
};
use crate::quality::Verdict;
use crate::routines::{TestOutcome, TestSuite, VoltageUnitRoutines};
use crate::session::CalibrationSession;
use crate::storage::{save_aggregated, save_raw};
use crate::sweep::{prepare_measurement_values, CalibrationSweep, Progress};
use crate::task::{self, HardwareSlot, TaskContext, TaskHandle};
use crate::types::RangeKey;
use crate::Result;

/// How a calibration folder is fitted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FitOptions {
    /// Use the stored aggregated tables instead of aggregating the raw data again
    pub from_aggregated: bool,
    /// Score the Gaussian process against the verification data
    pub verify: bool,
    /// Restrict the fit to one range
    pub range: Option<RangeKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    /// Verdict of the uncorrected measurement per range
    pub verdicts: BTreeMap<RangeKey, Verdict>,
    pub models: PathBuf,
    pub figures: Vec<PathBuf>,
}

/// Rows measured per range
pub type MeasureSummary = BTreeMap<RangeKey, usize>;

/// Calibration of a sampling unit against a reference instrument
pub struct SamplingService<D, R> {
    device: HardwareSlot<D>,
    reference: HardwareSlot<R>,
    config: Arc<Config>,
    folder: PathBuf,
    renderer: Arc<dyn Renderer>,
    reference_ip: Arc<Mutex<Option<String>>>,
    verified: Arc<AtomicBool>,
}

impl<D, R> SamplingService<D, R>
where
    D: MeasurementDevice + Send + 'static,
    R: ReferenceInstrument + Send + 'static,
{
    /// Service storing its data sets in `folder`
    pub fn new(
        device: HardwareSlot<D>,
        reference: HardwareSlot<R>,
        config: Config,
        folder: &Path,
    ) -> Self {
        let reference_ip = config.hardware.reference_ip.clone();
        Self {
            device,
            reference,
            config: Arc::new(config),
            folder: folder.to_path_buf(),
            renderer: Arc::new(CsvRenderer),
            reference_ip: Arc::new(Mutex::new(reference_ip)),
            verified: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Point the service at another reference instrument, which has to be verified again
    pub fn set_reference_ip(&self, ip: impl Into<String>) {
        let ip = ip.into();
        log::info!("reference instrument set to {ip}");
        *self.reference_ip.lock() = Some(ip);
        self.verified.store(false, Ordering::SeqCst);
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    fn input_timeout(&self) -> Duration {
        self.config.hardware.input_timeout()
    }

    fn require_ip(&self) -> Result<String> {
        self.reference_ip
            .lock()
            .clone()
            .ok_or_else(|| Error::configuration("no reference instrument address set"))
    }

    /// Check that the reference instrument answers at the configured address
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when no address is set.
    pub fn verify_instrument(&self) -> Result<TaskHandle<bool>> {
        let ip = self.require_ip()?;
        let reference = self.reference.clone();
        let verified = Arc::clone(&self.verified);
        task::spawn_with_timeout("verify instrument", self.input_timeout(), move |ctx| {
            let alive = reference.with_connected(|r| Ok(r.ping(&ip)))?;
            verified.store(alive, Ordering::SeqCst);
            if alive {
                status(ctx, &format!("reference instrument at {ip} answers"));
            } else {
                log::warn!("reference instrument at {ip} does not answer");
                ctx.log(&format!("no answer from {ip}"));
            }
            Ok(alive)
        })
    }

    /// Measure every channel into the raw data set, and a second time into the verification
    /// data set when `verify` is set
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when no reference address is set.
    pub fn run_calibration_measure(&self, verify: bool) -> Result<TaskHandle<MeasureSummary>> {
        self.require_ip()?;
        let job = self.measure_job();
        task::spawn_with_timeout("calibration measure", self.input_timeout(), move |ctx| {
            let progress = Progress::default();
            let mut summary = job.run(ctx, &progress, false)?;
            if verify {
                summary = job.run(ctx, &progress, true)?;
            }
            Ok(summary)
        })
    }

    /// Fit and score the data of the folder
    ///
    /// # Errors
    /// Returns an error if the task cannot be started.
    pub fn run_calibration_fit(&self, options: FitOptions) -> Result<TaskHandle<FitSummary>> {
        run_calibration_fit(
            &self.folder,
            Arc::clone(&self.config),
            Arc::clone(&self.renderer),
            options,
        )
    }

    /// Measure the verification data set again, then score the fits against it
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when no reference address is set.
    pub fn run_calibration_verify(&self) -> Result<TaskHandle<FitSummary>> {
        self.require_ip()?;
        let job = self.measure_job();
        let renderer = Arc::clone(&self.renderer);
        task::spawn_with_timeout("calibration verify", self.input_timeout(), move |ctx| {
            job.run(ctx, &Progress::default(), true)?;
            let options = FitOptions {
                verify: true,
                ..FitOptions::default()
            };
            fit_folder(&job.folder, &job.config, renderer.as_ref(), &options, ctx)
        })
    }

    fn measure_job(&self) -> MeasureJob<D, R> {
        MeasureJob {
            device: self.device.clone(),
            reference: self.reference.clone(),
            config: Arc::clone(&self.config),
            folder: self.folder.clone(),
        }
    }
}

struct MeasureJob<D, R> {
    device: HardwareSlot<D>,
    reference: HardwareSlot<R>,
    config: Arc<Config>,
    folder: PathBuf,
}

impl<D: MeasurementDevice, R: ReferenceInstrument> MeasureJob<D, R> {
    fn run(&self, ctx: &TaskContext, progress: &Progress, verify: bool) -> Result<MeasureSummary> {
        let files = &self.config.files;
        let (raw, aggregated) = if verify {
            (&files.raw_data_verify, &files.aggregated_verify)
        } else {
            (&files.raw_data, &files.aggregated)
        };
        let setpoints = prepare_measurement_values(&self.config.sweep.grid);
        status(
            ctx,
            &format!("measuring {raw} at {} setpoints per channel", setpoints.len()),
        );

        let samples = self.device.with_connected(|device| {
            self.reference.with_connected(|reference| {
                let mut sweep = CalibrationSweep::new(device, reference, &self.config.sweep, ctx)
                    .with_progress(progress.clone());
                sweep.guarded(|sweep| sweep.measure_all_ranges(&setpoints))
            })
        })?;

        save_raw(&self.folder.join(raw), &samples, false)?;
        let tables = aggregate(&samples);
        save_aggregated(&self.folder.join(aggregated), &tables)?;
        Ok(tables.iter().map(|(k, t)| (k.clone(), t.len())).collect())
    }
}

/// Fit and score the data of `folder`, no hardware is involved
///
/// # Errors
/// Returns an error if the task cannot be started.
pub fn run_calibration_fit(
    folder: &Path,
    config: Arc<Config>,
    renderer: Arc<dyn Renderer>,
    options: FitOptions,
) -> Result<TaskHandle<FitSummary>> {
    let folder = folder.to_path_buf();
    let input_timeout = config.hardware.input_timeout();
    task::spawn_with_timeout("calibration fit", input_timeout, move |ctx| {
        fit_folder(&folder, &config, renderer.as_ref(), &options, ctx)
    })
}

fn fit_folder(
    folder: &Path,
    config: &Config,
    renderer: &dyn Renderer,
    options: &FitOptions,
    ctx: &TaskContext,
) -> Result<FitSummary> {
    let mut session = CalibrationSession::open(folder, config, options.from_aggregated)?;
    if let Some(key) = &options.range {
        session.single_range(key)?;
    }
    if options.verify && !session.has_verify_data() {
        return Err(Error::configuration(format!(
            "no verification data in {}",
            folder.display()
        )));
    }

    status(ctx, &format!("fitting {} ranges", session.aggregated().len()));
    session.fit();
    session.analyze(options.verify);
    for report in session.reports().values() {
        for metrics in report.metrics.values() {
            ctx.log(&format!("{} {}: {}", report.key, metrics.verdict, metrics.message));
        }
    }
    let figures = session.render(renderer)?;
    let models = session.save_models()?;

    let verdicts = session
        .reports()
        .iter()
        .map(|(key, report)| (key.clone(), report.verdict()))
        .collect();
    Ok(FitSummary {
        verdicts,
        models,
        figures,
    })
}

/// Characterisation and auto-calibration of a voltage unit
pub struct VoltageUnitService<V, S> {
    unit: HardwareSlot<V>,
    scope: HardwareSlot<S>,
    config: Arc<Config>,
    artifacts: ArtifactManager,
    renderer: Arc<dyn Renderer>,
    store: Arc<Mutex<Option<CoefficientStore>>>,
    /// Snapshot of `store` taken when the last task finished
    published: Arc<Mutex<Option<Vec<(String, Coefficients)>>>>,
}

impl<V, S> VoltageUnitService<V, S>
where
    V: VoltageSource + Send + 'static,
    S: Oscilloscope + Send + 'static,
{
    /// Artifacts go to `calibration_vu<serial>` under the configured artifact root
    pub fn new(unit: HardwareSlot<V>, scope: HardwareSlot<S>, config: Config) -> Self {
        let artifacts = ArtifactManager::new(
            &config.hardware.artifact_root,
            "vu",
            config.hardware.serial,
            &config.files.figures,
        );
        Self {
            unit,
            scope,
            config: Arc::new(config),
            artifacts,
            renderer: Arc::new(CsvRenderer),
            store: Arc::new(Mutex::new(None)),
            published: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub const fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    /// Coefficients held in memory as of the last finished task, `None` before the unit was
    /// first used
    ///
    /// Does not wait for a running task.
    pub fn coefficients(&self) -> Option<Vec<(String, Coefficients)>> {
        self.published.lock().clone()
    }

    /// # Errors
    /// Returns an error if the artifact directory cannot be listed.
    pub fn collect_artifacts(&self) -> Result<Vec<PathBuf>> {
        self.artifacts.collect()
    }

    fn run<T, F>(&self, name: &str, job: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut VoltageUnitRoutines<'_, V, S>, &TaskContext) -> Result<T> + Send + 'static,
    {
        let unit = self.unit.clone();
        let scope = self.scope.clone();
        let config = Arc::clone(&self.config);
        let artifacts = self.artifacts.clone();
        let renderer = Arc::clone(&self.renderer);
        let store = Arc::clone(&self.store);
        let published = Arc::clone(&self.published);
        let input_timeout = self.config.hardware.input_timeout();
        task::spawn_with_timeout(name, input_timeout, move |ctx| {
            unit.with_connected(|unit| {
                scope.with_connected(|scope| {
                    let mut held = store.lock();
                    let store = held.get_or_insert_with(|| CoefficientStore::new(&unit.channels()));
                    artifacts.ensure()?;
                    let mut routines = VoltageUnitRoutines::new(
                        unit,
                        scope,
                        store,
                        &config.autocal,
                        &artifacts,
                        renderer.as_ref(),
                        ctx,
                    );
                    let result = job(&mut routines, ctx);
                    *published.lock() = Some(store.snapshot());
                    result
                })
            })
        })
    }

    /// # Errors
    /// Returns an error if the task cannot be started.
    pub fn read_coefficients(&self) -> Result<TaskHandle<Vec<(String, Coefficients)>>> {
        self.run("read coefficients", |routines, _| routines.read_coefficients())
    }

    /// # Errors
    /// Returns an error if the task cannot be started.
    pub fn reset_coefficients(&self) -> Result<TaskHandle<Vec<(String, Coefficients)>>> {
        self.run("reset coefficients", |routines, _| routines.reset_coefficients())
    }

    /// Replace the held coefficients of the given channels and persist all of them
    ///
    /// # Errors
    /// Returns an error if the task cannot be started.
    pub fn write_coefficients(
        &self,
        values: Vec<(String, Coefficients)>,
    ) -> Result<TaskHandle<Vec<(String, Coefficients)>>> {
        self.run("write coefficients", move |routines, _| {
            routines.set_coefficients(&values)?;
            routines.write_coefficients()?;
            Ok(routines.store().snapshot())
        })
    }

    /// # Errors
    /// Returns an error if the task cannot be started.
    pub fn test_outputs(&self) -> Result<TaskHandle<TestOutcome>> {
        self.run("output test", |routines, _| routines.output_test())
    }

    /// # Errors
    /// Returns an error if the task cannot be started.
    pub fn test_ramp(&self) -> Result<TaskHandle<TestOutcome>> {
        self.run("ramp test", |routines, _| routines.ramp_test())
    }

    /// # Errors
    /// Returns an error if the task cannot be started.
    pub fn test_transient(&self) -> Result<TaskHandle<TestOutcome>> {
        self.run("transient test", |routines, _| routines.transient_test())
    }

    /// # Errors
    /// Returns an error if the task cannot be started.
    pub fn test_all(&self) -> Result<TaskHandle<TestSuite>> {
        self.run("all tests", |routines, _| routines.test_all())
    }

    /// # Errors
    /// Returns an error if the task cannot be started.
    pub fn auto_calibrate(&self) -> Result<TaskHandle<AutoCalOutcome>> {
        let max_iterations = self.config.autocal.max_iterations;
        self.run("auto calibration", move |routines, ctx| {
            AutoCalibrationLoop::new(max_iterations, ctx).run(routines)
        })
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::sim::VoltageBench;

    #[test]
    fn held_coefficients_are_readable_while_a_task_holds_the_store() -> Result<()> {
        let tmp_dir = TempDir::new("service").unwrap();
        let bench = VoltageBench::new(&["CH1", "CH2"]).with_gain(0.99);
        let mut config = Config::default();
        config.hardware.artifact_root = tmp_dir.path().to_path_buf();
        let service = VoltageUnitService::new(
            HardwareSlot::connected(bench.unit()),
            HardwareSlot::connected(bench.scope()),
            config,
        );
        assert!(service.coefficients().is_none());
        assert!(service.test_ramp()?.join().ok);

        let busy = service.store.lock();
        let held = service.coefficients().unwrap();
        assert_eq!(held.len(), 2);
        approx::assert_relative_eq!(held[0].1.slope, 1.0 / 0.99, epsilon = 1e-4);
        drop(busy);
        Ok(())
    }
}
