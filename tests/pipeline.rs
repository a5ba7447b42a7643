use std::collections::BTreeMap;
use std::fs;

use approx::assert_relative_eq;
use tempdir::TempDir;

use unitcal::aggregate::aggregate;
use unitcal::config::{Config, SetpointGrid};
use unitcal::fitter::{ModelSummary, ModelVariant};
use unitcal::instrument::Silent;
use unitcal::service::{FitOptions, SamplingService};
use unitcal::sim::{SamplingBench, SimulatedReference, SimulatedSamplingUnit};
use unitcal::storage::{load_aggregated, load_raw, save_raw};
use unitcal::sweep::{prepare_measurement_values, CalibrationSweep};
use unitcal::task::HardwareSlot;
use unitcal::types::RangeKey;
use unitcal::{Error, Result};

const GAIN: f64 = 1.02;
const OFFSET: f64 = 0.01;

fn small_config() -> Config {
    let mut config = Config::default();
    config.sweep.burst_duration = 0.01;
    config.sweep.grid = SetpointGrid {
        max_value: 1.0,
        decades: 2.0,
        delta_log: 0.5,
        delta_lin: 0.25,
    };
    for channel in &mut config.sweep.channels {
        channel.grid = None;
    }
    config.fit.variants = vec![
        ModelVariant::Linear,
        ModelVariant::Cubic,
        ModelVariant::Spline,
        ModelVariant::GaussianProcess,
    ];
    config
}

type SimService = SamplingService<SimulatedSamplingUnit, SimulatedReference>;

fn service(bench: &SamplingBench, dir: &TempDir) -> SimService {
    SamplingService::new(
        HardwareSlot::connected(bench.unit()),
        HardwareSlot::connected(bench.reference()),
        small_config(),
        dir.path(),
    )
}

fn exported_models(dir: &TempDir) -> Result<BTreeMap<String, BTreeMap<String, ModelSummary>>> {
    let contents = fs::read_to_string(dir.path().join("models.toml"))?;
    Ok(toml::from_str(&contents)?)
}

#[test]
fn sweep_output_survives_storage() -> Result<()> {
    let tmp_dir = TempDir::new("pipeline").unwrap();
    let config = small_config();
    let bench = SamplingBench::new(GAIN, OFFSET).with_noise(1e-4, 40);
    let mut unit = bench.unit();
    let mut reference = bench.reference();

    let setpoints = prepare_measurement_values(&config.sweep.grid);
    let samples = CalibrationSweep::new(&mut unit, &mut reference, &config.sweep, &Silent)
        .guarded(|sweep| sweep.measure_all_ranges(&setpoints))?;
    assert_eq!(samples.len(), setpoints.len() * config.sweep.channels.len());

    let raw_dir = tmp_dir.path().join("raw_data");
    save_raw(&raw_dir, &samples, false)?;
    let reloaded = load_raw(&raw_dir)?;
    assert_eq!(reloaded.len(), samples.len());

    let tables = aggregate(&reloaded);
    assert_eq!(tables.len(), 3);
    let amp1 = &tables[&RangeKey::new(false, "AMP1", "0")];
    assert_eq!(amp1.len(), setpoints.len());
    Ok(())
}

#[test]
fn measured_unit_fits_to_its_inverse() -> Result<()> {
    let tmp_dir = TempDir::new("pipeline").unwrap();
    let bench = SamplingBench::new(GAIN, OFFSET);
    let service = service(&bench, &tmp_dir);
    service.set_reference_ip("192.168.1.20");

    let verified = service.verify_instrument()?.join();
    assert_eq!(verified.data, Some(true));
    assert!(service.is_verified());

    let measured = service.run_calibration_measure(false)?.join();
    assert!(measured.ok, "{}", measured.message);
    let rows = measured.data.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(tmp_dir.path().join("raw_data").is_dir());
    assert_eq!(load_aggregated(&tmp_dir.path().join("aggregated"))?.len(), 3);

    let fitted = service.run_calibration_fit(FitOptions::default())?.join();
    assert!(fitted.ok, "{}", fitted.message);
    let summary = fitted.data.unwrap();
    assert_eq!(summary.verdicts.len(), 3);
    assert_eq!(summary.figures.len(), 3);

    let models = exported_models(&tmp_dir)?;
    let ModelSummary::Linear { k, d } = models["false_AMP1_0"]["Linear"] else {
        panic!("linear model exported as {:?}", models["false_AMP1_0"]["Linear"]);
    };
    assert_relative_eq!(k, 1.0 / GAIN, epsilon = 1e-9);
    assert_relative_eq!(d, -OFFSET / GAIN, epsilon = 1e-9);
    assert!(models["false_AMP01_0"].contains_key("GP"));
    Ok(())
}

#[test]
fn verification_data_is_measured_and_scored() -> Result<()> {
    let tmp_dir = TempDir::new("pipeline").unwrap();
    let bench = SamplingBench::new(GAIN, OFFSET).with_noise(1e-5, 40);
    let service = service(&bench, &tmp_dir);
    service.set_reference_ip("192.168.1.20");

    let without = service
        .run_calibration_fit(FitOptions {
            verify: true,
            ..FitOptions::default()
        })?
        .join();
    assert!(!without.ok);

    let measured = service.run_calibration_measure(false)?.join();
    assert!(measured.ok, "{}", measured.message);
    let verified = service.run_calibration_verify()?.join();
    assert!(verified.ok, "{}", verified.message);
    assert!(tmp_dir.path().join("raw_data_verify").is_dir());
    assert!(tmp_dir.path().join("aggregated_verify").is_dir());
    assert_eq!(verified.data.unwrap().verdicts.len(), 3);
    Ok(())
}

#[test]
fn measuring_with_verification_writes_both_sets() -> Result<()> {
    let tmp_dir = TempDir::new("pipeline").unwrap();
    let bench = SamplingBench::new(GAIN, OFFSET).with_noise(1e-5, 40);
    let service = service(&bench, &tmp_dir);
    service.set_reference_ip("192.168.1.20");

    let measured = service.run_calibration_measure(true)?.join();
    assert!(measured.ok, "{}", measured.message);
    for dir in ["raw_data", "raw_data_verify"] {
        assert!(tmp_dir.path().join(dir).is_dir(), "{dir} missing");
    }
    assert_eq!(load_aggregated(&tmp_dir.path().join("aggregated"))?.len(), 3);
    assert_eq!(load_aggregated(&tmp_dir.path().join("aggregated_verify"))?.len(), 3);

    let fitted = service
        .run_calibration_fit(FitOptions {
            verify: true,
            ..FitOptions::default()
        })?
        .join();
    assert!(fitted.ok, "{}", fitted.message);
    assert_eq!(fitted.data.unwrap().verdicts.len(), 3);
    Ok(())
}

#[test]
fn single_range_fit_from_aggregated_tables() -> Result<()> {
    let tmp_dir = TempDir::new("pipeline").unwrap();
    let bench = SamplingBench::new(GAIN, OFFSET);
    let service = service(&bench, &tmp_dir);
    service.set_reference_ip("192.168.1.20");
    assert!(service.run_calibration_measure(false)?.join().ok);

    let key: RangeKey = "false/AMP2/0".parse()?;
    let fitted = service
        .run_calibration_fit(FitOptions {
            from_aggregated: true,
            verify: false,
            range: Some(key.clone()),
        })?
        .join();
    assert!(fitted.ok, "{}", fitted.message);
    let verdicts = fitted.data.unwrap().verdicts;
    assert_eq!(verdicts.keys().collect::<Vec<_>>(), vec![&key]);

    let unknown = service
        .run_calibration_fit(FitOptions {
            range: Some(RangeKey::new(true, "AMP2", "0")),
            ..FitOptions::default()
        })?
        .join();
    assert!(!unknown.ok);
    Ok(())
}

#[test]
fn measuring_needs_a_reference_address() {
    let tmp_dir = TempDir::new("pipeline").unwrap();
    let bench = SamplingBench::new(GAIN, OFFSET);
    let service = service(&bench, &tmp_dir);

    assert!(matches!(
        service.run_calibration_measure(false),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        service.verify_instrument(),
        Err(Error::Configuration(_))
    ));

    service.set_reference_ip("10.0.0.2");
    assert!(service.verify_instrument().unwrap().join().ok);
    assert!(service.is_verified());
    service.set_reference_ip("10.0.0.3");
    assert!(!service.is_verified());
}
