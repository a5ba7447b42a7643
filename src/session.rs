//! Offline processing of one calibration folder
//!
//! A folder holds the raw and aggregated data sets named in [`FileNames`], with optional
//! verification counterparts measured independently of the calibration data. A session loads
//! them, fits every configured model per range, scores the fits and writes the results back
//! into the folder.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::aggregate::aggregate;
use crate::artifacts::{ArtifactManager, Renderer};
use crate::coefficients::{CoefficientStore, Coefficients};
use crate::config::{Config, FileNames};
use crate::error::Error;
use crate::fitter::{FittedModel, ModelFitter, ModelSet, ModelSummary, ModelVariant};
use crate::quality::{QualityAnalyzer, RangeReport, Verdict};
use crate::storage::{load_aggregated, load_raw, save_aggregated};
use crate::types::{AggregatedTable, RangeKey};
use crate::Result;

pub struct CalibrationSession {
    folder: PathBuf,
    config: Config,
    aggregated: BTreeMap<RangeKey, AggregatedTable>,
    aggregated_verify: BTreeMap<RangeKey, AggregatedTable>,
    models: BTreeMap<RangeKey, ModelSet>,
    reports: BTreeMap<RangeKey, RangeReport>,
}

impl CalibrationSession {
    /// Load the calibration data of `folder`
    ///
    /// With `from_aggregated` the stored aggregated tables are used as they are, otherwise the
    /// raw bursts are aggregated again and the aggregated data set is rewritten. Verification
    /// data is loaded the same way when present.
    ///
    /// # Errors
    /// Returns an error if the calibration data cannot be read.
    pub fn open(folder: &Path, config: &Config, from_aggregated: bool) -> Result<Self> {
        let files = &config.files;
        let aggregated = Self::load(folder, &files.raw_data, &files.aggregated, from_aggregated)?
            .ok_or_else(|| {
                Error::configuration(format!("no calibration data in {}", folder.display()))
            })?;
        let aggregated_verify = Self::load(
            folder,
            &files.raw_data_verify,
            &files.aggregated_verify,
            from_aggregated,
        )?
        .unwrap_or_default();
        log::info!(
            "opened {} with {} ranges ({} with verification data)",
            folder.display(),
            aggregated.len(),
            aggregated_verify.len()
        );

        Ok(Self {
            folder: folder.to_path_buf(),
            config: config.clone(),
            aggregated,
            aggregated_verify,
            models: BTreeMap::new(),
            reports: BTreeMap::new(),
        })
    }

    fn load(
        folder: &Path,
        raw: &str,
        aggregated: &str,
        from_aggregated: bool,
    ) -> Result<Option<BTreeMap<RangeKey, AggregatedTable>>> {
        let aggregated_dir = folder.join(aggregated);
        if from_aggregated {
            return if aggregated_dir.is_dir() {
                load_aggregated(&aggregated_dir).map(Some)
            } else {
                Ok(None)
            };
        }

        let raw_dir = folder.join(raw);
        if !raw_dir.is_dir() {
            return Ok(None);
        }
        let tables = aggregate(&load_raw(&raw_dir)?);
        save_aggregated(&aggregated_dir, &tables)?;
        Ok(Some(tables))
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn files(&self) -> &FileNames {
        &self.config.files
    }

    pub fn aggregated(&self) -> &BTreeMap<RangeKey, AggregatedTable> {
        &self.aggregated
    }

    pub fn has_verify_data(&self) -> bool {
        !self.aggregated_verify.is_empty()
    }

    pub fn models(&self) -> &BTreeMap<RangeKey, ModelSet> {
        &self.models
    }

    pub fn reports(&self) -> &BTreeMap<RangeKey, RangeReport> {
        &self.reports
    }

    /// Restrict the session to a single range
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the range was not measured.
    pub fn single_range(&mut self, key: &RangeKey) -> Result<()> {
        if !self.aggregated.contains_key(key) {
            return Err(Error::configuration(format!("range {key} was not measured")));
        }
        self.aggregated.retain(|k, _| k == key);
        self.aggregated_verify.retain(|k, _| k == key);
        self.models.retain(|k, _| k == key);
        self.reports.retain(|k, _| k == key);
        Ok(())
    }

    /// Fit the configured model variants to every range
    pub fn fit(&mut self) -> &BTreeMap<RangeKey, ModelSet> {
        let fitter = ModelFitter::new(&self.config.fit);
        self.models = fitter.fit_all(&self.aggregated, &self.config.fit.variants);
        &self.models
    }

    /// Score every range, against its verification data too when `verify` is set
    pub fn analyze(&mut self, verify: bool) -> &BTreeMap<RangeKey, RangeReport> {
        let analyzer = QualityAnalyzer::new(self.config.quality);
        let empty = ModelSet::new();
        self.reports = self
            .aggregated
            .iter()
            .map(|(key, table)| {
                let models = self.models.get(key).unwrap_or(&empty);
                let verify_table = verify.then(|| self.aggregated_verify.get(key)).flatten();
                if verify && verify_table.is_none() {
                    log::warn!("no verification data for {key}");
                }
                let report = analyzer.analyze_range(table, models, verify_table);
                for metrics in report.metrics.values() {
                    match metrics.verdict {
                        Verdict::Ok => log::info!("{key}: {}", metrics.message),
                        Verdict::Warn => log::warn!("{key}: {}", metrics.message),
                        Verdict::Error => log::error!("{key}: {}", metrics.message),
                    }
                }
                (key.clone(), report)
            })
            .collect();
        &self.reports
    }

    /// Write the diagnostic figure of every analysed range
    ///
    /// # Errors
    /// Returns an error if a figure cannot be written.
    pub fn render(&self, renderer: &dyn Renderer) -> Result<Vec<PathBuf>> {
        let artifacts = ArtifactManager::in_folder(&self.folder, &self.config.files.figures);
        artifacts.ensure()?;
        self.reports
            .values()
            .map(|report| {
                let path = artifacts.range_plot_path(&report.key);
                renderer.render(&report.figure(), &path)
            })
            .collect()
    }

    /// Write the parameters of every fitted model to the models file of the folder
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_models(&self) -> Result<PathBuf> {
        let export = self
            .models
            .iter()
            .map(|(key, models)| {
                let summaries = models
                    .iter()
                    .map(|(variant, model)| (variant.label().to_owned(), model.summary()))
                    .collect::<BTreeMap<_, _>>();
                (key.stem(), summaries)
            })
            .collect::<BTreeMap<String, BTreeMap<String, ModelSummary>>>();
        let path = self.folder.join(&self.config.files.models);
        fs::write(&path, toml::to_string(&export)?)?;
        log::info!("stored models of {} ranges in {}", export.len(), path.display());
        Ok(path)
    }

    /// Take over the linear fit as correction coefficients
    ///
    /// Only channels measured in exactly one range are adopted, a channel with several ranges
    /// has no single correction. Returns the channels that were updated.
    ///
    /// # Errors
    /// Returns an error only for inconsistencies in `store` itself.
    pub fn adopt_linear_fits(&self, store: &mut CoefficientStore) -> Result<Vec<String>> {
        let mut per_channel: BTreeMap<&str, Vec<&ModelSet>> = BTreeMap::new();
        for (key, models) in &self.models {
            per_channel.entry(&key.channel_id).or_default().push(models);
        }

        let mut adopted = vec![];
        for (channel, sets) in per_channel {
            if !store.channels().iter().any(|c| c == channel) {
                log::debug!("{channel} has no correction coefficients");
                continue;
            }
            let [models] = sets.as_slice() else {
                log::warn!("{channel} was measured in {} ranges, not adopted", sets.len());
                continue;
            };
            if let Some(FittedModel::Linear { k, d }) = models.get(&ModelVariant::Linear) {
                store.set(channel, Coefficients { slope: *k, offset: *d })?;
                adopted.push(channel.to_owned());
            }
        }
        Ok(adopted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempdir::TempDir;

    use crate::storage::save_raw;
    use crate::types::{RangeMetadata, RawSample, SampleAttrs};

    fn burst(channel: &str, sub_range: &str, reference: f64, measured: f64) -> RawSample {
        RawSample::new(
            vec![0.0, 1e-4],
            vec![measured, measured],
            SampleAttrs {
                setpoint: reference,
                reference_value: reference,
                mode: false,
                channel_id: channel.to_owned(),
                sub_range_id: sub_range.to_owned(),
                temperature_device: 25.0,
                temperature_reference: 23.0,
                range_metadata: RangeMetadata::new(),
            },
        )
        .unwrap()
    }

    fn linear_config() -> Config {
        let mut config = Config::default();
        config.fit.variants = vec![ModelVariant::Linear, ModelVariant::Cubic];
        config
    }

    fn write_folder(dir: &Path, config: &Config) -> Result<()> {
        let mut samples = vec![];
        for i in -4..=4 {
            let reference = f64::from(i) * 0.25;
            samples.push(burst("AMP1", "0", reference, (reference - 0.01) / 1.02));
            samples.push(burst("AMP2", "0", reference, reference));
            samples.push(burst("AMP2", "1", reference, reference));
        }
        save_raw(&dir.join(&config.files.raw_data), &samples, false)
    }

    #[test]
    fn fit_analyze_and_export() -> Result<()> {
        let tmp_dir = TempDir::new("session").unwrap();
        let config = linear_config();
        write_folder(tmp_dir.path(), &config)?;

        let mut session = CalibrationSession::open(tmp_dir.path(), &config, false)?;
        assert!(tmp_dir.path().join("aggregated").is_dir());
        assert!(!session.has_verify_data());

        session.fit();
        let reports = session.analyze(false);
        assert_eq!(reports.len(), 3);

        let models = session.save_models()?;
        let exported: BTreeMap<String, BTreeMap<String, ModelSummary>> =
            toml::from_str(&fs::read_to_string(models)?)?;
        assert_eq!(exported.len(), 3);
        let ModelSummary::Linear { k, d } = exported["false_AMP1_0"]["Linear"] else {
            panic!("linear model exported as {:?}", exported["false_AMP1_0"]["Linear"]);
        };
        approx::assert_relative_eq!(k, 1.02, epsilon = 1e-9);
        approx::assert_relative_eq!(d, 0.01, epsilon = 1e-9);
        assert!(matches!(
            exported["false_AMP2_1"]["Cubic"],
            ModelSummary::Cubic { .. }
        ));

        let figures = session.render(&crate::artifacts::CsvRenderer)?;
        assert_eq!(figures.len(), 3);
        Ok(())
    }

    #[test]
    fn single_range_rejects_unknown_ranges() -> Result<()> {
        let tmp_dir = TempDir::new("session").unwrap();
        let config = linear_config();
        write_folder(tmp_dir.path(), &config)?;
        let mut session = CalibrationSession::open(tmp_dir.path(), &config, false)?;

        assert!(session
            .single_range(&RangeKey::new(true, "AMP1", "0"))
            .is_err());
        session.single_range(&RangeKey::new(false, "AMP2", "1"))?;
        assert_eq!(session.aggregated().len(), 1);
        Ok(())
    }

    #[test]
    fn reopening_from_aggregated_data() -> Result<()> {
        let tmp_dir = TempDir::new("session").unwrap();
        let config = linear_config();
        write_folder(tmp_dir.path(), &config)?;
        let first = CalibrationSession::open(tmp_dir.path(), &config, false)?;
        let second = CalibrationSession::open(tmp_dir.path(), &config, true)?;
        assert_eq!(first.aggregated(), second.aggregated());
        Ok(())
    }

    #[test]
    fn linear_fits_are_adopted_for_single_range_channels() -> Result<()> {
        let tmp_dir = TempDir::new("session").unwrap();
        let config = linear_config();
        write_folder(tmp_dir.path(), &config)?;
        let mut session = CalibrationSession::open(tmp_dir.path(), &config, false)?;
        session.fit();

        let mut store = CoefficientStore::new(&["AMP1", "AMP2"]);
        let adopted = session.adopt_linear_fits(&mut store)?;

        assert_eq!(adopted, vec!["AMP1"]);
        let c = store.get("AMP1")?;
        approx::assert_relative_eq!(c.slope, 1.02, epsilon = 1e-9);
        approx::assert_relative_eq!(c.offset, 0.01, epsilon = 1e-9);
        assert_eq!(store.get("AMP2")?, Coefficients::default());
        Ok(())
    }
}
