use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Identifies one calibration context
///
/// Ordering is lexicographic over `(mode, channel_id, sub_range_id)`, which fixes the iteration
/// order of every map keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct RangeKey {
    pub mode: bool,
    pub channel_id: String,
    pub sub_range_id: String,
}

impl RangeKey {
    pub fn new(mode: bool, channel_id: impl Into<String>, sub_range_id: impl Into<String>) -> Self {
        Self {
            mode,
            channel_id: channel_id.into(),
            sub_range_id: sub_range_id.into(),
        }
    }

    /// File name stem, `<mode>_<channel>_<range>`
    pub fn stem(&self) -> String {
        format!("{}_{}_{}", self.mode, self.channel_id, self.sub_range_id)
    }
}

/// Parses `<mode>/<channel>/<range>`, e.g. `false/AMP1/0`
impl FromStr for RangeKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s.split('/').collect::<Vec<_>>();
        let [mode, channel, range] = parts.as_slice() else {
            return Err(Error::configuration(format!(
                "range `{s}` is not of the form <mode>/<channel>/<range>"
            )));
        };
        let mode = mode
            .parse::<bool>()
            .map_err(|_| Error::configuration(format!("invalid mode `{mode}` in range `{s}`")))?;
        Ok(Self::new(mode, *channel, *range))
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(mode={}, channel={}, range={})",
            self.mode, self.channel_id, self.sub_range_id
        )
    }
}

/// Free form numeric description of a range, e.g. its nominal gain
pub type RangeMetadata = BTreeMap<String, f64>;

/// Conditions under which a burst was captured
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SampleAttrs {
    pub setpoint: f64,
    pub reference_value: f64,
    pub mode: bool,
    pub channel_id: String,
    pub sub_range_id: String,
    pub temperature_device: f64,
    pub temperature_reference: f64,
    #[serde(default)]
    pub range_metadata: RangeMetadata,
}

impl SampleAttrs {
    pub fn range_key(&self) -> RangeKey {
        RangeKey::new(self.mode, &self.channel_id, &self.sub_range_id)
    }
}

/// One repeated-measurement burst at a single setpoint
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    time: Vec<f64>,
    signal: Vec<f64>,
    attrs: SampleAttrs,
}

impl RawSample {
    /// # Errors
    /// Returns [`Error::Configuration`] if the burst is empty or `time` and `signal` differ in
    /// length.
    pub fn new(time: Vec<f64>, signal: Vec<f64>, attrs: SampleAttrs) -> Result<Self> {
        if signal.is_empty() {
            return Err(Error::configuration(format!(
                "empty burst at setpoint {} on {}",
                attrs.setpoint,
                attrs.range_key()
            )));
        }
        if time.len() != signal.len() {
            return Err(Error::configuration(format!(
                "burst has {} time stamps for {} samples",
                time.len(),
                signal.len()
            )));
        }
        Ok(Self {
            time,
            signal,
            attrs,
        })
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn signal(&self) -> &[f64] {
        &self.signal
    }

    pub const fn attrs(&self) -> &SampleAttrs {
        &self.attrs
    }
}

/// Summary of one burst
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AggregatedRow {
    pub setpoint: f64,
    pub reference_value: f64,
    pub measured_mean: f64,
    pub measured_std: f64,
    pub measured_max: f64,
    pub measured_min: f64,
    /// `reference_value - measured_mean`
    pub error: f64,
}

/// All rows of one [`RangeKey`], sorted by ascending setpoint
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedTable {
    key: RangeKey,
    metadata: RangeMetadata,
    rows: Vec<AggregatedRow>,
}

impl AggregatedTable {
    /// Sorts `rows` by setpoint, rows with equal setpoints keep their relative order
    pub fn new(key: RangeKey, metadata: RangeMetadata, mut rows: Vec<AggregatedRow>) -> Self {
        rows.sort_by(|a, b| a.setpoint.total_cmp(&b.setpoint));
        Self {
            key,
            metadata,
            rows,
        }
    }

    pub const fn key(&self) -> &RangeKey {
        &self.key
    }

    pub const fn metadata(&self) -> &RangeMetadata {
        &self.metadata
    }

    pub fn rows(&self) -> &[AggregatedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn setpoints(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.setpoint).collect()
    }

    pub fn reference_values(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.reference_value).collect()
    }

    pub fn measured_means(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.measured_mean).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_keys_parse_from_slash_form() -> Result<()> {
        let key: RangeKey = "true/AMP01/3".parse()?;
        assert_eq!(key, RangeKey::new(true, "AMP01", "3"));
        assert_eq!(key.stem(), "true_AMP01_3");
        assert!("AMP01/3".parse::<RangeKey>().is_err());
        assert!("yes/AMP01/3".parse::<RangeKey>().is_err());
        Ok(())
    }

    fn row(setpoint: f64) -> AggregatedRow {
        AggregatedRow {
            setpoint,
            reference_value: setpoint,
            measured_mean: setpoint,
            measured_std: 0.0,
            measured_max: setpoint,
            measured_min: setpoint,
            error: 0.0,
        }
    }

    #[test]
    fn range_keys_order_lexicographically() {
        let mut keys = vec![
            RangeKey::new(true, "AMP1", "0"),
            RangeKey::new(false, "AMP2", "0"),
            RangeKey::new(false, "AMP01", "1"),
            RangeKey::new(false, "AMP01", "0"),
        ];
        keys.sort();
        assert_eq!(
            keys.iter().map(RangeKey::stem).collect::<Vec<_>>(),
            vec!["false_AMP01_0", "false_AMP01_1", "false_AMP2_0", "true_AMP1_0"]
        );
    }

    #[test]
    fn tables_are_sorted_by_setpoint() {
        let table = AggregatedTable::new(
            RangeKey::new(false, "AMP1", "0"),
            RangeMetadata::new(),
            vec![row(0.5), row(-1.0), row(0.0)],
        );
        assert_eq!(table.setpoints(), vec![-1.0, 0.0, 0.5]);
    }

    #[test]
    fn empty_bursts_are_rejected() {
        let attrs = SampleAttrs {
            setpoint: 0.0,
            reference_value: 0.0,
            mode: false,
            channel_id: "AMP1".to_owned(),
            sub_range_id: "0".to_owned(),
            temperature_device: 25.0,
            temperature_reference: 25.0,
            range_metadata: RangeMetadata::new(),
        };
        assert!(RawSample::new(vec![], vec![], attrs.clone()).is_err());
        assert!(RawSample::new(vec![0.0], vec![1.0, 2.0], attrs).is_err());
    }
}
