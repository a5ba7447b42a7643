use std::collections::BTreeMap;

use crate::math::{mean, std_dev};
use crate::types::{AggregatedRow, AggregatedTable, RangeKey, RawSample};

/// Reduce one burst to its summary statistics
pub fn summarise(sample: &RawSample) -> AggregatedRow {
    let signal = sample.signal();
    let attrs = sample.attrs();
    let measured_mean = mean(signal);
    AggregatedRow {
        setpoint: attrs.setpoint,
        reference_value: attrs.reference_value,
        measured_mean,
        measured_std: std_dev(signal),
        measured_max: signal.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        measured_min: signal.iter().copied().fold(f64::INFINITY, f64::min),
        error: attrs.reference_value - measured_mean,
    }
}

/// Group bursts by [`RangeKey`] and summarise each of them
///
/// Every burst yields exactly one row, bursts at identical setpoints are not merged. The range
/// metadata of a table is taken from the first burst of its group.
pub fn aggregate(samples: &[RawSample]) -> BTreeMap<RangeKey, AggregatedTable> {
    let mut groups: BTreeMap<RangeKey, Vec<&RawSample>> = BTreeMap::new();
    for sample in samples {
        groups
            .entry(sample.attrs().range_key())
            .or_default()
            .push(sample);
    }

    groups
        .into_iter()
        .map(|(key, group)| {
            let metadata = group[0].attrs().range_metadata.clone();
            let rows = group.iter().map(|s| summarise(s)).collect();
            log::debug!("aggregated {} bursts for {key}", group.len());
            (key.clone(), AggregatedTable::new(key, metadata, rows))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::types::{RangeMetadata, SampleAttrs};

    fn burst(channel: &str, setpoint: f64, signal: Vec<f64>) -> RawSample {
        let time = (0..signal.len()).map(|i| i as f64 * 1e-4).collect();
        RawSample::new(
            time,
            signal,
            SampleAttrs {
                setpoint,
                reference_value: setpoint,
                mode: false,
                channel_id: channel.to_owned(),
                sub_range_id: "0".to_owned(),
                temperature_device: 30.0,
                temperature_reference: 23.0,
                range_metadata: RangeMetadata::from([("range".to_owned(), 1.0)]),
            },
        )
        .unwrap()
    }

    #[test]
    fn burst_statistics_are_computed() {
        let row = summarise(&burst("AMP1", 1.0, vec![0.9, 1.0, 1.1, 1.0]));
        approx::assert_relative_eq!(row.measured_mean, 1.0, max_relative = 1e-12);
        approx::assert_relative_eq!(row.measured_max, 1.1);
        approx::assert_relative_eq!(row.measured_min, 0.9);
        approx::assert_relative_eq!(row.measured_std, (0.02f64 / 3.0).sqrt(), max_relative = 1e-9);
        approx::assert_abs_diff_eq!(row.error, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn error_is_reference_minus_mean() {
        let row = summarise(&burst("AMP1", 0.5, vec![0.498; 10]));
        approx::assert_relative_eq!(row.error, 0.002, max_relative = 1e-9);
    }

    #[test]
    fn bursts_are_grouped_by_key() {
        let samples = vec![
            burst("AMP2", 0.0, vec![0.0]),
            burst("AMP1", 1.0, vec![1.0]),
            burst("AMP1", -1.0, vec![-1.0]),
            burst("AMP1", 1.0, vec![1.0]),
        ];
        let tables = aggregate(&samples);
        assert_eq!(tables.len(), 2);
        let amp1 = &tables[&RangeKey::new(false, "AMP1", "0")];
        assert_eq!(amp1.setpoints(), vec![-1.0, 1.0, 1.0]);
        assert_eq!(amp1.metadata()["range"], 1.0);
        assert!(aggregate(&[]).is_empty());
    }

    proptest! {
        #[test]
        fn output_is_sorted_and_complete(
            bursts in prop::collection::vec((0usize..3, -10.0f64..10.0), 0..30)
        ) {
            let channels = ["AMP01", "AMP1", "AMP2"];
            let samples = bursts
                .iter()
                .map(|(ch, sp)| burst(channels[*ch], *sp, vec![*sp, sp + 1e-3]))
                .collect::<Vec<_>>();

            let tables = aggregate(&samples);

            for (key, table) in &tables {
                let expected = samples
                    .iter()
                    .filter(|s| &s.attrs().range_key() == key)
                    .count();
                prop_assert_eq!(table.len(), expected);
                prop_assert!(table.setpoints().windows(2).all(|w| w[0] <= w[1]));
            }
            let rows = tables.values().map(AggregatedTable::len).sum::<usize>();
            prop_assert_eq!(rows, samples.len());
        }
    }
}
