//! On-disk layout of measured and aggregated data
//!
//! A raw data set is a directory holding `samples.csv` (one line per sample, tagged with the
//! index of its burst) and `attrs.toml` (the attributes of every burst, in the same order).
//! An aggregated data set is a directory with one `<mode>_<channel>_<range>.csv` table per
//! [`RangeKey`] and a `.toml` header of the same stem carrying the key and range metadata, so
//! tables can be reloaded without the raw data.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{AggregatedRow, AggregatedTable, RangeKey, RangeMetadata, RawSample, SampleAttrs};
use crate::Result;

const SAMPLES_FILE: &str = "samples.csv";
const ATTRS_FILE: &str = "attrs.toml";

#[derive(Deserialize, Serialize)]
struct SampleRow {
    burst: usize,
    time: f64,
    signal: f64,
}

#[derive(Default, Deserialize, Serialize)]
struct BurstIndex {
    #[serde(default)]
    burst: Vec<SampleAttrs>,
}

#[derive(Deserialize, Serialize)]
struct TableHeader {
    key: RangeKey,
    #[serde(default)]
    metadata: RangeMetadata,
}

/// Write raw bursts to `dir`, after any bursts already stored there when `append` is set
///
/// # Errors
/// Returns an error if existing data cannot be read back or the files cannot be written.
pub fn save_raw(dir: &Path, samples: &[RawSample], append: bool) -> Result<()> {
    let mut all = if append && dir.join(ATTRS_FILE).exists() {
        load_raw(dir)?
    } else {
        vec![]
    };
    all.extend_from_slice(samples);

    fs::create_dir_all(dir)?;
    let mut wtr = csv::Writer::from_path(dir.join(SAMPLES_FILE))?;
    for (burst, sample) in all.iter().enumerate() {
        for (time, signal) in sample.time().iter().zip(sample.signal()) {
            wtr.serialize(SampleRow {
                burst,
                time: *time,
                signal: *signal,
            })?;
        }
    }
    wtr.flush()?;

    let index = BurstIndex {
        burst: all.iter().map(|s| s.attrs().clone()).collect(),
    };
    fs::write(dir.join(ATTRS_FILE), toml::to_string(&index)?)?;
    log::info!("stored {} bursts in {}", all.len(), dir.display());
    Ok(())
}

/// # Errors
/// Returns an error if either file is missing or malformed, or a burst has no samples.
pub fn load_raw(dir: &Path) -> Result<Vec<RawSample>> {
    let index: BurstIndex = toml::from_str(&fs::read_to_string(dir.join(ATTRS_FILE))?)?;
    let mut time = vec![vec![]; index.burst.len()];
    let mut signal = vec![vec![]; index.burst.len()];

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(dir.join(SAMPLES_FILE))?;
    for result in rdr.deserialize() {
        let row: SampleRow = result?;
        let (Some(t), Some(s)) = (time.get_mut(row.burst), signal.get_mut(row.burst)) else {
            return Err(Error::configuration(format!(
                "sample refers to unknown burst {} in {}",
                row.burst,
                dir.display()
            )));
        };
        t.push(row.time);
        s.push(row.signal);
    }

    index
        .burst
        .into_iter()
        .zip(time.into_iter().zip(signal))
        .map(|(attrs, (time, signal))| RawSample::new(time, signal, attrs))
        .collect()
}

/// Replace the aggregated data set in `dir`
///
/// # Errors
/// Returns an error if the directory cannot be cleared or written.
pub fn save_aggregated(dir: &Path, tables: &BTreeMap<RangeKey, AggregatedTable>) -> Result<()> {
    if dir.exists() {
        for path in data_files(dir, "toml")?.into_iter().chain(data_files(dir, "csv")?) {
            fs::remove_file(path)?;
        }
    }
    fs::create_dir_all(dir)?;

    for (key, table) in tables {
        let stem = key.stem();
        let header = TableHeader {
            key: key.clone(),
            metadata: table.metadata().clone(),
        };
        fs::write(dir.join(format!("{stem}.toml")), toml::to_string(&header)?)?;

        let mut wtr = csv::Writer::from_path(dir.join(format!("{stem}.csv")))?;
        for row in table.rows() {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
    }
    log::info!("stored {} aggregated tables in {}", tables.len(), dir.display());
    Ok(())
}

/// # Errors
/// Returns an error if the directory cannot be listed or a table is malformed.
pub fn load_aggregated(dir: &Path) -> Result<BTreeMap<RangeKey, AggregatedTable>> {
    let mut tables = BTreeMap::new();
    for header_path in data_files(dir, "toml")? {
        let header: TableHeader = toml::from_str(&fs::read_to_string(&header_path)?)?;
        let csv_path = header_path.with_extension("csv");
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&csv_path)?;
        let rows = rdr
            .deserialize()
            .collect::<std::result::Result<Vec<AggregatedRow>, _>>()?;
        let table = AggregatedTable::new(header.key.clone(), header.metadata, rows);
        tables.insert(header.key, table);
    }
    Ok(tables)
}

fn data_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(OsStr::to_str) == Some(extension))
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}
