//! Plot artifacts and where they live
//!
//! Figures are described as data ([`Figure`]) and handed to a [`Renderer`]. The bundled
//! [`CsvRenderer`] writes the traces as a long-format table next to the requested image path, a
//! plotting front end can render the same description into an image.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::types::RangeKey;
use crate::Result;

/// Artifacts listed ahead of everything else, in this order
const PRIORITY_STEMS: [&str; 3] = ["output", "ramp", "transient"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    Linear,
    SymLog,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub label: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl Trace {
    pub fn new(label: impl Into<String>, x: Vec<f64>, y: Vec<f64>) -> Self {
        Self {
            label: label.into(),
            x,
            y,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub y_scale: Scale,
    pub traces: Vec<Trace>,
}

impl Panel {
    pub fn new(title: &str, x_label: &str, y_label: &str) -> Self {
        Self {
            title: title.to_owned(),
            x_label: x_label.to_owned(),
            y_label: y_label.to_owned(),
            y_scale: Scale::Linear,
            traces: vec![],
        }
    }

    #[must_use]
    pub const fn with_scale(mut self, y_scale: Scale) -> Self {
        self.y_scale = y_scale;
        self
    }

    pub fn push(&mut self, trace: Trace) {
        self.traces.push(trace);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Figure {
    pub title: String,
    pub panels: Vec<Panel>,
}

/// Turns a [`Figure`] into a file
pub trait Renderer: Send + Sync {
    /// Render `figure` for `path` and return the file actually written
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    fn render(&self, figure: &Figure, path: &Path) -> Result<PathBuf>;
}

#[derive(Serialize)]
struct TraceRow<'a> {
    figure: &'a str,
    panel: &'a str,
    scale: Scale,
    trace: &'a str,
    x: f64,
    y: f64,
}

/// Writes every point of every trace to `<path>.csv`
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvRenderer;

impl Renderer for CsvRenderer {
    fn render(&self, figure: &Figure, path: &Path) -> Result<PathBuf> {
        let target = path.with_extension("csv");
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut wtr = csv::Writer::from_path(&target)?;
        for panel in &figure.panels {
            for trace in &panel.traces {
                for (x, y) in trace.x.iter().zip(&trace.y) {
                    wtr.serialize(TraceRow {
                        figure: &figure.title,
                        panel: &panel.title,
                        scale: panel.y_scale,
                        trace: &trace.label,
                        x: *x,
                        y: *y,
                    })?;
                }
            }
        }
        wtr.flush()?;
        log::debug!("rendered {} to {}", figure.title, target.display());
        Ok(target)
    }
}

/// Artifact directory of one hardware unit, `calibration_<kind><serial>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactManager {
    unit_dir: PathBuf,
    figures: String,
}

impl ArtifactManager {
    pub fn new(root: &Path, kind: &str, serial: u32, figures: &str) -> Self {
        Self {
            unit_dir: root.join(format!("calibration_{kind}{serial}")),
            figures: figures.to_owned(),
        }
    }

    /// Use an existing calibration folder as the artifact directory
    pub fn in_folder(folder: &Path, figures: &str) -> Self {
        Self {
            unit_dir: folder.to_path_buf(),
            figures: figures.to_owned(),
        }
    }

    pub fn unit_dir(&self) -> &Path {
        &self.unit_dir
    }

    pub fn figures_dir(&self) -> PathBuf {
        self.unit_dir.join(&self.figures)
    }

    /// # Errors
    /// Returns an error if the directories cannot be created.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.figures_dir())?;
        Ok(())
    }

    /// Path for a unit level plot such as `ramp`
    pub fn plot_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{name}.png"))
    }

    /// Path of the diagnostic plot of one range
    pub fn range_plot_path(&self, key: &RangeKey) -> PathBuf {
        self.figures_dir().join(format!("{}_analyze.png", key.stem()))
    }

    /// Every artifact of the unit: `output`, `ramp` and `transient` first, then the rest of the
    /// unit directory and its figures sorted by path
    ///
    /// # Errors
    /// Returns an error if an existing directory cannot be listed.
    pub fn collect(&self) -> Result<Vec<PathBuf>> {
        let mut files = BTreeSet::new();
        for dir in [self.unit_dir.clone(), self.figures_dir()] {
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_file() {
                    files.insert(path);
                }
            }
        }

        let stem_of = |path: &PathBuf| {
            path.file_stem()
                .and_then(OsStr::to_str)
                .map(str::to_owned)
        };
        let mut ordered = vec![];
        for stem in PRIORITY_STEMS {
            let (matching, rest): (BTreeSet<_>, BTreeSet<_>) = files.into_iter().partition(|p| {
                p.parent() == Some(self.unit_dir.as_path()) && stem_of(p).as_deref() == Some(stem)
            });
            ordered.extend(matching);
            files = rest;
        }
        ordered.extend(files);
        Ok(ordered)
    }
}
