//! Error type shared by every stage of the calibration pipeline.
//!
//! Configuration problems abort only the target they concern, fit failures remove a single model
//! variant from the results and hardware failures end the running task. Quality verdicts are not
//! errors at all, they are returned as data by [`crate::quality`].

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Unknown channel or range identifiers, missing instrument addresses, invalid config values.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A regression model could not be fitted to the supplied data.
    #[error("fit error: {0}")]
    Fit(String),

    /// An instrument call failed.
    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("hardware is not connected")]
    NotConnected,

    #[error("no input was provided within {0:?}")]
    InputTimeout(Duration),

    #[error("task `{0}` panicked")]
    TaskPanicked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to parse toml: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to write toml: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn fit(msg: impl Into<String>) -> Self {
        Self::Fit(msg.into())
    }

    pub fn hardware(msg: impl Into<String>) -> Self {
        Self::Hardware(msg.into())
    }
}
