#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

pub mod aggregate;
pub mod artifacts;
pub mod autocal;
pub mod coefficients;
pub mod config;
pub mod error;
pub mod fitter;
pub mod gp;
pub mod instrument;
pub mod logging;
pub mod math;
pub mod polyfit;
pub mod quality;
pub mod routines;
pub mod service;
pub mod session;
pub mod sim;
pub mod spline;
pub mod storage;
pub mod sweep;
pub mod task;
pub mod types;

pub use error::Error;

pub type Result<T> = ::std::result::Result<T, Error>;
