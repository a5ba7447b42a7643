//! Command line front end
//!
//! # Usage
//!
//! ```bash
//! # Fit and score a calibration folder
//! unitcal fit ./calibration_sc12 --verify
//!
//! # Fit one range from the stored aggregated tables
//! unitcal fit ./calibration_sc12 --aggregated --range false/AMP1/0
//!
//! # Measure a simulated sampling unit into a folder, then fit it
//! unitcal simulate ./sim --offset 0.01 --noise 1e-4
//!
//! # Auto-calibrate a simulated voltage unit
//! unitcal --config bench.toml autocal --gain-error 1.01 --offset 0.003
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use unitcal::artifacts::CsvRenderer;
use unitcal::config::Config;
use unitcal::service::{
    run_calibration_fit, FitOptions, FitSummary, SamplingService, VoltageUnitService,
};
use unitcal::sim::{SamplingBench, VoltageBench};
use unitcal::task::{HardwareSlot, TaskEvent, TaskHandle};
use unitcal::types::RangeKey;
use unitcal::{logging, Result};

/// Calibration of sampling and voltage units
#[derive(Parser, Debug)]
#[command(name = "unitcal")]
#[command(version)]
struct Args {
    /// Configuration file, defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit correction models to a measured calibration folder and score them
    Fit {
        folder: PathBuf,

        /// Start from the aggregated tables instead of the raw data
        #[arg(long)]
        aggregated: bool,

        /// Score the Gaussian process against the verification data
        #[arg(long)]
        verify: bool,

        /// Only fit one range, given as mode/channel/range
        #[arg(long)]
        range: Option<RangeKey>,
    },

    /// Measure a simulated sampling unit into a folder and fit it
    Simulate {
        folder: PathBuf,

        /// Gain of the simulated unit
        #[arg(long, default_value = "1.0")]
        gain: f64,

        /// Offset of the simulated unit in volts
        #[arg(long, default_value = "0.0")]
        offset: f64,

        /// Standard deviation of the sample noise in volts
        #[arg(long, default_value = "0.0")]
        noise: f64,

        /// Also measure the verification data set
        #[arg(long)]
        verify: bool,
    },

    /// Auto-calibrate a simulated voltage unit
    Autocal {
        /// Gain error of the simulated outputs
        #[arg(long, default_value = "1.0")]
        gain_error: f64,

        /// Offset error of the simulated outputs in volts
        #[arg(long, default_value = "0.0")]
        offset: f64,

        /// Channels of the simulated unit (comma-separated)
        #[arg(long, default_value = "CH1,CH2,CH3", value_delimiter = ',')]
        channels: Vec<String>,
    },
}

/// Print the log lines of a task as they arrive and return its data
fn follow<T>(handle: TaskHandle<T>) -> Option<T> {
    for event in handle.events() {
        match event {
            TaskEvent::Log(line) => println!("[{}] {line}", handle.name()),
            TaskEvent::Progress { done, total } if done == total => {
                println!("[{}] {done} points measured", handle.name());
            }
            TaskEvent::InputRequested(prompt) => {
                eprintln!("[{}] cannot answer \"{prompt}\" from the command line", handle.name());
            }
            _ => {}
        }
    }
    let result = handle.join();
    if !result.ok {
        eprintln!("{} failed: {}", result.name, result.message);
    }
    result.data
}

/// Print the verdict table, returns whether there was anything to print
fn print_fit(summary: Option<FitSummary>) -> bool {
    let Some(summary) = summary else {
        return false;
    };
    println!("\n| range | verdict |");
    println!("|---|---|");
    for (key, verdict) in &summary.verdicts {
        println!("| {key} | {verdict} |");
    }
    println!("\nmodels: {}", summary.models.display());
    for figure in &summary.figures {
        println!("figure: {}", figure.display());
    }
    true
}

fn run(args: Args) -> Result<bool> {
    let config = args
        .config
        .as_deref()
        .map_or_else(|| Ok(Config::default()), Config::from_file)?;
    logging::init(&config.logging);

    match args.command {
        Command::Fit {
            folder,
            aggregated,
            verify,
            range,
        } => {
            let options = FitOptions {
                from_aggregated: aggregated,
                verify,
                range,
            };
            let handle =
                run_calibration_fit(&folder, Arc::new(config), Arc::new(CsvRenderer), options)?;
            Ok(print_fit(follow(handle)))
        }
        Command::Simulate {
            folder,
            gain,
            offset,
            noise,
            verify,
        } => {
            let bench = SamplingBench::new(gain, offset).with_noise(noise, 40);
            let service = SamplingService::new(
                HardwareSlot::connected(bench.unit()),
                HardwareSlot::connected(bench.reference()),
                config,
                &folder,
            );
            service.set_reference_ip("simulated");
            if follow(service.verify_instrument()?) != Some(true) {
                return Ok(false);
            }
            let Some(rows) = follow(service.run_calibration_measure(verify)?) else {
                return Ok(false);
            };
            for (key, n) in &rows {
                println!("{key}: {n} setpoints");
            }
            let options = FitOptions {
                verify,
                ..FitOptions::default()
            };
            Ok(print_fit(follow(service.run_calibration_fit(options)?)))
        }
        Command::Autocal {
            gain_error,
            offset,
            channels,
        } => {
            let bench = VoltageBench::new(&channels)
                .with_gain(gain_error)
                .with_offset(offset);
            let service = VoltageUnitService::new(
                HardwareSlot::connected(bench.unit()),
                HardwareSlot::connected(bench.scope()),
                config,
            );
            let Some(outcome) = follow(service.auto_calibrate()?) else {
                return Ok(false);
            };
            println!("\n{} after {} iterations", outcome.state, outcome.iterations);
            for (channel, c) in &outcome.coefficients {
                println!("{channel}: slope {:.6}, offset {:+.6}", c.slope, c.offset);
            }
            for test in &outcome.final_tests {
                println!("{}: {}", test.kind.name(), verdict(test.ok));
            }
            for artifact in service.collect_artifacts()? {
                println!("artifact: {}", artifact.display());
            }
            Ok(outcome.converged())
        }
    }
}

const fn verdict(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "not ok"
    }
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}
