//! Iterative auto-calibration of a voltage unit
//!
//! Starting from identity coefficients the loop alternates a ramp test (slope) and an output
//! test (offset), persisting the adjusted coefficients after each, until both pass or the
//! iteration budget is spent. A transient, output and ramp test are run afterwards for the
//! record, their adjustments are not persisted.

use std::fmt;

use crate::coefficients::Coefficients;
use crate::instrument::{status, Observer, Oscilloscope, VoltageSource};
use crate::routines::{TestOutcome, VoltageUnitRoutines};
use crate::Result;

/// The steps an auto-calibration run performs
pub trait CalibrationRoutine {
    fn reset_coefficients(&mut self) -> Result<()>;
    fn ramp_test(&mut self) -> Result<TestOutcome>;
    fn output_test(&mut self) -> Result<TestOutcome>;
    fn transient_test(&mut self) -> Result<TestOutcome>;
    /// Persist the held coefficients
    fn write_coefficients(&mut self) -> Result<()>;
    fn coefficients(&self) -> Vec<(String, Coefficients)>;
}

impl<V, S> CalibrationRoutine for VoltageUnitRoutines<'_, V, S>
where
    V: VoltageSource + ?Sized,
    S: Oscilloscope + ?Sized,
{
    fn reset_coefficients(&mut self) -> Result<()> {
        Self::reset_coefficients(self).map(|_| ())
    }

    fn ramp_test(&mut self) -> Result<TestOutcome> {
        Self::ramp_test(self)
    }

    fn output_test(&mut self) -> Result<TestOutcome> {
        Self::output_test(self)
    }

    fn transient_test(&mut self) -> Result<TestOutcome> {
        Self::transient_test(self)
    }

    fn write_coefficients(&mut self) -> Result<()> {
        Self::write_coefficients(self)
    }

    fn coefficients(&self) -> Vec<(String, Coefficients)> {
        self.store().snapshot()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoCalState {
    Resetting,
    RampTesting,
    OutputTesting,
    Converged,
    IterationLimitReached,
}

impl fmt::Display for AutoCalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resetting => "resetting",
            Self::RampTesting => "ramp testing",
            Self::OutputTesting => "output testing",
            Self::Converged => "converged",
            Self::IterationLimitReached => "iteration limit reached",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoCalOutcome {
    /// `Converged` or `IterationLimitReached`
    pub state: AutoCalState,
    /// Loop iterations run, at least one
    pub iterations: usize,
    /// Every state entered, in order
    pub transitions: Vec<AutoCalState>,
    /// Transient, output and ramp test run after the loop
    pub final_tests: Vec<TestOutcome>,
    /// Coefficients persisted by the last iteration
    pub coefficients: Vec<(String, Coefficients)>,
}

impl AutoCalOutcome {
    pub fn converged(&self) -> bool {
        self.state == AutoCalState::Converged
    }
}

pub struct AutoCalibrationLoop<'a> {
    max_iterations: usize,
    observer: &'a dyn Observer,
}

impl<'a> AutoCalibrationLoop<'a> {
    pub fn new(max_iterations: usize, observer: &'a dyn Observer) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            observer,
        }
    }

    /// Run the loop to convergence or to the iteration limit, then the final tests
    ///
    /// # Errors
    /// Any failing step ends the run, coefficients persisted so far stay on the device.
    pub fn run<R: CalibrationRoutine + ?Sized>(&self, routine: &mut R) -> Result<AutoCalOutcome> {
        let mut transitions = vec![];
        let enter = |state: AutoCalState, transitions: &mut Vec<AutoCalState>| {
            log::debug!("auto-calibration: {state}");
            transitions.push(state);
        };

        enter(AutoCalState::Resetting, &mut transitions);
        routine.reset_coefficients()?;

        let mut state = AutoCalState::IterationLimitReached;
        let mut iterations = 0;
        for iteration in 1..=self.max_iterations {
            iterations = iteration;
            status(
                self.observer,
                &format!("auto-calibration iteration {iteration} of {}", self.max_iterations),
            );

            enter(AutoCalState::RampTesting, &mut transitions);
            let ramp = routine.ramp_test()?;
            routine.write_coefficients()?;

            enter(AutoCalState::OutputTesting, &mut transitions);
            let output = routine.output_test()?;
            routine.write_coefficients()?;

            if ramp.ok && output.ok {
                state = AutoCalState::Converged;
                break;
            }
        }
        enter(state, &mut transitions);
        let coefficients = routine.coefficients();

        if state == AutoCalState::Converged {
            status(
                self.observer,
                &format!("auto-calibration converged after {iterations} iterations"),
            );
        } else {
            log::warn!("auto-calibration did not converge in {iterations} iterations");
            self.observer.log(&format!(
                "auto-calibration did not converge in {iterations} iterations"
            ));
        }

        let final_tests = vec![
            routine.transient_test()?,
            routine.output_test()?,
            routine.ramp_test()?,
        ];

        Ok(AutoCalOutcome {
            state,
            iterations,
            transitions,
            final_tests,
            coefficients,
        })
    }
}
