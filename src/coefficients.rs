use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::instrument::CorrectionDevice;
use crate::Result;

/// Linear correction applied by the device, `corrected = slope * raw + offset`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Coefficients {
    pub slope: f64,
    pub offset: f64,
}

impl Default for Coefficients {
    fn default() -> Self {
        Self {
            slope: 1.0,
            offset: 0.0,
        }
    }
}

/// In-memory copy of the correction coefficients of every channel of a unit
///
/// Channels are always visited in the order they were registered in.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientStore {
    channels: Vec<String>,
    values: BTreeMap<String, Coefficients>,
}

impl CoefficientStore {
    pub fn new<S: AsRef<str>>(channels: &[S]) -> Self {
        let channels = channels
            .iter()
            .map(|c| c.as_ref().to_owned())
            .collect::<Vec<_>>();
        let values = channels
            .iter()
            .map(|c| (c.clone(), Coefficients::default()))
            .collect();
        Self { channels, values }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// # Errors
    /// Returns [`Error::Configuration`] for a channel the store does not know.
    pub fn get(&self, channel: &str) -> Result<Coefficients> {
        self.values
            .get(channel)
            .copied()
            .ok_or_else(|| Error::configuration(format!("unknown channel {channel}")))
    }

    /// # Errors
    /// Returns [`Error::Configuration`] for a channel the store does not know.
    pub fn set(&mut self, channel: &str, coefficients: Coefficients) -> Result<()> {
        let slot = self
            .values
            .get_mut(channel)
            .ok_or_else(|| Error::configuration(format!("unknown channel {channel}")))?;
        *slot = coefficients;
        Ok(())
    }

    /// Snapshot in channel order
    pub fn snapshot(&self) -> Vec<(String, Coefficients)> {
        self.channels
            .iter()
            .map(|c| (c.clone(), self.values[c]))
            .collect()
    }

    /// Replace the held values with those stored on the device
    ///
    /// # Errors
    /// Propagates device failures, the store keeps the channels read before the failure.
    pub fn read<D: CorrectionDevice + ?Sized>(
        &mut self,
        device: &mut D,
    ) -> Result<Vec<(String, Coefficients)>> {
        for channel in &self.channels {
            let coefficients = device.correction(channel)?;
            log::debug!("{channel}: read {coefficients:?}");
            self.values.insert(channel.clone(), coefficients);
        }
        Ok(self.snapshot())
    }

    /// Set every channel to identity and persist it immediately
    ///
    /// # Errors
    /// Propagates device failures.
    pub fn reset<D: CorrectionDevice + ?Sized>(
        &mut self,
        device: &mut D,
    ) -> Result<Vec<(String, Coefficients)>> {
        for value in self.values.values_mut() {
            *value = Coefficients::default();
        }
        self.write(device)?;
        Ok(self.snapshot())
    }

    /// Push the held values to the device without reading anything back
    ///
    /// # Errors
    /// Propagates device failures, channels after the failing one are not written.
    pub fn write<D: CorrectionDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        for (channel, coefficients) in self.snapshot() {
            let zero_word = device.zero_word(&channel, coefficients.offset)?;
            device.store_correction(&channel, coefficients, zero_word, true)?;
            log::debug!("{channel}: wrote {coefficients:?} (zero word {zero_word:#x})");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        stored: BTreeMap<String, Coefficients>,
        calls: Vec<String>,
    }

    impl CorrectionDevice for Recorder {
        fn correction(&mut self, channel: &str) -> Result<Coefficients> {
            self.calls.push(format!("read {channel}"));
            Ok(self.stored.get(channel).copied().unwrap_or_default())
        }

        fn zero_word(&mut self, channel: &str, offset: f64) -> Result<u32> {
            self.calls.push(format!("zero {channel}"));
            Ok((offset * 1e6).round().abs() as u32)
        }

        fn store_correction(
            &mut self,
            channel: &str,
            coefficients: Coefficients,
            _zero_word: u32,
            persist: bool,
        ) -> Result<()> {
            assert!(persist);
            self.calls.push(format!("store {channel}"));
            self.stored.insert(channel.to_owned(), coefficients);
            Ok(())
        }
    }

    #[test]
    fn new_store_holds_identity() {
        let store = CoefficientStore::new(&["CH1", "CH2", "CH3"]);
        for (_, c) in store.snapshot() {
            assert_eq!(c, Coefficients::default());
        }
        assert!(store.get("CH4").is_err());
    }

    #[test]
    fn write_visits_channels_in_registration_order() -> Result<()> {
        let mut device = Recorder::default();
        let store = CoefficientStore::new(&["CH2", "CH10", "CH1"]);
        store.write(&mut device)?;
        assert_eq!(
            device.calls,
            vec!["zero CH2", "store CH2", "zero CH10", "store CH10", "zero CH1", "store CH1"]
        );
        Ok(())
    }

    #[test]
    fn read_resynchronises_from_the_device() -> Result<()> {
        let mut device = Recorder::default();
        device.stored.insert(
            "CH1".to_owned(),
            Coefficients {
                slope: 1.01,
                offset: -0.002,
            },
        );
        let mut store = CoefficientStore::new(&["CH1", "CH2"]);
        store.set(
            "CH1",
            Coefficients {
                slope: 5.0,
                offset: 5.0,
            },
        )?;

        let read = store.read(&mut device)?;

        approx::assert_relative_eq!(read[0].1.slope, 1.01);
        assert_eq!(store.get("CH1")?.offset, -0.002);
        assert!(device.calls.iter().all(|c| c.starts_with("read")));
        Ok(())
    }

    #[test]
    fn reset_persists_identity() -> Result<()> {
        let mut device = Recorder::default();
        let mut store = CoefficientStore::new(&["CH1"]);
        store.set(
            "CH1",
            Coefficients {
                slope: 0.9,
                offset: 0.1,
            },
        )?;
        store.reset(&mut device)?;
        assert_eq!(device.stored["CH1"], Coefficients::default());
        Ok(())
    }
}
