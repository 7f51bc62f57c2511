//! # Sample Source Module
//!
//! Abstraction over the analog front end. The loop asks for one raw reading
//! per cycle and scales it to millivolts the way an MCP3208 driver does
//! (12-bit reading against a reference voltage).
//!
//! ## Sources
//! - `SyntheticEcg`: generated PQRST waveform at a fixed heart rate, for
//!   running on a host without the acquisition board
//! - `ReplaySource`: raw readings captured to a text file, replayed in a loop

use crate::clock::{MonotonicUptime, Uptime};
use crate::error::SampleError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Full-scale count of a 12-bit converter
const ADC_COUNTS: u32 = 4096;

/// One reading, kept only for the cycle that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub raw: u16,
    pub voltage: u16,
}

pub trait SampleSource {
    /// Raw converter count from `channel`
    fn read_channel(&mut self, channel: u8) -> Result<u16, SampleError>;

    /// Converts a raw count to the millivolt-scaled value fed to the detector
    fn to_scaled_value(&self, raw: u16) -> u16;

    fn read_sample(&mut self, channel: u8) -> Result<Sample, SampleError> {
        let raw = self.read_channel(channel)?;
        Ok(Sample {
            raw,
            voltage: self.to_scaled_value(raw),
        })
    }
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn read_channel(&mut self, channel: u8) -> Result<u16, SampleError> {
        (**self).read_channel(channel)
    }

    fn to_scaled_value(&self, raw: u16) -> u16 {
        (**self).to_scaled_value(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Synthetic,
    Replay,
}

/// Linear conversion from 12-bit counts to millivolts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcScale {
    vref_mv: u16,
}

impl AdcScale {
    pub fn new(vref_mv: u16) -> Self {
        Self { vref_mv }
    }

    pub fn to_millivolts(&self, raw: u16) -> u16 {
        (raw as u32 * self.vref_mv as u32 / ADC_COUNTS) as u16
    }

    pub fn to_counts(&self, millivolts: u16) -> u16 {
        if self.vref_mv == 0 {
            return 0;
        }
        (millivolts as u32 * ADC_COUNTS / self.vref_mv as u32).min(ADC_COUNTS - 1) as u16
    }
}

/// Synthetic single-lead ECG. Amplitudes are in millivolts around a 500 mV
/// baseline so the default 850/700 thresholds catch every R peak.
pub struct SyntheticEcg<U: Uptime = MonotonicUptime> {
    uptime: U,
    period_ms: u64,
    scale: AdcScale,
    noise_seed: u32,
}

impl SyntheticEcg<MonotonicUptime> {
    pub fn new(bpm: u16, scale: AdcScale) -> Self {
        Self::with_uptime(bpm, scale, MonotonicUptime::new())
    }
}

impl<U: Uptime> SyntheticEcg<U> {
    pub fn with_uptime(bpm: u16, scale: AdcScale, uptime: U) -> Self {
        Self {
            uptime,
            // Rates above 60000 bpm would give a zero-length beat
            period_ms: (60_000 / bpm.max(1) as u64).max(1),
            scale,
            noise_seed: 0x9E37_79B9,
        }
    }

    fn waveform_mv(&self, phase: f64) -> f64 {
        const BASELINE: f64 = 500.0;
        let bump = |center: f64, width: f64, height: f64| {
            let x = (phase - center) / width;
            height * (-x * x).exp()
        };
        BASELINE
            + bump(0.15, 0.03, 80.0) // P
            - bump(0.29, 0.008, 60.0) // Q
            + bump(0.30, 0.01, 700.0) // R
            - bump(0.315, 0.01, 120.0) // S
            + bump(0.60, 0.05, 150.0) // T
    }

    fn noise_mv(&mut self) -> f64 {
        self.noise_seed ^= self.noise_seed << 13;
        self.noise_seed ^= self.noise_seed >> 17;
        self.noise_seed ^= self.noise_seed << 5;
        (self.noise_seed % 31) as f64 - 15.0
    }
}

impl<U: Uptime> SampleSource for SyntheticEcg<U> {
    fn read_channel(&mut self, _channel: u8) -> Result<u16, SampleError> {
        let t = self.uptime.uptime().as_millis() as u64;
        let phase = (t % self.period_ms) as f64 / self.period_ms as f64;
        let mv = (self.waveform_mv(phase) + self.noise_mv()).max(0.0);
        Ok(self.scale.to_counts(mv as u16))
    }

    fn to_scaled_value(&self, raw: u16) -> u16 {
        self.scale.to_millivolts(raw)
    }
}

/// Replays raw readings from a text file, one per line. Blank lines and
/// lines starting with `#` are skipped. Wraps around at the end.
pub struct ReplaySource {
    readings: Vec<u16>,
    position: usize,
    scale: AdcScale,
}

impl ReplaySource {
    pub fn from_file(path: &Path, scale: AdcScale) -> Result<Self, SampleError> {
        let contents = fs::read_to_string(path).map_err(SampleError::Io)?;
        Self::parse(&contents, scale)
    }

    pub fn parse(contents: &str, scale: AdcScale) -> Result<Self, SampleError> {
        let mut readings = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let value = line
                .parse::<u16>()
                .ok()
                .filter(|&v| u32::from(v) < ADC_COUNTS)
                .ok_or_else(|| SampleError::Malformed {
                    line: index + 1,
                    content: line.to_string(),
                })?;
            readings.push(value);
        }
        Ok(Self {
            readings,
            position: 0,
            scale,
        })
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }
}

impl SampleSource for ReplaySource {
    fn read_channel(&mut self, _channel: u8) -> Result<u16, SampleError> {
        if self.readings.is_empty() {
            return Err(SampleError::Exhausted);
        }
        let value = self.readings[self.position];
        self.position = (self.position + 1) % self.readings.len();
        Ok(value)
    }

    fn to_scaled_value(&self, raw: u16) -> u16 {
        self.scale.to_millivolts(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualUptime;
    use crate::detector::{DetectorEvent, QrsDetector, Thresholds};
    use std::io::Write;

    #[test]
    fn test_adc_scale_matches_driver_conversion() {
        let scale = AdcScale::new(3300);
        assert_eq!(scale.to_millivolts(0), 0);
        assert_eq!(scale.to_millivolts(4095), 3299);
        assert_eq!(scale.to_millivolts(2048), 1650);
        assert_eq!(scale.to_counts(1650), 2048);
        assert_eq!(scale.to_counts(5000), 4095);
    }

    #[test]
    fn test_replay_wraps_and_scales() {
        let mut source = ReplaySource::parse("# header\n100\n\n4095\n", AdcScale::new(3300))
            .expect("parse");
        assert_eq!(source.len(), 2);

        let first = source.read_sample(3).expect("sample");
        assert_eq!(first, Sample { raw: 100, voltage: 80 });
        assert_eq!(source.read_channel(3).expect("sample"), 4095);
        assert_eq!(source.read_channel(3).expect("sample"), 100);
    }

    #[test]
    fn test_replay_rejects_garbage() {
        match ReplaySource::parse("12\nabc\n", AdcScale::new(3300)) {
            Err(SampleError::Malformed { line, content }) => {
                assert_eq!(line, 2);
                assert_eq!(content, "abc");
            }
            other => panic!("expected malformed error, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_replay_rejects_counts_beyond_12_bits() {
        assert!(ReplaySource::parse("4095\n", AdcScale::new(3300)).is_ok());
        match ReplaySource::parse("4095\n4096\n", AdcScale::new(65_535)) {
            Err(SampleError::Malformed { line, content }) => {
                assert_eq!(line, 2);
                assert_eq!(content, "4096");
            }
            other => panic!("expected malformed error, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_synthetic_ecg_survives_absurd_rate() {
        let uptime = ManualUptime::default();
        uptime.set_millis(1_234);
        let mut source = SyntheticEcg::with_uptime(60_001, AdcScale::new(3300), uptime);
        assert!(source.read_channel(3).is_ok());
        let mut source =
            SyntheticEcg::with_uptime(u16::MAX, AdcScale::new(3300), ManualUptime::default());
        assert!(source.read_channel(3).is_ok());
    }

    #[test]
    fn test_empty_replay_is_exhausted() {
        let mut source = ReplaySource::parse("", AdcScale::new(3300)).expect("parse");
        assert!(matches!(source.read_channel(0), Err(SampleError::Exhausted)));
    }

    #[test]
    fn test_replay_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "1000\n1200").expect("write");
        let mut source =
            ReplaySource::from_file(file.path(), AdcScale::new(3300)).expect("load");
        assert_eq!(source.read_channel(3).expect("sample"), 1000);
    }

    #[test]
    fn test_synthetic_ecg_beats_at_configured_rate() {
        let scale = AdcScale::new(3300);
        let mut source = SyntheticEcg::with_uptime(60, scale, ManualUptime::default());
        let mut detector = QrsDetector::new(Thresholds::default());

        let mut beats = Vec::new();
        for t in (0..5_000u64).step_by(2) {
            source.uptime.set_millis(t);
            let sample = source.read_sample(3).expect("sample");
            if let DetectorEvent::RWaveDetected { .. } = detector.observe(sample.voltage, t) {
                beats.push(t);
            }
        }

        assert_eq!(beats.len(), 5);
        // Noise can move a crossing by one sampling step
        assert!((59..=61).contains(&detector.beats_per_minute()));
    }
}
