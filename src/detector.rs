//! # R-Wave Detection Module
//!
//! Turns the raw ECG voltage stream into discrete heartbeat events using a
//! hysteresis (Schmitt trigger) threshold pair, and derives beats per minute
//! from the spacing of consecutive beats.
//!
//! ## Algorithm
//! - Rising above `upper` while low: enter the high state and emit a beat
//! - Falling below `lower` while high: re-arm, no event
//! - Anything else: no change
//!
//! The band between `lower` and `upper` is the noise margin. A signal wobbling
//! around a single level cannot produce a second beat until it has dropped
//! all the way below `lower`.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// One minute in milliseconds, the numerator of the BPM calculation
const MILLIS_PER_MINUTE: u64 = 60_000;

/// Upper/lower detection levels, always configured together.
///
/// Both values are on the same scale as the samples fed to the detector
/// (millivolts with a 3300 mV reference, or raw 12-bit counts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawThresholds", into = "RawThresholds")]
pub struct Thresholds {
    upper: u16,
    lower: u16,
}

#[derive(Serialize, Deserialize)]
struct RawThresholds {
    upper: u16,
    lower: u16,
}

impl Thresholds {
    pub fn new(upper: u16, lower: u16) -> Result<Self, ConfigError> {
        if upper <= lower {
            return Err(ConfigError::InvalidThresholds { upper, lower });
        }
        Ok(Self { upper, lower })
    }

    pub fn upper(&self) -> u16 {
        self.upper
    }

    pub fn lower(&self) -> u16 {
        self.lower
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { upper: 850, lower: 700 }
    }
}

impl TryFrom<RawThresholds> for Thresholds {
    type Error = ConfigError;

    fn try_from(raw: RawThresholds) -> Result<Self, Self::Error> {
        Thresholds::new(raw.upper, raw.lower)
    }
}

impl From<Thresholds> for RawThresholds {
    fn from(t: Thresholds) -> Self {
        RawThresholds { upper: t.upper, lower: t.lower }
    }
}

/// Detector memory carried from one sample to the next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectorState {
    pub is_above_threshold: bool,
    /// Uptime (ms) of the last detected R-wave, `None` until the first beat
    pub previous_event_time: Option<u64>,
    /// Last computed rate, 0 until two beats have been seen
    pub beats_per_minute: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorEvent {
    NoChange,
    /// An R-wave was detected. `bpm` is `None` when no previous beat exists
    /// to measure an interval against.
    RWaveDetected { bpm: Option<u16> },
}

pub struct QrsDetector {
    thresholds: Thresholds,
    state: DetectorState,
}

impl QrsDetector {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            state: DetectorState::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    /// Current rate to report alongside each sample
    pub fn beats_per_minute(&self) -> u16 {
        self.state.beats_per_minute
    }

    /// Feed one sample taken at `now_millis` (monotonic uptime).
    pub fn observe(&mut self, voltage: u16, now_millis: u64) -> DetectorEvent {
        if voltage > self.thresholds.upper && !self.state.is_above_threshold {
            self.state.is_above_threshold = true;

            let bpm = self
                .state
                .previous_event_time
                .map(|previous| now_millis.saturating_sub(previous))
                .and_then(bpm_from_interval);
            self.state.previous_event_time = Some(now_millis);

            if let Some(bpm) = bpm {
                self.state.beats_per_minute = bpm;
            }
            log::debug!("R-wave at {} ms, bpm {:?}", now_millis, bpm);
            DetectorEvent::RWaveDetected { bpm }
        } else if voltage < self.thresholds.lower && self.state.is_above_threshold {
            self.state.is_above_threshold = false;
            DetectorEvent::NoChange
        } else {
            DetectorEvent::NoChange
        }
    }
}

/// `60000 / interval`, or `None` for a zero-length interval
fn bpm_from_interval(interval_millis: u64) -> Option<u16> {
    if interval_millis == 0 {
        return None;
    }
    // Interval >= 1 ms keeps the quotient within 60000, which fits in u16
    Some((MILLIS_PER_MINUTE / interval_millis) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> QrsDetector {
        QrsDetector::new(Thresholds::default())
    }

    fn feed(detector: &mut QrsDetector, samples: &[(u16, u64)]) -> Vec<(u64, DetectorEvent)> {
        samples
            .iter()
            .map(|&(v, t)| (t, detector.observe(v, t)))
            .filter(|(_, e)| *e != DetectorEvent::NoChange)
            .collect()
    }

    #[test]
    fn test_thresholds_must_form_band() {
        assert!(Thresholds::new(850, 700).is_ok());
        assert!(Thresholds::new(700, 700).is_err());
        assert!(Thresholds::new(700, 850).is_err());
    }

    #[test]
    fn test_thresholds_deserialize_validated() {
        let ok: Thresholds = toml::from_str("upper = 2000\nlower = 1500").expect("valid pair");
        assert_eq!(ok.upper(), 2000);
        assert_eq!(ok.lower(), 1500);

        let bad: Result<Thresholds, _> = toml::from_str("upper = 100\nlower = 200");
        assert!(bad.is_err());
    }

    #[test]
    fn test_two_beats_one_second_apart() {
        let mut d = detector();
        let events = feed(
            &mut d,
            &[(500, 0), (500, 10), (900, 20), (500, 1020), (500, 1030), (900, 1040)],
        );

        assert_eq!(
            events,
            vec![
                (20, DetectorEvent::RWaveDetected { bpm: None }),
                (1040, DetectorEvent::RWaveDetected { bpm: Some(58) }),
            ]
        );
        assert_eq!(d.beats_per_minute(), 58);
    }

    #[test]
    fn test_first_beat_leaves_rate_unset() {
        let mut d = detector();
        assert_eq!(
            d.observe(900, 5_000),
            DetectorEvent::RWaveDetected { bpm: None }
        );
        assert_eq!(d.beats_per_minute(), 0);
        assert_eq!(d.state().previous_event_time, Some(5_000));
    }

    #[test]
    fn test_noise_inside_band_does_not_retrigger() {
        let mut d = detector();
        // Wobbles between the thresholds never re-arm the detector
        let events = feed(
            &mut d,
            &[(900, 0), (800, 5), (860, 10), (710, 15), (900, 20), (751, 25)],
        );
        assert_eq!(events.len(), 1);
        assert!(d.state().is_above_threshold);
    }

    #[test]
    fn test_rearm_requires_dropping_below_lower() {
        let mut d = detector();
        d.observe(900, 0);
        d.observe(700, 10); // equal to lower is not below it
        assert!(d.state().is_above_threshold);
        d.observe(699, 20);
        assert!(!d.state().is_above_threshold);
    }

    #[test]
    fn test_value_equal_to_upper_is_not_a_crossing() {
        let mut d = detector();
        assert_eq!(d.observe(850, 0), DetectorEvent::NoChange);
        assert!(!d.state().is_above_threshold);
    }

    #[test]
    fn test_bpm_matches_interval_for_many_intervals() {
        for delta in [1u64, 7, 250, 333, 600, 1000, 1500, 59_999, 60_000, 120_000] {
            let mut d = detector();
            d.observe(900, 100);
            d.observe(500, 100 + delta / 2);
            let event = d.observe(900, 100 + delta);
            assert_eq!(
                event,
                DetectorEvent::RWaveDetected { bpm: Some((60_000 / delta) as u16) },
                "delta {}",
                delta
            );
        }
    }

    #[test]
    fn test_zero_interval_keeps_previous_rate() {
        let mut d = detector();
        d.observe(900, 0);
        d.observe(500, 500);
        d.observe(900, 1000);
        assert_eq!(d.beats_per_minute(), 60);

        d.observe(500, 1000);
        assert_eq!(
            d.observe(900, 1000),
            DetectorEvent::RWaveDetected { bpm: None }
        );
        assert_eq!(d.beats_per_minute(), 60);
    }

    #[test]
    fn test_events_alternate_with_rearm() {
        // Deterministic pseudo-random walk across the whole band
        let mut d = detector();
        let mut armed = true;
        let mut value: i32 = 600;
        let mut seed: u32 = 0x2545_F491;
        for t in 0..5_000u64 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            value = (value + (seed % 201) as i32 - 100).clamp(0, 1500);
            let v = value as u16;

            match d.observe(v, t) {
                DetectorEvent::RWaveDetected { .. } => {
                    assert!(armed, "beat without re-arm at t={}", t);
                    assert!(v > 850);
                    armed = false;
                }
                DetectorEvent::NoChange => {
                    if v < 700 {
                        armed = true;
                    }
                }
            }
        }
    }
}
