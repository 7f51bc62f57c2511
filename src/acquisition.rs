//! # Acquisition Loop Module
//!
//! Drives one cycle at a time:
//! `ensure_ready -> poll -> read sample -> detect -> timestamp -> encode -> publish`
//!
//! Every piece of mutable state (detector, clock anchor, session, sequence
//! counter) is owned here and only touched from the loop's thread. A cycle
//! that fails part-way is abandoned and the next cycle starts fresh.

use crate::clock::{ClockAnchor, NetworkTimeSource, Uptime};
use crate::detector::{DetectorEvent, QrsDetector};
use crate::error::ConnectionError;
use crate::retry::{RetryPolicy, Sleeper};
use crate::sample::SampleSource;
use crate::session::PublishSession;
use crate::telemetry::{TelemetryEncoder, TelemetryRecord};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published(TelemetryRecord),
    /// Record built and counted, but the transport did not take it
    PublishFailed(TelemetryRecord),
    /// Sample source failed; nothing was built
    SampleSkipped,
    /// Session could not be made ready within the retry policy
    Offline,
    /// Shutdown was requested while waiting to reconnect
    Interrupted,
}

pub struct AcquisitionLoop<S, T, C, U>
where
    S: SampleSource,
    T: Transport,
    C: NetworkTimeSource,
    U: Uptime,
{
    source: S,
    channel: u8,
    detector: QrsDetector,
    clock: ClockAnchor,
    time_source: C,
    uptime: U,
    clock_policy: RetryPolicy,
    encoder: Box<dyn TelemetryEncoder>,
    session: PublishSession<T>,
    last_measurement_id: u32,
    sample_interval: Option<Duration>,
}

impl<S, T, C, U> AcquisitionLoop<S, T, C, U>
where
    S: SampleSource,
    T: Transport,
    C: NetworkTimeSource,
    U: Uptime,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: S,
        channel: u8,
        detector: QrsDetector,
        clock: ClockAnchor,
        time_source: C,
        uptime: U,
        clock_policy: RetryPolicy,
        encoder: Box<dyn TelemetryEncoder>,
        session: PublishSession<T>,
    ) -> Self {
        Self {
            source,
            channel,
            detector,
            clock,
            time_source,
            uptime,
            clock_policy,
            encoder,
            session,
            last_measurement_id: 0,
            sample_interval: None,
        }
    }

    /// Paces cycles to at least `interval` each
    pub fn with_sample_interval(mut self, interval: Option<Duration>) -> Self {
        self.sample_interval = interval;
        self
    }

    #[cfg(test)]
    pub fn session(&self) -> &PublishSession<T> {
        &self.session
    }

    #[cfg(test)]
    pub fn session_mut(&mut self) -> &mut PublishSession<T> {
        &mut self.session
    }

    #[cfg(test)]
    pub fn clock(&self) -> &ClockAnchor {
        &self.clock
    }

    #[cfg(test)]
    pub fn uptime(&self) -> &U {
        &self.uptime
    }

    pub fn run_cycle(&mut self, sleeper: &mut dyn Sleeper) -> CycleOutcome {
        match self.session.ensure_ready(sleeper) {
            Ok(()) => {}
            Err(ConnectionError::Interrupted) => return CycleOutcome::Interrupted,
            Err(e) => {
                log::warn!(
                    "Skipping cycle, broker unreachable ({:?}): {}",
                    self.session.state(),
                    e
                );
                return CycleOutcome::Offline;
            }
        }
        self.session.poll();

        let sample = match self.source.read_sample(self.channel) {
            Ok(sample) => sample,
            Err(e) => {
                log::warn!("Skipping cycle, sample read failed: {}", e);
                return CycleOutcome::SampleSkipped;
            }
        };

        log::trace!("Sample raw {} -> {} mV", sample.raw, sample.voltage);

        let now_millis = self.uptime.uptime().as_millis() as u64;
        if let DetectorEvent::RWaveDetected { bpm } = self.detector.observe(sample.voltage, now_millis) {
            match bpm {
                Some(bpm) => log::debug!("Beat, {} bpm", bpm),
                None => log::debug!("Beat, rate not yet available"),
            }
        }

        let timestamp_millis = self.clock.resolve(
            &mut self.time_source,
            &self.uptime,
            &self.clock_policy,
            sleeper,
        );

        self.last_measurement_id = self.last_measurement_id.wrapping_add(1);
        if self.last_measurement_id == 0 {
            log::warn!("measurement_id wrapped past {}, ids restart from 0", u32::MAX);
        }
        let record = TelemetryRecord {
            timestamp_millis,
            measurement_id: self.last_measurement_id,
            measurement_value: sample.voltage,
            heart_rate: self.detector.beats_per_minute(),
        };

        match self.session.publish(self.encoder.encode(&record)) {
            Ok(()) => CycleOutcome::Published(record),
            Err(e) => {
                log::warn!("Record {} not published: {}", record.measurement_id, e);
                CycleOutcome::PublishFailed(record)
            }
        }
    }

    /// Runs cycles until `should_stop` is raised, then closes the session.
    pub fn run(&mut self, sleeper: &mut dyn Sleeper, should_stop: &AtomicBool) {
        log::info!("Acquisition loop started on channel {}", self.channel);

        while !should_stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            if self.run_cycle(sleeper) == CycleOutcome::Interrupted {
                break;
            }

            if let Some(interval) = self.sample_interval {
                let elapsed = started.elapsed();
                if elapsed < interval && !sleeper.pause(interval - elapsed) {
                    break;
                }
            }
        }

        self.session.close();
        let stats = self.session.stats();
        log::info!(
            "Acquisition loop stopped after {} records: {} sent ({} bytes), {} failed, {} reconnections",
            self.last_measurement_id,
            stats.messages_sent,
            stats.bytes_sent,
            stats.messages_failed,
            stats.reconnections
        );
        if let Some(error) = &stats.last_error {
            log::info!("Last publish error: {}", error);
        }
    }
}
