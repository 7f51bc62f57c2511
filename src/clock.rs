//! # Clock Anchoring Module
//!
//! The device has no battery-backed clock, so wall-clock timestamps are
//! rebuilt from two sources:
//! - a network time source queried once, lazily, until it answers
//! - local monotonic uptime, read every sample
//!
//! The first answer is turned into an anchor ("epoch seconds at boot") by
//! subtracting the uptime elapsed so far. The anchor is never recomputed,
//! so drift between the local oscillator and real time is not corrected.
//!
//! While the source stays silent it is asked again at most once per retry
//! interval of uptime, so a dead time server cannot slow the sample rate.
//!
//! ## Day skew correction
//! Network-sourced timestamps include a fixed `DAY_SKEW_CORRECTION_SECS`
//! offset. Deployed devices reported times exactly one day behind when using
//! the network time source; the offset restores them. The host clock has no
//! such skew and gets no offset. `clock.skew_correction_secs` overrides both.

use crate::retry::{RetryPolicy, Sleeper};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

/// One day, added to every reconstructed timestamp
pub const DAY_SKEW_CORRECTION_SECS: u64 = 86_400;

/// Seconds between the NTP era (1900) and the Unix epoch (1970)
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

const SNTP_PACKET_LEN: usize = 48;

/// Supplies epoch seconds when the network can answer.
pub trait NetworkTimeSource {
    fn epoch_seconds(&mut self) -> Option<u64>;
}

impl<T: NetworkTimeSource + ?Sized> NetworkTimeSource for Box<T> {
    fn epoch_seconds(&mut self) -> Option<u64> {
        (**self).epoch_seconds()
    }
}

/// Monotonic time since the process started
pub trait Uptime {
    fn uptime(&self) -> Duration;
}

pub struct MonotonicUptime {
    boot: Instant,
}

impl MonotonicUptime {
    pub fn new() -> Self {
        Self { boot: Instant::now() }
    }
}

impl Uptime for MonotonicUptime {
    fn uptime(&self) -> Duration {
        self.boot.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSourceKind {
    /// Host clock, for machines that already keep time
    System,
    /// SNTP query against `clock.sntp_server`
    Sntp,
}

impl TimeSourceKind {
    /// Offset applied when the config does not set one
    pub fn default_skew_correction_secs(self) -> u64 {
        match self {
            TimeSourceKind::System => 0,
            TimeSourceKind::Sntp => DAY_SKEW_CORRECTION_SECS,
        }
    }
}

/// Host wall clock via chrono
pub struct SystemTimeSource;

impl NetworkTimeSource for SystemTimeSource {
    fn epoch_seconds(&mut self) -> Option<u64> {
        u64::try_from(chrono::Utc::now().timestamp()).ok()
    }
}

/// Minimal SNTP (RFC 4330) client reading the server's transmit timestamp
pub struct SntpTimeSource {
    server: String,
    timeout: Duration,
}

impl SntpTimeSource {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }

    fn query(&self) -> io::Result<u64> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.connect(&self.server)?;

        let mut request = [0u8; SNTP_PACKET_LEN];
        request[0] = 0x1B; // LI = 0, VN = 3, Mode = 3 (client)
        socket.send(&request)?;

        let mut response = [0u8; SNTP_PACKET_LEN];
        let len = socket.recv(&mut response)?;
        parse_sntp_response(&response[..len])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad SNTP response"))
    }
}

impl NetworkTimeSource for SntpTimeSource {
    fn epoch_seconds(&mut self) -> Option<u64> {
        match self.query() {
            Ok(secs) => Some(secs),
            Err(e) => {
                log::debug!("SNTP query to {} failed: {}", self.server, e);
                None
            }
        }
    }
}

/// Extracts Unix seconds from the transmit timestamp (bytes 40..44)
fn parse_sntp_response(packet: &[u8]) -> Option<u64> {
    if packet.len() < SNTP_PACKET_LEN {
        return None;
    }
    let secs = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]) as u64;
    // Zero transmit time is a kiss-of-death or unsynchronised server
    if secs == 0 {
        return None;
    }
    secs.checked_sub(NTP_UNIX_OFFSET_SECS)
}

pub struct ClockAnchor {
    anchor_epoch_seconds: Option<u64>,
    skew_correction_secs: u64,
    retry_interval: Duration,
    /// Uptime before which an unresolved anchor does not query again
    next_attempt: Option<Duration>,
}

impl ClockAnchor {
    /// Anchor that queries on every call until resolved
    pub fn new(skew_correction_secs: u64) -> Self {
        Self {
            anchor_epoch_seconds: None,
            skew_correction_secs,
            retry_interval: Duration::ZERO,
            next_attempt: None,
        }
    }

    /// Waits at least `interval` of uptime between failed queries
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Epoch seconds at boot, once resolved
    #[cfg(test)]
    pub fn anchor_epoch_seconds(&self) -> Option<u64> {
        self.anchor_epoch_seconds
    }

    /// Timestamp in epoch milliseconds for a sample taken now, or `None`
    /// while the time source has not answered yet.
    ///
    /// Queries `source` only until the anchor is set, with up to
    /// `policy.max_attempts` tries per call and no tries at all while the
    /// retry interval since the last failure has not elapsed.
    pub fn resolve(
        &mut self,
        source: &mut dyn NetworkTimeSource,
        uptime: &dyn Uptime,
        policy: &RetryPolicy,
        sleeper: &mut dyn Sleeper,
    ) -> Option<u64> {
        if self.anchor_epoch_seconds.is_none() {
            if matches!(self.next_attempt, Some(next) if uptime.uptime() < next) {
                return None;
            }

            let mut fetched = None;
            let outcome = policy.run(sleeper, |_| {
                fetched = source.epoch_seconds();
                fetched.is_some()
            });

            match (outcome, fetched) {
                (Ok(_), Some(epoch)) => {
                    let anchor = epoch.saturating_sub(uptime.uptime().as_secs());
                    log::info!("Clock anchored: epoch {} at boot", anchor);
                    self.anchor_epoch_seconds = Some(anchor);
                }
                (outcome, _) => {
                    log::debug!("Network time not yet available ({:?})", outcome);
                    self.next_attempt = Some(uptime.uptime() + self.retry_interval);
                    return None;
                }
            }
        }

        self.timestamp_millis(uptime.uptime())
    }

    fn timestamp_millis(&self, uptime: Duration) -> Option<u64> {
        let anchor = self.anchor_epoch_seconds?;
        Some((anchor + self.skew_correction_secs) * 1000 + uptime.as_millis() as u64)
    }
}
