//! Fixed-delay retry loops used for network joins, broker handshakes and
//! clock resolution. Delays go through a `Sleeper` so tests can count them
//! instead of waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Granularity at which `ThreadSleeper` checks the stop flag
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub trait Sleeper {
    /// Waits for `duration`. Returns `false` if the wait was cut short by shutdown.
    fn pause(&mut self, duration: Duration) -> bool;
}

/// Blocks the calling thread, waking early when the stop flag is raised.
pub struct ThreadSleeper {
    should_stop: Arc<AtomicBool>,
}

impl ThreadSleeper {
    pub fn new(should_stop: Arc<AtomicBool>) -> Self {
        Self { should_stop }
    }
}

impl Sleeper for ThreadSleeper {
    fn pause(&mut self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.should_stop.load(Ordering::Relaxed) {
                return false;
            }
            let step = remaining.min(STOP_CHECK_INTERVAL);
            std::thread::sleep(step);
            remaining -= step;
        }
        !self.should_stop.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries until success
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryError {
    Exhausted { attempts: u32 },
    Interrupted { attempts: u32 },
}

impl RetryPolicy {
    pub fn new(max_attempts: Option<u32>, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// A single attempt, no waiting
    pub fn once() -> Self {
        Self::new(Some(1), Duration::ZERO)
    }

    /// Runs `attempt` until it returns true, pausing `delay` after each
    /// failure. Returns the number of attempts made.
    pub fn run<F>(&self, sleeper: &mut dyn Sleeper, mut attempt: F) -> Result<u32, RetryError>
    where
        F: FnMut(u32) -> bool,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempt(attempts) {
                return Ok(attempts);
            }
            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(RetryError::Exhausted { attempts });
            }
            if !sleeper.pause(self.delay) {
                return Err(RetryError::Interrupted { attempts });
            }
        }
    }
}

/// Records requested pauses without sleeping
#[cfg(test)]
#[derive(Default)]
pub struct CountingSleeper {
    pub pauses: Vec<Duration>,
}

#[cfg(test)]
impl Sleeper for CountingSleeper {
    fn pause(&mut self, duration: Duration) -> bool {
        self.pauses.push(duration);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_on_first_attempt_never_sleeps() {
        let mut sleeper = CountingSleeper::default();
        let policy = RetryPolicy::new(None, Duration::from_secs(1));
        assert_eq!(policy.run(&mut sleeper, |_| true), Ok(1));
        assert!(sleeper.pauses.is_empty());
    }

    #[test]
    fn test_one_pause_per_failure() {
        let mut sleeper = CountingSleeper::default();
        let policy = RetryPolicy::new(None, Duration::from_secs(1));
        assert_eq!(policy.run(&mut sleeper, |n| n == 4), Ok(4));
        assert_eq!(sleeper.pauses, vec![Duration::from_secs(1); 3]);
    }

    #[test]
    fn test_bounded_attempts_give_up() {
        let mut sleeper = CountingSleeper::default();
        let policy = RetryPolicy::new(Some(3), Duration::from_millis(5));
        assert_eq!(
            policy.run(&mut sleeper, |_| false),
            Err(RetryError::Exhausted { attempts: 3 })
        );
        // No pause after the final attempt
        assert_eq!(sleeper.pauses.len(), 2);
    }

    #[test]
    fn test_once_policy() {
        let mut sleeper = CountingSleeper::default();
        assert_eq!(
            RetryPolicy::once().run(&mut sleeper, |_| false),
            Err(RetryError::Exhausted { attempts: 1 })
        );
        assert!(sleeper.pauses.is_empty());
    }

    #[test]
    fn test_thread_sleeper_stops_early() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut sleeper = ThreadSleeper::new(stop);
        let policy = RetryPolicy::new(None, Duration::from_secs(60));
        assert_eq!(
            policy.run(&mut sleeper, |_| false),
            Err(RetryError::Interrupted { attempts: 1 })
        );
    }

    #[test]
    fn test_thread_sleeper_short_pause() {
        let mut sleeper = ThreadSleeper::new(Arc::new(AtomicBool::new(false)));
        assert!(sleeper.pause(Duration::from_millis(1)));
        assert!(sleeper.pause(Duration::ZERO));
    }
}
