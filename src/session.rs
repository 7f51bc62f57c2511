//! # Publish Session Module
//!
//! Owns the connect/reconnect state machine in front of the transport and
//! sends telemetry with at-least-once delivery.
//!
//! ## States
//! ```text
//! Disconnected ──network up──▶ SessionConnecting ──handshake ok──▶ Ready
//!      │                              ▲
//!      └──network down──▶ NetworkConnecting ──joined──┘
//!
//! any state ──transport reports not connected──▶ Disconnected
//! ```
//!
//! `ensure_ready()` blocks, retrying with fixed delays, until the session is
//! ready or the retry policy gives up. Publish failures are counted but not
//! retried; a dropped session is noticed by the next `ensure_ready()`.

use crate::config::TopicConfig;
use crate::error::ConnectionError;
use crate::retry::{RetryError, RetryPolicy, Sleeper};
use crate::transport::{QoS, Transport};

/// Delivery quality for telemetry and the control subscription
const DELIVERY_QOS: QoS = QoS::AtLeastOnce;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    NetworkConnecting,
    SessionConnecting,
    Ready,
}

/// Session counters, logged at shutdown
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub bytes_sent: u64,
    /// Sessions re-established after the first one
    pub reconnections: u32,
    pub last_error: Option<String>,
}

pub struct PublishSession<T: Transport> {
    transport: T,
    state: ConnectionState,
    topics: TopicConfig,
    network_policy: RetryPolicy,
    session_policy: RetryPolicy,
    stats: SessionStats,
    sessions_established: u32,
}

impl<T: Transport> PublishSession<T> {
    pub fn new(
        transport: T,
        topics: TopicConfig,
        network_policy: RetryPolicy,
        session_policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            topics,
            network_policy,
            session_policy,
            stats: SessionStats::default(),
            sessions_established: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[cfg(test)]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drops to `Disconnected` if the transport lost the session
    fn refresh_state(&mut self) {
        if self.state != ConnectionState::Disconnected && !self.transport.is_connected() {
            log::warn!("Session lost (was {:?})", self.state);
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Blocks until the network link is up.
    pub fn ensure_network(&mut self, sleeper: &mut dyn Sleeper) -> Result<(), ConnectionError> {
        if self.transport.network_available() {
            return Ok(());
        }

        log::info!("Network down, attempting to join");
        self.state = ConnectionState::NetworkConnecting;
        let transport = &mut self.transport;
        let outcome = self.network_policy.run(sleeper, |attempt| {
            let joined = transport.join_network();
            if !joined {
                log::debug!("Network join attempt {} failed", attempt);
            }
            joined
        });

        match outcome {
            Ok(attempts) => {
                log::info!("Network up after {} attempt(s)", attempts);
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(match e {
                    RetryError::Exhausted { attempts } => {
                        ConnectionError::NetworkUnavailable { attempts }
                    }
                    RetryError::Interrupted { .. } => ConnectionError::Interrupted,
                })
            }
        }
    }

    /// Blocks until the broker accepts a session, then re-subscribes to the
    /// control topic.
    pub fn ensure_session(&mut self, sleeper: &mut dyn Sleeper) -> Result<(), ConnectionError> {
        self.state = ConnectionState::SessionConnecting;
        let transport = &mut self.transport;
        let outcome = self.session_policy.run(sleeper, |attempt| {
            let connected = transport.connect();
            if !connected {
                log::warn!("Broker handshake attempt {} failed, retrying", attempt);
            }
            connected
        });

        match outcome {
            Ok(attempts) => {
                log::info!("Connected to broker after {} attempt(s)", attempts);
                if self.sessions_established > 0 {
                    self.stats.reconnections += 1;
                }
                self.sessions_established += 1;

                if let Err(e) = self.transport.subscribe(&self.topics.control, DELIVERY_QOS) {
                    log::warn!("Could not subscribe to {}: {}", self.topics.control, e);
                }
                self.state = ConnectionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(match e {
                    RetryError::Exhausted { attempts } => {
                        ConnectionError::SessionRefused { attempts }
                    }
                    RetryError::Interrupted { .. } => ConnectionError::Interrupted,
                })
            }
        }
    }

    /// Network, then session. Returns immediately when already ready.
    pub fn ensure_ready(&mut self, sleeper: &mut dyn Sleeper) -> Result<(), ConnectionError> {
        self.refresh_state();
        if self.state == ConnectionState::Ready {
            return Ok(());
        }

        self.ensure_network(sleeper)?;
        self.ensure_session(sleeper)
    }

    /// Services keep-alives. No-op unless ready.
    pub fn poll(&mut self) {
        if self.state != ConnectionState::Ready {
            return;
        }
        self.transport.poll();
        self.refresh_state();
    }

    /// Sends one payload to the data topic. Never touches the transport
    /// unless the session is ready.
    pub fn publish(&mut self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.refresh_state();
        if self.state != ConnectionState::Ready {
            self.stats.messages_failed += 1;
            return Err(ConnectionError::NotReady(self.state));
        }

        let len = payload.len() as u64;
        match self
            .transport
            .publish(&self.topics.data, payload, DELIVERY_QOS, self.topics.retain)
        {
            Ok(()) => {
                self.stats.messages_sent += 1;
                self.stats.bytes_sent += len;
                Ok(())
            }
            Err(e) => {
                self.stats.messages_failed += 1;
                self.stats.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn close(&mut self) {
        if self.state == ConnectionState::Ready {
            self.transport.disconnect();
        }
        self.state = ConnectionState::Disconnected;
    }
}
