//! # Network Transport Module
//!
//! The contract the publish session needs from the network stack, and the
//! MQTT implementation used in deployment.
//!
//! ## Why a private runtime
//! rumqttc's event loop is async. The acquisition loop is deliberately a
//! plain blocking loop, so `MqttTransport` owns a current-thread Tokio
//! runtime and drives the event loop with `block_on` for bounded windows.
//! Queued publishes are written to the socket during `poll()`.

use crate::config::BrokerConfig;
use crate::error::ConnectionError;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet};
use std::net::ToSocketAddrs;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Outgoing request queue between client handle and event loop
const REQUEST_QUEUE_CAPACITY: usize = 64;
/// Upper bound on events drained by a single `poll()`
const MAX_EVENTS_PER_POLL: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    #[allow(dead_code)]
    AtMostOnce,
    AtLeastOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

pub trait Transport {
    /// Whether the network link is up
    fn network_available(&mut self) -> bool;

    /// One attempt to bring the network link up
    fn join_network(&mut self) -> bool;

    /// One session handshake attempt with the broker
    fn connect(&mut self) -> bool;

    fn is_connected(&self) -> bool;

    /// Services keep-alives and incoming traffic. Called once per cycle.
    fn poll(&mut self);

    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ConnectionError>;

    /// Best-effort clean shutdown of the session
    fn disconnect(&mut self) {}
}

pub struct MqttTransport {
    runtime: Runtime,
    client: AsyncClient,
    eventloop: EventLoop,
    host: String,
    port: u16,
    connected: bool,
    handshake_timeout: Duration,
    poll_window: Duration,
}

impl MqttTransport {
    pub fn new(broker: &BrokerConfig) -> Result<Self, ConnectionError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ConnectionError::RuntimeCreation(e.to_string()))?;

        let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs.max(1)));
        if let (Some(username), Some(password)) = (&broker.username, &broker.password) {
            options.set_credentials(username, password);
        }
        if let Some(ca_path) = &broker.tls_ca_path {
            let ca = std::fs::read(ca_path).map_err(|e| {
                ConnectionError::TlsSetup(format!("{}: {}", ca_path.display(), e))
            })?;
            options.set_transport(rumqttc::Transport::tls(ca, None, None));
            log::info!("Broker session will use TLS (CA {})", ca_path.display());
        }

        let (client, eventloop) = {
            let _guard = runtime.enter();
            AsyncClient::new(options, REQUEST_QUEUE_CAPACITY)
        };

        Ok(Self {
            runtime,
            client,
            eventloop,
            host: broker.host.clone(),
            port: broker.port,
            connected: false,
            handshake_timeout: Duration::from_millis(broker.handshake_timeout_ms),
            poll_window: Duration::from_millis(5),
        })
    }

    fn broker_resolves(&self) -> bool {
        match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                log::debug!("Cannot resolve broker {}:{}: {}", self.host, self.port, e);
                false
            }
        }
    }
}

impl Transport for MqttTransport {
    fn network_available(&mut self) -> bool {
        self.broker_resolves()
    }

    fn join_network(&mut self) -> bool {
        // The host OS owns the link; all we can do is check it came back
        self.broker_resolves()
    }

    fn connect(&mut self) -> bool {
        let eventloop = &mut self.eventloop;
        let deadline = self.handshake_timeout;
        let result = self.runtime.block_on(async {
            tokio::time::timeout(deadline, async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            return ack.code == ConnectReturnCode::Success;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            log::debug!("MQTT handshake failed: {}", e);
                            return false;
                        }
                    }
                }
            })
            .await
        });

        self.connected = matches!(result, Ok(true));
        self.connected
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn poll(&mut self) {
        if !self.connected {
            return;
        }

        let eventloop = &mut self.eventloop;
        let window = self.poll_window;
        let still_connected = self.runtime.block_on(async {
            for _ in 0..MAX_EVENTS_PER_POLL {
                match tokio::time::timeout(window, eventloop.poll()).await {
                    Err(_) => break,
                    Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                        log::warn!("Broker closed the session");
                        return false;
                    }
                    Ok(Ok(event)) => log::trace!("MQTT event: {:?}", event),
                    Ok(Err(e)) => {
                        log::warn!("MQTT connection lost: {}", e);
                        return false;
                    }
                }
            }
            true
        });

        self.connected = still_connected;
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        self.client
            .try_publish(topic, qos.into(), retain, payload)
            .map_err(|e| ConnectionError::PublishFailed(e.to_string()))
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ConnectionError> {
        self.client
            .try_subscribe(topic, qos.into())
            .map_err(|e| ConnectionError::PublishFailed(e.to_string()))
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        // Flush whatever is still queued before saying goodbye
        self.poll();
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect request failed: {}", e);
        }
        self.poll();
        self.connected = false;
    }
}
