//! Broker link: topic layout, the remote-write path, and the rumqttc
//! client/event-loop pair.
//!
//! Every topic is rooted at the device's hardware address:
//!
//! ```text
//! <addr>/Pub/<i>        register i, decimal
//! <addr>/Pub/status     "connected" (last will: "disconnected", retained)
//! <addr>/Pub/version    running firmware version
//! <addr>/Pub/update     update diagnostics
//! <addr>/Sub/<n>        n in 10..=19: register n := payload
//! <addr>/Sub/restart    restart the device
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::registers::{SharedBank, REMOTE_WRITABLE};
use crate::restart::RestartHandle;

pub const STATUS_CONNECTED: &str = "connected";
pub const STATUS_DISCONNECTED: &str = "disconnected";

/// Outbound request queue depth. Holds a full register dump plus the
/// status, version and update messages.
const QUEUE_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Topics {
    publish: String,
    subscribe: String,
}

impl Topics {
    pub fn new(addr: &str) -> Self {
        Self {
            publish: format!("{addr}/Pub/"),
            subscribe: format!("{addr}/Sub/"),
        }
    }

    pub fn register(&self, index: usize) -> String {
        format!("{}{index}", self.publish)
    }

    pub fn status(&self) -> String {
        format!("{}status", self.publish)
    }

    pub fn version(&self) -> String {
        format!("{}version", self.publish)
    }

    pub fn update(&self) -> String {
        format!("{}update", self.publish)
    }

    /// Filter covering every inbound topic.
    pub fn inbound_filter(&self) -> String {
        format!("{}#", self.subscribe)
    }

    /// Inbound topic for `suffix`.
    #[cfg(test)]
    pub fn inbound(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.subscribe)
    }

    /// The part of an inbound topic after `<addr>/Sub/`.
    pub fn inbound_suffix<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic.strip_prefix(self.subscribe.as_str())
    }
}

// ---------------------------------------------------------------------------
// Remote writes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Write { index: usize, value: u32 },
    Restart,
    Ignored(String),
}

/// Classify an inbound message without touching any state.
pub fn parse_inbound(topics: &Topics, topic: &str, payload: &[u8]) -> Inbound {
    let Some(suffix) = topics.inbound_suffix(topic) else {
        return Inbound::Ignored(format!("foreign topic '{topic}'"));
    };

    match suffix.parse::<usize>() {
        Ok(index) if REMOTE_WRITABLE.contains(&index) => {
            let text = String::from_utf8_lossy(payload);
            match text.trim().parse::<u32>() {
                Ok(value) => Inbound::Write { index, value },
                Err(_) => Inbound::Ignored(format!("non-numeric payload '{}'", text.trim())),
            }
        }
        Ok(index) => Inbound::Ignored(format!("register {index} is not remote-writable")),
        Err(_) if suffix == "restart" => Inbound::Restart,
        Err(_) => Inbound::Ignored(format!("unknown command '{suffix}'")),
    }
}

/// Apply an inbound message to the bank or the restart handle.
pub fn apply_inbound(
    bank: &SharedBank,
    topics: &Topics,
    restart: &RestartHandle,
    topic: &str,
    payload: &[u8],
) -> Inbound {
    let inbound = parse_inbound(topics, topic, payload);
    match &inbound {
        Inbound::Write { index, value } => {
            bank.write(*index, *value);
            info!(register = index, value, "remote write");
        }
        Inbound::Restart => restart.request("remote command"),
        Inbound::Ignored(reason) => debug!(topic, %reason, "inbound message ignored"),
    }
    inbound
}

// ---------------------------------------------------------------------------
// Broker seam
// ---------------------------------------------------------------------------

/// What the sync agent and update gate need from the broker connection.
pub trait Broker: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Queue a message. Never waits for the network.
    fn publish(&self, topic: String, payload: String, retain: bool) -> Result<()>;
}

impl<B: Broker + ?Sized> Broker for Arc<B> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn publish(&self, topic: String, payload: String, retain: bool) -> Result<()> {
        (**self).publish(topic, payload, retain)
    }
}

/// Publish every register as `<addr>/Pub/<i>`. Returns how many were
/// queued.
pub fn publish_bank<B: Broker + ?Sized>(broker: &B, topics: &Topics, bank: &SharedBank) -> usize {
    let mut sent = 0;
    for (i, value) in bank.snapshot().iter().enumerate() {
        match broker.publish(topics.register(i), value.to_string(), false) {
            Ok(()) => sent += 1,
            Err(e) => warn!(register = i, "publish failed: {e:#}"),
        }
    }
    sent
}

// ---------------------------------------------------------------------------
// rumqttc adapter
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MqttBroker {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl Broker for MqttBroker {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn publish(&self, topic: String, payload: String, retain: bool) -> Result<()> {
        self.client
            .try_publish(topic.as_str(), QoS::AtMostOnce, retain, payload)
            .with_context(|| format!("queueing publish on {topic}"))
    }
}

/// Owns the rumqttc event loop: keeps the connection alive, tracks broker
/// state, and feeds inbound messages to the remote-write path.
pub struct EventPump {
    eventloop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    topics: Topics,
}

/// Build the client (with the `disconnected` last will) and its pump.
/// Nothing touches the network until the pump runs.
pub fn open(addr: &str, host: &str, port: u16, topics: &Topics) -> (MqttBroker, EventPump) {
    let mut options = MqttOptions::new(addr, host, port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        topics.status(),
        STATUS_DISCONNECTED,
        QoS::AtMostOnce,
        true,
    ));

    let (client, eventloop) = AsyncClient::new(options, QUEUE_CAPACITY);
    let connected = Arc::new(AtomicBool::new(false));
    (
        MqttBroker {
            client: client.clone(),
            connected: connected.clone(),
        },
        EventPump {
            eventloop,
            client,
            connected,
            topics: topics.clone(),
        },
    )
}

impl EventPump {
    pub async fn run(mut self, bank: SharedBank, restart: RestartHandle) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    self.connected.store(true, Ordering::Relaxed);
                    let filter = self.topics.inbound_filter();
                    if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                        warn!(%filter, "subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    apply_inbound(&bank, &self.topics, &restart, &p.topic, &p.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("mqtt disconnected");
                    self.connected.store(false, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected.swap(false, Ordering::Relaxed) {
                        warn!("mqtt connection lost: {e}");
                    } else {
                        debug!("mqtt error: {e}. retrying...");
                    }
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Broker that records every publish and reports a settable state.
    #[derive(Default)]
    pub(crate) struct RecordingBroker {
        pub(crate) connected: AtomicBool,
        pub(crate) sent: Mutex<Vec<(String, String, bool)>>,
    }

    impl RecordingBroker {
        pub(crate) fn set_connected(&self, up: bool) {
            self.connected.store(up, Ordering::Relaxed);
        }

        pub(crate) fn take(&self) -> Vec<(String, String, bool)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        pub(crate) fn payloads_on(&self, topic: &str) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _, _)| t == topic)
                .map(|(_, p, _)| p.clone())
                .collect()
        }
    }

    impl Broker for RecordingBroker {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }

        fn publish(&self, topic: String, payload: String, retain: bool) -> Result<()> {
            self.sent.lock().unwrap().push((topic, payload, retain));
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
