//! Network and broker link supervision.
//!
//! ```text
//! DisconnectedNet ──▶ Connecting ──[link up]──▶ ConnectedNetNoBroker ──[broker up]──▶ Connected
//!       ▲                 │                            │      ▲                          │
//!       │            [link down]                       │      └──────[broker lost]───────┤
//!       ├─────────────────┘                            │                                 │
//!       └───────────────────[link lost]────────────────┴─────────────────────────────────┘
//! ```
//!
//! The agent owns the no-network and no-broker alarms. The firmware update
//! gate runs inside the first successful network connection of the
//! process and is consumed by it. Inbound messages are handled by the MQTT
//! event pump, not here.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::Timing;
use crate::mqtt::{publish_bank, Broker, Topics, STATUS_CONNECTED};
use crate::network::NetworkLink;
use crate::registers::{Alarm, AlarmFlag, SharedBank};
use crate::restart::RestartHandle;
use crate::update::{FirmwareServer, UpdateGate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    DisconnectedNet,
    Connecting,
    ConnectedNetNoBroker,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::DisconnectedNet => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::ConnectedNetNoBroker => "connected_no_broker",
            LinkState::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncTiming {
    pub connect_timeout: Duration,
    pub portal_timeout: Duration,
    pub broker_settle: Duration,
    pub publish_interval: Duration,
}

impl From<&Timing> for SyncTiming {
    fn from(t: &Timing) -> Self {
        Self {
            connect_timeout: t.connect_timeout(),
            portal_timeout: t.portal_timeout(),
            broker_settle: t.broker_settle(),
            publish_interval: t.publish_interval(),
        }
    }
}

pub struct SyncAgent<L, B, S> {
    bank: SharedBank,
    link: L,
    broker: B,
    firmware: S,
    topics: Topics,
    restart: RestartHandle,
    timing: SyncTiming,
    version: i64,
    no_network: AlarmFlag,
    no_broker: AlarmFlag,
    update_gate: Option<UpdateGate>,
    state: LinkState,
    last_publish: Option<Instant>,
}

impl<L, B, S> SyncAgent<L, B, S>
where
    L: NetworkLink,
    B: Broker,
    S: FirmwareServer,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bank: SharedBank,
        link: L,
        broker: B,
        firmware: S,
        topics: Topics,
        restart: RestartHandle,
        timing: SyncTiming,
        version: i64,
        update_gate: UpdateGate,
    ) -> Result<Self> {
        Ok(Self {
            no_network: bank.claim(Alarm::NoNetwork)?,
            no_broker: bank.claim(Alarm::NoBroker)?,
            bank,
            link,
            broker,
            firmware,
            topics,
            restart,
            timing,
            version,
            update_gate: Some(update_gate),
            state: LinkState::DisconnectedNet,
            last_publish: None,
        })
    }

    pub async fn run(mut self, period: Duration) {
        info!(period_ms = period.as_millis() as u64, "sync agent started");
        loop {
            self.step().await;
            sleep(period).await;
        }
    }

    /// One pass of the link state machine.
    pub async fn step(&mut self) -> LinkState {
        let next = match self.state {
            LinkState::DisconnectedNet => {
                self.no_network.raise();
                self.no_broker.raise();
                LinkState::Connecting
            }
            LinkState::Connecting => self.connect_network().await,
            LinkState::ConnectedNetNoBroker => self.connect_broker().await,
            LinkState::Connected => self.service(),
        };
        if next != self.state {
            info!(from = %self.state, to = %next, "link state");
            self.state = next;
        }
        next
    }

    async fn connect_network(&mut self) -> LinkState {
        let up = self
            .link
            .auto_connect(self.timing.connect_timeout, self.timing.portal_timeout)
            .await;
        if !up {
            return LinkState::DisconnectedNet;
        }
        self.no_network.clear();

        if let Some(gate) = self.update_gate.take() {
            let outcome = gate
                .run(&self.firmware, &self.broker, &self.topics, &self.restart)
                .await;
            info!(?outcome, "update check done");
        }
        LinkState::ConnectedNetNoBroker
    }

    async fn connect_broker(&mut self) -> LinkState {
        if !self.link.is_up() {
            return LinkState::DisconnectedNet;
        }
        self.no_broker.raise();
        // The event pump reconnects on its own; give it time to land.
        sleep(self.timing.broker_settle).await;
        if !self.broker.is_connected() {
            debug!("broker not connected yet");
            return LinkState::ConnectedNetNoBroker;
        }

        self.no_broker.clear();
        self.send(self.topics.status(), STATUS_CONNECTED.to_string(), true);
        self.send(self.topics.version(), self.version.to_string(), true);
        self.last_publish = None;
        LinkState::Connected
    }

    fn service(&mut self) -> LinkState {
        if !self.link.is_up() {
            warn!("network lost");
            return LinkState::DisconnectedNet;
        }
        if !self.broker.is_connected() {
            warn!("broker lost");
            self.no_broker.raise();
            return LinkState::ConnectedNetNoBroker;
        }

        let due = self
            .last_publish
            .map_or(true, |t| t.elapsed() >= self.timing.publish_interval);
        if due {
            let sent = publish_bank(&self.broker, &self.topics, &self.bank);
            debug!(sent, "register dump published");
            self.last_publish = Some(Instant::now());
        }
        LinkState::Connected
    }

    fn send(&self, topic: String, payload: String, retain: bool) {
        if let Err(e) = self.broker.publish(topic, payload, retain) {
            warn!("publish failed: {e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
