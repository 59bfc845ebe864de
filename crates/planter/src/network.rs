//! Network link status for the sync agent.
//!
//! Provisioning itself (credentials, captive portal) belongs to the host
//! OS. The device only watches the interface: `auto_connect` waits for the
//! link within the connect timeout, then keeps waiting through the portal
//! window while an operator provisions it.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::normalize_hardware_address;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub trait NetworkLink: Send + Sync {
    fn is_up(&self) -> bool;

    /// Wait for the link to come up. Returns whether it did.
    fn auto_connect(
        &self,
        connect_timeout: Duration,
        portal_timeout: Duration,
    ) -> impl Future<Output = bool> + Send;
}

// ---------------------------------------------------------------------------
// Host interface via sysfs
// ---------------------------------------------------------------------------

pub struct HostNetwork {
    root: PathBuf,
    interface: String,
}

impl HostNetwork {
    pub fn new(interface: &str) -> Self {
        Self::with_root("/sys/class/net", interface)
    }

    pub fn with_root(root: impl Into<PathBuf>, interface: &str) -> Self {
        Self {
            root: root.into(),
            interface: interface.to_string(),
        }
    }

    fn attribute(&self, name: &str) -> Result<String> {
        let path = self.root.join(&self.interface).join(name);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(raw.trim().to_string())
    }

    /// MAC address of the interface, normalized for topic use.
    pub fn hardware_address(&self) -> Result<String> {
        let addr = normalize_hardware_address(&self.attribute("address")?);
        ensure!(
            !addr.is_empty(),
            "interface {} has no hardware address",
            self.interface
        );
        Ok(addr)
    }

    async fn wait_up(&self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        loop {
            if self.is_up() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

impl NetworkLink for HostNetwork {
    fn is_up(&self) -> bool {
        match self.attribute("operstate") {
            Ok(state) => state == "up",
            Err(e) => {
                debug!("{e:#}");
                false
            }
        }
    }

    async fn auto_connect(&self, connect_timeout: Duration, portal_timeout: Duration) -> bool {
        if self.wait_up(connect_timeout).await {
            return true;
        }
        info!(
            interface = %self.interface,
            portal_s = portal_timeout.as_secs(),
            "link still down, waiting for provisioning"
        );
        let up = self.wait_up(portal_timeout).await;
        if !up {
            warn!(interface = %self.interface, "network unavailable");
        }
        up
    }
}

// ===========================================================================
// Tests
// ===========================================================================
