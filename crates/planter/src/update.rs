//! One-shot firmware update check, run on the first network connection.
//!
//! `<base>/<addr>.version` holds a single integer. When it is greater than
//! the running build, the image at `<base>/<addr>.bin` is downloaded next to
//! the installed binary and renamed over it, then the process restarts into
//! it. Every outcome is reported on `<addr>/Pub/update`; nothing is retried.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::mqtt::{Broker, Topics};
use crate::registers::{Alarm, AlarmFlag, SharedBank};
use crate::restart::RestartHandle;

/// Build number of this firmware, compared against the server's
/// `.version` file.
pub const FIRMWARE_VERSION: i64 = 20261017;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest silence tolerated while a response is streaming in. There is no
/// bound on the whole transfer; an image over a slow link just takes longer.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Firmware server seam
// ---------------------------------------------------------------------------

pub trait FirmwareServer: Send + Sync {
    fn latest_version(&self) -> impl Future<Output = Result<i64>> + Send;

    /// Fetch the image and put it in place of the running binary.
    fn install(&self) -> impl Future<Output = Result<()>> + Send;
}

pub struct HttpFirmware {
    client: reqwest::Client,
    version_url: String,
    image_url: String,
    install_path: PathBuf,
}

impl HttpFirmware {
    pub fn new(base_url: &str, addr: &str, install_path: PathBuf) -> Result<Self> {
        Self::with_timeouts(base_url, addr, install_path, CONNECT_TIMEOUT, READ_TIMEOUT)
    }

    pub fn with_timeouts(
        base_url: &str,
        addr: &str,
        install_path: PathBuf,
        connect: Duration,
        read: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect)
            .read_timeout(read)
            .build()
            .context("building HTTP client")?;
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client,
            version_url: format!("{base}/{addr}.version"),
            image_url: format!("{base}/{addr}.bin"),
            install_path,
        })
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.install_path.clone().into_os_string();
        name.push(".staging");
        PathBuf::from(name)
    }
}

impl FirmwareServer for HttpFirmware {
    async fn latest_version(&self) -> Result<i64> {
        let body = self
            .client
            .get(&self.version_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("GET {}", self.version_url))?
            .text()
            .await
            .context("reading version body")?;
        body.trim()
            .parse::<i64>()
            .with_context(|| format!("version '{}' is not an integer", body.trim()))
    }

    async fn install(&self) -> Result<()> {
        let mut response = self
            .client
            .get(&self.image_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("GET {}", self.image_url))?;
        let expected = response.content_length();

        let staging = self.staging_path();
        let mut file = tokio::fs::File::create(&staging)
            .await
            .with_context(|| format!("creating {}", staging.display()))?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.context("downloading image")? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing {}", staging.display()))?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.context("syncing image")?;
        drop(file);

        ensure!(written > 0, "image is empty");
        if let Some(expected) = expected {
            ensure!(
                written == expected,
                "image truncated: {written} of {expected} bytes"
            );
        }

        tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))
            .await
            .context("marking image executable")?;
        tokio::fs::rename(&staging, &self.install_path)
            .await
            .with_context(|| format!("installing to {}", self.install_path.display()))?;
        info!(bytes = written, path = %self.install_path.display(), "image installed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Installed,
    UpToDate,
    Unreachable,
    Failed,
}

pub struct UpdateGate {
    pending: AlarmFlag,
    running: i64,
    settle: Duration,
}

impl UpdateGate {
    pub fn new(bank: &SharedBank, running: i64, settle: Duration) -> Result<Self> {
        Ok(Self {
            pending: bank.claim(Alarm::UpdatePending)?,
            running,
            settle,
        })
    }

    /// Check once and install if the server has a newer build. Consumes the
    /// gate so it can never run twice.
    pub async fn run<S, B>(
        self,
        server: &S,
        broker: &B,
        topics: &Topics,
        restart: &RestartHandle,
    ) -> UpdateOutcome
    where
        S: FirmwareServer,
        B: Broker + ?Sized,
    {
        let report = |msg: String| {
            info!(%msg, "update");
            if let Err(e) = broker.publish(topics.update(), msg, false) {
                warn!("update report not sent: {e:#}");
            }
        };

        let latest = match server.latest_version().await {
            Ok(v) => v,
            Err(e) => {
                report(format!("firmware version unreachable: {e:#}"));
                return UpdateOutcome::Unreachable;
            }
        };

        if latest <= self.running {
            report(format!(
                "not necessary to update, running version {} (server has {latest})",
                self.running
            ));
            return UpdateOutcome::UpToDate;
        }

        self.pending.raise();
        report("Updating".to_string());
        sleep(self.settle).await;
        let installed = server.install().await;
        sleep(self.settle).await;

        match installed {
            Ok(()) => {
                report(format!("installed version {latest}, restarting"));
                restart.request("firmware installed");
                UpdateOutcome::Installed
            }
            Err(e) => {
                report(format!("update to version {latest} failed: {e:#}"));
                self.pending.clear();
                UpdateOutcome::Failed
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
