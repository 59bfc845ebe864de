//! Process restart requests. Any task may ask for a restart; `main` waits
//! on the handle and replaces the process image with a fresh copy of the
//! current binary.

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct RestartHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl RestartHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn request(&self, reason: &str) {
        info!(reason, "restart requested");
        self.tx.send_replace(true);
    }

    #[cfg(test)]
    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a restart has been requested.
    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for RestartHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-execute the running binary with the same arguments. Only returns on
/// failure.
pub fn reexec() -> Result<()> {
    let exe = std::env::current_exe().context("locating current executable")?;
    let err = Command::new(&exe).args(std::env::args_os().skip(1)).exec();
    Err(err).with_context(|| format!("re-executing {}", exe.display()))
}

// ===========================================================================
// Tests
// ===========================================================================
