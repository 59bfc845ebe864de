use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;

use crate::registers::{reg, Alarm, SharedBank, REGISTER_COUNT};
use crate::update::FIRMWARE_VERSION;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StatusState {
    inner: Arc<Inner>,
}

struct Inner {
    bank: SharedBank,
    hardware_address: String,
    started_at: Instant,
}

impl StatusState {
    pub fn new(bank: SharedBank, hardware_address: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                bank,
                hardware_address,
                started_at: Instant::now(),
            }),
        }
    }

    fn to_status(&self) -> StatusResponse {
        let registers = self.inner.bank.snapshot();
        StatusResponse {
            hardware_address: self.inner.hardware_address.clone(),
            firmware_version: FIRMWARE_VERSION,
            uptime_secs: self.inner.started_at.elapsed().as_secs(),
            valve_open: registers[reg::VALVE] != 0,
            alarms: self.inner.bank.alarms().iter().collect(),
            registers,
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    hardware_address: String,
    firmware_version: i64,
    uptime_secs: u64,
    valve_open: bool,
    alarms: Vec<Alarm>,
    registers: [u32; REGISTER_COUNT],
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn api_status(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.to_status())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: StatusState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding status port {addr}"))?;

    info!("status endpoint listening on http://{addr}/api/status");

    axum::serve(listener, router(state))
        .await
        .context("status server error")
}

// ===========================================================================
// Tests
// ===========================================================================
