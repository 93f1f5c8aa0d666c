//! Voxlink headless host.
//!
//! Opens the default microphone and speakers, starts one call against the
//! local echo endpoint, logs status transitions and a coarse volume meter,
//! and hangs up on Ctrl-C (or exits when the call ends on its own).
//!
//! The echo endpoint plays your own voice back; use headphones.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use voxlink_core::{CallConfig, CallEngine, CallStatus, CpalDevices, EchoConnector};

/// Minimum spacing between volume meter log lines.
const METER_LOG_INTERVAL: Duration = Duration::from_secs(1);

const METER_WIDTH: usize = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxlink=info")),
        )
        .init();

    let mut config = CallConfig::default();
    config.apply_env_overrides();
    info!(
        model = %config.model,
        voice = %config.voice,
        input_device = config.preferred_input_device.as_deref().unwrap_or("default"),
        "Voxlink starting"
    );

    let engine = Arc::new(CallEngine::new(
        config,
        CpalDevices::new(),
        EchoConnector::new(),
    ));

    let mut status_rx = engine.subscribe_status();
    let mut volume_rx = engine.subscribe_volume();

    tokio::spawn(async move {
        let mut last_log: Option<Instant> = None;
        loop {
            match volume_rx.recv().await {
                Ok(event) => {
                    let due = last_log.map_or(true, |t| t.elapsed() >= METER_LOG_INTERVAL);
                    if due && event.level > 0.0 {
                        last_log = Some(Instant::now());
                        info!(level = event.level, "mic {}", meter_bar(event.level));
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    engine.start_call().context("failed to start call")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, hanging up");
                engine.end_call().await;
                break;
            }
            event = status_rx.recv() => match event {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    info!(status = %event.status, "status {json}");
                    if event.status.is_terminal() {
                        if event.status == CallStatus::Error {
                            warn!(detail = event.detail.as_deref().unwrap_or(""), "call failed");
                        }
                        engine.end_call().await;
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let diag = engine.diagnostics_snapshot();
    info!(
        frames_sent = diag.frames_sent,
        frames_dropped = diag.frames_dropped,
        chunks_scheduled = diag.chunks_scheduled,
        chunks_malformed = diag.chunks_malformed,
        interruptions = diag.interruptions,
        "Voxlink stopped"
    );
    Ok(())
}

fn meter_bar(level: f32) -> String {
    let filled = ((level.clamp(0.0, 1.0) * METER_WIDTH as f32).round() as usize).min(METER_WIDTH);
    format!("[{}{}]", "#".repeat(filled), " ".repeat(METER_WIDTH - filled))
}
