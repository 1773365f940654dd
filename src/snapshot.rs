//! Periodic engine-state snapshots.
//!
//! On a timer, serializes the instance summaries, open positions, recent
//! closed positions, and PnL totals to a JSON file, and publishes a
//! `snapshot` event on each save. Restoring is a load-and-report: the
//! engine does not replay a snapshot back into strategies.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::error::Result;
use crate::orchestrator::Orchestrator;

const CLOSED_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub path: PathBuf,
    pub interval_secs: u64,
    pub enabled: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("state/snapshot.json"),
            interval_secs: 60,
            enabled: true,
        }
    }
}

pub struct Snapshotter {
    config: SnapshotConfig,
    bus: Arc<EventBus>,
    orchestrator: Arc<Orchestrator>,
}

impl Snapshotter {
    pub fn new(
        config: SnapshotConfig,
        bus: Arc<EventBus>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            config,
            bus,
            orchestrator,
        }
    }

    /// Assemble the snapshot document from current engine state.
    #[must_use]
    pub fn capture(&self) -> Value {
        let ledger = self.orchestrator.ledger();
        json!({
            "saved_at": Utc::now(),
            "instances": self.orchestrator.instances_summary(),
            "open_positions": ledger.all_open(),
            "closed_positions": ledger.closed(CLOSED_HISTORY_LIMIT),
            "totals": {
                "realized_pnl": ledger.total_realized(),
                "unrealized_pnl": ledger.total_unrealized(),
                "daily_pnl": self.orchestrator.risk().daily_pnl(),
            },
            "risk": self.orchestrator.risk().status(),
        })
    }

    /// Capture and write the snapshot file, then publish a `snapshot`
    /// event.
    pub fn save(&self) -> Result<()> {
        let snapshot = self.capture();
        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.config.path, serde_json::to_string_pretty(&snapshot)?)?;
        info!(path = %self.config.path.display(), "Snapshot saved");
        self.bus.publish_snapshot(json!({
            "path": self.config.path,
            "instances": self.orchestrator.instance_count(),
            "open_positions": self.orchestrator.ledger().open_count(),
        }));
        Ok(())
    }

    /// Read a previously saved snapshot document.
    pub fn load(path: &Path) -> Result<Value> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Save on a fixed interval until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.save() {
                warn!(error = %e, "Snapshot save failed");
            }
        }
    }
}
