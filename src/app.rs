//! Engine assembly and run loop.
//!
//! Wires the bus, ledger, risk engine, paper connector, orchestrator, and
//! snapshotter together from a [`Config`], creates the configured strategy
//! instances, and drives a synthetic ticker feed until shutdown.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::domain::position::PositionLedger;
use crate::domain::{Fill, Symbol};
use crate::error::Result;
use crate::exchange::{PaperConnector, RandomWalk};
use crate::orchestrator::Orchestrator;
use crate::risk::RiskEngine;
use crate::snapshot::Snapshotter;

pub struct App {
    config: Config,
    bus: Arc<EventBus>,
    connector: Arc<PaperConnector>,
    orchestrator: Arc<Orchestrator>,
    snapshotter: Arc<Snapshotter>,
    fills_rx: mpsc::UnboundedReceiver<Fill>,
    started_at: Instant,
}

impl App {
    /// Build the engine and create (and optionally start) the configured
    /// strategy instances. Must be called within a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(PositionLedger::new());
        let risk = Arc::new(RiskEngine::new(config.risk.clone()));
        let (connector, fills_rx) =
            PaperConnector::new(config.exchange.initial_balances.clone());
        let connector = Arc::new(connector.with_name(config.exchange.name.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            bus.clone(),
            ledger,
            risk,
            connector.clone(),
        ));
        let snapshotter = Arc::new(Snapshotter::new(
            config.snapshot.clone(),
            bus.clone(),
            orchestrator.clone(),
        ));

        for def in &config.strategies {
            let id = orchestrator.create_instance(&def.kind, def.config.clone())?;
            if def.autostart {
                orchestrator.start_instance(&id);
            }
        }
        if config.strategies.is_empty() {
            warn!("No strategies configured, engine will only publish market data");
        }

        Ok(Self {
            config,
            bus,
            connector,
            orchestrator,
            snapshotter,
            fills_rx,
            started_at: Instant::now(),
        })
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run until interrupted, then stop every instance and write a final
    /// snapshot.
    pub async fn run(self) -> Result<()> {
        info!(exchange = %self.config.exchange.name, "Engine starting");
        self.bus.publish_connected();

        let forwarder = spawn_fill_forwarder(self.fills_rx, self.orchestrator.clone());
        let heartbeat = spawn_heartbeat(
            self.bus.clone(),
            self.orchestrator.clone(),
            self.started_at,
            self.config.engine.status_interval_secs,
        );
        let snapshots = tokio::spawn(self.snapshotter.clone().run());

        let mut walks: Vec<RandomWalk> = self
            .config
            .exchange
            .symbols
            .iter()
            .map(|s| {
                RandomWalk::new(
                    Symbol::from(s.as_str()),
                    self.config.exchange.start_price,
                    self.config.exchange.walk_step_pct,
                )
            })
            .collect();
        let mut feed = interval(Duration::from_millis(
            self.config.engine.tick_interval_ms.max(50),
        ));

        loop {
            tokio::select! {
                _ = feed.tick() => {
                    for walk in &mut walks {
                        let tick = walk.next_tick();
                        self.connector.set_ticker(tick.clone());
                        self.bus.publish_price(&tick.symbol, tick.last, tick.bid, tick.ask);
                        self.orchestrator.distribute_market_data(&tick, None).await;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.orchestrator.stop_all().await;
        if let Err(e) = self.snapshotter.save() {
            warn!(error = %e, "Final snapshot failed");
        }
        self.bus.publish_disconnected(Some("shutdown"));
        forwarder.abort();
        heartbeat.abort();
        snapshots.abort();
        info!("Engine stopped");
        Ok(())
    }
}

fn spawn_fill_forwarder(
    mut fills_rx: mpsc::UnboundedReceiver<Fill>,
    orchestrator: Arc<Orchestrator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(fill) = fills_rx.recv().await {
            if !orchestrator.handle_fill(&fill) {
                warn!(order_id = %fill.order_id, "Fill for untracked order ignored");
            }
        }
    })
}

fn spawn_heartbeat(
    bus: Arc<EventBus>,
    orchestrator: Arc<Orchestrator>,
    started_at: Instant,
    interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            bus.publish_system_status(
                started_at.elapsed().as_secs(),
                "running",
                orchestrator.running_count(),
                orchestrator.ledger().total_realized(),
            );
        }
    })
}
