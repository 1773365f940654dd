//! Strategy orchestration: instance creation, lifecycle, market-data
//! fan-out, and fill routing.
//!
//! Strategy types are a closed set: [`StrategyKind`] is matched
//! exhaustively at creation, so an unknown type is rejected before any
//! instance state exists.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::domain::position::PositionLedger;
use crate::domain::{Fill, OrderBook, Symbol, Ticker};
use crate::error::{Result, ValidationError};
use crate::exchange::ExchangeConnector;
use crate::risk::RiskEngine;
use crate::strategy::{
    self, ArbitrageStrategy, AvellanedaStrategy, HedgeStrategy, MarketMakerStrategy, Strategy,
    StrategyCore,
};

/// The closed set of strategy algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    MarketMaker,
    Avellaneda,
    Arbitrage,
    Hedge,
}

impl StrategyKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::MarketMaker => "market_maker",
            StrategyKind::Avellaneda => "avellaneda",
            StrategyKind::Arbitrage => "arbitrage",
            StrategyKind::Hedge => "hedge",
        }
    }

    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            StrategyKind::MarketMaker => "Inventory-skewed two-sided quoting",
            StrategyKind::Avellaneda => "Avellaneda-Stoikov reservation-price quoting",
            StrategyKind::Arbitrage => "Cross-market spread arbitrage",
            StrategyKind::Hedge => "Ratio-targeted derivative hedging",
        }
    }

    /// Every known kind, for summaries and command surfaces.
    #[must_use]
    pub fn all() -> [StrategyKind; 4] {
        [
            StrategyKind::MarketMaker,
            StrategyKind::Avellaneda,
            StrategyKind::Arbitrage,
            StrategyKind::Hedge,
        ]
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "market_maker" => Ok(StrategyKind::MarketMaker),
            "avellaneda" => Ok(StrategyKind::Avellaneda),
            "arbitrage" => Ok(StrategyKind::Arbitrage),
            "hedge" => Ok(StrategyKind::Hedge),
            other => Err(ValidationError::UnknownStrategy {
                name: other.to_string(),
            }),
        }
    }
}

struct Instance {
    kind: StrategyKind,
    strategy: Arc<dyn Strategy>,
    created_at: DateTime<Utc>,
    last_active: RwLock<DateTime<Utc>>,
}

/// Owns every strategy instance and the shared engine handles they are
/// built from.
pub struct Orchestrator {
    bus: Arc<EventBus>,
    ledger: Arc<PositionLedger>,
    risk: Arc<RiskEngine>,
    connector: Arc<dyn ExchangeConnector>,
    instances: DashMap<String, Instance>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        ledger: Arc<PositionLedger>,
        risk: Arc<RiskEngine>,
        connector: Arc<dyn ExchangeConnector>,
    ) -> Self {
        Self {
            bus,
            ledger,
            risk,
            connector,
            instances: DashMap::new(),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn risk(&self) -> &Arc<RiskEngine> {
        &self.risk
    }

    /// Create an instance of `kind` with the given config map. The config
    /// must carry a `symbol`; anything else is strategy-specific. Returns
    /// the generated instance id.
    pub fn create_instance(&self, kind: &str, config: Map<String, Value>) -> Result<String> {
        let kind: StrategyKind = kind.parse()?;
        let symbol = config
            .get("symbol")
            .and_then(Value::as_str)
            .map(Symbol::from)
            .ok_or(ValidationError::InvalidConfig {
                reason: "symbol is required".to_string(),
            })?;

        let id = Uuid::new_v4().to_string();
        let core = StrategyCore::new(
            id.clone(),
            symbol,
            self.bus.clone(),
            self.ledger.clone(),
            self.risk.clone(),
            self.connector.clone(),
            config,
        );
        let strategy: Arc<dyn Strategy> = match kind {
            StrategyKind::MarketMaker => Arc::new(MarketMakerStrategy::new(core)?),
            StrategyKind::Avellaneda => Arc::new(AvellanedaStrategy::new(core)?),
            StrategyKind::Arbitrage => Arc::new(ArbitrageStrategy::new(core)?),
            StrategyKind::Hedge => Arc::new(HedgeStrategy::new(core)?),
        };

        let now = Utc::now();
        self.instances.insert(
            id.clone(),
            Instance {
                kind,
                strategy,
                created_at: now,
                last_active: RwLock::new(now),
            },
        );
        info!(instance = %id, kind = %kind, "Instance created");
        self.bus
            .publish_strategy(&id, "created", Some(json!({ "type": kind })));
        Ok(id)
    }

    /// Start an instance's main loop. Returns false for unknown ids.
    pub fn start_instance(&self, id: &str) -> bool {
        let Some(entry) = self.instances.get(id) else {
            warn!(instance = %id, "Start of unknown instance");
            return false;
        };
        strategy::start(entry.strategy.clone());
        true
    }

    /// Stop an instance, cancelling its tracked orders. Returns false for
    /// unknown ids.
    pub async fn stop_instance(&self, id: &str) -> bool {
        let Some(handle) = self.instances.get(id).map(|e| e.strategy.clone()) else {
            warn!(instance = %id, "Stop of unknown instance");
            return false;
        };
        strategy::stop(&handle).await;
        true
    }

    /// Stop and remove an instance. Returns false for unknown ids.
    pub async fn delete_instance(&self, id: &str) -> bool {
        let Some((_, instance)) = self.instances.remove(id) else {
            warn!(instance = %id, "Delete of unknown instance");
            return false;
        };
        strategy::stop(&instance.strategy).await;
        info!(instance = %id, "Instance deleted");
        self.bus.publish_strategy(id, "deleted", None);
        true
    }

    /// Shallow-merge a config patch into an instance's config map.
    /// Strategies that cached typed values at construction keep them; only
    /// flags read at use time observe the patch.
    pub fn update_config(&self, id: &str, patch: &Map<String, Value>) -> bool {
        let Some(entry) = self.instances.get(id) else {
            warn!(instance = %id, "Config update for unknown instance");
            return false;
        };
        entry.strategy.core().merge_config(patch);
        info!(instance = %id, "Config updated");
        true
    }

    /// Deliver market data to every running instance. A failure from one
    /// instance is logged and never halts delivery to the rest.
    pub async fn distribute_market_data(&self, ticker: &Ticker, book: Option<&OrderBook>) {
        if let Some(mid) = ticker.mid_price() {
            self.ledger.update_unrealized(&ticker.symbol, mid);
        }

        let now = Utc::now();
        let running: Vec<(String, Arc<dyn Strategy>)> = self
            .instances
            .iter()
            .filter(|entry| entry.strategy.core().is_running())
            .map(|entry| {
                *entry.last_active.write() = now;
                (entry.key().clone(), entry.strategy.clone())
            })
            .collect();

        for (id, handle) in running {
            if let Err(e) = handle.on_tick(ticker).await {
                warn!(instance = %id, error = %e, "Tick handler failed");
            }
            if let Some(book) = book {
                if let Err(e) = handle.on_order_book(book).await {
                    warn!(instance = %id, error = %e, "Order-book handler failed");
                }
            }
        }
    }

    /// Route a connector fill to whichever instance tracks its order id.
    /// Fills for unknown orders are ignored.
    pub fn handle_fill(&self, fill: &Fill) -> bool {
        for entry in self.instances.iter() {
            if entry.strategy.core().on_fill(fill) {
                return true;
            }
        }
        false
    }

    /// Per-instance summaries including each strategy's own status
    /// snapshot.
    #[must_use]
    pub fn instances_summary(&self) -> Vec<Value> {
        self.instances
            .iter()
            .map(|entry| {
                json!({
                    "id": entry.key(),
                    "type": entry.kind,
                    "running": entry.strategy.core().is_running(),
                    "created_at": entry.created_at,
                    "last_active": *entry.last_active.read(),
                    "status": entry.strategy.status(),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|entry| entry.strategy.core().is_running())
            .count()
    }

    /// Stop every running instance, for shutdown.
    pub async fn stop_all(&self) {
        let handles: Vec<Arc<dyn Strategy>> = self
            .instances
            .iter()
            .map(|entry| entry.strategy.clone())
            .collect();
        for handle in handles {
            strategy::stop(&handle).await;
        }
    }
}
