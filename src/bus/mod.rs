//! Ordered, at-least-once publish/subscribe with bounded history.
//!
//! `publish` never blocks the caller longer than an enqueue: events land in
//! an unbounded channel and a single drain task delivers them one at a time.
//! Handler invocations for one event run concurrently with each other, but
//! delivery of event N+1 does not begin until the fan-out of event N has
//! completed, giving strict FIFO across events per bus.
//!
//! Failure isolation: a handler error never reaches the publisher, never
//! stalls the drain loop, and never suppresses delivery to sibling handlers.
//! Errors surface as `error` events (except for failures while handling an
//! `error` event, which are only logged, to avoid infinite recursion).

mod event;

pub use event::{Event, EventKind};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::domain::{OrderId, PositionSide, Symbol};
use crate::error::Error;

const MAX_HISTORY: usize = 1000;

/// A subscriber callback.
///
/// Handlers run on the bus drain task; returning an error isolates the
/// failure to this handler only.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), Error>;
}

/// Opaque identity of one subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

struct BusInner {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    history: RwLock<VecDeque<Event>>,
    next_subscription: RwLock<u64>,
}

impl BusInner {
    fn record(&self, event: Event) {
        let mut history = self.history.write();
        history.push_back(event);
        if history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }
}

/// The engine-wide event bus.
///
/// Constructed once at startup and passed by `Arc` to every component that
/// publishes or subscribes; there is no ambient global bus.
pub struct EventBus {
    inner: Arc<BusInner>,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    /// Create a bus and spawn its drain task.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(BusInner {
            subscribers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            next_subscription: RwLock::new(1),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(inner.clone(), rx, tx.downgrade()));
        Self { inner, tx }
    }

    /// Register a handler for one event kind. Handlers for a kind are
    /// invoked in subscription order within each event's fan-out.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = {
            let mut next = self.inner.next_subscription.write();
            let id = SubscriptionId(*next);
            *next += 1;
            id
        };
        self.inner
            .subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(Subscriber { id, handler });
        info!(kind = %kind, subscription = %id, "Subscribed");
        id
    }

    /// Register a synchronous closure as a handler.
    pub fn subscribe_fn<F>(&self, kind: EventKind, f: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        struct FnHandler<F>(F);

        #[async_trait]
        impl<F> EventHandler for FnHandler<F>
        where
            F: Fn(&Event) + Send + Sync,
        {
            async fn handle(&self, event: &Event) -> Result<(), Error> {
                (self.0)(event);
                Ok(())
            }
        }

        self.subscribe(kind, Arc::new(FnHandler(f)))
    }

    /// Remove a subscription. Returns false when the id is not registered
    /// under `kind`.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let Some(list) = subscribers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() < before;
        if removed {
            info!(kind = %kind, subscription = %id, "Unsubscribed");
        }
        removed
    }

    /// Publish an event. Appends to history and enqueues for delivery;
    /// never blocks on handlers.
    pub fn publish(&self, kind: EventKind, payload: Value) {
        let event = Event {
            kind,
            timestamp: Utc::now(),
            payload,
        };
        self.inner.record(event.clone());
        debug!(kind = %kind, "Publishing event");
        // Send only fails when the drain task is gone, i.e. at shutdown.
        let _ = self.tx.send(event);
    }

    /// Events recorded so far, most recent last, optionally filtered by
    /// kind and bounded to the last `limit` matches.
    #[must_use]
    pub fn history(&self, kind: Option<EventKind>, limit: usize) -> Vec<Event> {
        let history = self.inner.history.read();
        let filtered: Vec<Event> = history
            .iter()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].to_vec()
    }

    /// Drop all recorded history.
    pub fn clear_history(&self) {
        self.inner.history.write().clear();
    }

    // Typed convenience publishers. Pure syntactic sugar over `publish`:
    // each constructs the canonical payload for its event kind.

    pub fn publish_price(&self, symbol: &Symbol, price: Decimal, bid: Decimal, ask: Decimal) {
        self.publish(
            EventKind::Price,
            json!({ "symbol": symbol, "price": price, "bid": bid, "ask": ask }),
        );
    }

    pub fn publish_order_update(
        &self,
        order_id: &OrderId,
        status: &str,
        symbol: &Symbol,
        filled: Decimal,
        price: Decimal,
    ) {
        self.publish(
            EventKind::OrderUpdate,
            json!({
                "order_id": order_id,
                "status": status,
                "symbol": symbol,
                "filled": filled,
                "price": price,
            }),
        );
    }

    pub fn publish_trade(
        &self,
        order_id: &OrderId,
        symbol: &Symbol,
        price: Decimal,
        amount: Decimal,
        side: &str,
    ) {
        self.publish(
            EventKind::Trade,
            json!({
                "order_id": order_id,
                "symbol": symbol,
                "price": price,
                "amount": amount,
                "side": side,
            }),
        );
    }

    pub fn publish_position(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        size: Decimal,
        pnl: Decimal,
    ) {
        self.publish(
            EventKind::Position,
            json!({ "symbol": symbol, "side": side, "size": size, "pnl": pnl }),
        );
    }

    pub fn publish_balance(&self, asset: &str, free: Decimal, used: Decimal, total: Decimal) {
        self.publish(
            EventKind::Balance,
            json!({ "asset": asset, "free": free, "used": used, "total": total }),
        );
    }

    pub fn publish_strategy(&self, instance_id: &str, status: &str, detail: Option<Value>) {
        let mut payload = json!({ "id": instance_id, "status": status });
        if let Some(detail) = detail {
            payload["detail"] = detail;
        }
        self.publish(EventKind::Strategy, payload);
    }

    pub fn publish_log(&self, level: &str, message: &str) {
        self.publish(EventKind::Log, json!({ "level": level, "msg": message }));
    }

    pub fn publish_error(&self, error_type: &str, message: &str) {
        self.publish(
            EventKind::Error,
            json!({ "error_type": error_type, "message": message }),
        );
    }

    pub fn publish_connection(&self, exchange: &str, status: &str) {
        self.publish(
            EventKind::Connection,
            json!({ "exchange": exchange, "status": status }),
        );
    }

    pub fn publish_connected(&self) {
        self.publish(EventKind::Connected, json!({}));
    }

    pub fn publish_disconnected(&self, reason: Option<&str>) {
        self.publish(EventKind::Disconnected, json!({ "reason": reason }));
    }

    pub fn publish_system_status(
        &self,
        uptime_secs: u64,
        bot_status: &str,
        active_strategies: usize,
        total_profit: Decimal,
    ) {
        self.publish(
            EventKind::SystemStatus,
            json!({
                "uptime": uptime_secs,
                "bot_status": bot_status,
                "active_strategies": active_strategies,
                "total_profit": total_profit,
            }),
        );
    }

    pub fn publish_snapshot(&self, snapshot: Value) {
        self.publish(EventKind::Snapshot, snapshot);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// The drain loop: pops events strictly in order and fans each one out to
/// every handler currently registered for its kind.
///
/// Holds only a weak sender for error re-publish, so the channel closes
/// and the task exits once the bus itself is dropped.
async fn drain(
    inner: Arc<BusInner>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    tx: mpsc::WeakUnboundedSender<Event>,
) {
    while let Some(event) = rx.recv().await {
        let handlers: Vec<Arc<dyn EventHandler>> = inner
            .subscribers
            .read()
            .get(&event.kind)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            continue;
        }

        let results = join_all(handlers.iter().map(|h| h.handle(&event))).await;

        for result in results {
            if let Err(e) = result {
                error!(kind = %event.kind, error = %e, "Error in event handler");
                if event.kind != EventKind::Error {
                    let error_event = Event {
                        kind: EventKind::Error,
                        timestamp: Utc::now(),
                        payload: json!({
                            "error_type": "handler_failure",
                            "message": e.to_string(),
                            "source_kind": event.kind,
                        }),
                    };
                    inner.record(error_event.clone());
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx.send(error_event);
                    }
                }
            }
        }
    }
}
