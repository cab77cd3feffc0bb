// =============================================================================
// Order manager — single owner of order state, retries, broker calls
// =============================================================================
//
// Responsibilities:
//   - Submit entries as brackets: once the entry fills, the linked stop and
//     take are submitted atomically; a failed link flags the position and
//     leaves an audit record.
//   - Working-order hygiene: before any new submit for a symbol, every
//     still-working order for that symbol is cancelled and awaited to a
//     terminal state. A global sweep runs each cycle and at shutdown.
//   - Retry transient submit failures with exponential backoff up to
//     max_order_retries; fatal failures reject the order and feed the risk
//     kernel's escalation tally.
//   - Route fills to the position tracker and the trade log, in
//     broker-reported order (the single event loop guarantees this).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, BrokerEvent, BrokerHandle, BrokerOrderStatus, OrderSide, TicketType};
use crate::journal::{AuditRecord, FillRecord, Journal};
use crate::orders::{Fill, Order, OrderState};
use crate::positions::PositionTracker;
use crate::risk::RiskKernel;

/// Base delay for the exponential submit backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
/// Budget for a bracket child submission.
const BRACKET_LINK_TIMEOUT: Duration = Duration::from_secs(3);
/// How long to wait for cancelled orders to reach a terminal state.
const CANCEL_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Protective levels to establish once an entry fills, tagged with the
/// cycle that approved the entry so lifecycle audit records stay traceable.
#[derive(Debug, Clone)]
struct BracketPlan {
    stop_price: f64,
    take_price: f64,
    cycle_id: u64,
}

pub struct OrderManager {
    orders: RwLock<HashMap<String, Order>>,
    /// broker_id -> order id, for event routing.
    broker_index: RwLock<HashMap<String, String>>,
    pending_brackets: RwLock<HashMap<String, BracketPlan>>,
    broker: BrokerHandle,
    tracker: Arc<PositionTracker>,
    journal: Arc<Journal>,
    kernel: Arc<RiskKernel>,
    max_retries: u32,
}

impl OrderManager {
    pub fn new(
        broker: BrokerHandle,
        tracker: Arc<PositionTracker>,
        journal: Arc<Journal>,
        kernel: Arc<RiskKernel>,
        max_retries: u32,
    ) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            broker_index: RwLock::new(HashMap::new()),
            pending_brackets: RwLock::new(HashMap::new()),
            broker,
            tracker,
            journal,
            kernel,
            max_retries,
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn order(&self, id: &str) -> Option<Order> {
        self.orders.read().get(id).cloned()
    }

    /// Orders the engine still considers live, optionally per symbol.
    pub fn working_orders(&self, symbol: Option<&str>) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.state.is_working())
            .filter(|o| symbol.is_none() || symbol == Some(o.symbol.as_str()))
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Submit an entry order with its bracket plan. The pre-submit sweep
    /// guarantees no working order for the symbol exists at submit time.
    /// `cycle_id` is the cycle that approved the intent; it tags any audit
    /// record the bracket lifecycle emits later.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_bracket_entry(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        stop_price: f64,
        take_price: f64,
        strategy_label: &str,
        cycle_id: u64,
    ) -> Result<String, BrokerError> {
        self.cancel_working_for_symbol(symbol).await;

        let order = Order::new(symbol, side, TicketType::Market, qty, strategy_label);
        let order_id = order.id.clone();
        self.orders.write().insert(order_id.clone(), order);
        self.pending_brackets.write().insert(
            order_id.clone(),
            BracketPlan {
                stop_price,
                take_price,
                cycle_id,
            },
        );

        match self.place_with_retry(&order_id).await {
            Ok(()) => Ok(order_id),
            Err(e) => {
                self.pending_brackets.write().remove(&order_id);
                Err(e)
            }
        }
    }

    /// Submit a closing market order for an exit. Pre-sweeps the symbol so
    /// resting bracket children cannot fight the close.
    pub async fn submit_market_close(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        reason: &str,
    ) -> Result<String, BrokerError> {
        self.cancel_working_for_symbol(symbol).await;

        let order = Order::new(symbol, side, TicketType::Market, qty, reason);
        let order_id = order.id.clone();
        self.orders.write().insert(order_id.clone(), order);

        self.place_with_retry(&order_id).await?;
        Ok(order_id)
    }

    /// Place an order, retrying transient failures with exponential backoff.
    async fn place_with_retry(&self, order_id: &str) -> Result<(), BrokerError> {
        let ticket = match self.orders.read().get(order_id) {
            Some(order) => order.ticket(),
            None => return Err(BrokerError::fatal(-3, "order vanished before submit")),
        };

        let mut attempt: u32 = 0;
        loop {
            match self.broker.place_order(ticket.clone()).await {
                Ok(broker_id) => {
                    let mut orders = self.orders.write();
                    if let Some(order) = orders.get_mut(order_id) {
                        order.broker_id = Some(broker_id.clone());
                        if let Err(e) = order.transition(OrderState::Submitted) {
                            error!(order_id, error = %e, "submit transition failed");
                        }
                        order.retries = attempt;
                    }
                    self.broker_index.write().insert(broker_id, order_id.to_string());
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY * 2_u32.pow(attempt - 1);
                    warn!(
                        order_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient submit failure — retrying"
                    );
                    // FAILED -> (retry) -> SUBMITTED per the state machine.
                    if let Some(order) = self.orders.write().get_mut(order_id) {
                        let _ = order.transition(OrderState::Failed);
                    }
                    sleep(delay).await;
                    if let Some(order) = self.orders.write().get_mut(order_id) {
                        let _ = order.transition(OrderState::Submitted);
                        order.retries = attempt;
                    }
                }
                Err(e) => {
                    let terminal = if e.is_transient() {
                        OrderState::Failed
                    } else {
                        self.kernel.record_broker_fatal(&ticket.symbol);
                        OrderState::Rejected
                    };
                    warn!(order_id, state = %terminal, error = %e, "order submit failed");
                    if let Some(order) = self.orders.write().get_mut(order_id) {
                        let _ = order.transition(terminal);
                    }
                    return Err(e);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Working-order hygiene
    // -------------------------------------------------------------------------

    /// Cancel every still-working order for `symbol` — both the broker's
    /// view and ours — then wait until none remain working locally.
    pub async fn cancel_working_for_symbol(&self, symbol: &str) {
        // Broker-side view first: it may track orders we already forgot.
        match self.broker.working_orders(Some(symbol)).await {
            Ok(working) => {
                for w in working {
                    debug!(symbol, broker_id = %w.broker_id, "pre-submit cancel");
                    if let Err(e) = self.broker.cancel_order(&w.broker_id).await {
                        warn!(symbol, broker_id = %w.broker_id, error = %e, "cancel failed");
                    }
                }
            }
            Err(e) => warn!(symbol, error = %e, "could not list working orders"),
        }

        // Local view: PENDING orders never reached the broker and can be
        // cancelled directly; submitted ones get a broker cancel.
        let local: Vec<(String, Option<String>)> = self
            .working_orders(Some(symbol))
            .into_iter()
            .map(|o| (o.id, o.broker_id))
            .collect();
        for (order_id, broker_id) in local {
            match broker_id {
                Some(broker_id) => {
                    if let Err(e) = self.broker.cancel_order(&broker_id).await {
                        warn!(symbol, broker_id = %broker_id, error = %e, "cancel failed");
                    }
                }
                None => {
                    if let Some(order) = self.orders.write().get_mut(&order_id) {
                        let _ = order.transition(OrderState::Cancelled);
                    }
                }
            }
        }

        self.await_no_working(symbol).await;
    }

    async fn await_no_working(&self, symbol: &str) {
        let settled = timeout(CANCEL_SETTLE_TIMEOUT, async {
            loop {
                if self.working_orders(Some(symbol)).is_empty() {
                    return;
                }
                sleep(CANCEL_POLL_INTERVAL).await;
            }
        })
        .await;

        if settled.is_err() {
            // Events did not arrive in time; force the local view terminal so
            // the invariant (no working order before a new submit) holds.
            warn!(symbol, "cancel settle timed out — forcing local orders terminal");
            let mut orders = self.orders.write();
            for order in orders.values_mut() {
                if order.symbol == symbol && order.state.is_working() {
                    let _ = order.transition(OrderState::Cancelled);
                }
            }
        }
    }

    /// Cancel all working orders everywhere. Runs each cycle and at shutdown.
    pub async fn global_cancel_sweep(&self) {
        let working = self.working_orders(None);
        if working.is_empty() {
            return;
        }
        info!(count = working.len(), "global working-order sweep");
        let symbols: Vec<String> = {
            let mut s: Vec<String> = working.into_iter().map(|o| o.symbol).collect();
            s.sort();
            s.dedup();
            s
        };
        for symbol in symbols {
            self.cancel_working_for_symbol(&symbol).await;
        }
    }

    // -------------------------------------------------------------------------
    // Broker events
    // -------------------------------------------------------------------------

    fn order_id_for(&self, broker_id: &str, client_id: &str) -> Option<String> {
        if self.orders.read().contains_key(client_id) {
            return Some(client_id.to_string());
        }
        self.broker_index.read().get(broker_id).cloned()
    }

    /// Apply one broker event to the order book. Bar events are routed to
    /// the cache by the event loop, not here.
    pub async fn handle_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Bar(_) => {}
            BrokerEvent::OrderStatus {
                broker_id,
                client_id,
                status,
            } => {
                let Some(order_id) = self.order_id_for(&broker_id, &client_id) else {
                    debug!(broker_id = %broker_id, "status for unknown order");
                    return;
                };
                let target = match status {
                    BrokerOrderStatus::Submitted
                    | BrokerOrderStatus::PendingSubmit
                    | BrokerOrderStatus::PendingCancel => None,
                    BrokerOrderStatus::Cancelled => Some(OrderState::Cancelled),
                    BrokerOrderStatus::Rejected => Some(OrderState::Rejected),
                    // Fill accounting arrives via Fill events.
                    BrokerOrderStatus::Filled => None,
                };
                if let Some(target) = target {
                    let mut orders = self.orders.write();
                    if let Some(order) = orders.get_mut(&order_id) {
                        if !order.state.is_terminal() {
                            if let Err(e) = order.transition(target) {
                                error!(order_id, error = %e, "status transition failed");
                            }
                        }
                    }
                }
            }

            BrokerEvent::Fill {
                broker_id,
                client_id,
                symbol,
                side,
                qty,
                price,
                commission,
                ts,
            } => {
                let Some(order_id) = self.order_id_for(&broker_id, &client_id) else {
                    warn!(broker_id = %broker_id, symbol = %symbol, "fill for unknown order");
                    return;
                };
                self.apply_fill(&order_id, &symbol, side, qty, price, commission, ts)
                    .await;
            }

            BrokerEvent::Error { code, message } => {
                warn!(code, message = %message, "broker error event");
            }
        }
    }

    async fn apply_fill(
        &self,
        order_id: &str,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
        commission: f64,
        ts: i64,
    ) {
        let (strategy_label, now_filled) = {
            let mut orders = self.orders.write();
            let Some(order) = orders.get_mut(order_id) else {
                return;
            };
            if let Err(e) = order.apply_fill(Fill {
                qty,
                price,
                commission,
                ts,
            }) {
                error!(order_id, error = %e, "fill application failed");
                return;
            }
            (order.strategy_label.clone(), order.state == OrderState::Filled)
        };

        // Position first, then the trade log.
        if let Err(e) = self
            .tracker
            .apply_fill(symbol, side, qty, price, commission, ts)
        {
            error!(symbol, error = %e, "position update from fill failed");
        }
        self.journal.record_fill(&FillRecord::new(
            ts,
            symbol,
            side,
            qty,
            price,
            commission,
            order_id,
            &strategy_label,
        ));

        if now_filled {
            self.establish_bracket(order_id, symbol).await;
        }
    }

    /// Submit the stop and take children for a filled entry. Both go out
    /// back-to-back; a failure on either flags the position.
    async fn establish_bracket(&self, entry_id: &str, symbol: &str) {
        let Some(plan) = self.pending_brackets.write().remove(entry_id) else {
            return;
        };
        let (side, qty, label) = match self.orders.read().get(entry_id) {
            Some(order) => (
                match order.side {
                    OrderSide::Buy => OrderSide::Sell,
                    OrderSide::Sell => OrderSide::Buy,
                },
                order.filled_qty(),
                order.strategy_label.clone(),
            ),
            None => return,
        };

        let stop_result = self
            .submit_child(
                entry_id,
                symbol,
                side,
                TicketType::Stop {
                    stop: plan.stop_price,
                },
                qty,
                &label,
            )
            .await;
        let take_result = self
            .submit_child(
                entry_id,
                symbol,
                side,
                TicketType::Limit {
                    limit: plan.take_price,
                },
                qty,
                &label,
            )
            .await;

        match (&stop_result, &take_result) {
            (Ok(stop_id), Ok(take_id)) => {
                let mut orders = self.orders.write();
                if let Some(order) = orders.get_mut(entry_id) {
                    order.linked_stop_id = Some(stop_id.clone());
                    order.linked_take_id = Some(take_id.clone());
                }
                info!(symbol, entry_id, "bracket established");
            }
            _ => {
                let detail = format!(
                    "bracket link failed (stop: {}, take: {})",
                    stop_result.as_ref().map(|_| "ok").unwrap_or("failed"),
                    take_result.as_ref().map(|_| "ok").unwrap_or("failed"),
                );
                error!(symbol, entry_id, detail = %detail, "bracket link failure");
                self.tracker.flag(symbol, &detail);
                self.journal.record_audit(&AuditRecord {
                    ts: Utc::now().timestamp_millis(),
                    cycle_id: plan.cycle_id,
                    intent_id: entry_id.to_string(),
                    symbol: symbol.to_string(),
                    stage: 5,
                    verdict: "REJECT".into(),
                    reason: Some("BRACKET_LINK_FAILED".into()),
                    summary: detail,
                });
            }
        }
    }

    async fn submit_child(
        &self,
        parent_id: &str,
        symbol: &str,
        side: OrderSide,
        ticket_type: TicketType,
        qty: f64,
        label: &str,
    ) -> Result<String, BrokerError> {
        let mut order = Order::new(symbol, side, ticket_type, qty, label);
        order.parent_id = Some(parent_id.to_string());
        let order_id = order.id.clone();
        let ticket = order.ticket();
        self.orders.write().insert(order_id.clone(), order);

        let placed = timeout(BRACKET_LINK_TIMEOUT, self.broker.place_order(ticket))
            .await
            .map_err(|_| BrokerError::timeout("bracket link"))?;

        match placed {
            Ok(broker_id) => {
                let mut orders = self.orders.write();
                if let Some(order) = orders.get_mut(&order_id) {
                    order.broker_id = Some(broker_id.clone());
                    let _ = order.transition(OrderState::Submitted);
                }
                self.broker_index.write().insert(broker_id, order_id.clone());
                Ok(order_id)
            }
            Err(e) => {
                if let Some(order) = self.orders.write().get_mut(&order_id) {
                    let _ = order.transition(OrderState::Failed);
                }
                Err(e)
            }
        }
    }
}

/// Drain the broker event stream: order events into the manager, subscribed
/// bars into the cache. Spawn once at startup; exits when the broker task
/// drops its event sender.
pub async fn run_order_events(
    manager: Arc<OrderManager>,
    cache: Arc<crate::market_data::BarCache>,
    mut rx: mpsc::UnboundedReceiver<BrokerEvent>,
) {
    info!("broker event loop started");
    while let Some(event) = rx.recv().await {
        match event {
            BrokerEvent::Bar(bar) => {
                let key = crate::market_data::BarKey::new(&bar.symbol, bar.timeframe);
                cache.append(&key, vec![bar]);
            }
            other => manager.handle_event(other).await,
        }
    }
    info!("broker event loop stopped");
}
