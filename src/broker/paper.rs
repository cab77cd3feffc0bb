// =============================================================================
// Paper broker — simulated fills behind the real broker trait
// =============================================================================
//
// Selected by configuration (`execution.paper_trading`) or by a backtest
// entry point; the production pipeline never branches on it. Behavior:
//
//   - Market orders fill immediately at the current mark.
//   - Limit orders fill at the limit price when marketable, otherwise rest.
//   - Stop / stop-limit orders rest as working orders and trigger when a
//     mark update crosses the stop level.
//   - Commission: $0.005 per share, $1.00 minimum per fill.
//
// Marks are updated from the last close of every served historical-bars
// request, so the paper account tracks whatever data feeds the engine.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{
    BrokerClient, BrokerError, BrokerEvent, BrokerOrderStatus, OrderSide, OrderTicket, TicketType,
    WorkingOrder,
};
use crate::market_data::{Bar, BarKey, Timeframe};

const COMMISSION_PER_SHARE: f64 = 0.005;
const COMMISSION_MIN: f64 = 1.0;

struct RestingOrder {
    broker_id: String,
    ticket: OrderTicket,
}

/// In-process simulated broker.
pub struct PaperBroker {
    connected: bool,
    marks: HashMap<String, f64>,
    bars: HashMap<BarKey, Vec<Bar>>,
    subscriptions: std::collections::HashSet<BarKey>,
    resting: Vec<RestingOrder>,
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl PaperBroker {
    pub fn new(events: mpsc::UnboundedSender<BrokerEvent>) -> Self {
        Self {
            connected: false,
            marks: HashMap::new(),
            bars: HashMap::new(),
            subscriptions: std::collections::HashSet::new(),
            resting: Vec::new(),
            events,
        }
    }

    /// Feed one completed bar into the simulation: it lands in the
    /// historical store, moves the mark (triggering resting orders), and is
    /// published to subscribers.
    pub fn push_bar(&mut self, bar: Bar) {
        let key = BarKey::new(&bar.symbol, bar.timeframe);
        let symbol = bar.symbol.clone();
        self.bars.entry(key.clone()).or_default().push(bar.clone());
        self.set_mark(&symbol, bar.close);
        if self.subscriptions.contains(&key) {
            let _ = self.events.send(BrokerEvent::Bar(bar));
        }
    }

    /// Set the mark price for a symbol and trigger any resting stops it
    /// crosses.
    pub fn set_mark(&mut self, symbol: &str, price: f64) {
        self.marks.insert(symbol.to_string(), price);
        self.trigger_resting(symbol, price);
    }

    /// Seed the historical bar store for a series.
    pub fn load_bars(&mut self, key: BarKey, bars: Vec<Bar>) {
        if let Some(last) = bars.last() {
            self.marks.insert(key.symbol.clone(), last.close);
        }
        self.bars.insert(key, bars);
    }

    fn commission(qty: f64) -> f64 {
        (qty.abs() * COMMISSION_PER_SHARE).max(COMMISSION_MIN)
    }

    fn emit_fill(&self, broker_id: &str, ticket: &OrderTicket, price: f64) {
        let _ = self.events.send(BrokerEvent::OrderStatus {
            broker_id: broker_id.to_string(),
            client_id: ticket.client_id.clone(),
            status: BrokerOrderStatus::Filled,
        });
        let _ = self.events.send(BrokerEvent::Fill {
            broker_id: broker_id.to_string(),
            client_id: ticket.client_id.clone(),
            symbol: ticket.symbol.clone(),
            side: ticket.side,
            qty: ticket.qty,
            price,
            commission: Self::commission(ticket.qty),
            ts: Utc::now().timestamp_millis(),
        });
    }

    fn trigger_resting(&mut self, symbol: &str, price: f64) {
        let mut fired = Vec::new();
        self.resting.retain(|r| {
            if r.ticket.symbol != symbol {
                return true;
            }
            let fill = match r.ticket.ticket_type {
                // A sell stop triggers when price falls to the stop; a buy
                // stop when it rises to it.
                TicketType::Stop { stop } => {
                    let triggered = match r.ticket.side {
                        OrderSide::Sell => price <= stop,
                        OrderSide::Buy => price >= stop,
                    };
                    triggered.then_some(price)
                }
                TicketType::StopLimit { stop, limit } => {
                    let triggered = match r.ticket.side {
                        OrderSide::Sell => price <= stop,
                        OrderSide::Buy => price >= stop,
                    };
                    triggered.then_some(limit)
                }
                // A resting limit fills when the mark reaches it.
                TicketType::Limit { limit } => {
                    let marketable = match r.ticket.side {
                        OrderSide::Sell => price >= limit,
                        OrderSide::Buy => price <= limit,
                    };
                    marketable.then_some(limit)
                }
                TicketType::Market => None,
            };
            if let Some(fill_price) = fill {
                fired.push((r.broker_id.clone(), r.ticket.clone(), fill_price));
                false
            } else {
                true
            }
        });

        for (broker_id, ticket, fill_price) in fired {
            debug!(
                broker_id = %broker_id,
                symbol = %ticket.symbol,
                fill_price,
                "paper stop triggered"
            );
            self.emit_fill(&broker_id, &ticket, fill_price);
        }
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.connected = true;
        info!("paper broker connected");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn historical_bars(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        let key = BarKey::new(symbol, timeframe);
        let bars = self.bars.get(&key).cloned().unwrap_or_default();
        if let Some(last) = bars.last() {
            let close = last.close;
            self.set_mark(symbol, close);
        }
        let start = bars.len().saturating_sub(lookback);
        Ok(bars[start..].to_vec())
    }

    async fn subscribe_bars(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::transient(1100, "paper broker not connected"));
        }
        self.subscriptions.insert(BarKey::new(symbol, timeframe));
        Ok(())
    }

    async fn current_price(&mut self, symbol: &str) -> Result<Option<f64>, BrokerError> {
        Ok(self.marks.get(symbol).copied())
    }

    async fn place_order(&mut self, ticket: &OrderTicket) -> Result<String, BrokerError> {
        if !self.connected {
            return Err(BrokerError::transient(1100, "paper broker not connected"));
        }
        if ticket.qty <= 0.0 {
            return Err(BrokerError::fatal(201, "order quantity must be positive"));
        }

        let broker_id = format!("P-{}", Uuid::new_v4());
        let _ = self.events.send(BrokerEvent::OrderStatus {
            broker_id: broker_id.clone(),
            client_id: ticket.client_id.clone(),
            status: BrokerOrderStatus::Submitted,
        });

        match ticket.ticket_type {
            TicketType::Market => {
                let mark = self.marks.get(&ticket.symbol).copied();
                match mark {
                    Some(price) if price > 0.0 => self.emit_fill(&broker_id, ticket, price),
                    _ => {
                        warn!(symbol = %ticket.symbol, "no mark price for market order");
                        return Err(BrokerError::fatal(
                            200,
                            format!("no market data for {}", ticket.symbol),
                        ));
                    }
                }
            }
            TicketType::Limit { limit } => {
                let mark = self.marks.get(&ticket.symbol).copied();
                let marketable = match (mark, ticket.side) {
                    (Some(m), OrderSide::Buy) => m <= limit,
                    (Some(m), OrderSide::Sell) => m >= limit,
                    (None, _) => false,
                };
                if marketable {
                    self.emit_fill(&broker_id, ticket, limit);
                } else {
                    self.resting.push(RestingOrder {
                        broker_id: broker_id.clone(),
                        ticket: ticket.clone(),
                    });
                }
            }
            TicketType::Stop { .. } | TicketType::StopLimit { .. } => {
                self.resting.push(RestingOrder {
                    broker_id: broker_id.clone(),
                    ticket: ticket.clone(),
                });
            }
        }

        Ok(broker_id)
    }

    async fn cancel_order(&mut self, broker_id: &str) -> Result<(), BrokerError> {
        let before = self.resting.len();
        let mut client_id = None;
        self.resting.retain(|r| {
            if r.broker_id == broker_id {
                client_id = Some(r.ticket.client_id.clone());
                false
            } else {
                true
            }
        });

        if self.resting.len() < before {
            let _ = self.events.send(BrokerEvent::OrderStatus {
                broker_id: broker_id.to_string(),
                client_id: client_id.unwrap_or_default(),
                status: BrokerOrderStatus::Cancelled,
            });
        }
        // Cancelling an already-gone order is a no-op, as at the gateway.
        Ok(())
    }

    async fn working_orders(
        &mut self,
        symbol: Option<&str>,
    ) -> Result<Vec<WorkingOrder>, BrokerError> {
        Ok(self
            .resting
            .iter()
            .filter(|r| symbol.is_none() || symbol == Some(r.ticket.symbol.as_str()))
            .map(|r| WorkingOrder {
                broker_id: r.broker_id.clone(),
                client_id: r.ticket.client_id.clone(),
                symbol: r.ticket.symbol.clone(),
                side: r.ticket.side,
                qty: r.ticket.qty,
            })
            .collect())
    }
}
