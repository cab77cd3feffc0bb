// =============================================================================
// Orders — lifecycle state machine, fills, brackets
// =============================================================================
//
// State machine:
//
//   PENDING ─submit→ SUBMITTED ─partial→ PARTIAL ─complete→ FILLED
//                        │          │
//                        ├─reject→ REJECTED
//                        ├─error─→ FAILED ─retry(≤N)→ SUBMITTED
//                        └─cancel→ CANCELLED
//
// Terminal states: FILLED, CANCELLED, REJECTED, FAILED. Orders become
// immutable on reaching one. PENDING orders have no broker id; FILLED
// orders satisfy sum(fills.qty) == qty.
// =============================================================================

pub mod manager;

pub use manager::OrderManager;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{OrderSide, TicketType};
use crate::errors::EngineError;

/// Order lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Submitted,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Failed
        )
    }

    /// Still live from the engine's perspective.
    pub fn is_working(self) -> bool {
        matches!(self, Self::Pending | Self::Submitted | Self::Partial)
    }

    fn can_transition_to(self, to: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, to),
            (Pending, Submitted)
                | (Pending, Cancelled)
                | (Pending, Rejected)
                | (Pending, Failed)
                | (Submitted, Partial)
                | (Submitted, Filled)
                | (Submitted, Cancelled)
                | (Submitted, Rejected)
                | (Submitted, Failed)
                | (Partial, Filled)
                | (Partial, Cancelled)
                | (Partial, Failed)
                | (Failed, Submitted) // retry
                | (Failed, Cancelled)
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// One execution against an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub qty: f64,
    pub price: f64,
    pub commission: f64,
    /// Epoch milliseconds.
    pub ts: i64,
}

/// A tracked order. Owned exclusively by the OrderManager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    /// Assigned at submit time; None while PENDING.
    pub broker_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub ticket_type: TicketType,
    pub qty: f64,
    pub state: OrderState,
    /// Ids of the protective children, once a bracket is established.
    pub linked_stop_id: Option<String>,
    pub linked_take_id: Option<String>,
    /// Entry order this protective child belongs to.
    pub parent_id: Option<String>,
    /// Strategy set that produced the order, for the trade log.
    pub strategy_label: String,
    pub created_at: i64,
    pub last_update: i64,
    pub fills: Vec<Fill>,
    pub commission_paid: f64,
    pub retries: u32,
}

impl Order {
    pub fn new(
        symbol: impl Into<String>,
        side: OrderSide,
        ticket_type: TicketType,
        qty: f64,
        strategy_label: impl Into<String>,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            broker_id: None,
            symbol: symbol.into(),
            side,
            ticket_type,
            qty,
            state: OrderState::Pending,
            linked_stop_id: None,
            linked_take_id: None,
            parent_id: None,
            strategy_label: strategy_label.into(),
            created_at: now,
            last_update: now,
            fills: Vec::new(),
            commission_paid: 0.0,
            retries: 0,
        }
    }

    pub fn filled_qty(&self) -> f64 {
        self.fills.iter().map(|f| f.qty).sum()
    }

    pub fn avg_fill_price(&self) -> Option<f64> {
        let qty = self.filled_qty();
        if qty <= 0.0 {
            return None;
        }
        Some(self.fills.iter().map(|f| f.price * f.qty).sum::<f64>() / qty)
    }

    /// Enforce a legal state transition. Terminal orders are immutable; an
    /// illegal edge is an invariant violation.
    pub fn transition(&mut self, to: OrderState) -> Result<(), EngineError> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(EngineError::Invariant(format!(
                "illegal order transition {} -> {} for {}",
                self.state, to, self.id
            )));
        }
        self.state = to;
        self.last_update = Utc::now().timestamp_millis();
        Ok(())
    }

    /// Record a fill and move to PARTIAL or FILLED accordingly.
    pub fn apply_fill(&mut self, fill: Fill) -> Result<(), EngineError> {
        if self.state.is_terminal() {
            return Err(EngineError::Invariant(format!(
                "fill on terminal order {} ({})",
                self.id, self.state
            )));
        }
        self.commission_paid += fill.commission;
        self.fills.push(fill);

        // Tolerance of a millishare absorbs float dust from partial fills.
        if self.filled_qty() >= self.qty - 1e-3 {
            self.transition(OrderState::Filled)
        } else {
            self.transition(OrderState::Partial)
        }
    }

    /// The broker-facing projection of this order.
    pub fn ticket(&self) -> crate::broker::OrderTicket {
        crate::broker::OrderTicket {
            client_id: self.id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            ticket_type: self.ticket_type,
            qty: self.qty,
        }
    }
}
