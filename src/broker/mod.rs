// =============================================================================
// Broker abstraction — the only interface the engine consumes from the
// broker subsystem
// =============================================================================
//
// The concrete gateway client (TWS wire protocol) lives outside this repo.
// In-process we have:
//   - `BrokerClient`: the trait a concrete client implements.
//   - `PaperBroker`:  a simulated client for paper trading, behind the same
//     trait, selected only by configuration.
//   - `BrokerHandle`: a cloneable typed request interface. All components
//     talk to the broker through it; the connection itself is owned by a
//     single I/O task (task.rs) which serializes every request.
//
// Events (order status, fills, errors) flow out on a channel the concrete
// client is constructed with; the order manager is the sole consumer.
// =============================================================================

pub mod paper;
pub mod task;

pub use paper::PaperBroker;
pub use task::run_broker_task;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

use crate::market_data::{Bar, Timeframe};

// ---------------------------------------------------------------------------
// Timeouts (spec'd per call class)
// ---------------------------------------------------------------------------

/// Order submit / cancel timeout.
pub const ORDER_TIMEOUT: Duration = Duration::from_secs(5);
/// Market data refresh timeout.
pub const DATA_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// How an error code should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Connection loss, timeout, rate limit, working-order conflict — retry
    /// with backoff.
    Transient,
    /// Auth, permissions, unknown instrument — never retried.
    Fatal,
}

/// A broker-reported failure with its retry classification.
#[derive(Debug, Clone, thiserror::Error)]
#[error("broker error {code}: {message}")]
pub struct BrokerError {
    pub code: i32,
    pub message: String,
    pub class: ErrorClass,
}

impl BrokerError {
    pub fn transient(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            class: ErrorClass::Transient,
        }
    }

    pub fn fatal(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            class: ErrorClass::Fatal,
        }
    }

    /// A request that outran its timeout budget.
    pub fn timeout(what: &str) -> Self {
        Self::transient(-1, format!("{what} timed out"))
    }

    /// The request channel to the broker task is gone (shutdown).
    pub fn disconnected() -> Self {
        Self::transient(-2, "broker task unavailable")
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// Map a gateway error code to its retry class. Codes follow the TWS
/// convention: 1100/1102 connectivity, 502/504 connection refused, 10197
/// duplicate/working order conflict; 200-range are contract/permission
/// rejections.
pub fn classify_code(code: i32) -> ErrorClass {
    match code {
        1100 | 1101 | 1102 | 502 | 504 | 10197 | 10148 => ErrorClass::Transient,
        200 | 201 | 203 | 321 | 354 => ErrorClass::Fatal,
        _ if code < 0 => ErrorClass::Transient, // engine-local (timeouts)
        _ => ErrorClass::Fatal,
    }
}

// ---------------------------------------------------------------------------
// Order tickets and events
// ---------------------------------------------------------------------------

/// Buy/sell flag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TicketType {
    Market,
    Limit { limit: f64 },
    Stop { stop: f64 },
    StopLimit { stop: f64, limit: f64 },
}

/// The broker-facing projection of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    /// Engine-side order id (uuid), echoed back in events.
    pub client_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub ticket_type: TicketType,
    pub qty: f64,
}

/// A working (non-terminal) order as the broker reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingOrder {
    pub broker_id: String,
    pub client_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
}

/// Asynchronous notifications from the broker connection.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A completed bar for a subscribed series.
    Bar(Bar),
    OrderStatus {
        broker_id: String,
        client_id: String,
        status: BrokerOrderStatus,
    },
    Fill {
        broker_id: String,
        client_id: String,
        symbol: String,
        side: OrderSide,
        qty: f64,
        price: f64,
        commission: f64,
        ts: i64,
    },
    Error {
        code: i32,
        message: String,
    },
}

/// Status values the broker reports for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderStatus {
    PendingSubmit,
    Submitted,
    PendingCancel,
    Cancelled,
    Filled,
    Rejected,
}

impl BrokerOrderStatus {
    /// Whether the broker still tracks this order (anything non-terminal,
    /// including the pending-submit/pending-cancel limbo states).
    pub fn is_working(self) -> bool {
        matches!(
            self,
            Self::PendingSubmit | Self::Submitted | Self::PendingCancel
        )
    }
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Contract a concrete broker client implements. Only the broker I/O task
/// ever touches a `BrokerClient` directly.
#[async_trait]
pub trait BrokerClient: Send {
    async fn connect(&mut self) -> Result<(), BrokerError>;
    async fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    async fn historical_bars(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Result<Vec<Bar>, BrokerError>;

    /// Stream completed bars for a series; they arrive as
    /// `BrokerEvent::Bar` on the event channel.
    async fn subscribe_bars(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<(), BrokerError>;

    /// Latest trade/mark price, or None when the broker has no quote.
    async fn current_price(&mut self, symbol: &str) -> Result<Option<f64>, BrokerError>;

    /// Submit an order; returns the broker-assigned id.
    async fn place_order(&mut self, ticket: &OrderTicket) -> Result<String, BrokerError>;

    async fn cancel_order(&mut self, broker_id: &str) -> Result<(), BrokerError>;

    /// All working orders, optionally filtered by symbol.
    async fn working_orders(
        &mut self,
        symbol: Option<&str>,
    ) -> Result<Vec<WorkingOrder>, BrokerError>;
}

// ---------------------------------------------------------------------------
// Typed request interface
// ---------------------------------------------------------------------------

/// Requests the broker I/O task serves, one at a time.
pub enum BrokerRequest {
    Connect {
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    HistoricalBars {
        symbol: String,
        timeframe: Timeframe,
        lookback: usize,
        reply: oneshot::Sender<Result<Vec<Bar>, BrokerError>>,
    },
    SubscribeBars {
        symbol: String,
        timeframe: Timeframe,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    CurrentPrice {
        symbol: String,
        reply: oneshot::Sender<Result<Option<f64>, BrokerError>>,
    },
    PlaceOrder {
        ticket: OrderTicket,
        reply: oneshot::Sender<Result<String, BrokerError>>,
    },
    CancelOrder {
        broker_id: String,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    WorkingOrders {
        symbol: Option<String>,
        reply: oneshot::Sender<Result<Vec<WorkingOrder>, BrokerError>>,
    },
}

/// Cloneable handle over the broker task's request queue. Applies the
/// per-call-class timeout and converts channel failures into transient
/// broker errors.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerRequest>,
}

impl BrokerHandle {
    pub fn new(tx: mpsc::Sender<BrokerRequest>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, BrokerError>>) -> BrokerRequest,
        timeout: Duration,
        what: &str,
    ) -> Result<T, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| BrokerError::disconnected())?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::disconnected()),
            Err(_) => Err(BrokerError::timeout(what)),
        }
    }

    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.request(
            |reply| BrokerRequest::Connect { reply },
            DATA_TIMEOUT,
            "connect",
        )
        .await
    }

    pub async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(BrokerRequest::Disconnect { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    pub async fn historical_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        let symbol = symbol.to_string();
        self.request(
            move |reply| BrokerRequest::HistoricalBars {
                symbol,
                timeframe,
                lookback,
                reply,
            },
            DATA_TIMEOUT,
            "historical bars",
        )
        .await
    }

    pub async fn subscribe_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<(), BrokerError> {
        let symbol = symbol.to_string();
        self.request(
            move |reply| BrokerRequest::SubscribeBars {
                symbol,
                timeframe,
                reply,
            },
            DATA_TIMEOUT,
            "bar subscription",
        )
        .await
    }

    pub async fn current_price(&self, symbol: &str) -> Result<Option<f64>, BrokerError> {
        let symbol = symbol.to_string();
        self.request(
            move |reply| BrokerRequest::CurrentPrice { symbol, reply },
            DATA_TIMEOUT,
            "current price",
        )
        .await
    }

    pub async fn place_order(&self, ticket: OrderTicket) -> Result<String, BrokerError> {
        self.request(
            move |reply| BrokerRequest::PlaceOrder { ticket, reply },
            ORDER_TIMEOUT,
            "order submit",
        )
        .await
    }

    pub async fn cancel_order(&self, broker_id: &str) -> Result<(), BrokerError> {
        let broker_id = broker_id.to_string();
        self.request(
            move |reply| BrokerRequest::CancelOrder { broker_id, reply },
            ORDER_TIMEOUT,
            "order cancel",
        )
        .await
    }

    pub async fn working_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<WorkingOrder>, BrokerError> {
        let symbol = symbol.map(str::to_string);
        self.request(
            move |reply| BrokerRequest::WorkingOrders { symbol, reply },
            ORDER_TIMEOUT,
            "working orders",
        )
        .await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_classification() {
        assert_eq!(classify_code(1100), ErrorClass::Transient);
        assert_eq!(classify_code(10197), ErrorClass::Transient);
        assert_eq!(classify_code(200), ErrorClass::Fatal);
        assert_eq!(classify_code(-1), ErrorClass::Transient);
        // Unknown positive codes default to fatal — safer than retrying blind.
        assert_eq!(classify_code(9999), ErrorClass::Fatal);
    }

    #[test]
    fn working_status_covers_pending_states() {
        assert!(BrokerOrderStatus::PendingSubmit.is_working());
        assert!(BrokerOrderStatus::Submitted.is_working());
        assert!(BrokerOrderStatus::PendingCancel.is_working());
        assert!(!BrokerOrderStatus::Filled.is_working());
        assert!(!BrokerOrderStatus::Cancelled.is_working());
        assert!(!BrokerOrderStatus::Rejected.is_working());
    }

    #[tokio::test]
    async fn handle_reports_disconnect_when_task_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = BrokerHandle::new(tx);
        let err = handle.current_price("AAPL").await.unwrap_err();
        assert!(err.is_transient());
    }
}
