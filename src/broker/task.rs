// =============================================================================
// Broker I/O task — single owner of the broker connection
// =============================================================================
//
// Every broker request in the engine flows through this task's queue, so the
// connection sees exactly one request at a time and no other component can
// touch the socket. The task exits when the last `BrokerHandle` is dropped.
// =============================================================================

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerRequest};

/// Serve requests against `client` until the request channel closes.
/// Spawn as a background Tokio task:
///
///   let (tx, rx) = mpsc::channel(64);
///   tokio::spawn(run_broker_task(Box::new(client), rx));
///   let handle = BrokerHandle::new(tx);
pub async fn run_broker_task(
    mut client: Box<dyn BrokerClient>,
    mut rx: mpsc::Receiver<BrokerRequest>,
) {
    info!("broker I/O task started");

    while let Some(request) = rx.recv().await {
        match request {
            BrokerRequest::Connect { reply } => {
                let result = client.connect().await;
                if let Err(e) = &result {
                    warn!(code = e.code, error = %e, "broker connect failed");
                }
                let _ = reply.send(result);
            }
            BrokerRequest::Disconnect { reply } => {
                client.disconnect().await;
                info!("broker disconnected");
                let _ = reply.send(());
            }
            BrokerRequest::HistoricalBars {
                symbol,
                timeframe,
                lookback,
                reply,
            } => {
                debug!(symbol = %symbol, %timeframe, lookback, "historical bars request");
                let result = client.historical_bars(&symbol, timeframe, lookback).await;
                let _ = reply.send(result);
            }
            BrokerRequest::SubscribeBars {
                symbol,
                timeframe,
                reply,
            } => {
                debug!(symbol = %symbol, %timeframe, "bar subscription request");
                let result = client.subscribe_bars(&symbol, timeframe).await;
                let _ = reply.send(result);
            }
            BrokerRequest::CurrentPrice { symbol, reply } => {
                let result = client.current_price(&symbol).await;
                let _ = reply.send(result);
            }
            BrokerRequest::PlaceOrder { ticket, reply } => {
                debug!(
                    client_id = %ticket.client_id,
                    symbol = %ticket.symbol,
                    side = %ticket.side,
                    qty = ticket.qty,
                    "order submit request"
                );
                let result = client.place_order(&ticket).await;
                let _ = reply.send(result);
            }
            BrokerRequest::CancelOrder { broker_id, reply } => {
                debug!(broker_id = %broker_id, "order cancel request");
                let result = client.cancel_order(&broker_id).await;
                let _ = reply.send(result);
            }
            BrokerRequest::WorkingOrders { symbol, reply } => {
                let result = client.working_orders(symbol.as_deref()).await;
                let _ = reply.send(result);
            }
        }
    }

    client.disconnect().await;
    info!("broker I/O task stopped");
}
