// =============================================================================
// Bar cache — freshness-checked ring buffer per (symbol, timeframe)
// =============================================================================
//
// `get_bars` returns bars ending at the most recent completed bar. When the
// newest cached bar is older than the staleness budget (staleness_mult x
// timeframe, default 2x) the cache refreshes through the broker handle
// before returning; a failed refresh surfaces as EngineError::StaleData.
//
// Concurrency: readers take a consistent snapshot under the read lock; at
// most one refresher runs per series (per-key async mutex with a freshness
// re-check after acquisition).
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::broker::BrokerHandle;
use crate::errors::EngineError;
use crate::market_data::{Bar, BarKey, Timeframe};

pub struct BarCache {
    buffers: RwLock<HashMap<BarKey, VecDeque<Bar>>>,
    refresh_locks: Mutex<HashMap<BarKey, Arc<tokio::sync::Mutex<()>>>>,
    max_bars: usize,
    /// Staleness budget as a multiple of the timeframe duration.
    staleness_mult: f64,
}

impl BarCache {
    pub fn new(max_bars: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            max_bars,
            staleness_mult: 2.0,
        }
    }

    // -------------------------------------------------------------------------
    // Ingest
    // -------------------------------------------------------------------------

    /// Append bars to a series, validating each. Invalid bars are dropped
    /// with a warning; bars at or before the newest cached open time are
    /// ignored (bars are immutable once produced). Returns how many bars
    /// were accepted.
    pub fn append(&self, key: &BarKey, bars: Vec<Bar>) -> usize {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars));

        let mut accepted = 0;
        for bar in bars {
            if let Err(e) = bar.validate() {
                warn!(key = %key, error = %e, "dropping invalid bar");
                continue;
            }
            if let Some(newest) = ring.back() {
                if bar.open_time <= newest.open_time {
                    continue;
                }
            }
            ring.push_back(bar);
            accepted += 1;
        }
        while ring.len() > self.max_bars {
            ring.pop_front();
        }
        accepted
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// The most recent `lookback` bars (oldest first), without any freshness
    /// guarantee.
    pub fn snapshot(&self, key: &BarKey, lookback: usize) -> Vec<Bar> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(lookback);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Close time of the newest cached bar for a series, if any.
    pub fn newest_close_time(&self, key: &BarKey) -> Option<i64> {
        self.buffers.read().get(key)?.back().map(|b| b.close_time())
    }

    fn is_fresh(&self, key: &BarKey, now_ms: i64) -> bool {
        match self.newest_close_time(key) {
            Some(close_ms) => {
                let budget = (key.timeframe.millis() as f64 * self.staleness_mult) as i64;
                now_ms - close_ms <= budget
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Freshness-checked read
    // -------------------------------------------------------------------------

    /// Return the most recent `lookback` bars, refreshing from the broker
    /// first when the cache is stale. Fails with `StaleData` when the series
    /// cannot be brought up to date.
    pub async fn get_bars(
        &self,
        broker: &BrokerHandle,
        symbol: &str,
        timeframe: Timeframe,
        lookback: usize,
        now_ms: i64,
    ) -> Result<Vec<Bar>, EngineError> {
        let key = BarKey::new(symbol, timeframe);

        if !self.is_fresh(&key, now_ms) {
            let lock = {
                let mut locks = self.refresh_locks.lock();
                locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                    .clone()
            };
            let _guard = lock.lock().await;

            // Another refresher may have run while we waited for the lock.
            if !self.is_fresh(&key, now_ms) {
                debug!(key = %key, "cache stale — refreshing from broker");
                match broker.historical_bars(symbol, timeframe, lookback.max(1)).await {
                    Ok(bars) => {
                        self.append(&key, bars);
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "bar refresh failed");
                    }
                }
            }

            if !self.is_fresh(&key, now_ms) {
                let age_secs = self
                    .newest_close_time(&key)
                    .map(|t| (now_ms - t) / 1000)
                    .unwrap_or(i64::MAX);
                return Err(EngineError::StaleData {
                    symbol: symbol.to_string(),
                    age_secs,
                });
            }
        }

        Ok(self.snapshot(&key, lookback))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::broker::{run_broker_task, BrokerHandle};
    use tokio::sync::mpsc;

    fn bar(open_time: i64, close: f64) -> Bar {
        Bar {
            symbol: "AAPL".into(),
            timeframe: Timeframe::Min30,
            open_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1000.0,
        }
    }

    fn key() -> BarKey {
        BarKey::new("AAPL", Timeframe::Min30)
    }

    #[test]
    fn append_rejects_invalid_and_stale_bars() {
        let cache = BarCache::new(100);
        let mut bad = bar(0, 100.0);
        bad.high = 90.0; // violates OHLC invariant

        let accepted = cache.append(&key(), vec![bar(0, 100.0), bad, bar(0, 101.0)]);
        // Invalid bar dropped; duplicate open_time dropped.
        assert_eq!(accepted, 1);
        assert_eq!(cache.snapshot(&key(), 10).len(), 1);
    }

    #[test]
    fn ring_trims_to_capacity() {
        let cache = BarCache::new(5);
        let bars: Vec<Bar> = (0..10).map(|i| bar(i * 1_800_000, 100.0)).collect();
        cache.append(&key(), bars);
        let snap = cache.snapshot(&key(), 100);
        assert_eq!(snap.len(), 5);
        assert_eq!(snap[0].open_time, 5 * 1_800_000);
    }

    #[test]
    fn snapshot_returns_most_recent() {
        let cache = BarCache::new(100);
        let bars: Vec<Bar> = (0..10).map(|i| bar(i * 1_800_000, 100.0 + i as f64)).collect();
        cache.append(&key(), bars);
        let snap = cache.snapshot(&key(), 3);
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[2].close, 109.0);
    }

    #[tokio::test]
    async fn fresh_cache_skips_broker() {
        let cache = BarCache::new(100);
        cache.append(&key(), vec![bar(0, 100.0)]);

        // Handle with no task behind it: any broker call would fail, proving
        // the fresh path never touches it.
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = BrokerHandle::new(tx);

        // Just inside the 2x staleness budget.
        let now = Timeframe::Min30.millis() * 2;
        let bars = cache
            .get_bars(&handle, "AAPL", Timeframe::Min30, 10, now)
            .await
            .unwrap();
        assert_eq!(bars.len(), 1);
    }

    #[tokio::test]
    async fn stale_cache_refreshes_from_broker() {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let mut paper = PaperBroker::new(event_tx);
        paper.load_bars(key(), (0..5).map(|i| bar(i * 1_800_000, 100.0)).collect());

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(run_broker_task(Box::new(paper), rx));
        let handle = BrokerHandle::new(tx);

        let cache = BarCache::new(100);
        // now = just after the newest loaded bar closes, so refresh succeeds
        // and freshness holds.
        let now = 5 * 1_800_000 + 1_000;
        let bars = cache
            .get_bars(&handle, "AAPL", Timeframe::Min30, 10, now)
            .await
            .unwrap();
        assert_eq!(bars.len(), 5);
    }

    #[tokio::test]
    async fn failed_refresh_is_stale_data() {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let paper = PaperBroker::new(event_tx); // no bars loaded

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(run_broker_task(Box::new(paper), rx));
        let handle = BrokerHandle::new(tx);

        let cache = BarCache::new(100);
        let err = cache
            .get_bars(&handle, "AAPL", Timeframe::Min30, 10, 10_000_000)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleData { .. }));
    }
}
