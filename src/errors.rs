// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Recovery policy per class:
//   Config            — fatal at startup, never at runtime.
//   StaleData         — the affected symbol is skipped for the cycle.
//   InvalidBar        — same: drop the symbol, keep the cycle.
//   Strategy          — the strategy is disabled for the rest of the cycle.
//   BrokerTransient   — retried with exponential backoff.
//   BrokerFatal       — order rejected; recurrence across symbols escalates
//                       to a trading halt.
//   Invariant         — fatal: cancel working orders, alert, halt.
//
// Risk denials are NOT errors; they are RiskDecision::Deny values (risk.rs).
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad configuration detected at load time (unknown key, out-of-range
    /// value, duplicate strategy id).
    #[error("configuration error: {0}")]
    Config(String),

    /// The freshest cached bar for a symbol is older than the staleness
    /// budget and the refresh attempt failed.
    #[error("stale data for {symbol}: newest bar is {age_secs}s old")]
    StaleData { symbol: String, age_secs: i64 },

    /// A bar violated the OHLC invariant and was dropped.
    #[error("invalid bar for {symbol}: {reason}")]
    InvalidBar { symbol: String, reason: String },

    /// A strategy failed while evaluating a symbol.
    #[error("strategy {strategy} failed on {symbol}: {reason}")]
    Strategy {
        strategy: String,
        symbol: String,
        reason: String,
    },

    /// Recoverable broker failure (timeout, disconnect, rate limit,
    /// working-order conflict).
    #[error("broker transient error ({code}): {message}")]
    BrokerTransient { code: i32, message: String },

    /// Unrecoverable broker failure (auth, permissions, unknown instrument).
    #[error("broker fatal error ({code}): {message}")]
    BrokerFatal { code: i32, message: String },

    /// A state invariant was violated. The engine halts.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Transient errors are retried; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerTransient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let e = EngineError::BrokerTransient {
            code: 1100,
            message: "connectivity lost".into(),
        };
        assert!(e.is_transient());

        let e = EngineError::BrokerFatal {
            code: 200,
            message: "no security definition".into(),
        };
        assert!(!e.is_transient());
    }

    #[test]
    fn display_includes_context() {
        let e = EngineError::StaleData {
            symbol: "AAPL".into(),
            age_secs: 4000,
        };
        let msg = e.to_string();
        assert!(msg.contains("AAPL"));
        assert!(msg.contains("4000"));
    }
}
