// =============================================================================
// Engine configuration — enumerated surface with strict validation
// =============================================================================
//
// Every tunable lives here. Unknown keys are rejected at load time
// (`deny_unknown_fields` on every section), duplicate strategy ids fail
// loudly, and out-of-range values are reported with the offending key.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that older config files missing
// new fields still deserialise.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::EngineError;
use crate::market_data::universe::{ScreenerConfig, SymbolMeta, Tier};
use crate::strategies::StrategyId;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_min_agreement() -> u32 {
    2
}

fn default_confidence_floor() -> f64 {
    0.55
}

fn default_max_signals_per_day() -> u32 {
    20
}

fn default_max_positions() -> u32 {
    5
}

fn default_max_position_size_percent() -> f64 {
    10.0
}

fn default_max_position_value() -> f64 {
    2_000.0
}

fn default_max_sector_exposure() -> f64 {
    30.0
}

fn default_max_drawdown() -> f64 {
    0.20
}

fn default_max_daily_loss() -> f64 {
    0.03
}

fn default_max_consecutive_losses() -> u32 {
    4
}

fn default_cool_down_secs() -> u64 {
    3_600
}

fn default_max_portfolio_heat() -> f64 {
    0.06
}

fn default_max_portfolio_exposure() -> f64 {
    0.60
}

fn default_max_position_heat() -> f64 {
    0.02
}

fn default_risk_per_trade() -> f64 {
    0.01
}

fn default_fixed_shares() -> f64 {
    10.0
}

fn default_kelly_fraction() -> f64 {
    0.25
}

fn default_target_vol() -> f64 {
    0.02
}

fn default_cycle_interval_secs() -> u64 {
    300
}

fn default_max_order_retries() -> u32 {
    3
}

fn default_session_start() -> String {
    "09:30".to_string()
}

fn default_session_end() -> String {
    "16:00".to_string()
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_stop_atr_multiplier() -> f64 {
    2.0
}

fn default_stop_percent() -> f64 {
    2.0
}

fn default_take_risk_reward() -> f64 {
    2.0
}

fn default_take_percent() -> f64 {
    4.0
}

fn default_volume_threshold() -> f64 {
    1.5
}

fn default_deviation_percent() -> f64 {
    0.2
}

fn default_max_deviation_percent() -> f64 {
    2.0
}

fn default_min_divergence_strength() -> f64 {
    0.3
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_fast_period() -> usize {
    9
}

fn default_slow_period() -> usize {
    21
}

fn default_trend_period() -> usize {
    50
}

fn default_lookback() -> usize {
    20
}

fn default_confirmation_bars() -> u32 {
    1
}

// =============================================================================
// Stops
// =============================================================================

/// How the protective stop distance is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    Atr,
    Percent,
}

/// Stop-loss policy: ATR multiple or fixed percent of entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StopPolicy {
    pub mode: StopMode,
    #[serde(default = "default_stop_atr_multiplier")]
    pub atr_multiplier: f64,
    #[serde(default = "default_stop_percent")]
    pub percent: f64,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            mode: StopMode::Atr,
            atr_multiplier: default_stop_atr_multiplier(),
            percent: default_stop_percent(),
        }
    }
}

/// How the take-profit level is derived from entry and stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeMode {
    /// Multiple of the entry-to-stop distance.
    RiskReward,
    /// Fixed percent of entry.
    Percent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TakePolicy {
    pub mode: TakeMode,
    #[serde(default = "default_take_risk_reward")]
    pub risk_reward: f64,
    #[serde(default = "default_take_percent")]
    pub percent: f64,
}

impl Default for TakePolicy {
    fn default() -> Self {
        Self {
            mode: TakeMode::RiskReward,
            risk_reward: default_take_risk_reward(),
            percent: default_take_percent(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StopsConfig {
    #[serde(default)]
    pub stop_loss: StopPolicy,
    #[serde(default)]
    pub take_profit: TakePolicy,
    /// Trailing stop distance in percent of the anchor; None disables
    /// trailing.
    #[serde(default)]
    pub trailing_percent: Option<f64>,
}

// =============================================================================
// Strategies
// =============================================================================

/// Per-strategy parameter block. Strategies read only the fields they
/// declare; the rest keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyParams {
    #[serde(default = "default_true")]
    pub volume_filter: bool,
    /// Absolute share floor for the current bar.
    #[serde(default)]
    pub min_volume: f64,
    /// Bars the entry condition must persist before a signal fires.
    #[serde(default = "default_confirmation_bars")]
    pub confirmation_bars: u32,
    /// Volume-ratio gate (current volume over trailing mean).
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: f64,
    /// Minimum distance from the reference level (VWAP / band), percent.
    #[serde(default = "default_deviation_percent")]
    pub deviation_percent: f64,
    /// Maximum distance from the reference level, percent.
    #[serde(default = "default_max_deviation_percent")]
    pub max_deviation_percent: f64,
    #[serde(default = "default_min_divergence_strength")]
    pub min_divergence_strength: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,
    #[serde(default = "default_slow_period")]
    pub slow_period: usize,
    #[serde(default = "default_trend_period")]
    pub trend_period: usize,
    /// Window for breakout highs, divergence scans, and pair z-scores.
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    /// Tightens thresholds (RSI divergence).
    #[serde(default)]
    pub conservative: bool,
    /// Mean-reversion variant flag (VWAP).
    #[serde(default)]
    pub mean_reversion: bool,
    /// Advanced variant flag (volume breakout adds CMF confirmation).
    #[serde(default)]
    pub advanced: bool,
    /// Per-strategy stop override; falls back to the global stops block.
    #[serde(default)]
    pub stop_loss: Option<StopPolicy>,
    #[serde(default)]
    pub take_profit: Option<TakePolicy>,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            volume_filter: true,
            min_volume: 0.0,
            confirmation_bars: default_confirmation_bars(),
            volume_threshold: default_volume_threshold(),
            deviation_percent: default_deviation_percent(),
            max_deviation_percent: default_max_deviation_percent(),
            min_divergence_strength: default_min_divergence_strength(),
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            fast_period: default_fast_period(),
            slow_period: default_slow_period(),
            trend_period: default_trend_period(),
            lookback: default_lookback(),
            conservative: false,
            mean_reversion: false,
            advanced: false,
            stop_loss: None,
            take_profit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StrategiesConfig {
    /// Strategies that run each cycle. A duplicate id here is a startup
    /// error, never a silent override.
    #[serde(default)]
    pub enabled: Vec<StrategyId>,
    /// Parameter blocks keyed by strategy id; absent entries use defaults.
    #[serde(default)]
    pub params: BTreeMap<StrategyId, StrategyParams>,
}

impl StrategiesConfig {
    pub fn params_for(&self, id: StrategyId) -> StrategyParams {
        self.params.get(&id).cloned().unwrap_or_default()
    }

    pub fn is_enabled(&self, id: StrategyId) -> bool {
        self.enabled.contains(&id)
    }
}

// =============================================================================
// Signals
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalsConfig {
    #[serde(default = "default_true")]
    pub require_confirmation: bool,
    #[serde(default = "default_min_agreement")]
    pub min_strategies_agreement: u32,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    #[serde(default = "default_max_signals_per_day")]
    pub max_signals_per_day: u32,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            require_confirmation: true,
            min_strategies_agreement: default_min_agreement(),
            confidence_floor: default_confidence_floor(),
            max_signals_per_day: default_max_signals_per_day(),
        }
    }
}

// =============================================================================
// Universe
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TickerConfig {
    pub symbol: String,
    #[serde(default)]
    pub tier: Tier,
}

fn default_index_proxy() -> String {
    "SPY".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UniverseConfig {
    #[serde(default)]
    pub tickers: Vec<TickerConfig>,
    #[serde(default)]
    pub screener: ScreenerConfig,
    /// Market index proxy driving the regime detector and the correlation
    /// enhancer.
    #[serde(default = "default_index_proxy")]
    pub index_proxy: String,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            tickers: Vec::new(),
            screener: ScreenerConfig::default(),
            index_proxy: default_index_proxy(),
        }
    }
}

impl UniverseConfig {
    pub fn to_symbol_meta(&self) -> Vec<SymbolMeta> {
        self.tickers
            .iter()
            .map(|t| SymbolMeta {
                symbol: t.symbol.clone(),
                tier: t.tier,
            })
            .collect()
    }
}

// =============================================================================
// Position limits
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionLimitsConfig {
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    /// Single-position cap as a percent of equity.
    #[serde(default = "default_max_position_size_percent")]
    pub max_position_size_percent: f64,
    /// Single-position notional cap in account currency.
    #[serde(default = "default_max_position_value")]
    pub max_position_value: f64,
    #[serde(default = "default_max_sector_exposure")]
    pub max_sector_exposure: f64,
}

impl Default for PositionLimitsConfig {
    fn default() -> Self {
        Self {
            max_positions: default_max_positions(),
            max_position_size_percent: default_max_position_size_percent(),
            max_position_value: default_max_position_value(),
            max_sector_exposure: default_max_sector_exposure(),
        }
    }
}

// =============================================================================
// Risk
// =============================================================================

/// Immutable per-run risk limits. All fractions are of equity (0.20 = 20%).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskLimitsConfig {
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Cool-down duration after a consecutive-loss trip, seconds.
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_period: u64,
    #[serde(default = "default_max_portfolio_heat")]
    pub max_portfolio_heat: f64,
    #[serde(default = "default_max_portfolio_exposure")]
    pub max_portfolio_exposure: f64,
    /// Heat penalty charged for a position missing its stop.
    #[serde(default = "default_max_position_heat")]
    pub max_position_heat: f64,
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        Self {
            max_drawdown: default_max_drawdown(),
            max_daily_loss: default_max_daily_loss(),
            max_consecutive_losses: default_max_consecutive_losses(),
            cool_down_period: default_cool_down_secs(),
            max_portfolio_heat: default_max_portfolio_heat(),
            max_portfolio_exposure: default_max_portfolio_exposure(),
            max_position_heat: default_max_position_heat(),
        }
    }
}

// =============================================================================
// Sizing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    RiskBased,
    Fixed,
    Kelly,
    VolAdjusted,
}

impl Default for SizingMethod {
    fn default() -> Self {
        Self::RiskBased
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizingConfig {
    #[serde(default)]
    pub method: SizingMethod,
    /// Fraction of equity risked per trade (risk-based).
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,
    /// Share count for the fixed method.
    #[serde(default = "default_fixed_shares")]
    pub fixed_shares: f64,
    /// Fractional Kelly multiplier, capped at 0.25.
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    /// Per-bar volatility target for the vol-adjusted method.
    #[serde(default = "default_target_vol")]
    pub target_vol: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            method: SizingMethod::RiskBased,
            risk_per_trade: default_risk_per_trade(),
            fixed_shares: default_fixed_shares(),
            kelly_fraction: default_kelly_fraction(),
            target_vol: default_target_vol(),
        }
    }
}

// =============================================================================
// Execution & session
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval: u64,
    #[serde(default = "default_max_order_retries")]
    pub max_order_retries: u32,
    #[serde(default = "default_true")]
    pub paper_trading: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            cycle_interval: default_cycle_interval_secs(),
            max_order_retries: default_max_order_retries(),
            paper_trading: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Session open, "HH:MM" in the configured timezone.
    #[serde(default = "default_session_start")]
    pub start: String,
    /// Session close, "HH:MM".
    #[serde(default = "default_session_end")]
    pub end: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub extended_hours: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start: default_session_start(),
            end: default_session_end(),
            timezone: default_timezone(),
            extended_hours: false,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub strategies: StrategiesConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default)]
    pub universe: UniverseConfig,
    #[serde(default)]
    pub limits: PositionLimitsConfig,
    #[serde(default)]
    pub risk: RiskLimitsConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub stops: StopsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Starting cash for paper accounts and day-start equity seeding.
    #[serde(default = "default_starting_cash")]
    pub starting_cash: f64,
}

fn default_starting_cash() -> f64 {
    100_000.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategies: StrategiesConfig::default(),
            signals: SignalsConfig::default(),
            universe: UniverseConfig::default(),
            limits: PositionLimitsConfig::default(),
            risk: RiskLimitsConfig::default(),
            sizing: SizingConfig::default(),
            stops: StopsConfig::default(),
            execution: ExecutionConfig::default(),
            session: SessionConfig::default(),
            starting_cash: default_starting_cash(),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid config in {}", path.display()))?;

        info!(
            path = %path.display(),
            strategies = ?config.strategies.enabled,
            tickers = config.universe.tickers.len(),
            "config loaded"
        );
        Ok(config)
    }

    /// Persist the configuration using an atomic write (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Reject semantic errors the type system cannot: duplicates and
    /// out-of-range values, each reported with its key.
    pub fn validate(&self) -> Result<(), EngineError> {
        // Duplicate strategy ids fail loudly.
        let mut seen = Vec::new();
        for id in &self.strategies.enabled {
            if seen.contains(id) {
                return Err(EngineError::Config(format!(
                    "duplicate strategy id in strategies.enabled: {id}"
                )));
            }
            seen.push(*id);
        }

        let mut symbols = Vec::new();
        for t in &self.universe.tickers {
            if symbols.contains(&t.symbol) {
                return Err(EngineError::Config(format!(
                    "duplicate ticker in universe.tickers: {}",
                    t.symbol
                )));
            }
            symbols.push(t.symbol.clone());
        }

        fn check_fraction(key: &str, value: f64) -> Result<(), EngineError> {
            if !(value > 0.0 && value <= 1.0) {
                return Err(EngineError::Config(format!(
                    "{key} must be in (0, 1], got {value}"
                )));
            }
            Ok(())
        }

        check_fraction("risk.max_drawdown", self.risk.max_drawdown)?;
        check_fraction("risk.max_daily_loss", self.risk.max_daily_loss)?;
        check_fraction("risk.max_portfolio_heat", self.risk.max_portfolio_heat)?;
        check_fraction(
            "risk.max_portfolio_exposure",
            self.risk.max_portfolio_exposure,
        )?;
        check_fraction("sizing.risk_per_trade", self.sizing.risk_per_trade)?;

        if !(0.0..=1.0).contains(&self.signals.confidence_floor) {
            return Err(EngineError::Config(format!(
                "signals.confidence_floor must be in [0, 1], got {}",
                self.signals.confidence_floor
            )));
        }
        if self.signals.min_strategies_agreement == 0 {
            return Err(EngineError::Config(
                "signals.min_strategies_agreement must be >= 1".into(),
            ));
        }
        if self.limits.max_positions == 0 {
            return Err(EngineError::Config("limits.max_positions must be >= 1".into()));
        }
        if self.limits.max_position_value <= 0.0 {
            return Err(EngineError::Config(
                "limits.max_position_value must be positive".into(),
            ));
        }
        if self.sizing.kelly_fraction > 0.25 {
            return Err(EngineError::Config(format!(
                "sizing.kelly_fraction is capped at 0.25, got {}",
                self.sizing.kelly_fraction
            )));
        }
        if self.execution.cycle_interval == 0 {
            return Err(EngineError::Config(
                "execution.cycle_interval must be >= 1 second".into(),
            ));
        }
        if self.starting_cash <= 0.0 {
            return Err(EngineError::Config("starting_cash must be positive".into()));
        }

        // Session times and timezone must parse.
        for (key, value) in [("session.start", &self.session.start), ("session.end", &self.session.end)] {
            NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
                EngineError::Config(format!("{key} must be HH:MM, got {value:?}"))
            })?;
        }
        chrono_tz::Tz::from_str(&self.session.timezone).map_err(|_| {
            EngineError::Config(format!(
                "session.timezone is not a known timezone: {:?}",
                self.session.timezone
            ))
        })?;

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.signals.min_strategies_agreement, 2);
        assert!((cfg.signals.confidence_floor - 0.55).abs() < f64::EPSILON);
        assert!((cfg.risk.max_drawdown - 0.20).abs() < f64::EPSILON);
        assert_eq!(cfg.execution.cycle_interval, 300);
        assert!(cfg.execution.paper_trading);
    }

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.limits.max_positions, 5);
        assert_eq!(cfg.risk.max_consecutive_losses, 4);
        assert_eq!(cfg.session.timezone, "America/New_York");
    }

    #[test]
    fn unknown_keys_rejected() {
        let json = r#"{ "risky_business": true }"#;
        assert!(serde_json::from_str::<EngineConfig>(json).is_err());

        let json = r#"{ "risk": { "max_drawdown": 0.2, "yolo": 1 } }"#;
        assert!(serde_json::from_str::<EngineConfig>(json).is_err());
    }

    #[test]
    fn unknown_strategy_id_rejected() {
        let json = r#"{ "strategies": { "enabled": ["astrology"] } }"#;
        assert!(serde_json::from_str::<EngineConfig>(json).is_err());
    }

    #[test]
    fn duplicate_strategy_id_fails_validation() {
        let json = r#"{ "strategies": { "enabled": ["mean_reversion", "mean_reversion"] } }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate strategy id"));
    }

    #[test]
    fn duplicate_ticker_fails_validation() {
        let json = r#"{ "universe": { "tickers": [
            { "symbol": "AAPL" }, { "symbol": "AAPL" }
        ] } }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_values_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.risk.max_drawdown = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.signals.confidence_floor = 1.2;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.sizing.kelly_fraction = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.session.timezone = "Mars/Olympus_Mons".into();
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.session.start = "9:3a".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.limits.max_positions, cfg2.limits.max_positions);
        assert_eq!(cfg.session.timezone, cfg2.session.timezone);
    }

    #[test]
    fn atomic_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = EngineConfig::default();
        cfg.universe.tickers.push(TickerConfig {
            symbol: "AAPL".into(),
            tier: Tier::Standard,
        });
        cfg.strategies.enabled.push(StrategyId::EmaCross);
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.universe.tickers.len(), 1);
        assert_eq!(loaded.strategies.enabled, vec![StrategyId::EmaCross]);
    }

    #[test]
    fn strategy_params_fallback() {
        let cfg = StrategiesConfig::default();
        let params = cfg.params_for(StrategyId::EmaCross);
        assert_eq!(params.fast_period, 9);
        assert!(params.volume_filter);
    }
}
