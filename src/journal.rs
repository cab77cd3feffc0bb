// =============================================================================
// Journal — append-only persistence for fills, daily snapshots, decisions
// =============================================================================
//
// Three sinks, all append-only:
//
//   trades.csv        one record per fill:
//                     ts,symbol,side,qty,price,commission,order_id,strategy_id
//   daily.csv         one record per session close:
//                     date,equity,peak_equity,realized_day_pnl,open_position_count
//   audit.jsonl       one JSON line per pipeline decision
//
// Record formats are stable; new fields may be added only at the end.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::OrderSide;

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// One fill in the trade log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub ts: i64,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub commission: f64,
    pub order_id: String,
    pub strategy_id: String,
}

impl FillRecord {
    pub fn new(
        ts: i64,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
        commission: f64,
        order_id: &str,
        strategy_id: &str,
    ) -> Self {
        Self {
            ts,
            symbol: symbol.to_string(),
            side: side.to_string(),
            qty,
            price,
            commission,
            order_id: order_id.to_string(),
            strategy_id: strategy_id.to_string(),
        }
    }
}

/// One end-of-day portfolio snapshot line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyRecord {
    pub date: String,
    pub equity: f64,
    pub peak_equity: f64,
    pub realized_day_pnl: f64,
    pub open_position_count: usize,
}

/// One structured pipeline decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: i64,
    pub cycle_id: u64,
    pub intent_id: String,
    pub symbol: String,
    /// Pipeline stage (1..=5) the verdict belongs to.
    pub stage: u8,
    /// "PASS" or "REJECT".
    pub verdict: String,
    pub reason: Option<String>,
    pub summary: String,
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

pub struct Journal {
    trades: Mutex<csv::Writer<File>>,
    daily: Mutex<csv::Writer<File>>,
    audit: Mutex<File>,
    dir: PathBuf,
}

impl Journal {
    /// Open (or create) the journal files under `dir`. Existing files are
    /// appended to; headers are written only for fresh files.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create journal dir {}", dir.display()))?;

        let trades = Self::open_csv(&dir.join("trades.csv"))?;
        let daily = Self::open_csv(&dir.join("daily.csv"))?;
        let audit = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("audit.jsonl"))
            .context("failed to open audit.jsonl")?;

        info!(dir = %dir.display(), "journal opened");
        Ok(Self {
            trades: Mutex::new(trades),
            daily: Mutex::new(daily),
            audit: Mutex::new(audit),
            dir,
        })
    }

    fn open_csv(path: &Path) -> Result<csv::Writer<File>> {
        let fresh = !path.exists() || path.metadata().map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(file))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one fill. Persistence failures are logged, never fatal: a
    /// full disk must not take the trading loop down mid-session.
    pub fn record_fill(&self, record: &FillRecord) {
        let mut writer = self.trades.lock();
        if let Err(e) = writer.serialize(record) {
            warn!(error = %e, "failed to append trade log record");
            return;
        }
        if let Err(e) = writer.flush() {
            warn!(error = %e, "failed to flush trade log");
        }
    }

    /// Append one daily snapshot line.
    pub fn record_daily(&self, record: &DailyRecord) {
        let mut writer = self.daily.lock();
        if let Err(e) = writer.serialize(record) {
            warn!(error = %e, "failed to append daily snapshot");
            return;
        }
        if let Err(e) = writer.flush() {
            warn!(error = %e, "failed to flush daily snapshot");
        }
    }

    /// Append one pipeline decision as a JSON line.
    pub fn record_audit(&self, record: &AuditRecord) {
        match serde_json::to_string(record) {
            Ok(line) => {
                let mut file = self.audit.lock();
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(error = %e, "failed to append audit record");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise audit record"),
        }
    }
}
