// =============================================================================
// Trade Journal — append-only record store
// =============================================================================
//
// One JSON document per line. Appends are flushed per record; reads tolerate
// blank lines and skip corrupt records with a warning rather than failing the
// whole read.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::Side;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A completed trade as recorded after position closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub direction: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    /// UNIX-epoch milliseconds.
    pub entry_time: i64,
    /// UNIX-epoch milliseconds.
    pub exit_time: i64,
    /// RFC 3339; basis for period filtering in analytics.
    pub opened_at: String,
    pub exit_reason: String,
}

// ---------------------------------------------------------------------------
// Trait + JSONL implementation
// ---------------------------------------------------------------------------

/// Append-only trade store consumed by the analytics layer.
pub trait Journal: Send + Sync {
    fn append_trade(&self, record: &TradeRecord) -> Result<()>;
    fn read_all_trades(&self) -> Result<Vec<TradeRecord>>;
}

/// File-backed journal, one JSON document per line.
#[derive(Debug)]
pub struct JsonlJournal {
    path: PathBuf,
}

impl JsonlJournal {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Journal for JsonlJournal {
    fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialise trade record")?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open journal at {}", self.path.display()))?;

        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to journal at {}", self.path.display()))?;

        debug!(trade_id = %record.trade_id, symbol = %record.symbol, "trade journaled");
        Ok(())
    }

    fn read_all_trades(&self) -> Result<Vec<TradeRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read journal at {}", self.path.display()))?;

        let mut trades = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeRecord>(trimmed) {
                Ok(record) => trades.push(record),
                Err(e) => {
                    warn!(line = line_no + 1, error = %e, "skipping corrupt journal line");
                }
            }
        }
        Ok(trades)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn record(trade_id: &str, pnl: f64) -> TradeRecord {
        TradeRecord {
            trade_id: trade_id.into(),
            symbol: "BTCUSDT".into(),
            direction: Side::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            pnl,
            pnl_percent: pnl,
            entry_time: 1_700_000_000_000,
            exit_time: 1_700_000_060_000,
            opened_at: "2023-11-14T22:13:20+00:00".into(),
            exit_reason: "TakeProfit".into(),
        }
    }

    #[test]
    fn append_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::new(dir.path().join("journal.jsonl"));

        journal.append_trade(&record("t1", 5.0)).unwrap();
        journal.append_trade(&record("t2", -3.0)).unwrap();

        let trades = journal.read_all_trades().unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].trade_id, "t1");
        assert!((trades[1].pnl - -3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::new(dir.path().join("absent.jsonl"));
        assert!(journal.read_all_trades().unwrap().is_empty());
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = JsonlJournal::new(&path);

        journal.append_trade(&record("t1", 1.0)).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{{not valid json"))
            .unwrap();
        journal.append_trade(&record("t2", 2.0)).unwrap();

        let trades = journal.read_all_trades().unwrap();
        assert_eq!(trades.len(), 2);
    }
}
