// =============================================================================
// Performance Analytics — statistics over the trade journal
// =============================================================================
//
// All numeric outputs are rounded to 2 decimal places. Period filtering uses
// `opened_at`: TODAY starts at the current UTC midnight, WEEK and MONTH are
// rolling 7- and 30-day windows.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

use crate::journal::{Journal, TradeRecord};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Period {
    All,
    Today,
    Week,
    Month,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub period: Period,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub loss_rate: f64,
    pub profit_factor: f64,
    pub total_pnl: f64,
    pub average_hold_time_minutes: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown_pct: f64,
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

pub struct PerformanceAnalytics {
    journal: Arc<dyn Journal>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl PerformanceAnalytics {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self { journal }
    }

    // -------------------------------------------------------------------------
    // Core calculations (pure, slice-based)
    // -------------------------------------------------------------------------

    /// Win percentage over the last `period` trades (or all when `None`).
    pub fn calculate_win_rate(trades: &[TradeRecord], period: Option<usize>) -> f64 {
        let window: &[TradeRecord] = match period {
            Some(n) if n < trades.len() => &trades[trades.len() - n..],
            _ => trades,
        };
        if window.is_empty() {
            return 0.0;
        }
        let wins = window.iter().filter(|t| t.pnl > 0.0).count();
        round2(wins as f64 / window.len() as f64 * 100.0)
    }

    /// Gross profit over gross loss. With no losses: 100 when any profit
    /// exists, otherwise 0.
    pub fn calculate_profit_factor(trades: &[TradeRecord]) -> f64 {
        let gross_profit: f64 = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).sum();
        let gross_loss: f64 = trades
            .iter()
            .map(|t| t.pnl)
            .filter(|p| *p < 0.0)
            .map(f64::abs)
            .sum();

        if gross_loss == 0.0 {
            return if gross_profit > 0.0 { 100.0 } else { 0.0 };
        }
        round2(gross_profit / gross_loss)
    }

    /// Mean holding time in minutes.
    pub fn calculate_average_hold_time(trades: &[TradeRecord]) -> f64 {
        if trades.is_empty() {
            return 0.0;
        }
        let total_minutes: f64 = trades
            .iter()
            .map(|t| (t.exit_time - t.entry_time) as f64 / 60_000.0)
            .sum();
        round2(total_minutes / trades.len() as f64)
    }

    fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    fn std_dev(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mean = Self::mean(values);
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        variance.sqrt()
    }

    /// Sharpe over the PnL series: mean / population standard deviation.
    pub fn calculate_sharpe(trades: &[TradeRecord]) -> f64 {
        let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        let sd = Self::std_dev(&pnls);
        if sd == 0.0 {
            return 0.0;
        }
        round2(Self::mean(&pnls) / sd)
    }

    /// Sortino: mean over downside deviation (negative PnL deviations from
    /// zero, averaged across all samples).
    pub fn calculate_sortino(trades: &[TradeRecord]) -> f64 {
        if trades.is_empty() {
            return 0.0;
        }
        let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        let downside_variance = pnls
            .iter()
            .map(|p| p.min(0.0).powi(2))
            .sum::<f64>()
            / pnls.len() as f64;
        let downside = downside_variance.sqrt();
        if downside == 0.0 {
            return 0.0;
        }
        round2(Self::mean(&pnls) / downside)
    }

    /// Maximum peak-relative drawdown (percent) on the running equity curve.
    pub fn calculate_max_drawdown(trades: &[TradeRecord]) -> f64 {
        let mut equity = 0.0f64;
        let mut peak = 0.0f64;
        let mut max_dd_pct = 0.0f64;
        for trade in trades {
            equity += trade.pnl;
            if equity > peak {
                peak = equity;
            }
            if peak > 0.0 {
                let dd = (peak - equity) / peak * 100.0;
                if dd > max_dd_pct {
                    max_dd_pct = dd;
                }
            }
        }
        round2(max_dd_pct)
    }

    // -------------------------------------------------------------------------
    // Period filtering
    // -------------------------------------------------------------------------

    fn period_start(period: Period, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match period {
            Period::All => None,
            Period::Today => Some(
                now.date_naive()
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is valid")
                    .and_utc(),
            ),
            Period::Week => Some(now - Duration::days(7)),
            Period::Month => Some(now - Duration::days(30)),
        }
    }

    /// Keep trades whose `opened_at` falls inside the period. Records with
    /// unparseable timestamps are skipped with a warning.
    pub fn filter_by_period(
        trades: &[TradeRecord],
        period: Period,
        now: DateTime<Utc>,
    ) -> Vec<TradeRecord> {
        let Some(start) = Self::period_start(period, now) else {
            return trades.to_vec();
        };

        trades
            .iter()
            .filter(|t| match DateTime::parse_from_rfc3339(&t.opened_at) {
                Ok(opened) => opened.with_timezone(&Utc) >= start,
                Err(e) => {
                    warn!(trade_id = %t.trade_id, error = %e, "unparseable opened_at — skipping");
                    false
                }
            })
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Journal-backed API
    // -------------------------------------------------------------------------

    /// Compute the full metric set for `period` from the journal.
    pub fn get_metrics(&self, period: Period) -> Result<PerformanceMetrics> {
        let all = self.journal.read_all_trades()?;
        let trades = Self::filter_by_period(&all, period, Utc::now());
        Ok(Self::metrics_for(&trades, period))
    }

    /// Pure metric computation over an already-filtered slice.
    pub fn metrics_for(trades: &[TradeRecord], period: Period) -> PerformanceMetrics {
        let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
        let losses = trades.iter().filter(|t| t.pnl < 0.0).count();
        let win_rate = Self::calculate_win_rate(trades, None);
        let loss_rate = if trades.is_empty() {
            0.0
        } else {
            round2(losses as f64 / trades.len() as f64 * 100.0)
        };

        PerformanceMetrics {
            period,
            total_trades: trades.len(),
            wins,
            losses,
            win_rate,
            loss_rate,
            profit_factor: Self::calculate_profit_factor(trades),
            total_pnl: round2(trades.iter().map(|t| t.pnl).sum()),
            average_hold_time_minutes: Self::calculate_average_hold_time(trades),
            sharpe_ratio: Self::calculate_sharpe(trades),
            sortino_ratio: Self::calculate_sortino(trades),
            max_drawdown_pct: Self::calculate_max_drawdown(trades),
        }
    }

    /// Best `n` trades by PnL (stable order for equal PnL).
    pub fn get_top_trades(&self, n: usize) -> Result<Vec<TradeRecord>> {
        let mut trades = self.journal.read_all_trades()?;
        trades.sort_by(|a, b| b.pnl.partial_cmp(&a.pnl).unwrap_or(std::cmp::Ordering::Equal));
        trades.truncate(n);
        Ok(trades)
    }

    /// Worst `n` trades by PnL (stable order for equal PnL).
    pub fn get_worst_trades(&self, n: usize) -> Result<Vec<TradeRecord>> {
        let mut trades = self.journal.read_all_trades()?;
        trades.sort_by(|a, b| a.pnl.partial_cmp(&b.pnl).unwrap_or(std::cmp::Ordering::Equal));
        trades.truncate(n);
        Ok(trades)
    }
}

impl std::fmt::Debug for PerformanceAnalytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceAnalytics").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::testing::MemoryJournal;
    use crate::types::Side;
    use chrono::TimeZone;

    fn trade(id: &str, pnl: f64, opened_at: &str, hold_minutes: i64) -> TradeRecord {
        TradeRecord {
            trade_id: id.into(),
            symbol: "BTCUSDT".into(),
            direction: Side::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            pnl,
            pnl_percent: pnl,
            entry_time: 0,
            exit_time: hold_minutes * 60_000,
            opened_at: opened_at.into(),
            exit_reason: "TakeProfit".into(),
        }
    }

    fn simple(id: &str, pnl: f64) -> TradeRecord {
        trade(id, pnl, "2026-07-01T12:00:00+00:00", 60)
    }

    #[test]
    fn win_rate_over_window_and_empty() {
        assert_eq!(PerformanceAnalytics::calculate_win_rate(&[], None), 0.0);

        let trades = vec![simple("a", 5.0), simple("b", -2.0), simple("c", 3.0)];
        assert!((PerformanceAnalytics::calculate_win_rate(&trades, None) - 66.67).abs() < 1e-9);
        // Last two trades only: one win.
        assert!((PerformanceAnalytics::calculate_win_rate(&trades, Some(2)) - 50.0).abs() < 1e-9);
        // Window larger than the series behaves like All.
        assert!(
            (PerformanceAnalytics::calculate_win_rate(&trades, Some(10)) - 66.67).abs() < 1e-9
        );
    }

    #[test]
    fn profit_factor_edges() {
        assert_eq!(PerformanceAnalytics::calculate_profit_factor(&[]), 0.0);

        let no_losses = vec![simple("a", 5.0), simple("b", 1.0)];
        assert_eq!(PerformanceAnalytics::calculate_profit_factor(&no_losses), 100.0);

        let no_profits = vec![simple("a", -5.0)];
        assert_eq!(PerformanceAnalytics::calculate_profit_factor(&no_profits), 0.0);

        let mixed = vec![simple("a", 6.0), simple("b", -2.0), simple("c", -1.0)];
        assert!((PerformanceAnalytics::calculate_profit_factor(&mixed) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn average_hold_time_in_minutes() {
        let trades = vec![
            trade("a", 1.0, "2026-07-01T12:00:00+00:00", 30),
            trade("b", 1.0, "2026-07-01T12:00:00+00:00", 90),
        ];
        assert!((PerformanceAnalytics::calculate_average_hold_time(&trades) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn sharpe_and_sortino() {
        // Constant PnL: zero deviation => 0.
        let flat = vec![simple("a", 1.0), simple("b", 1.0)];
        assert_eq!(PerformanceAnalytics::calculate_sharpe(&flat), 0.0);
        // All positive => no downside => 0 by convention.
        assert_eq!(PerformanceAnalytics::calculate_sortino(&flat), 0.0);

        let mixed = vec![simple("a", 2.0), simple("b", -2.0)];
        // mean 0, sd 2 => sharpe 0; sortino 0 / sqrt(2) = 0.
        assert_eq!(PerformanceAnalytics::calculate_sharpe(&mixed), 0.0);
        assert_eq!(PerformanceAnalytics::calculate_sortino(&mixed), 0.0);

        let skewed = vec![simple("a", 3.0), simple("b", 3.0), simple("c", -3.0)];
        // mean = 1, population sd = sqrt(8) ≈ 2.83 => sharpe ≈ 0.35
        assert!((PerformanceAnalytics::calculate_sharpe(&skewed) - 0.35).abs() < 1e-9);
        // downside = sqrt(9/3) = sqrt(3) ≈ 1.73 => sortino ≈ 0.58
        assert!((PerformanceAnalytics::calculate_sortino(&skewed) - 0.58).abs() < 1e-9);
    }

    #[test]
    fn max_drawdown_on_running_equity() {
        // Equity: 10, 4, 12, 6 => peak 12, trough 6 => 50%.
        let trades = vec![
            simple("a", 10.0),
            simple("b", -6.0),
            simple("c", 8.0),
            simple("d", -6.0),
        ];
        assert!((PerformanceAnalytics::calculate_max_drawdown(&trades) - 50.0).abs() < 1e-9);

        // Monotonic gains: no drawdown.
        let up_only = vec![simple("a", 1.0), simple("b", 2.0)];
        assert_eq!(PerformanceAnalytics::calculate_max_drawdown(&up_only), 0.0);

        // Losses before any profit never divide by a zero peak.
        let down_first = vec![simple("a", -5.0), simple("b", 1.0)];
        assert_eq!(PerformanceAnalytics::calculate_max_drawdown(&down_first), 0.0);
    }

    #[test]
    fn period_filter_today_uses_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 7, 15, 10, 0, 0).unwrap();
        let trades = vec![
            trade("today", 1.0, "2026-07-15T01:00:00+00:00", 10),
            trade("yesterday", 1.0, "2026-07-14T23:59:00+00:00", 10),
            trade("last_week", 1.0, "2026-07-07T09:00:00+00:00", 10),
            trade("old", 1.0, "2026-05-01T00:00:00+00:00", 10),
            trade("bad_ts", 1.0, "not-a-date", 10),
        ];

        let today = PerformanceAnalytics::filter_by_period(&trades, Period::Today, now);
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].trade_id, "today");

        // Rolling 7-day cutoff is 2026-07-08T10:00, excluding "last_week".
        let week = PerformanceAnalytics::filter_by_period(&trades, Period::Week, now);
        assert_eq!(week.len(), 2);
        let month = PerformanceAnalytics::filter_by_period(&trades, Period::Month, now);
        assert_eq!(month.len(), 3);

        let all = PerformanceAnalytics::filter_by_period(&trades, Period::All, now);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn top_and_worst_trades_sorted_by_pnl() {
        let journal = Arc::new(MemoryJournal::new());
        for (id, pnl) in [("a", 1.0), ("b", 5.0), ("c", -3.0), ("d", 2.0)] {
            journal.append_trade(&simple(id, pnl)).unwrap();
        }
        let analytics = PerformanceAnalytics::new(journal);

        let top = analytics.get_top_trades(2).unwrap();
        assert_eq!(top[0].trade_id, "b");
        assert_eq!(top[1].trade_id, "d");

        let worst = analytics.get_worst_trades(2).unwrap();
        assert_eq!(worst[0].trade_id, "c");
        assert_eq!(worst[1].trade_id, "a");
    }

    #[test]
    fn full_metrics_rounding() {
        let journal = Arc::new(MemoryJournal::new());
        for (id, pnl) in [("a", 3.0), ("b", 3.0), ("c", -3.0)] {
            journal.append_trade(&simple(id, pnl)).unwrap();
        }
        let analytics = PerformanceAnalytics::new(journal);

        let metrics = analytics.get_metrics(Period::All).unwrap();
        assert_eq!(metrics.total_trades, 3);
        assert_eq!(metrics.wins, 2);
        assert_eq!(metrics.losses, 1);
        assert!((metrics.win_rate - 66.67).abs() < 1e-9);
        assert!((metrics.loss_rate - 33.33).abs() < 1e-9);
        assert!((metrics.profit_factor - 2.0).abs() < 1e-9);
        assert!((metrics.total_pnl - 3.0).abs() < 1e-9);
        assert!((metrics.sharpe_ratio - 0.35).abs() < 1e-9);
    }

    #[test]
    fn empty_journal_metrics_are_zero() {
        let analytics = PerformanceAnalytics::new(Arc::new(MemoryJournal::new()));
        let metrics = analytics.get_metrics(Period::All).unwrap();
        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.win_rate, 0.0);
        assert_eq!(metrics.profit_factor, 0.0);
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.max_drawdown_pct, 0.0);
    }
}
