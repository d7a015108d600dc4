use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{EngineSettings, SettingsStore};
use crate::strategies::Side;

/// Whether a trade touched an exchange or was simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    Real,
    Validation,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Real => "real",
            TradeKind::Validation => "validation",
        }
    }
}

/// One trade's contribution to a strategy's rolling window.
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub fingerprint: String,
    pub kind: TradeKind,
    pub side: Side,
    pub pnl: Decimal,
    pub fees: Decimal,
    /// True for position-closing trades whose pnl is meaningful.
    pub realized: bool,
    pub success: bool,
    pub ts: DateTime<Utc>,
}

/// Computed SCS with its sub-scores.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    /// 0..100, rounded to 2 decimal places.
    pub final_score: Decimal,
    pub win_rate: Option<f64>,
    pub sharpe: Option<f64>,
    pub profit_factor: Option<f64>,
    pub drawdown: Option<f64>,
    pub volatility: Option<f64>,
    /// True when any sub-score fell back to the prior.
    pub provisional: bool,
    pub total_trades: u32,
    pub realized_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: Decimal,
    pub daily_return: Decimal,
    /// Trailing streak of losing real trades.
    pub consecutive_real_losses: u32,
}

impl ScoreBreakdown {
    /// The §4.5 real-trading gate.
    pub fn real_eligible(&self, settings: &EngineSettings) -> bool {
        self.final_score.to_f64().unwrap_or(0.0) >= settings.s_real
            && self.total_trades >= settings.min_trades_for_real
            && self.win_rate.unwrap_or(0.0) >= settings.min_win_rate
    }
}

/// Rolling window of trade outcomes for one strategy.
#[derive(Debug, Default)]
pub struct ScoreCard {
    outcomes: VecDeque<TradeOutcome>,
}

impl ScoreCard {
    /// Insert an outcome, enforcing scoring continuity: a real fill replaces
    /// the validation observation sharing its fingerprint.
    pub fn insert(&mut self, outcome: TradeOutcome) {
        if outcome.kind == TradeKind::Real {
            self.outcomes
                .retain(|o| !(o.kind == TradeKind::Validation && o.fingerprint == outcome.fingerprint));
        } else if self
            .outcomes
            .iter()
            .any(|o| o.kind == TradeKind::Real && o.fingerprint == outcome.fingerprint)
        {
            // The real fill already superseded this observation.
            return;
        }
        self.outcomes.push_back(outcome);
    }

    /// Drop outcomes past the window caps.
    pub fn prune(&mut self, window_trades: usize, window_days: i64, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(window_days);
        self.outcomes.retain(|o| o.ts >= cutoff);
        while self.outcomes.len() > window_trades {
            self.outcomes.pop_front();
        }
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &TradeOutcome> {
        self.outcomes.iter()
    }

    /// Compute the SCS from the current window.
    ///
    /// Pure over the outcome set: recomputing from the same trades yields the
    /// same breakdown bit-for-bit, which is what makes scores auditable.
    pub fn compute(&self, settings: &EngineSettings) -> ScoreBreakdown {
        let mut ordered: Vec<&TradeOutcome> = self.outcomes.iter().collect();
        ordered.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.fingerprint.cmp(&b.fingerprint)));

        let realized: Vec<&TradeOutcome> = ordered.iter().copied().filter(|o| o.realized).collect();
        let pnls: Vec<f64> = realized
            .iter()
            .filter_map(|o| o.pnl.to_f64())
            .collect();

        let wins = realized.iter().filter(|o| o.pnl > Decimal::ZERO).count() as u32;
        let losses = realized.iter().filter(|o| o.pnl < Decimal::ZERO).count() as u32;
        let total_pnl: Decimal = ordered.iter().map(|o| o.pnl).sum();

        let win_rate = if wins + losses > 0 {
            Some((wins as f64 / (wins + losses) as f64).clamp(0.0, 1.0))
        } else {
            None
        };

        let sharpe = sharpe_ratio(&pnls);
        let profit_factor = profit_factor(&realized, settings.profit_factor_cap);
        let notional = settings.validation_amount.to_f64().unwrap_or(100.0);
        let drawdown = max_drawdown(&pnls, notional);
        let volatility = return_volatility(&pnls, notional);

        let prior = settings.score_prior;
        let mut provisional = false;
        let mut sub = |value: Option<f64>| -> f64 {
            match value {
                Some(v) => v,
                None => {
                    provisional = true;
                    prior
                }
            }
        };

        let s_win = sub(win_rate);
        let s_sharpe = sub(sharpe.map(|s| 0.5 * (1.0 + (s / 2.0).tanh())));
        let s_pf = sub(profit_factor.map(|pf| {
            ((1.0 + pf).ln() / (1.0 + settings.profit_factor_cap).ln()).min(1.0)
        }));
        let s_dd = sub(drawdown.map(|dd| 1.0 - (dd / settings.max_drawdown_cap).min(1.0)));
        let s_vol = sub(volatility.map(|v| 1.0 / (1.0 + settings.volatility_penalty_k * v)));

        let weighted = settings.score_weight_win_rate * s_win
            + settings.score_weight_sharpe * s_sharpe
            + settings.score_weight_profit_factor * s_pf
            + settings.score_weight_drawdown * s_dd
            + settings.score_weight_volatility * s_vol;

        let final_score = Decimal::from_f64((weighted * 100.0).clamp(0.0, 100.0))
            .unwrap_or(Decimal::ZERO)
            .round_dp(2);

        let daily_return = if settings.score_window_days > 0 {
            (total_pnl / Decimal::from(settings.score_window_days)).round_dp(8)
        } else {
            Decimal::ZERO
        };

        ScoreBreakdown {
            final_score,
            win_rate,
            sharpe,
            profit_factor,
            drawdown,
            volatility,
            provisional,
            total_trades: ordered.len() as u32,
            realized_trades: realized.len() as u32,
            wins,
            losses,
            total_pnl,
            daily_return,
            consecutive_real_losses: real_loss_streak(&ordered),
        }
    }
}

fn sharpe_ratio(pnls: &[f64]) -> Option<f64> {
    if pnls.len() < 2 {
        return None;
    }
    let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
    let variance = pnls.iter().map(|p| (p - mean) * (p - mean)).sum::<f64>() / pnls.len() as f64;
    let std = variance.sqrt();
    if std == 0.0 {
        return None;
    }
    Some(mean / std * (pnls.len() as f64).sqrt())
}

fn profit_factor(realized: &[&TradeOutcome], cap: f64) -> Option<f64> {
    if realized.is_empty() {
        return None;
    }
    let gross_win: f64 = realized
        .iter()
        .filter(|o| o.pnl > Decimal::ZERO)
        .filter_map(|o| o.pnl.to_f64())
        .sum();
    let gross_loss: f64 = realized
        .iter()
        .filter(|o| o.pnl < Decimal::ZERO)
        .filter_map(|o| o.pnl.abs().to_f64())
        .sum();

    if gross_loss == 0.0 {
        if gross_win > 0.0 {
            Some(cap)
        } else {
            None
        }
    } else {
        Some(gross_win / gross_loss)
    }
}

/// Peak-to-trough decline of the cumulative pnl curve over a notional stake.
fn max_drawdown(pnls: &[f64], notional: f64) -> Option<f64> {
    if pnls.is_empty() || notional <= 0.0 {
        return None;
    }
    let mut equity = notional;
    let mut peak = notional;
    let mut max_dd = 0.0f64;
    for pnl in pnls {
        equity += pnl;
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    Some(max_dd)
}

fn return_volatility(pnls: &[f64], notional: f64) -> Option<f64> {
    if pnls.len() < 2 || notional <= 0.0 {
        return None;
    }
    let returns: Vec<f64> = pnls.iter().map(|p| p / notional).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / returns.len() as f64;
    Some(variance.sqrt())
}

fn real_loss_streak(ordered: &[&TradeOutcome]) -> u32 {
    let mut streak = 0;
    for outcome in ordered
        .iter()
        .rev()
        .filter(|o| o.kind == TradeKind::Real && o.realized)
    {
        if outcome.pnl < Decimal::ZERO {
            streak += 1;
        } else {
            break;
        }
    }
    streak
}

/// Per-strategy score cards with shared settings.
pub struct ScoringService {
    cards: DashMap<Uuid, ScoreCard>,
    settings: Arc<SettingsStore>,
}

impl ScoringService {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            cards: DashMap::new(),
            settings,
        }
    }

    /// Record a trade outcome and return the updated breakdown.
    pub fn record_trade(&self, strategy_id: Uuid, outcome: TradeOutcome) -> ScoreBreakdown {
        let settings = self.settings.snapshot();
        let mut card = self.cards.entry(strategy_id).or_default();
        card.insert(outcome);
        card.prune(
            settings.score_window_trades,
            settings.score_window_days,
            Utc::now(),
        );
        card.compute(&settings)
    }

    /// Recompute without mutating, e.g. for the T1 re-scoring sweep.
    pub fn breakdown(&self, strategy_id: Uuid) -> Option<ScoreBreakdown> {
        let settings = self.settings.snapshot();
        self.cards.get(&strategy_id).map(|c| c.compute(&settings))
    }

    pub fn forget(&self, strategy_id: Uuid) {
        self.cards.remove(&strategy_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(fp: &str, kind: TradeKind, pnl: i64, minutes_ago: i64) -> TradeOutcome {
        TradeOutcome {
            fingerprint: fp.to_string(),
            kind,
            side: Side::Sell,
            pnl: Decimal::from(pnl),
            fees: Decimal::ONE,
            realized: true,
            success: true,
            ts: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings::default()
    }

    #[test]
    fn empty_card_scores_the_prior_and_is_provisional() {
        let card = ScoreCard::default();
        let breakdown = card.compute(&settings());
        assert!(breakdown.provisional);
        // All five sub-scores at the 0.4 prior.
        assert_eq!(breakdown.final_score, Decimal::from(40));
    }

    #[test]
    fn recompute_is_bit_for_bit_stable() {
        let mut card = ScoreCard::default();
        for i in 0..10 {
            let pnl = if i % 3 == 0 { -5 } else { 8 };
            card.insert(outcome(&format!("fp{}", i), TradeKind::Validation, pnl, 100 - i));
        }
        let a = card.compute(&settings());
        let b = card.compute(&settings());
        assert_eq!(a.final_score, b.final_score);
        assert_eq!(a.win_rate, b.win_rate);
        assert_eq!(a.sharpe, b.sharpe);
    }

    #[test]
    fn real_fill_replaces_validation_observation() {
        let mut card = ScoreCard::default();
        card.insert(outcome("fp1", TradeKind::Validation, 10, 30));
        card.insert(outcome("fp1", TradeKind::Real, -4, 29));

        let breakdown = card.compute(&settings());
        assert_eq!(breakdown.total_trades, 1);
        assert_eq!(breakdown.total_pnl, Decimal::from(-4));

        // A late validation observation for the same fingerprint is ignored.
        card.insert(outcome("fp1", TradeKind::Validation, 10, 28));
        assert_eq!(card.compute(&settings()).total_trades, 1);
    }

    #[test]
    fn winning_record_beats_losing_record() {
        let mut winner = ScoreCard::default();
        let mut loser = ScoreCard::default();
        for i in 0..20 {
            winner.insert(outcome(
                &format!("w{}", i),
                TradeKind::Validation,
                if i % 5 == 0 { -2 } else { 6 },
                200 - i,
            ));
            loser.insert(outcome(
                &format!("l{}", i),
                TradeKind::Validation,
                if i % 5 == 0 { 2 } else { -6 },
                200 - i,
            ));
        }
        let s = settings();
        assert!(winner.compute(&s).final_score > loser.compute(&s).final_score);
    }

    #[test]
    fn window_prunes_by_count_and_age() {
        let mut card = ScoreCard::default();
        for i in 0..60 {
            card.insert(outcome(&format!("fp{}", i), TradeKind::Validation, 1, i));
        }
        card.prune(50, 30, Utc::now());
        assert_eq!(card.outcomes().count(), 50);

        let mut aged = ScoreCard::default();
        aged.insert(outcome("old", TradeKind::Validation, 1, 60 * 24 * 40));
        aged.insert(outcome("new", TradeKind::Validation, 1, 5));
        aged.prune(50, 30, Utc::now());
        assert_eq!(aged.outcomes().count(), 1);
    }

    #[test]
    fn consecutive_real_losses_counts_trailing_streak() {
        let mut card = ScoreCard::default();
        card.insert(outcome("r1", TradeKind::Real, 5, 50));
        card.insert(outcome("r2", TradeKind::Real, -3, 40));
        card.insert(outcome("r3", TradeKind::Real, -2, 30));
        card.insert(outcome("v1", TradeKind::Validation, 9, 20));
        card.insert(outcome("r4", TradeKind::Real, -1, 10));

        let breakdown = card.compute(&settings());
        assert_eq!(breakdown.consecutive_real_losses, 3);
    }

    #[test]
    fn gate_requires_score_trades_and_win_rate() {
        let s = settings();
        let mut breakdown = ScoreCard::default().compute(&s);
        breakdown.final_score = Decimal::from(70);
        breakdown.total_trades = 20;
        breakdown.win_rate = Some(0.7);
        assert!(breakdown.real_eligible(&s));

        breakdown.win_rate = Some(0.5);
        assert!(!breakdown.real_eligible(&s));

        breakdown.win_rate = Some(0.7);
        breakdown.total_trades = 5;
        assert!(!breakdown.real_eligible(&s));

        breakdown.total_trades = 20;
        breakdown.final_score = Decimal::from(60);
        assert!(!breakdown.real_eligible(&s));
    }
}
