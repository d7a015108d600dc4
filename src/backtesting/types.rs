use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::scoring::ScoreBreakdown;
use crate::strategies::Side;

/// One simulated fill during a replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayTrade {
    pub ts: DateTime<Utc>,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub pnl: Option<Decimal>,
    pub reason: String,
}

/// Result of shadow-backtesting one parameter set.
#[derive(Debug, Clone)]
pub struct BacktestOutcome {
    /// Scored with the same SCS formula live trading uses.
    pub breakdown: ScoreBreakdown,
    pub trades: Vec<ReplayTrade>,
    pub final_balance: Decimal,
}

/// Cash + single-asset inventory during a replay.
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub cash_balance: Decimal,
    pub asset_quantity: Decimal,
    pub total_value: Decimal,
    pub initial_value: Decimal,
}

impl Portfolio {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            cash_balance: initial_balance,
            asset_quantity: Decimal::ZERO,
            total_value: initial_balance,
            initial_value: initial_balance,
        }
    }

    pub fn update_total_value(&mut self, current_price: Decimal) {
        self.total_value = self.cash_balance + (self.asset_quantity * current_price);
    }

    pub fn execute_buy(&mut self, price: Decimal, quantity: Decimal) -> bool {
        let total_cost = price * quantity;
        if self.cash_balance >= total_cost {
            self.cash_balance -= total_cost;
            self.asset_quantity += quantity;
            true
        } else {
            false
        }
    }

    pub fn execute_sell(&mut self, price: Decimal, quantity: Decimal) -> bool {
        if self.asset_quantity >= quantity {
            self.cash_balance += price * quantity;
            self.asset_quantity -= quantity;
            true
        } else {
            false
        }
    }
}
