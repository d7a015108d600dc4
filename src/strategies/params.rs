use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::breakout::{self, BreakoutParams};
use super::grid::{self, GridParams};
use super::high_frequency::{self, HighFrequencyParams};
use super::mean_reversion::{self, MeanReversionParams};
use super::momentum::{self, MomentumParams};
use super::schema::FamilySchema;
use super::trend_following::{self, TrendFollowingParams};
use super::{Decision, EvalContext, EvalState};
use crate::utils::errors::AppError;

/// The six strategy families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Momentum,
    MeanReversion,
    Breakout,
    GridTrading,
    HighFrequency,
    TrendFollowing,
}

impl StrategyType {
    pub const ALL: [StrategyType; 6] = [
        StrategyType::Momentum,
        StrategyType::MeanReversion,
        StrategyType::Breakout,
        StrategyType::GridTrading,
        StrategyType::HighFrequency,
        StrategyType::TrendFollowing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Momentum => "momentum",
            StrategyType::MeanReversion => "mean_reversion",
            StrategyType::Breakout => "breakout",
            StrategyType::GridTrading => "grid_trading",
            StrategyType::HighFrequency => "high_frequency",
            StrategyType::TrendFollowing => "trend_following",
        }
    }

    pub fn schema(&self) -> &'static FamilySchema {
        match self {
            StrategyType::Momentum => &momentum::SCHEMA,
            StrategyType::MeanReversion => &mean_reversion::SCHEMA,
            StrategyType::Breakout => &breakout::SCHEMA,
            StrategyType::GridTrading => &grid::SCHEMA,
            StrategyType::HighFrequency => &high_frequency::SCHEMA,
            StrategyType::TrendFollowing => &trend_following::SCHEMA,
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| AppError::Parse(format!("unknown strategy type: {}", s)))
    }
}

/// Typed parameter record of one strategy, stored as a structured document.
///
/// Every read path goes through the family schema validator; construction
/// from an untyped map fails `Constraint` on range or ordering violations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum StrategyParams {
    Momentum(MomentumParams),
    MeanReversion(MeanReversionParams),
    Breakout(BreakoutParams),
    GridTrading(GridParams),
    HighFrequency(HighFrequencyParams),
    TrendFollowing(TrendFollowingParams),
}

impl StrategyParams {
    pub fn family(&self) -> StrategyType {
        match self {
            StrategyParams::Momentum(_) => StrategyType::Momentum,
            StrategyParams::MeanReversion(_) => StrategyType::MeanReversion,
            StrategyParams::Breakout(_) => StrategyType::Breakout,
            StrategyParams::GridTrading(_) => StrategyType::GridTrading,
            StrategyParams::HighFrequency(_) => StrategyType::HighFrequency,
            StrategyParams::TrendFollowing(_) => StrategyType::TrendFollowing,
        }
    }

    pub fn defaults(family: StrategyType) -> Self {
        match family {
            StrategyType::Momentum => StrategyParams::Momentum(MomentumParams::default()),
            StrategyType::MeanReversion => {
                StrategyParams::MeanReversion(MeanReversionParams::default())
            }
            StrategyType::Breakout => StrategyParams::Breakout(BreakoutParams::default()),
            StrategyType::GridTrading => StrategyParams::GridTrading(GridParams::default()),
            StrategyType::HighFrequency => {
                StrategyParams::HighFrequency(HighFrequencyParams::default())
            }
            StrategyType::TrendFollowing => {
                StrategyParams::TrendFollowing(TrendFollowingParams::default())
            }
        }
    }

    /// Draw a parameter set from the family prior, retrying until the
    /// pairwise rules hold.
    pub fn sample(family: StrategyType, rng: &mut impl Rng) -> Self {
        let schema = family.schema();
        loop {
            let mut values = BTreeMap::new();
            for spec in &schema.specs {
                values.insert(spec.name.to_string(), spec.sample(rng));
            }
            if let Ok(params) = Self::from_map(family, &values) {
                return params;
            }
        }
    }

    /// Flatten to a name → value map for mutation and crossover.
    pub fn to_map(&self) -> BTreeMap<String, Decimal> {
        match self {
            StrategyParams::Momentum(p) => p.to_map(),
            StrategyParams::MeanReversion(p) => p.to_map(),
            StrategyParams::Breakout(p) => p.to_map(),
            StrategyParams::GridTrading(p) => p.to_map(),
            StrategyParams::HighFrequency(p) => p.to_map(),
            StrategyParams::TrendFollowing(p) => p.to_map(),
        }
    }

    /// Rebuild from a map, enforcing the family schema.
    pub fn from_map(
        family: StrategyType,
        values: &BTreeMap<String, Decimal>,
    ) -> Result<Self, AppError> {
        Ok(match family {
            StrategyType::Momentum => StrategyParams::Momentum(MomentumParams::from_map(values)?),
            StrategyType::MeanReversion => {
                StrategyParams::MeanReversion(MeanReversionParams::from_map(values)?)
            }
            StrategyType::Breakout => StrategyParams::Breakout(BreakoutParams::from_map(values)?),
            StrategyType::GridTrading => StrategyParams::GridTrading(GridParams::from_map(values)?),
            StrategyType::HighFrequency => {
                StrategyParams::HighFrequency(HighFrequencyParams::from_map(values)?)
            }
            StrategyType::TrendFollowing => {
                StrategyParams::TrendFollowing(TrendFollowingParams::from_map(values)?)
            }
        })
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.family().schema().validate(&self.to_map())
    }

    /// Candles required before the family can evaluate.
    pub fn min_candles(&self) -> usize {
        match self {
            StrategyParams::Momentum(p) => p.min_candles(),
            StrategyParams::MeanReversion(p) => p.min_candles(),
            StrategyParams::Breakout(p) => p.min_candles(),
            StrategyParams::GridTrading(p) => p.min_candles(),
            StrategyParams::HighFrequency(p) => p.min_candles(),
            StrategyParams::TrendFollowing(p) => p.min_candles(),
        }
    }

    /// Evaluate the family rule against a market snapshot.
    pub fn evaluate(&self, ctx: &EvalContext, state: &mut EvalState) -> Decision {
        match self {
            StrategyParams::Momentum(p) => p.evaluate(ctx, state),
            StrategyParams::MeanReversion(p) => p.evaluate(ctx, state),
            StrategyParams::Breakout(p) => p.evaluate(ctx, state),
            StrategyParams::GridTrading(p) => p.evaluate(ctx, state),
            StrategyParams::HighFrequency(p) => p.evaluate(ctx, state),
            StrategyParams::TrendFollowing(p) => p.evaluate(ctx, state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_round_trip_through_json() {
        for family in StrategyType::ALL {
            let params = StrategyParams::defaults(family);
            let bytes = serde_json::to_vec(&params).unwrap();
            let restored: StrategyParams = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(params, restored);
            // Byte-stable on re-serialization.
            assert_eq!(bytes, serde_json::to_vec(&restored).unwrap());
        }
    }

    #[test]
    fn defaults_satisfy_their_own_schema() {
        for family in StrategyType::ALL {
            StrategyParams::defaults(family).validate().unwrap();
        }
    }

    #[test]
    fn sampled_parameters_are_valid() {
        let mut rng = rand::thread_rng();
        for family in StrategyType::ALL {
            for _ in 0..20 {
                StrategyParams::sample(family, &mut rng).validate().unwrap();
            }
        }
    }

    #[test]
    fn map_round_trip_preserves_values() {
        for family in StrategyType::ALL {
            let params = StrategyParams::defaults(family);
            let map = params.to_map();
            let rebuilt = StrategyParams::from_map(family, &map).unwrap();
            assert_eq!(params, rebuilt);
        }
    }

    #[test]
    fn from_map_rejects_constraint_violations() {
        let mut map = StrategyParams::defaults(StrategyType::Momentum).to_map();
        map.insert("short_period".to_string(), Decimal::from(100));
        map.insert("long_period".to_string(), Decimal::from(50));
        let err = StrategyParams::from_map(StrategyType::Momentum, &map).unwrap_err();
        assert!(matches!(err, AppError::Constraint(_)));
    }
}
