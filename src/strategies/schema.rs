use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::utils::errors::AppError;

/// Declarative description of one tunable parameter.
///
/// Every parameter read or write goes through the family schema: range
/// validation on load, clamping on mutation, and prior sampling on creation
/// all use the same spec.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub min: Decimal,
    pub max: Decimal,
    pub default: Decimal,
    /// Integer-valued parameters (periods, counts) round on mutation.
    pub integer: bool,
}

impl ParamSpec {
    pub fn int(name: &'static str, min: i64, max: i64, default: i64) -> Self {
        Self {
            name,
            min: Decimal::from(min),
            max: Decimal::from(max),
            default: Decimal::from(default),
            integer: true,
        }
    }

    pub fn num(name: &'static str, min: &str, max: &str, default: &str) -> Self {
        Self {
            name,
            min: Decimal::from_str_exact(min).expect("schema literal"),
            max: Decimal::from_str_exact(max).expect("schema literal"),
            default: Decimal::from_str_exact(default).expect("schema literal"),
            integer: false,
        }
    }

    pub fn clamp(&self, value: Decimal) -> Decimal {
        let clamped = value.max(self.min).min(self.max);
        if self.integer {
            clamped.round()
        } else {
            clamped
        }
    }

    pub fn validate(&self, value: Decimal) -> Result<(), AppError> {
        if value < self.min || value > self.max {
            return Err(AppError::Constraint(format!(
                "{} = {} outside [{}, {}]",
                self.name, value, self.min, self.max
            )));
        }
        if self.integer && value != value.round() {
            return Err(AppError::Constraint(format!(
                "{} = {} must be an integer",
                self.name, value
            )));
        }
        Ok(())
    }

    /// Draw from the family prior: uniform over the valid range.
    pub fn sample(&self, rng: &mut impl rand::Rng) -> Decimal {
        let min = self.min.to_f64().unwrap_or(0.0);
        let max = self.max.to_f64().unwrap_or(1.0);
        let raw = rng.gen_range(min..=max);
        let value = Decimal::from_f64(raw).unwrap_or(self.default);
        self.clamp(value)
    }
}

/// Ordering constraint between two parameters of the same family.
#[derive(Debug, Clone, Copy)]
pub enum PairRule {
    /// `left` must be strictly less than `right`.
    LessThan(&'static str, &'static str),
}

impl PairRule {
    pub fn validate(&self, values: &BTreeMap<String, Decimal>) -> Result<(), AppError> {
        match self {
            PairRule::LessThan(left, right) => {
                let lv = values
                    .get(*left)
                    .ok_or_else(|| AppError::Constraint(format!("missing parameter {}", left)))?;
                let rv = values
                    .get(*right)
                    .ok_or_else(|| AppError::Constraint(format!("missing parameter {}", right)))?;
                if lv >= rv {
                    return Err(AppError::Constraint(format!(
                        "{} ({}) must be < {} ({})",
                        left, lv, right, rv
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Full parameter schema of one strategy family.
#[derive(Debug, Clone)]
pub struct FamilySchema {
    pub specs: Vec<ParamSpec>,
    pub rules: Vec<PairRule>,
}

impl FamilySchema {
    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Validate a complete parameter map: every spec present, in range, and
    /// all pairwise rules satisfied.
    pub fn validate(&self, values: &BTreeMap<String, Decimal>) -> Result<(), AppError> {
        for spec in &self.specs {
            let value = values
                .get(spec.name)
                .ok_or_else(|| AppError::Constraint(format!("missing parameter {}", spec.name)))?;
            spec.validate(*value)?;
        }
        for rule in &self.rules {
            rule.validate(values)?;
        }
        Ok(())
    }
}
