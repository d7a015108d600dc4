use rand::Rng;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::strategies::StrategyParams;
use crate::utils::errors::AppError;

/// Fraction of a parameter's range one mutation step may move it.
const PERTURBATION_SPAN: f64 = 0.2;
/// Attempts to repair a proposal that trips a pairwise rule before giving up.
const REPAIR_ATTEMPTS: usize = 8;

/// Perturb each parameter with probability `mutation_rate`.
///
/// Values are clamped to their schema range; integer parameters round.
/// A proposal that cannot satisfy the family's pairwise rules after several
/// redraws fails `Constraint` and is discarded, leaving the parent untouched.
pub fn mutate(
    params: &StrategyParams,
    mutation_rate: f64,
    rng: &mut impl Rng,
) -> Result<StrategyParams, AppError> {
    let family = params.family();
    let schema = family.schema();

    for _ in 0..REPAIR_ATTEMPTS {
        let mut values = params.to_map();
        let mut changed = false;

        for spec in &schema.specs {
            if rng.gen::<f64>() >= mutation_rate {
                continue;
            }
            let current = values
                .get(spec.name)
                .and_then(|v| v.to_f64())
                .unwrap_or_else(|| spec.default.to_f64().unwrap_or(0.0));
            let span = (spec.max - spec.min).to_f64().unwrap_or(1.0);
            let step = rng.gen_range(-PERTURBATION_SPAN..=PERTURBATION_SPAN) * span;
            let proposed = Decimal::from_f64(current + step).unwrap_or(spec.default);
            values.insert(spec.name.to_string(), spec.clamp(proposed));
            changed = true;
        }

        if !changed {
            // Guarantee at least one gene moves.
            let index = rng.gen_range(0..schema.specs.len());
            let spec = &schema.specs[index];
            let sampled = spec.sample(rng);
            values.insert(spec.name.to_string(), sampled);
        }

        match StrategyParams::from_map(family, &values) {
            Ok(proposal) => return Ok(proposal),
            Err(AppError::Constraint(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(AppError::Constraint(format!(
        "mutation of {} failed pairwise rules after {} attempts",
        family, REPAIR_ATTEMPTS
    )))
}

/// Uniform crossover: each parameter drawn from one of two same-family
/// parents.
pub fn crossover(
    a: &StrategyParams,
    b: &StrategyParams,
    rng: &mut impl Rng,
) -> Result<StrategyParams, AppError> {
    if a.family() != b.family() {
        return Err(AppError::Constraint(format!(
            "cannot cross {} with {}",
            a.family(),
            b.family()
        )));
    }

    let family = a.family();
    let map_a = a.to_map();
    let map_b = b.to_map();

    for _ in 0..REPAIR_ATTEMPTS {
        let mut values = map_a.clone();
        for (name, value) in &map_b {
            if rng.gen_bool(0.5) {
                values.insert(name.clone(), *value);
            }
        }

        match StrategyParams::from_map(family, &values) {
            Ok(child) => return Ok(child),
            Err(AppError::Constraint(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(AppError::Constraint(format!(
        "crossover of {} failed pairwise rules after {} attempts",
        family, REPAIR_ATTEMPTS
    )))
}
