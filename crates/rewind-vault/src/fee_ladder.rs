//! Fee-rate ladders
//!
//! A ladder is the list of fee rates (sat/vB) at which a transaction gets
//! pre-signed. Rates are strictly increasing, always include the mandatory
//! ceiling, and are denser at the low end since fee markets move
//! multiplicatively.

use bitcoin::{Amount, Transaction};
use serde::{Deserialize, Serialize};

use crate::vault::VaultError;

/// Lowest rate ever sampled, in sat/vB.
pub const MIN_FEE_RATE: f64 = 1.0;

/// Outputs below this are non-standard.
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

/// Witness weight of a P2WPKH spend with a worst-case signature.
pub const P2WPKH_SATISFACTION_WEIGHT: u64 = 1 + 73 + 1 + 33;

/// Fee rates a vault must be able to trigger and rescue at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Rate that must be covered, or construction fails.
    pub fee_rate_ceiling: f64,
    /// Highest rate sampled when funds allow.
    pub max_fee_rate_ceiling: f64,
    /// Number of points on the curve, before the ceiling is added.
    pub samples: usize,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            fee_rate_ceiling: 100.0,
            max_fee_rate_ceiling: 10_000.0,
            samples: 60,
        }
    }
}

impl FeeSchedule {
    pub fn validate(&self) -> Result<(), VaultError> {
        if !self.fee_rate_ceiling.is_finite() || self.fee_rate_ceiling < MIN_FEE_RATE {
            return Err(VaultError::InvalidFeeSchedule(format!(
                "ceiling {} is below {} sat/vB",
                self.fee_rate_ceiling, MIN_FEE_RATE
            )));
        }
        if !self.max_fee_rate_ceiling.is_finite()
            || self.max_fee_rate_ceiling < self.fee_rate_ceiling
        {
            return Err(VaultError::InvalidFeeSchedule(format!(
                "max ceiling {} is below ceiling {}",
                self.max_fee_rate_ceiling, self.fee_rate_ceiling
            )));
        }
        if self.samples < 2 {
            return Err(VaultError::InvalidFeeSchedule(format!(
                "need at least 2 samples, got {}",
                self.samples
            )));
        }
        Ok(())
    }
}

/// Strictly increasing fee rates.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeLadder(Vec<f64>);

impl FeeLadder {
    /// Geometric curve from [`MIN_FEE_RATE`] to the max ceiling, plus the
    /// ceiling. Rates are rounded to 0.01 sat/vB, the ceiling upwards (see
    /// [`FeeLadder::ceiling_rate`]).
    pub fn sample(schedule: &FeeSchedule) -> Self {
        let steps = schedule.samples.saturating_sub(1).max(1) as f64;
        let ratio = (schedule.max_fee_rate_ceiling / MIN_FEE_RATE).max(1.0);

        let mut rates: Vec<f64> = (0..schedule.samples)
            .map(|i| round_rate(MIN_FEE_RATE * ratio.powf(i as f64 / steps)))
            .collect();
        rates.push(Self::ceiling_rate(schedule));

        rates.sort_by(f64::total_cmp);
        rates.dedup();
        Self(rates)
    }

    /// The ceiling as sampled: the lowest 0.01 sat/vB step at or above it.
    pub fn ceiling_rate(schedule: &FeeSchedule) -> f64 {
        let rate = schedule.fee_rate_ceiling;
        let nearest = round_rate(rate);
        if nearest >= rate {
            return nearest;
        }
        let cents = (rate * 100.0).ceil();
        let up = cents / 100.0;
        if up >= rate {
            up
        } else {
            (cents + 1.0) / 100.0
        }
    }

    /// Drop rates, from the top down, whose fee would leave less than dust
    /// out of `value`.
    pub fn affordable<F>(mut self, value: Amount, required_fee: F) -> Self
    where
        F: Fn(f64) -> Amount,
    {
        while let Some(&top) = self.0.last() {
            match value.checked_sub(required_fee(top)) {
                Some(remainder) if remainder >= DUST_LIMIT => break,
                _ => {
                    self.0.pop();
                }
            }
        }
        self
    }

    pub fn rates(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn max(&self) -> Option<f64> {
        self.0.last().copied()
    }

    /// Whether some rate in the ladder reaches `rate`.
    pub fn covers(&self, rate: f64) -> bool {
        self.max().is_some_and(|max| max >= rate)
    }
}

fn round_rate(rate: f64) -> f64 {
    (rate * 100.0).round() / 100.0
}

/// `ceil(rate * vsize)`
pub fn fee_for(rate: f64, vsize: u64) -> Amount {
    Amount::from_sat((rate * vsize as f64).ceil() as u64)
}

/// Upper bound on the virtual size of `tx` once signed.
///
/// `tx` must not carry witnesses yet. Each entry of `satisfaction_weights` is
/// the worst-case witness weight of one input, excluding the stack count.
pub fn estimate_vsize<I>(tx: &Transaction, satisfaction_weights: I) -> u64
where
    I: IntoIterator<Item = u64>,
{
    // segwit marker and flag
    let mut weight = tx.weight().to_wu() + 2;
    for w in satisfaction_weights {
        weight += 1 + w;
    }
    weight.div_ceil(4)
}
