//! Commission schedules.
//!
//! Each escrow account carries two monotone-in-start-epoch step sequences: the
//! commission rates it charges and the min/max envelope those rates must stay
//! inside. Amendments are staged: validate complexity, non-degeneracy and
//! acceptability, prune stale steps, splice, then re-validate the unioned
//! timeline. A failing amendment leaves the schedule unchanged.

use serde::{Deserialize, Serialize};

use crate::epochtime::EpochTime;
use crate::errors::{ChainError, ChainResult};
use crate::quantity::Quantity;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommissionScheduleRules {
    /// All step starts must be multiples of this interval.
    pub rate_change_interval: EpochTime,
    /// Bound amendments may not start within this many epochs of now.
    pub rate_bound_lead: EpochTime,
    pub max_rate_steps: u16,
    pub max_bound_steps: u16,
    /// Rates are fractions with this denominator.
    pub rate_denominator: Quantity,
}

impl Default for CommissionScheduleRules {
    fn default() -> Self {
        Self {
            rate_change_interval: 1,
            rate_bound_lead: 0,
            max_rate_steps: 16,
            max_bound_steps: 16,
            // Denominated in 1000ths of a percent.
            rate_denominator: Quantity::from_u64(100_000),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommissionRateStep {
    pub start: EpochTime,
    pub rate: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommissionRateBoundStep {
    pub start: EpochTime,
    pub rate_min: Quantity,
    pub rate_max: Quantity,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommissionSchedule {
    pub rates: Vec<CommissionRateStep>,
    pub bounds: Vec<CommissionRateBoundStep>,
}

impl CommissionSchedule {
    fn validate_complexity(&self, rules: &CommissionScheduleRules) -> ChainResult<()> {
        if self.rates.len() > rules.max_rate_steps as usize {
            return Err(ChainError::InvalidArgument(format!(
                "staking: rate schedule {} steps exceeds maximum {}",
                self.rates.len(),
                rules.max_rate_steps
            )));
        }
        if self.bounds.len() > rules.max_bound_steps as usize {
            return Err(ChainError::InvalidArgument(format!(
                "staking: bound schedule {} steps exceeds maximum {}",
                self.bounds.len(),
                rules.max_bound_steps
            )));
        }
        Ok(())
    }

    fn validate_nondegenerate(&self, rules: &CommissionScheduleRules) -> ChainResult<()> {
        let interval = rules.rate_change_interval.max(1);
        for (i, step) in self.rates.iter().enumerate() {
            if step.start % interval != 0 {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: rate step {i} start epoch {} not aligned with rate change interval {interval}",
                    step.start
                )));
            }
            if i > 0 && step.start <= self.rates[i - 1].start {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: rate step {i} start epoch {} not after previous step",
                    step.start
                )));
            }
            if step.rate > rules.rate_denominator {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: rate step {i} rate {}/{} over unity",
                    step.rate, rules.rate_denominator
                )));
            }
        }

        for (i, step) in self.bounds.iter().enumerate() {
            if step.start % interval != 0 {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: bound step {i} start epoch {} not aligned with rate change interval {interval}",
                    step.start
                )));
            }
            if i > 0 && step.start <= self.bounds[i - 1].start {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: bound step {i} start epoch {} not after previous step",
                    step.start
                )));
            }
            if step.rate_min > rules.rate_denominator || step.rate_max > rules.rate_denominator {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: bound step {i} rate over unity"
                )));
            }
            if step.rate_max < step.rate_min {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: bound step {i} maximum rate {} less than minimum rate {}",
                    step.rate_max, step.rate_min
                )));
            }
        }
        Ok(())
    }

    fn validate_amendment_acceptable(
        &self,
        rules: &CommissionScheduleRules,
        now: EpochTime,
    ) -> ChainResult<()> {
        if let Some(first) = self.rates.first() {
            if first.start <= now {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: rate amendment with start epoch {} must not alter rate on or before {now}",
                    first.start
                )));
            }
        }
        if let Some(first) = self.bounds.first() {
            if first.start <= now.saturating_add(rules.rate_bound_lead) {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: bound amendment with start epoch {} must not alter bound on or before {}",
                    first.start,
                    now.saturating_add(rules.rate_bound_lead)
                )));
            }
        }
        Ok(())
    }

    /// Discards past steps that are not in effect anymore, keeping the
    /// currently active one.
    pub fn prune(&mut self, now: EpochTime) {
        while self.rates.len() > 1 && self.rates[1].start <= now {
            self.rates.remove(0);
        }
        while self.bounds.len() > 1 && self.bounds[1].start <= now {
            self.bounds.remove(0);
        }
    }

    /// Splices the amendment in: existing steps whose starts are covered by
    /// the amendment are discarded, amendment steps appended.
    fn amend(&mut self, amendment: &CommissionSchedule) {
        if let Some(first) = amendment.rates.first() {
            self.rates.retain(|step| step.start < first.start);
            self.rates.extend(amendment.rates.iter().cloned());
        }
        if let Some(first) = amendment.bounds.first() {
            self.bounds.retain(|step| step.start < first.start);
            self.bounds.extend(amendment.bounds.iter().cloned());
        }
    }

    /// Walks the unioned rate/bound timeline and rejects any epoch at which
    /// the active rate escapes the active bound.
    fn validate_within_bound(
        &self,
        rules: &CommissionScheduleRules,
        now: EpochTime,
    ) -> ChainResult<()> {
        if self.rates.is_empty() && self.bounds.is_empty() {
            return Ok(());
        }
        if self.rates.is_empty() {
            return Err(ChainError::InvalidArgument("staking: rates missing".into()));
        }
        if self.bounds.is_empty() {
            return Err(ChainError::InvalidArgument("staking: bounds missing".into()));
        }

        let mut rate_index = 0usize;
        let mut bound_index = 0usize;

        // If both schedules only start in the future they must start together;
        // already-started schedules may have different starts with older steps
        // pruned.
        if self.rates[0].start > now || self.bounds[0].start > now {
            if self.rates[0].start != self.bounds[0].start {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: rate schedule start epoch {} and bound schedule start epoch {} don't match",
                    self.rates[0].start, self.bounds[0].start
                )));
            }
        }

        loop {
            let rate = &self.rates[rate_index];
            let bound = &self.bounds[bound_index];
            if rate.rate < bound.rate_min || rate.rate > bound.rate_max {
                return Err(ChainError::InvalidArgument(format!(
                    "staking: rate {}/{} outside bound [{}, {}]",
                    rate.rate, rules.rate_denominator, bound.rate_min, bound.rate_max
                )));
            }

            let next_rate = self.rates.get(rate_index + 1);
            let next_bound = self.bounds.get(bound_index + 1);
            match (next_rate, next_bound) {
                (None, None) => break,
                (Some(_), None) => rate_index += 1,
                (None, Some(_)) => bound_index += 1,
                (Some(r), Some(b)) => {
                    if r.start <= b.start {
                        rate_index += 1;
                    }
                    if b.start <= r.start {
                        bound_index += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies a proposed amendment to a valid schedule. On error the caller
    /// must discard the (possibly partially amended) schedule.
    pub fn amend_and_prune_and_validate(
        &mut self,
        amendment: &CommissionSchedule,
        rules: &CommissionScheduleRules,
        now: EpochTime,
    ) -> ChainResult<()> {
        amendment.validate_complexity(rules)?;
        amendment.validate_nondegenerate(rules)?;
        amendment.validate_amendment_acceptable(rules, now)?;
        self.prune(now);
        self.amend(amendment);
        self.validate_complexity(rules)?;
        self.validate_within_bound(rules, now)?;
        Ok(())
    }

    /// Gets a schedule ready for use in the genesis document.
    pub fn prune_and_validate_for_genesis(
        &mut self,
        rules: &CommissionScheduleRules,
        now: EpochTime,
    ) -> ChainResult<()> {
        self.validate_complexity(rules)?;
        self.validate_nondegenerate(rules)?;
        self.prune(now);
        self.validate_within_bound(rules, now)
    }

    /// The rate of the latest step that has started, if any.
    pub fn current_rate(&self, now: EpochTime) -> Option<&Quantity> {
        let mut latest = None;
        for step in &self.rates {
            if step.start > now {
                break;
            }
            latest = Some(&step.rate);
        }
        latest
    }
}
