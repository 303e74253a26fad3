//! The stake accumulator.
//!
//! A per-escrow list of claims, each naming the threshold kinds it requires.
//! The account's active escrow balance must at all times cover the sum of the
//! configured thresholds over the *distinct* kinds present across all claims.
//! The registry adds one claim per registered node and one per registered
//! runtime; claims are released on expiration and deregistration.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::quantity::Quantity;

use super::ThresholdKind;

pub type ClaimId = String;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StakeAccumulator {
    pub claims: BTreeMap<ClaimId, BTreeSet<ThresholdKind>>,
}

impl StakeAccumulator {
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Total stake the accumulator requires: the union of kinds over every
    /// claim, each distinct kind counted once.
    pub fn total_claims(
        &self,
        thresholds: &BTreeMap<ThresholdKind, Quantity>,
    ) -> ChainResult<Quantity> {
        let mut kinds = BTreeSet::new();
        for claim_kinds in self.claims.values() {
            kinds.extend(claim_kinds.iter().copied());
        }
        let mut total = Quantity::zero();
        for kind in kinds {
            let threshold = thresholds.get(&kind).ok_or_else(|| {
                ChainError::Fatal(format!("staking: threshold for {kind:?} not configured"))
            })?;
            total.add(threshold);
        }
        Ok(total)
    }

    /// Adds (or replaces) a claim, verifying the new requirement against the
    /// given active balance. On failure the accumulator is unchanged.
    pub fn add_claim(
        &mut self,
        claim: ClaimId,
        kinds: BTreeSet<ThresholdKind>,
        thresholds: &BTreeMap<ThresholdKind, Quantity>,
        active_balance: &Quantity,
    ) -> ChainResult<()> {
        let previous = self.claims.insert(claim.clone(), kinds);
        match self.check_balance(thresholds, active_balance) {
            Ok(()) => Ok(()),
            Err(err) => {
                match previous {
                    Some(kinds) => {
                        self.claims.insert(claim, kinds);
                    }
                    None => {
                        self.claims.remove(&claim);
                    }
                }
                Err(err)
            }
        }
    }

    pub fn remove_claim(&mut self, claim: &str) -> ChainResult<()> {
        self.claims
            .remove(claim)
            .map(|_| ())
            .ok_or_else(|| ChainError::NotFound(format!("staking: no claim {claim}")))
    }

    pub fn check_balance(
        &self,
        thresholds: &BTreeMap<ThresholdKind, Quantity>,
        active_balance: &Quantity,
    ) -> ChainResult<()> {
        let required = self.total_claims(thresholds)?;
        if *active_balance < required {
            return Err(ChainError::InsufficientStake(format!(
                "staking: active escrow {active_balance} below accumulated claims {required}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> BTreeMap<ThresholdKind, Quantity> {
        let mut t = BTreeMap::new();
        t.insert(ThresholdKind::Entity, Quantity::from_u64(100));
        t.insert(ThresholdKind::Validator, Quantity::from_u64(200));
        t.insert(ThresholdKind::ComputeWorker, Quantity::from_u64(50));
        t.insert(ThresholdKind::StorageWorker, Quantity::from_u64(50));
        t.insert(ThresholdKind::KeyManager, Quantity::from_u64(50));
        t.insert(ThresholdKind::Runtime, Quantity::from_u64(400));
        t
    }

    #[test]
    fn distinct_kinds_are_counted_once() {
        let mut acc = StakeAccumulator::default();
        let balance = Quantity::from_u64(300);
        acc.add_claim(
            "node-a".into(),
            [ThresholdKind::Validator].into(),
            &thresholds(),
            &balance,
        )
        .unwrap();
        // A second validator node does not raise the requirement.
        acc.add_claim(
            "node-b".into(),
            [ThresholdKind::Validator].into(),
            &thresholds(),
            &balance,
        )
        .unwrap();
        assert_eq!(
            acc.total_claims(&thresholds()).unwrap(),
            Quantity::from_u64(200)
        );
    }

    #[test]
    fn failed_claim_leaves_accumulator_unchanged() {
        let mut acc = StakeAccumulator::default();
        let balance = Quantity::from_u64(250);
        acc.add_claim(
            "entity".into(),
            [ThresholdKind::Entity].into(),
            &thresholds(),
            &balance,
        )
        .unwrap();
        let err = acc
            .add_claim(
                "runtime".into(),
                [ThresholdKind::Runtime].into(),
                &thresholds(),
                &balance,
            )
            .unwrap_err();
        assert!(matches!(err, ChainError::InsufficientStake(_)));
        assert_eq!(acc.claims.len(), 1);
        acc.check_balance(&thresholds(), &balance).unwrap();
    }

    #[test]
    fn removing_a_claim_lowers_the_requirement() {
        let mut acc = StakeAccumulator::default();
        let balance = Quantity::from_u64(300);
        acc.add_claim(
            "entity".into(),
            [ThresholdKind::Entity].into(),
            &thresholds(),
            &balance,
        )
        .unwrap();
        acc.add_claim(
            "node".into(),
            [ThresholdKind::Validator].into(),
            &thresholds(),
            &balance,
        )
        .unwrap();
        acc.remove_claim("node").unwrap();
        assert_eq!(
            acc.total_claims(&thresholds()).unwrap(),
            Quantity::from_u64(100)
        );
        assert!(acc.remove_claim("node").is_err());
    }

    #[test]
    fn missing_threshold_configuration_is_fatal() {
        let mut acc = StakeAccumulator::default();
        acc.claims
            .insert("x".into(), [ThresholdKind::Runtime].into());
        let err = acc.total_claims(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ChainError::Fatal(_)));
    }
}
