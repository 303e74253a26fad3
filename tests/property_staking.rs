use proptest::prelude::*;

use tessera::crypto::ContextSignature;
use tessera::quantity::Quantity;
use tessera::staking::commission::{
    CommissionRateBoundStep, CommissionRateStep, CommissionSchedule, CommissionScheduleRules,
};
use tessera::staking::SharePool;

fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(64);
    ProptestConfig {
        cases,
        ..ProptestConfig::default()
    }
}

#[derive(Clone, Debug)]
enum PoolOp {
    Deposit(u64),
    Withdraw(u64),
}

fn arb_pool_ops() -> impl Strategy<Value = Vec<PoolOp>> {
    prop::collection::vec(
        prop_oneof![
            (1u64..10_000).prop_map(PoolOp::Deposit),
            (1u64..10_000).prop_map(PoolOp::Withdraw),
        ],
        1..40,
    )
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Any deposit/withdraw sequence conserves tokens and keeps the pool
    /// invariant: zero shares iff zero balance.
    #[test]
    fn share_pool_conserves_tokens(ops in arb_pool_ops(), funds in 10_000u64..1_000_000) {
        let mut pool = SharePool::default();
        let mut outside = Quantity::from_u64(funds);
        let mut shares = Quantity::zero();
        let total = Quantity::from_u64(funds);

        for op in ops {
            match op {
                PoolOp::Deposit(amount) => {
                    let amount = Quantity::from_u64(amount);
                    if outside >= amount {
                        pool.deposit(&mut shares, &mut outside, &amount).unwrap();
                    }
                }
                PoolOp::Withdraw(want) => {
                    let want = Quantity::from_u64(want);
                    let redeem = Quantity::min(&want, &shares);
                    if !redeem.is_zero() {
                        pool.withdraw(&mut outside, &mut shares, &redeem).unwrap();
                    }
                }
            }
            prop_assert_eq!(pool.balance.is_zero(), pool.total_shares.is_zero());
            let mut sum = outside.clone();
            sum.add(&pool.balance);
            prop_assert_eq!(&sum, &total);
        }

        // The single holder redeeming everything drains the pool entirely.
        if !shares.is_zero() {
            let remaining = shares.clone();
            pool.withdraw(&mut outside, &mut shares, &remaining).unwrap();
        }
        prop_assert!(pool.total_shares.is_zero());
        prop_assert!(pool.balance.is_zero());
        prop_assert_eq!(outside, total);
    }

    /// `mul_div_floor` never exceeds the exact ratio and round-trips through
    /// strings.
    #[test]
    fn quantity_mul_div_floor_bounds(a in 0u64..1_000_000, b in 0u64..1_000_000, c in 1u64..1_000_000) {
        let q = Quantity::from_u64(a);
        let floored = q
            .mul_div_floor(&Quantity::from_u64(b), &Quantity::from_u64(c))
            .unwrap();
        let exact = (a as u128) * (b as u128) / (c as u128);
        prop_assert_eq!(floored.clone(), Quantity::from_u128(exact));
        prop_assert_eq!(floored.to_string().parse::<Quantity>().unwrap(), floored);
    }

    /// A successfully amended schedule keeps every started rate inside the
    /// active bound at every sampled epoch.
    #[test]
    fn amended_schedule_respects_bounds(
        rate1 in 0u64..100_000,
        rate2 in 0u64..100_000,
        start in 1u64..8,
        probe in 0u64..200,
    ) {
        let rules = CommissionScheduleRules {
            rate_change_interval: 10,
            rate_bound_lead: 0,
            max_rate_steps: 8,
            max_bound_steps: 8,
            rate_denominator: Quantity::from_u64(100_000),
        };
        let mut schedule = CommissionSchedule {
            rates: vec![CommissionRateStep {
                start: 0,
                rate: Quantity::from_u64(50_000),
            }],
            bounds: vec![CommissionRateBoundStep {
                start: 0,
                rate_min: Quantity::from_u64(20_000),
                rate_max: Quantity::from_u64(80_000),
            }],
        };
        let amendment = CommissionSchedule {
            rates: vec![
                CommissionRateStep {
                    start: start * 10,
                    rate: Quantity::from_u64(rate1),
                },
                CommissionRateStep {
                    start: (start + 1) * 10,
                    rate: Quantity::from_u64(rate2),
                },
            ],
            bounds: vec![],
        };

        if schedule
            .amend_and_prune_and_validate(&amendment, &rules, 0)
            .is_ok()
        {
            if let Some(rate) = schedule.current_rate(probe) {
                prop_assert!(rate >= &Quantity::from_u64(20_000));
                prop_assert!(rate <= &Quantity::from_u64(80_000));
            }
        }
    }

    /// Context-bound signatures verify only under the exact signing context.
    #[test]
    fn signature_context_binding(seed in 1u8..=255, payload in prop::collection::vec(any::<u8>(), 0..256)) {
        let secret = ed25519_dalek::SecretKey::from_bytes(&[seed; 32]).unwrap();
        let public = ed25519_dalek::PublicKey::from(&secret);
        let keypair = ed25519_dalek::Keypair { secret, public };

        let signed = ContextSignature::sign(&keypair, "tessera/test: property", &payload);
        prop_assert!(signed.verify("tessera/test: property", &payload).is_ok());
        prop_assert!(signed.verify("tessera/test: other", &payload).is_err());

        let mut tampered = payload.clone();
        tampered.push(0xFF);
        prop_assert!(signed.verify("tessera/test: property", &tampered).is_err());
    }
}
