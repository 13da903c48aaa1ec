//! Reward split for a settled charge.
//!
//! ```text
//! platform_fee    = charge × platform_fee_bps / 10_000
//! provider_reward = charge − platform_fee
//! operator_pool   = provider_reward × node_operator_split_bps / 10_000
//! ```
//!
//! The operator pool is divided evenly across the cluster's node
//! operators in address order. Whatever does not divide evenly stays
//! with the provider, so the parts always sum to the charge.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use hpc_core::{Address, Amount, apply_bps};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSplit {
    pub charge: Amount,
    pub platform_fee: Amount,
    pub provider_reward: Amount,
    /// Part of the provider reward paid to the provider itself.
    pub provider_share: Amount,
    pub operator_shares: BTreeMap<Address, Amount>,
}

impl RewardSplit {
    pub fn total(&self) -> Amount {
        self.platform_fee + self.provider_share + self.operator_shares.values().sum::<Amount>()
    }
}

pub fn compute_split(
    charge: Amount,
    platform_fee_bps: u32,
    node_operator_split_bps: u32,
    operators: &[Address],
) -> RewardSplit {
    let platform_fee = apply_bps(charge, platform_fee_bps);
    let provider_reward = charge - platform_fee;

    let operators: BTreeSet<&Address> = operators.iter().collect();
    let mut operator_shares = BTreeMap::new();
    let mut paid_to_operators = 0;
    if !operators.is_empty() {
        let pool = apply_bps(provider_reward, node_operator_split_bps);
        let each = pool / operators.len() as Amount;
        if each > 0 {
            for op in operators {
                operator_shares.insert(op.clone(), each);
                paid_to_operators += each;
            }
        }
    }

    RewardSplit {
        charge,
        platform_fee,
        provider_reward,
        provider_share: provider_reward - paid_to_operators,
        operator_shares,
    }
}
