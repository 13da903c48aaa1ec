//! Atomic settle-or-revert.

use tracing::{error, info, warn};

use hpc_core::{Address, Amount, BlockContext, RecordId};
use hpcgrid_state::{
    EntryStatus, HPCAccountingRecord, HPCJob, HPCRewardRecord, SettlementEntry,
    SettlementEntryKind, TransferLeg,
};

use crate::error::{SettlementError, SettlementResult};
use crate::escrow::{Account, Escrow};
use crate::split::compute_split;

/// Everything needed to settle one finalized job.
#[derive(Debug, Clone)]
pub struct SettlementInput<'a> {
    pub job: &'a HPCJob,
    /// The job's final accounting record.
    pub record: &'a HPCAccountingRecord,
    pub operators: &'a [Address],
    /// Deferred compensation to net out of the final charge.
    pub deferred_compensation: Amount,
    pub platform_fee_bps: u32,
    pub node_operator_split_bps: u32,
    pub treasury: &'a str,
    pub entry_id: RecordId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementReceipt {
    pub reward: HPCRewardRecord,
    pub entry: SettlementEntry,
}

/// Pay out a finalized job from its escrow and release the remainder.
///
/// Either every transfer lands or every executed transfer is reversed
/// and [`SettlementError::Reverted`] is returned, leaving escrow exactly
/// as it was.
pub fn settle_job(
    escrow: &mut dyn Escrow,
    input: SettlementInput<'_>,
    ctx: &BlockContext,
) -> SettlementResult<SettlementReceipt> {
    let job = input.job;
    let netted = input.deferred_compensation.min(input.record.charge);
    let charge = input.record.charge - netted;
    let split = compute_split(
        charge,
        input.platform_fee_bps,
        input.node_operator_split_bps,
        input.operators,
    );
    let provider = job
        .provider
        .clone()
        .unwrap_or_else(|| input.record.provider.clone());

    let source = Account::escrow(&job.escrow_id);
    let mut planned = vec![(Account::address(input.treasury), split.platform_fee)];
    planned.push((Account::Address(provider.clone()), split.provider_share));
    for (op, amount) in &split.operator_shares {
        planned.push((Account::Address(op.clone()), *amount));
    }
    planned.retain(|(_, amount)| *amount > 0);

    let mut executed: Vec<(Account, Amount)> = Vec::new();
    let outcome = execute(escrow, &source, &job.escrow_id, charge, &planned, &mut executed);

    let refunded = match outcome {
        Ok(refunded) => refunded,
        Err(cause) => {
            warn!(job = %job.id, error = %cause, legs = executed.len(), "settlement failed, reverting");
            for (to, amount) in executed.iter().rev() {
                if let Err(revert) = escrow.transfer(to, &source, *amount) {
                    error!(job = %job.id, account = %to, amount, error = %revert, "settlement revert failed");
                    return Err(SettlementError::RevertFailed {
                        job_id: job.id.clone(),
                        cause: Box::new(revert),
                    });
                }
            }
            return Err(SettlementError::Reverted {
                job_id: job.id.clone(),
                cause: Box::new(cause),
            });
        }
    };

    let legs = planned
        .iter()
        .map(|(to, amount)| TransferLeg {
            from: source.to_string(),
            to: to.to_string(),
            amount: *amount,
        })
        .collect();

    info!(
        job = %job.id,
        charge,
        fee = split.platform_fee,
        provider = %provider,
        provider_share = split.provider_share,
        operators = split.operator_shares.len(),
        netted,
        refunded,
        "job settled"
    );

    let reward = HPCRewardRecord {
        id: HPCRewardRecord::make_id(&job.id),
        job_id: job.id.clone(),
        accounting_record_id: input.record.id.clone(),
        provider,
        charge,
        platform_fee: split.platform_fee,
        provider_reward: split.provider_reward,
        provider_share: split.provider_share,
        operator_shares: split.operator_shares,
        compensation_netted: netted,
        refunded,
        created_height: ctx.height,
        created_time: ctx.time,
    };
    let entry = SettlementEntry {
        id: input.entry_id,
        job_id: job.id.clone(),
        kind: SettlementEntryKind::Settlement,
        dispute_id: None,
        amount: charge,
        legs,
        status: EntryStatus::Executed,
        created_height: ctx.height,
    };
    Ok(SettlementReceipt { reward, entry })
}

/// Run the planned legs then release. `executed` records every leg that
/// landed so a failure can be reversed.
fn execute(
    escrow: &mut dyn Escrow,
    source: &Account,
    escrow_id: &str,
    charge: Amount,
    planned: &[(Account, Amount)],
    executed: &mut Vec<(Account, Amount)>,
) -> SettlementResult<Amount> {
    let available = escrow.balance(source);
    if available < charge {
        return Err(SettlementError::InsufficientFunds {
            account: source.to_string(),
            needed: charge,
            available,
        });
    }
    for (to, amount) in planned {
        escrow.transfer(source, to, *amount)?;
        executed.push((to.clone(), *amount));
    }
    escrow.release(escrow_id)
}
