//! Compensating settlement entries for resolved disputes.
//!
//! A refund for a job that has not settled yet is deferred and netted
//! out of the final charge. Once a job has settled, the refund is paid
//! back to the customer by the parties that were paid, in proportion to
//! what each received.

use tracing::{info, warn};

use hpc_core::{Amount, BlockContext, RecordId};
use hpcgrid_state::{
    AccountingAdjustment, EntryStatus, HPCRewardRecord, SettlementEntry, SettlementEntryKind,
    TransferLeg,
};

use crate::error::{SettlementError, SettlementResult};
use crate::escrow::{Account, Escrow};

fn proportion(amount: Amount, part: Amount, whole: Amount) -> Amount {
    if whole == 0 {
        return 0;
    }
    (u128::from(amount) * u128::from(part) / u128::from(whole)) as Amount
}

/// Build the compensating entry for `adjustment`.
///
/// `settled` is the job's reward record when it has already settled;
/// `already_returned` is what earlier compensations paid back for the
/// same job. Returns `None` when there is nothing to refund.
pub fn compensation_entry(
    id: RecordId,
    adjustment: &AccountingAdjustment,
    customer: &str,
    treasury: &str,
    settled: Option<&HPCRewardRecord>,
    already_returned: Amount,
    ctx: &BlockContext,
) -> Option<SettlementEntry> {
    let refund = adjustment.refund();
    let Some(reward) = settled else {
        if refund == 0 {
            return None;
        }
        return Some(SettlementEntry {
            id,
            job_id: adjustment.job_id.clone(),
            kind: SettlementEntryKind::Compensation,
            dispute_id: Some(adjustment.dispute_id.clone()),
            amount: refund,
            legs: Vec::new(),
            status: EntryStatus::Deferred,
            created_height: ctx.height,
        });
    };

    let amount = refund.min(reward.charge.saturating_sub(already_returned));
    if amount == 0 {
        return None;
    }

    let to = customer.to_string();
    let mut legs = Vec::new();
    let mut remaining = amount;
    let fee_back = proportion(amount, reward.platform_fee, reward.charge);
    legs.push(TransferLeg {
        from: treasury.to_string(),
        to: to.clone(),
        amount: fee_back,
    });
    remaining -= fee_back;
    for (op, share) in &reward.operator_shares {
        let back = proportion(amount, *share, reward.charge).min(remaining);
        legs.push(TransferLeg {
            from: op.clone(),
            to: to.clone(),
            amount: back,
        });
        remaining -= back;
    }
    // rounding dust falls to the provider
    legs.push(TransferLeg {
        from: reward.provider.clone(),
        to,
        amount: remaining,
    });
    legs.retain(|leg| leg.amount > 0);

    Some(SettlementEntry {
        id,
        job_id: adjustment.job_id.clone(),
        kind: SettlementEntryKind::Compensation,
        dispute_id: Some(adjustment.dispute_id.clone()),
        amount,
        legs,
        status: EntryStatus::Deferred,
        created_height: ctx.height,
    })
}

/// Execute a compensating entry's legs, all or nothing.
pub fn execute_compensation(
    escrow: &mut dyn Escrow,
    entry: &mut SettlementEntry,
) -> SettlementResult<()> {
    let mut done: Vec<&TransferLeg> = Vec::new();
    for leg in &entry.legs {
        let (from, to) = (Account::address(&leg.from), Account::address(&leg.to));
        if let Err(cause) = escrow.transfer(&from, &to, leg.amount) {
            warn!(entry = %entry.id, error = %cause, "compensation failed, reverting");
            for undo in done.iter().rev() {
                escrow
                    .transfer(&Account::address(&undo.to), &Account::address(&undo.from), undo.amount)
                    .map_err(|revert| SettlementError::RevertFailed {
                        job_id: entry.job_id.clone(),
                        cause: Box::new(revert),
                    })?;
            }
            return Err(SettlementError::Reverted {
                job_id: entry.job_id.clone(),
                cause: Box::new(cause),
            });
        }
        done.push(leg);
    }
    entry.status = EntryStatus::Executed;
    info!(entry = %entry.id, job = %entry.job_id, amount = entry.amount, "compensation paid");
    Ok(())
}
