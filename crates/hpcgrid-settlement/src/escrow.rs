//! Escrow interface.
//!
//! The engine never holds tokens itself. Budgets are locked into a
//! per-job escrow at submission; settlement moves funds out of it and
//! releases the remainder to the customer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::debug;

use hpc_core::{Address, Amount};

use crate::error::{SettlementError, SettlementResult};

/// A balance holder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Account {
    /// A plain account address.
    Address(Address),
    /// A per-job escrow.
    Escrow(String),
}

impl Account {
    pub fn address(address: &str) -> Self {
        Account::Address(address.to_string())
    }

    pub fn escrow(escrow_id: &str) -> Self {
        Account::Escrow(escrow_id.to_string())
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Account::Address(a) => write!(f, "{a}"),
            Account::Escrow(id) => write!(f, "escrow:{id}"),
        }
    }
}

/// Token custody the host ledger provides.
pub trait Escrow {
    /// Move `amount` from `owner` into a new escrow.
    fn lock(&mut self, escrow_id: &str, owner: &str, amount: Amount) -> SettlementResult<()>;

    /// Move `amount` between two accounts.
    fn transfer(&mut self, from: &Account, to: &Account, amount: Amount) -> SettlementResult<()>;

    /// Return whatever is left in the escrow to its owner. Returns the
    /// amount released.
    fn release(&mut self, escrow_id: &str) -> SettlementResult<Amount>;

    fn balance(&self, account: &Account) -> Amount;

    /// Owner recorded at lock time.
    fn owner(&self, escrow_id: &str) -> Option<Address>;
}

/// Escrow kept in process memory.
///
/// Supports failure injection: transfers touching an address in the
/// failure set are refused.
#[derive(Debug, Default)]
pub struct InMemoryEscrow {
    balances: BTreeMap<Account, Amount>,
    owners: BTreeMap<String, Address>,
    failing: BTreeSet<Account>,
}

impl InMemoryEscrow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an address from outside the engine.
    pub fn deposit(&mut self, address: &str, amount: Amount) {
        let balance = self.balances.entry(Account::address(address)).or_insert(0);
        *balance = balance.saturating_add(amount);
        debug!(address, amount, "deposit");
    }

    /// Make every transfer to or from `address` fail.
    pub fn fail_transfers_for(&mut self, address: &str) {
        self.failing.insert(Account::address(address));
    }

    pub fn clear_failures(&mut self) {
        self.failing.clear();
    }

    fn debit(&mut self, account: &Account, amount: Amount) -> SettlementResult<()> {
        let available = self.balance(account);
        if available < amount {
            return Err(SettlementError::InsufficientFunds {
                account: account.to_string(),
                needed: amount,
                available,
            });
        }
        self.balances.insert(account.clone(), available - amount);
        Ok(())
    }

    fn credit(&mut self, account: &Account, amount: Amount) {
        let balance = self.balances.entry(account.clone()).or_insert(0);
        *balance = balance.saturating_add(amount);
    }
}

impl Escrow for InMemoryEscrow {
    fn lock(&mut self, escrow_id: &str, owner: &str, amount: Amount) -> SettlementResult<()> {
        if self.owners.contains_key(escrow_id) {
            return Err(SettlementError::AlreadyLocked {
                escrow_id: escrow_id.to_string(),
            });
        }
        self.debit(&Account::address(owner), amount)?;
        self.credit(&Account::escrow(escrow_id), amount);
        self.owners.insert(escrow_id.to_string(), owner.to_string());
        debug!(escrow = escrow_id, owner, amount, "escrow locked");
        Ok(())
    }

    fn transfer(&mut self, from: &Account, to: &Account, amount: Amount) -> SettlementResult<()> {
        if let Some(blocked) = [from, to].into_iter().find(|a| self.failing.contains(*a)) {
            return Err(SettlementError::TransferFailed {
                from: from.to_string(),
                to: to.to_string(),
                amount,
                reason: format!("{blocked} refuses transfers"),
            });
        }
        if let Account::Escrow(id) = from {
            if !self.owners.contains_key(id) {
                return Err(SettlementError::UnknownEscrow { escrow_id: id.clone() });
            }
        }
        self.debit(from, amount)?;
        self.credit(to, amount);
        debug!(%from, %to, amount, "transfer");
        Ok(())
    }

    fn release(&mut self, escrow_id: &str) -> SettlementResult<Amount> {
        let owner = self
            .owner(escrow_id)
            .ok_or_else(|| SettlementError::UnknownEscrow {
                escrow_id: escrow_id.to_string(),
            })?;
        let escrow = Account::escrow(escrow_id);
        let remaining = self.balance(&escrow);
        if remaining > 0 {
            self.transfer(&escrow, &Account::Address(owner), remaining)?;
        }
        Ok(remaining)
    }

    fn balance(&self, account: &Account) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn owner(&self, escrow_id: &str) -> Option<Address> {
        self.owners.get(escrow_id).cloned()
    }
}
