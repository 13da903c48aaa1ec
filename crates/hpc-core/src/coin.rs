//! Coin and decimal-coin parsing (`500uve`, `12.5uve`).

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Amount;

/// An integral token amount with its denomination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: Amount,
}

/// A fixed-point decimal amount with its denomination (rates, prices).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecCoin {
    pub denom: String,
    pub amount: Decimal,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoinError {
    #[error("invalid coin: {0}")]
    Invalid(String),
    #[error("invalid denomination in {0}")]
    InvalidDenom(String),
    #[error("coin amount out of range: {0}")]
    OutOfRange(String),
}

/// Split `"12.5uve"` into (`"12.5"`, `"uve"`).
fn split_amount_denom(raw: &str) -> Result<(&str, &str), CoinError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| CoinError::InvalidDenom(raw.to_string()))?;
    let (amount, denom) = raw.split_at(split);
    if amount.is_empty() {
        return Err(CoinError::Invalid(raw.to_string()));
    }
    if !valid_denom(denom) {
        return Err(CoinError::InvalidDenom(raw.to_string()));
    }
    Ok((amount, denom))
}

fn valid_denom(denom: &str) -> bool {
    let mut chars = denom.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && denom.len() >= 2
        && denom.len() <= 64
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '/')
}

impl Coin {
    pub fn new(amount: Amount, denom: &str) -> Self {
        Self {
            denom: denom.to_string(),
            amount,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CoinError> {
        let (amount, denom) = split_amount_denom(raw)?;
        if !amount.chars().all(|c| c.is_ascii_digit()) {
            return Err(CoinError::Invalid(raw.to_string()));
        }
        let amount: Amount = amount
            .parse()
            .map_err(|_| CoinError::OutOfRange(raw.to_string()))?;
        Ok(Self::new(amount, denom))
    }
}

impl DecCoin {
    pub fn new(amount: Decimal, denom: &str) -> Self {
        Self {
            denom: denom.to_string(),
            amount,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CoinError> {
        let (amount, denom) = split_amount_denom(raw)?;
        if amount.starts_with('-') || amount.starts_with('+') {
            return Err(CoinError::Invalid(raw.to_string()));
        }
        let amount =
            Decimal::from_str(amount).map_err(|_| CoinError::Invalid(raw.to_string()))?;
        Ok(Self::new(amount, denom))
    }
}

impl FromStr for Coin {
    type Err = CoinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Coin::parse(s)
    }
}

impl FromStr for DecCoin {
    type Err = CoinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DecCoin::parse(s)
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

impl fmt::Display for DecCoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount.normalize(), self.denom)
    }
}
