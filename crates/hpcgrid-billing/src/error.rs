//! Error types for the billing calculator.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// Fixed-point arithmetic exceeded the representable range.
    #[error("charge overflow while pricing {0}")]
    Overflow(&'static str),

    #[error("negative rate for {0}")]
    NegativeRate(&'static str),
}
