pub mod coin;
pub mod config;
pub mod types;

pub use coin::{Coin, CoinError, DecCoin};
pub use config::*;
pub use types::*;
