//! Read-only multi-chain portfolio engine.
//!
//! Given a wallet, reads native and ERC20 balances plus lending, staking, vault and
//! money-market positions across EVM chains, prices them in USD, and returns one report with
//! per-source error annotations instead of failing on the first broken upstream.

pub mod amount;
pub mod cache;
pub mod chains;
pub mod cli_output;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod fetch;
pub mod fsutil;
pub mod multicall;
pub mod paths;
pub mod portfolio;
pub mod price;
pub mod protocols;
pub mod reader;
pub mod retry;
pub mod store;
pub mod valuation;
