//! Compound v3 (Comet) markets: base-asset supply and borrow per market.

use super::{settle, ProtocolKind, RawPosition, Settled};
use crate::{
    amount::per_second_rate_to_apr_percent,
    chains::evm::{CallTransport, IERC20},
    errors::FetchError,
    multicall::{CallResult, ReadCall},
    reader::ChainReader,
};
use alloy::{
    primitives::{Address, U256},
    sol,
};
use std::collections::HashMap;
use tracing::warn;

sol! {
    interface IComet {
        function baseToken() external view returns (address);
        function balanceOf(address account) external view returns (uint256);
        function borrowBalanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function getUtilization() external view returns (uint256);
        function getSupplyRate(uint256 utilization) external view returns (uint64);
        function getBorrowRate(uint256 utilization) external view returns (uint64);
    }
}

/// Per-comet account reads: supply balance, borrow balance, base token, utilization, decimals.
const ACCOUNT_CALLS: usize = 5;
/// Per-comet rate reads: supply rate, borrow rate, base token symbol.
const RATE_CALLS: usize = 3;

/// A wallet's open account in one comet, before rates are attached.
struct Account {
    comet: Address,
    base: Address,
    decimals: u8,
    supplied: U256,
    borrowed: U256,
    utilization: Option<U256>,
}

#[derive(Default)]
struct Rates {
    supply_apy: Option<String>,
    borrow_apy: Option<String>,
    symbol: Option<String>,
}

/// Two batched reads for every comet on the chain: account balances, then rates for the
/// markets the wallet actually uses.
pub async fn positions<T: CallTransport>(
    reader: &ChainReader<'_, T>,
    comets: &[Address],
    wallet: Address,
) -> Result<Settled, FetchError> {
    if comets.is_empty() {
        return Ok(Settled::default());
    }
    let chain = reader.chain.name.as_str();
    let calls: Vec<ReadCall> = comets
        .iter()
        .flat_map(|&comet| {
            [
                ReadCall::new(comet, &IComet::balanceOfCall { account: wallet }),
                ReadCall::new(comet, &IComet::borrowBalanceOfCall { account: wallet }),
                ReadCall::new(comet, &IComet::baseTokenCall {}),
                ReadCall::new(comet, &IComet::getUtilizationCall {}),
                ReadCall::new(comet, &IComet::decimalsCall {}),
            ]
        })
        .collect();
    let key = reader.batch_key("comet_accounts", Some(wallet), comets);
    let out = reader.read(&key, reader.volatile_ttl(), &calls).await?;

    let mut outcomes = Vec::with_capacity(comets.len());
    let mut accounts = Vec::new();
    for (&comet, res) in comets.iter().zip(out.chunks(ACCOUNT_CALLS)) {
        match account(chain, comet, res) {
            Ok(Some(a)) => accounts.push(a),
            Ok(None) => outcomes.push((comet, Ok(None))),
            Err(e) => outcomes.push((comet, Err(e))),
        }
    }

    let mut by_comet = rates(reader, &accounts).await;
    for a in accounts {
        let r = by_comet.remove(&a.comet).unwrap_or_default();
        let position = RawPosition {
            asset: a.base,
            symbol: r.symbol.unwrap_or_else(|| "UNKNOWN".to_owned()),
            decimals: a.decimals,
            supplied: a.supplied,
            borrowed: a.borrowed,
            supply_apy: r.supply_apy,
            borrow_apy: r.borrow_apy,
            underlying: None,
        }
        .into_position(ProtocolKind::CompoundV3, chain);
        outcomes.push((a.comet, Ok(position)));
    }
    settle(ProtocolKind::CompoundV3, chain, outcomes)
}

fn account(chain: &str, comet: Address, out: &[CallResult]) -> Result<Option<Account>, FetchError> {
    let (Some(supplied), Some(borrowed)) = (
        out.first().and_then(CallResult::get::<U256>),
        out.get(1).and_then(CallResult::get::<U256>),
    ) else {
        return Err(FetchError::Reverted(format!("comet balances on {comet}")));
    };
    if supplied.is_zero() && borrowed.is_zero() {
        return Ok(None);
    }
    let (Some(base), Some(decimals)) = (
        out.get(2).and_then(CallResult::get::<Address>),
        out.get(4).and_then(CallResult::get::<u8>),
    ) else {
        warn!(%chain, %comet, "comet base token unreadable, skipping");
        return Ok(None);
    };
    if base.is_zero() {
        warn!(%chain, %comet, "comet has zero base token, skipping");
        return Ok(None);
    }
    Ok(Some(Account {
        comet,
        base,
        decimals,
        supplied,
        borrowed,
        utilization: out.get(3).and_then(CallResult::get::<U256>),
    }))
}

/// Rates are optional extras: a failed batch leaves every position without them.
async fn rates<T: CallTransport>(
    reader: &ChainReader<'_, T>,
    accounts: &[Account],
) -> HashMap<Address, Rates> {
    let priced: Vec<(Address, Address, U256)> = accounts
        .iter()
        .filter_map(|a| a.utilization.map(|u| (a.comet, a.base, u)))
        .collect();
    if priced.is_empty() {
        return HashMap::new();
    }
    let calls: Vec<ReadCall> = priced
        .iter()
        .flat_map(|&(comet, base, utilization)| {
            [
                ReadCall::new(comet, &IComet::getSupplyRateCall { utilization }),
                ReadCall::new(comet, &IComet::getBorrowRateCall { utilization }),
                ReadCall::new(base, &IERC20::symbolCall {}),
            ]
        })
        .collect();
    let comets: Vec<Address> = priced.iter().map(|(c, _, _)| *c).collect();
    let key = reader.batch_key("comet_rates", None, &comets);
    match reader.read(&key, reader.volatile_ttl(), &calls).await {
        Ok(out) => comets
            .into_iter()
            .zip(out.chunks(RATE_CALLS))
            .map(|(comet, r)| {
                let rates = Rates {
                    supply_apy: rate_at(r, 0),
                    borrow_apy: rate_at(r, 1),
                    symbol: r.get(2).and_then(CallResult::get::<String>),
                };
                (comet, rates)
            })
            .collect(),
        Err(e) => {
            warn!(chain = %reader.chain.name, error = %e, "comet rates unavailable");
            HashMap::new()
        }
    }
}

fn rate_at(results: &[CallResult], idx: usize) -> Option<String> {
    let per_second = results.get(idx).and_then(CallResult::get::<u64>)?;
    per_second_rate_to_apr_percent(U256::from(per_second))
}
