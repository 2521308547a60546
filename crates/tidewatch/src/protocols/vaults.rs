//! Yearn-style yield vaults exposing `pricePerShare()`.

use super::{settle, Position, ProtocolKind, RawPosition, Settled};
use crate::{
    amount::{format_units, u256_pow10},
    chains::evm::{CallTransport, IERC20},
    errors::FetchError,
    multicall::{CallResult, ReadCall},
    reader::ChainReader,
};
use alloy::{
    primitives::{Address, U256},
    sol,
};
use tracing::warn;

sol! {
    interface IYearnVault {
        function pricePerShare() external view returns (uint256);
    }
}

/// Per-vault reads: share balance, `pricePerShare`, decimals, symbol.
const VAULT_CALLS: usize = 4;

/// All vaults on a chain are read in one batch.
pub async fn positions<T: CallTransport>(
    reader: &ChainReader<'_, T>,
    vaults: &[Address],
    wallet: Address,
) -> Result<Settled, FetchError> {
    if vaults.is_empty() {
        return Ok(Settled::default());
    }
    let chain = reader.chain.name.as_str();
    let calls: Vec<ReadCall> = vaults
        .iter()
        .flat_map(|&vault| {
            [
                ReadCall::new(vault, &IERC20::balanceOfCall { account: wallet }),
                ReadCall::new(vault, &IYearnVault::pricePerShareCall {}),
                ReadCall::new(vault, &IERC20::decimalsCall {}),
                ReadCall::new(vault, &IERC20::symbolCall {}),
            ]
        })
        .collect();
    let key = reader.batch_key("vault_positions", Some(wallet), vaults);
    let out = reader.read(&key, reader.volatile_ttl(), &calls).await?;
    let outcomes = vaults
        .iter()
        .zip(out.chunks(VAULT_CALLS))
        .map(|(&vault, res)| (vault, vault_position(chain, vault, res)))
        .collect();
    settle(ProtocolKind::Yearn, chain, outcomes)
}

/// `balance * pricePerShare / 10^decimals`, in base units of the vault's underlying token.
pub fn underlying_amount(shares: U256, price_per_share: U256, decimals: u8) -> Option<U256> {
    let scale = u256_pow10(u32::from(decimals))?;
    shares.checked_mul(price_per_share)?.checked_div(scale)
}

fn vault_position(
    chain: &str,
    vault: Address,
    out: &[CallResult],
) -> Result<Option<Position>, FetchError> {
    let Some(balance) = out.first().and_then(CallResult::get::<U256>) else {
        return Err(FetchError::Reverted(format!("balanceOf on vault {vault}")));
    };
    if balance.is_zero() {
        return Ok(None);
    }
    let (Some(pps), Some(decimals)) = (
        out.get(1).and_then(CallResult::get::<U256>),
        out.get(2).and_then(CallResult::get::<u8>),
    ) else {
        warn!(%chain, %vault, "vault pricePerShare/decimals unreadable, skipping");
        return Ok(None);
    };
    let Some(underlying) = underlying_amount(balance, pps, decimals) else {
        warn!(%chain, %vault, "vault underlying overflowed, skipping");
        return Ok(None);
    };
    let symbol = out
        .get(3)
        .and_then(CallResult::get::<String>)
        .unwrap_or_else(|| "UNKNOWN".to_owned());

    Ok(RawPosition {
        asset: vault,
        symbol,
        decimals,
        supplied: balance,
        borrowed: U256::ZERO,
        supply_apy: None,
        borrow_apy: None,
        underlying: Some(format_units(underlying, decimals)),
    }
    .into_position(ProtocolKind::Yearn, chain))
}
