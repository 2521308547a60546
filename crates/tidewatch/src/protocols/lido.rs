//! Lido liquid staking: stETH (rebasing, reported as pooled ETH) and wstETH (wrapped shares).

use super::{settle, Position, ProtocolKind, RawPosition, Settled};
use crate::{
    amount::format_units,
    chains::evm::{CallTransport, IERC20},
    config::LidoDeployment,
    errors::FetchError,
    multicall::{CallResult, ReadCall},
    reader::ChainReader,
};
use alloy::{
    primitives::{Address, U256},
    sol,
};

sol! {
    interface ILido {
        function sharesOf(address account) external view returns (uint256);
        function getPooledEthByShares(uint256 sharesAmount) external view returns (uint256);
    }
}

const DECIMALS: u8 = 18;

/// Unlike the other resolvers, a chain without a Lido deployment is reported as unsupported:
/// callers asking for staking positions there get told, rather than an empty list.
pub async fn positions<T: CallTransport>(
    reader: &ChainReader<'_, T>,
    deployment: Option<&LidoDeployment>,
    wallet: Address,
) -> Result<Settled, FetchError> {
    let chain = reader.chain.name.as_str();
    let Some(d) = deployment else {
        return Err(FetchError::Unsupported(format!("lido is not deployed on {chain}")));
    };

    let steth = async { (d.steth, steth_position(reader, d.steth, wallet).await) };
    let outcomes = match d.wsteth {
        Some(wsteth) => {
            let (a, b) = tokio::join!(steth, async {
                (wsteth, wsteth_position(reader, wsteth, wallet).await)
            });
            vec![a, b]
        }
        None => vec![steth.await],
    };
    settle(ProtocolKind::Lido, chain, outcomes)
}

async fn steth_position<T: CallTransport>(
    reader: &ChainReader<'_, T>,
    steth: Address,
    wallet: Address,
) -> Result<Option<Position>, FetchError> {
    let key = reader.key("lido_shares", Some(wallet), steth);
    let out = reader
        .read(&key, reader.volatile_ttl(), &[ReadCall::new(steth, &ILido::sharesOfCall { account: wallet })])
        .await?;
    let Some(shares) = out.first().and_then(CallResult::get::<U256>) else {
        return Err(FetchError::Reverted(format!("sharesOf on {steth}")));
    };
    if shares.is_zero() {
        return Ok(None);
    }

    let key = reader.key("lido_pooled_eth", Some(wallet), steth);
    let out = reader
        .read(
            &key,
            reader.volatile_ttl(),
            &[ReadCall::new(steth, &ILido::getPooledEthBySharesCall { sharesAmount: shares })],
        )
        .await?;
    let Some(pooled) = out.first().and_then(CallResult::get::<U256>) else {
        return Err(FetchError::Reverted(format!("getPooledEthByShares on {steth}")));
    };

    Ok(RawPosition {
        asset: steth,
        symbol: "stETH".to_owned(),
        decimals: DECIMALS,
        supplied: pooled,
        borrowed: U256::ZERO,
        supply_apy: None,
        borrow_apy: None,
        underlying: Some(format_units(pooled, DECIMALS)),
    }
    .into_position(ProtocolKind::Lido, &reader.chain.name))
}

async fn wsteth_position<T: CallTransport>(
    reader: &ChainReader<'_, T>,
    wsteth: Address,
    wallet: Address,
) -> Result<Option<Position>, FetchError> {
    let key = reader.key("erc20_balance", Some(wallet), wsteth);
    let out = reader
        .read(&key, reader.volatile_ttl(), &[ReadCall::new(wsteth, &IERC20::balanceOfCall { account: wallet })])
        .await?;
    let Some(balance) = out.first().and_then(CallResult::get::<U256>) else {
        return Err(FetchError::Reverted(format!("balanceOf on {wsteth}")));
    };

    // The stETH-per-wstETH rate is not read; wrapped balances carry no underlying figure.
    Ok(RawPosition {
        asset: wsteth,
        symbol: "wstETH".to_owned(),
        decimals: DECIMALS,
        supplied: balance,
        borrowed: U256::ZERO,
        supply_apy: None,
        borrow_apy: None,
        underlying: Some("0".to_owned()),
    }
    .into_position(ProtocolKind::Lido, &reader.chain.name))
}
