//! Aave v3 lending market: one position per reserve the wallet supplies to or borrows from.

use super::{settle, Position, ProtocolKind, RawPosition, Settled};
use crate::{
    amount::ray_to_apy_percent,
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
    interface IAavePool {
        struct ReserveConfigurationMap {
            uint256 data;
        }

        struct ReserveData {
            ReserveConfigurationMap configuration;
            uint128 liquidityIndex;
            uint128 currentLiquidityRate;
            uint128 variableBorrowIndex;
            uint128 currentVariableBorrowRate;
            uint128 currentStableBorrowRate;
            uint40 lastUpdateTimestamp;
            uint16 id;
            address aTokenAddress;
            address stableDebtTokenAddress;
            address variableDebtTokenAddress;
            address interestRateStrategyAddress;
            uint128 accruedToTreasury;
            uint128 unbacked;
            uint128 isolationModeTotalDebt;
        }

        function getReservesList() external view returns (address[] memory);
        function getReserveData(address asset) external view returns (ReserveData memory);
    }
}

/// Per-reserve reads in the second batch: aToken, stable debt, variable debt balances, then
/// the asset's decimals and symbol.
const USER_CALLS: usize = 5;

/// Two batched reads regardless of how many reserves the pool lists: every reserve's data,
/// then every live reserve's balances and metadata.
pub async fn positions<T: CallTransport>(
    reader: &ChainReader<'_, T>,
    pool: Option<Address>,
    wallet: Address,
) -> Result<Settled, FetchError> {
    let Some(pool) = pool else {
        return Ok(Settled::default());
    };
    let chain = reader.chain.name.as_str();
    let reserves = reserves_list(reader, pool).await?;
    if reserves.is_empty() {
        return Ok(Settled::default());
    }

    let data_calls: Vec<ReadCall> = reserves
        .iter()
        .map(|&asset| ReadCall::new(pool, &IAavePool::getReserveDataCall { asset }))
        .collect();
    let key = reader.batch_key("aave_reserve_data", None, &reserves);
    let data = reader.read(&key, reader.volatile_ttl(), &data_calls).await?;

    let mut outcomes = Vec::with_capacity(reserves.len());
    let mut live = Vec::new();
    for (&asset, r) in reserves.iter().zip(&data) {
        match r.get::<IAavePool::ReserveData>() {
            None => outcomes.push((
                asset,
                Err(FetchError::Reverted(format!(
                    "getReserveData({asset}): {}",
                    r.error.as_deref().unwrap_or("failed")
                ))),
            )),
            Some(d) if d.aTokenAddress.is_zero() => {
                warn!(%chain, %asset, "reserve has no aToken, skipping");
                outcomes.push((asset, Ok(None)));
            }
            Some(d) => live.push((asset, d)),
        }
    }

    if !live.is_empty() {
        let user_calls: Vec<ReadCall> = live
            .iter()
            .flat_map(|(asset, d)| user_reserve_calls(*asset, d, wallet))
            .collect();
        let assets: Vec<Address> = live.iter().map(|(a, _)| *a).collect();
        let key = reader.batch_key("aave_user_reserves", Some(wallet), &assets);
        let user = reader.read(&key, reader.volatile_ttl(), &user_calls).await?;
        for ((asset, d), out) in live.iter().zip(user.chunks(USER_CALLS)) {
            outcomes.push((*asset, reserve_position(chain, *asset, d, out)));
        }
    }
    settle(ProtocolKind::AaveV3, chain, outcomes)
}

async fn reserves_list<T: CallTransport>(
    reader: &ChainReader<'_, T>,
    pool: Address,
) -> Result<Vec<Address>, FetchError> {
    let key = reader.key("aave_reserves", None, pool);
    let list = reader
        .read(&key, reader.static_ttl(), &[ReadCall::new(pool, &IAavePool::getReservesListCall {})])
        .await?;
    match list.first() {
        Some(r) if r.success => Ok(r.get::<Vec<Address>>().unwrap_or_default()),
        Some(r) => Err(FetchError::Reverted(format!(
            "getReservesList on {pool}: {}",
            r.error.as_deref().unwrap_or("failed")
        ))),
        None => Ok(Vec::new()),
    }
}

fn user_reserve_calls(
    asset: Address,
    data: &IAavePool::ReserveData,
    wallet: Address,
) -> [ReadCall; USER_CALLS] {
    [
        ReadCall::new(data.aTokenAddress, &IERC20::balanceOfCall { account: wallet }),
        ReadCall::new(data.stableDebtTokenAddress, &IERC20::balanceOfCall { account: wallet }),
        ReadCall::new(data.variableDebtTokenAddress, &IERC20::balanceOfCall { account: wallet }),
        ReadCall::new(asset, &IERC20::decimalsCall {}),
        ReadCall::new(asset, &IERC20::symbolCall {}),
    ]
}

fn reserve_position(
    chain: &str,
    asset: Address,
    data: &IAavePool::ReserveData,
    out: &[CallResult],
) -> Result<Option<Position>, FetchError> {
    let Some(supplied) = out.first().and_then(CallResult::get::<U256>) else {
        return Err(FetchError::Reverted(format!("aToken balanceOf for {asset}")));
    };
    // Debt tokens can be retired (stable debt on newer markets); a failed read counts as none.
    let stable = out.get(1).and_then(CallResult::get::<U256>).unwrap_or_default();
    let variable = out.get(2).and_then(CallResult::get::<U256>).unwrap_or_default();
    let Some(decimals) = out.get(3).and_then(CallResult::get::<u8>) else {
        warn!(%chain, %asset, "reserve decimals unreadable, skipping");
        return Ok(None);
    };
    let symbol = out
        .get(4)
        .and_then(CallResult::get::<String>)
        .unwrap_or_else(|| "UNKNOWN".to_owned());

    Ok(RawPosition {
        asset,
        symbol,
        decimals,
        supplied,
        borrowed: stable.saturating_add(variable),
        supply_apy: ray_to_apy_percent(U256::from(data.currentLiquidityRate)),
        borrow_apy: ray_to_apy_percent(U256::from(data.currentVariableBorrowRate)),
        underlying: None,
    }
    .into_position(ProtocolKind::AaveV3, chain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicall::testing::{chain_info, fetcher, MockChain};

    const POOL: Address = Address::repeat_byte(0x10);
    const USDC: Address = Address::repeat_byte(0x20);
    const A_USDC: Address = Address::repeat_byte(0x21);
    const VAR_DEBT: Address = Address::repeat_byte(0x22);
    const WALLET: Address = Address::repeat_byte(0x99);

    fn reserve(a_token: Address, liquidity_rate: u128) -> IAavePool::ReserveData {
        IAavePool::ReserveData {
            configuration: IAavePool::ReserveConfigurationMap { data: U256::ZERO },
            liquidityIndex: Default::default(),
            currentLiquidityRate: liquidity_rate,
            variableBorrowIndex: Default::default(),
            currentVariableBorrowRate: 40_000_000_000_000_000_000_000_000_u128,
            currentStableBorrowRate: Default::default(),
            lastUpdateTimestamp: Default::default(),
            id: Default::default(),
            aTokenAddress: a_token,
            stableDebtTokenAddress: Address::ZERO,
            variableDebtTokenAddress: VAR_DEBT,
            interestRateStrategyAddress: Address::ZERO,
            accruedToTreasury: Default::default(),
            unbacked: Default::default(),
            isolationModeTotalDebt: Default::default(),
        }
    }

    fn seed(chain: &MockChain, a_token: Address, supplied: u64, debt: u64) {
        chain.respond::<IAavePool::getReservesListCall>(POOL, &vec![USDC]);
        // 2.5e25 ray
        chain.respond::<IAavePool::getReserveDataCall>(
            POOL,
            &reserve(a_token, 25_000_000_000_000_000_000_000_000_u128),
        );
        chain.respond::<IERC20::balanceOfCall>(A_USDC, &U256::from(supplied));
        chain.respond::<IERC20::balanceOfCall>(VAR_DEBT, &U256::from(debt));
        chain.respond::<IERC20::decimalsCall>(USDC, &6_u8);
        chain.respond::<IERC20::symbolCall>(USDC, &"USDC".to_owned());
    }

    #[tokio::test]
    async fn supplied_reserve_reports_amount_and_rates() -> eyre::Result<()> {
        let (info, chain, fetcher) = (chain_info("ethereum"), MockChain::default(), fetcher());
        seed(&chain, A_USDC, 1_500_000, 250_000);
        let reader = ChainReader::new(&info, &chain, &fetcher);

        let out = positions(&reader, Some(POOL), WALLET).await?.positions;
        assert_eq!(out.len(), 1_usize, "positions: {out:?}");
        let p = out.first().ok_or_else(|| eyre::eyre!("no position"))?;
        assert_eq!(p.symbol, "USDC");
        assert_eq!(p.supplied, "1.5");
        assert_eq!(p.borrowed, "0.25");
        assert_eq!(p.supply_apy.as_deref(), Some("2.50"));
        assert_eq!(p.borrow_apy.as_deref(), Some("4.00"));
        Ok(())
    }

    #[tokio::test]
    async fn untouched_reserve_is_not_a_position() -> eyre::Result<()> {
        let (info, chain, fetcher) = (chain_info("ethereum"), MockChain::default(), fetcher());
        seed(&chain, A_USDC, 0, 0);
        let reader = ChainReader::new(&info, &chain, &fetcher);
        assert!(positions(&reader, Some(POOL), WALLET).await?.positions.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn zero_atoken_reserve_is_skipped() -> eyre::Result<()> {
        let (info, chain, fetcher) = (chain_info("ethereum"), MockChain::default(), fetcher());
        seed(&chain, Address::ZERO, 1_000_000, 0);
        let reader = ChainReader::new(&info, &chain, &fetcher);
        assert!(positions(&reader, Some(POOL), WALLET).await?.positions.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn many_reserves_cost_a_fixed_number_of_round_trips() -> eyre::Result<()> {
        let (info, chain, fetcher) = (chain_info("ethereum"), MockChain::default(), fetcher());
        seed(&chain, A_USDC, 1_500_000, 0);
        // 29 more reserves share the same reserve data but have no readable decimals.
        let mut list = vec![USDC];
        list.extend((0_u8..29).map(|i| Address::repeat_byte(0x60_u8.saturating_add(i))));
        chain.respond::<IAavePool::getReservesListCall>(POOL, &list);
        let reader = ChainReader::new(&info, &chain, &fetcher);

        let out = positions(&reader, Some(POOL), WALLET).await?;
        assert_eq!(out.positions.len(), 1_usize, "positions: {:?}", out.positions);
        assert_eq!(
            chain.eth_calls.load(std::sync::atomic::Ordering::SeqCst),
            3_usize,
            "reserve list, reserve data and user balances should be one batch each"
        );
        Ok(())
    }

    #[test]
    fn failed_atoken_balance_is_an_error_for_that_reserve() {
        let out = vec![CallResult::failed("execution reverted"); USER_CALLS];
        let res = reserve_position("ethereum", USDC, &reserve(A_USDC, 0), &out);
        assert!(matches!(res, Err(FetchError::Reverted(_))), "got {res:?}");
    }

    #[tokio::test]
    async fn chain_without_pool_is_empty_not_an_error() -> eyre::Result<()> {
        let (info, chain, fetcher) = (chain_info("bnb"), MockChain::default(), fetcher());
        let reader = ChainReader::new(&info, &chain, &fetcher);
        assert!(positions(&reader, None, WALLET).await?.positions.is_empty());
        assert_eq!(
            chain.eth_calls.load(std::sync::atomic::Ordering::SeqCst),
            0_usize
        );
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_chain_fails_the_protocol() {
        let info = chain_info("ethereum");
        let chain = MockChain::down();
        let fetcher = fetcher();
        let reader = ChainReader::new(&info, &chain, &fetcher);
        let res = positions(&reader, Some(POOL), WALLET).await;
        assert!(matches!(res, Err(FetchError::BatchTransport(_))), "got {res:?}");
    }
}
