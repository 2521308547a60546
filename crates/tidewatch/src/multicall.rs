//! Chain read-batcher: packs independent contract reads into Multicall3 `aggregate3` calls and
//! hands back one [`CallResult`] per [`ReadCall`], in input order.

use crate::{chains::evm::CallTransport, errors::FetchError};
use alloy::{
    primitives::{Address, Bytes},
    sol,
    sol_types::SolCall,
};
use futures::future::{join_all, try_join_all};
use std::{any::Any, sync::Arc};
use tracing::debug;

sol! {
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls)
            external payable returns (Result[] memory returnData);
    }
}

/// A decoded return value; its concrete type is the `Return` of the call that produced it.
pub type Value = Arc<dyn Any + Send + Sync>;

type Decoder = fn(&[u8]) -> Result<Value, String>;

fn decode_returns<C>(data: &[u8]) -> Result<Value, String>
where
    C: SolCall,
    C::Return: Send + Sync + 'static,
{
    C::abi_decode_returns(data)
        .map(|r| Arc::new(r) as Value)
        .map_err(|e| format!("{e}"))
}

/// One read-only contract call plus the decoder for its return type.
#[derive(Clone)]
pub struct ReadCall {
    pub target: Address,
    pub allow_failure: bool,
    pub call_data: Bytes,
    pub function: &'static str,
    decode: Decoder,
}

impl ReadCall {
    pub fn new<C>(target: Address, call: &C) -> Self
    where
        C: SolCall,
        C::Return: Send + Sync + 'static,
    {
        Self {
            target,
            allow_failure: true,
            call_data: call.abi_encode().into(),
            function: C::SIGNATURE,
            decode: decode_returns::<C>,
        }
    }

    fn decode(&self, data: &[u8]) -> CallResult {
        match (self.decode)(data) {
            Ok(v) => CallResult::ok(v),
            Err(e) => CallResult::failed(format!("decode {}: {e}", self.function)),
        }
    }
}

impl std::fmt::Debug for ReadCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCall")
            .field("target", &self.target)
            .field("function", &self.function)
            .field("allow_failure", &self.allow_failure)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct CallResult {
    pub success: bool,
    value: Option<Value>,
    pub error: Option<String>,
}

impl CallResult {
    fn ok(value: Value) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error.into()),
        }
    }

    /// The decoded value, if the call succeeded and `T` is its return type.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        self.value.as_ref()?.downcast_ref::<T>()
    }

    pub fn get<T: Clone + 'static>(&self) -> Option<T> {
        self.value::<T>().cloned()
    }
}

impl std::fmt::Debug for CallResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallResult")
            .field("success", &self.success)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

pub const DEFAULT_CHUNK_SIZE: usize = 200;

pub struct ReadBatcher<'a, T> {
    transport: &'a T,
    multicall: Option<Address>,
    chunk_size: usize,
}

impl<'a, T: CallTransport> ReadBatcher<'a, T> {
    pub fn new(transport: &'a T, multicall: Option<Address>) -> Self {
        Self {
            transport,
            multicall,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }

    /// Execute `calls` and return exactly one result per call, in the same order.
    ///
    /// Individual reverts and decode failures become failed [`CallResult`]s. The whole batch
    /// fails only when the batch call itself cannot be made or its envelope cannot be decoded,
    /// in which case every call must be treated as failed.
    pub async fn batch(&self, calls: &[ReadCall]) -> Result<Vec<CallResult>, FetchError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let Some(multicall) = self.multicall else {
            return Ok(self.batch_per_call(calls).await);
        };

        let chunks = calls
            .chunks(self.chunk_size)
            .map(|chunk| self.aggregate(multicall, chunk));
        let parts = try_join_all(chunks).await?;
        Ok(parts.into_iter().flatten().collect())
    }

    async fn aggregate(
        &self,
        multicall: Address,
        calls: &[ReadCall],
    ) -> Result<Vec<CallResult>, FetchError> {
        let encoded: Vec<IMulticall3::Call3> = calls
            .iter()
            .map(|c| IMulticall3::Call3 {
                target: c.target,
                allowFailure: c.allow_failure,
                callData: c.call_data.clone(),
            })
            .collect();
        let data = IMulticall3::aggregate3Call { calls: encoded }.abi_encode();

        let out = match self.transport.call(multicall, data.into()).await {
            Ok(out) => out,
            // A revert here is the batching contract itself failing (wrong or missing
            // multicall address), not any one read.
            Err(FetchError::Transport(e) | FetchError::Reverted(e)) => {
                return Err(FetchError::BatchTransport(e))
            }
            Err(e) => return Err(e),
        };
        let results = IMulticall3::aggregate3Call::abi_decode_returns(&out)
            .map_err(|e| FetchError::Decode(format!("aggregate3 returns: {e}")))?;
        if results.len() != calls.len() {
            return Err(FetchError::Decode(format!(
                "aggregate3 returned {} results for {} calls",
                results.len(),
                calls.len()
            )));
        }
        debug!(chain = %self.transport.chain_name(), calls = calls.len(), "multicall batch");

        Ok(calls
            .iter()
            .zip(results)
            .map(|(call, r)| {
                if r.success {
                    call.decode(&r.returnData)
                } else {
                    CallResult::failed(format!("{} reverted", call.function))
                }
            })
            .collect())
    }

    /// Chains without a batching contract: one `eth_call` per read, run concurrently.
    async fn batch_per_call(&self, calls: &[ReadCall]) -> Vec<CallResult> {
        let futs = calls.iter().map(|c| async move {
            match self.transport.call(c.target, c.call_data.clone()).await {
                Ok(out) => c.decode(&out),
                Err(e) => CallResult::failed(format!("{}: {e}", c.function)),
            }
        });
        join_all(futs).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{MockChain, MULTICALL};
    use super::*;
    use crate::chains::evm::IERC20;
    use alloy::primitives::U256;
    use std::sync::atomic::Ordering;

    fn token(i: u8) -> Address {
        Address::repeat_byte(i)
    }

    fn balance_calls(n: u8) -> Vec<ReadCall> {
        (1..=n)
            .map(|i| {
                ReadCall::new(
                    token(i),
                    &IERC20::balanceOfCall {
                        account: Address::ZERO,
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_batch_makes_no_network_call() -> eyre::Result<()> {
        let chain = MockChain::default();
        let out = ReadBatcher::new(&chain, Some(MULTICALL)).batch(&[]).await?;
        assert!(out.is_empty());
        assert_eq!(chain.eth_calls.load(Ordering::SeqCst), 0_usize);
        Ok(())
    }

    #[tokio::test]
    async fn one_reverting_call_does_not_fail_its_siblings() -> eyre::Result<()> {
        let chain = MockChain::default();
        for i in [1_u8, 2, 4, 5] {
            chain.respond::<IERC20::balanceOfCall>(token(i), &U256::from(u64::from(i) * 100));
        }
        // token(3) has no canned response: it reverts.
        let calls = balance_calls(5);
        let out = ReadBatcher::new(&chain, Some(MULTICALL)).batch(&calls).await?;

        assert_eq!(out.len(), 5_usize, "one result per call");
        let flags: Vec<bool> = out.iter().map(|r| r.success).collect();
        assert_eq!(flags, vec![true, true, false, true, true]);
        assert_eq!(out.get(3).and_then(CallResult::get::<U256>), Some(U256::from(400_u64)));
        assert_eq!(chain.eth_calls.load(Ordering::SeqCst), 1_usize, "expected one round trip");
        Ok(())
    }

    #[tokio::test]
    async fn results_keep_input_order_across_chunks() -> eyre::Result<()> {
        let chain = MockChain::default();
        for i in 1_u8..=7 {
            chain.respond::<IERC20::balanceOfCall>(token(i), &U256::from(i));
        }
        let calls = balance_calls(7);
        let out = ReadBatcher::new(&chain, Some(MULTICALL))
            .with_chunk_size(3)
            .batch(&calls)
            .await?;
        let got: Vec<Option<U256>> = out.iter().map(CallResult::get::<U256>).collect();
        let want: Vec<Option<U256>> = (1_u8..=7).map(|i| Some(U256::from(i))).collect();
        assert_eq!(got, want);
        assert_eq!(chain.eth_calls.load(Ordering::SeqCst), 3_usize, "7 calls in chunks of 3");
        Ok(())
    }

    #[tokio::test]
    async fn decode_failure_after_success_is_an_item_failure() -> eyre::Result<()> {
        let chain = MockChain::default();
        chain.respond::<IERC20::balanceOfCall>(token(1), &U256::from(1_u64));
        // Two bytes can never decode as uint256.
        chain.respond_raw(
            token(2),
            IERC20::balanceOfCall::SELECTOR,
            Bytes::from_static(&[0x01, 0x02]),
        );
        let out = ReadBatcher::new(&chain, Some(MULTICALL))
            .batch(&balance_calls(2))
            .await?;
        assert!(out.first().is_some_and(|r| r.success));
        let second = out.get(1).ok_or_else(|| eyre::eyre!("missing result"))?;
        assert!(!second.success, "garbage return data should fail the item");
        assert!(
            second.error.as_deref().is_some_and(|e| e.contains("decode")),
            "error: {:?}",
            second.error
        );
        Ok(())
    }

    #[tokio::test]
    async fn transport_failure_fails_the_whole_batch() {
        let chain = MockChain::down();
        let res = ReadBatcher::new(&chain, Some(MULTICALL))
            .batch(&balance_calls(3))
            .await;
        assert!(
            matches!(res, Err(FetchError::BatchTransport(_))),
            "got {res:?}"
        );
    }

    #[tokio::test]
    async fn reverting_batch_contract_fails_the_whole_batch() {
        let chain = MockChain::default();
        chain.respond::<IERC20::balanceOfCall>(token(1), &U256::from(1_u64));
        // Nothing answers at this address, so aggregate3 itself reverts.
        let wrong_multicall = Address::repeat_byte(0xcb);
        let res = ReadBatcher::new(&chain, Some(wrong_multicall))
            .batch(&balance_calls(2))
            .await;
        assert!(
            matches!(res, Err(FetchError::BatchTransport(_))),
            "got {res:?}"
        );
    }

    #[tokio::test]
    async fn chains_without_multicall_fall_back_to_single_calls() -> eyre::Result<()> {
        let chain = MockChain::default();
        chain.respond::<IERC20::balanceOfCall>(token(1), &U256::from(5_u64));
        let out = ReadBatcher::new(&chain, None).batch(&balance_calls(2)).await?;
        assert_eq!(out.len(), 2_usize);
        assert_eq!(out.first().and_then(CallResult::get::<U256>), Some(U256::from(5_u64)));
        assert!(out.get(1).is_some_and(|r| !r.success), "second call should revert");
        assert_eq!(chain.eth_calls.load(Ordering::SeqCst), 2_usize);
        Ok(())
    }
}
