use crate::{
    cache::cache_key,
    chains::evm::CallTransport,
    config::ChainInfo,
    errors::FetchError,
    fetch::ResilientFetcher,
    multicall::{CallResult, ReadBatcher, ReadCall},
};
use alloy::primitives::{Address, U256};
use std::time::Duration;

/// One chain's read path: batched contract reads and native balances, each going through the
/// shared fetch wrapper.
pub struct ChainReader<'a, T> {
    pub chain: &'a ChainInfo,
    pub transport: &'a T,
    pub fetcher: &'a ResilientFetcher,
    pub chunk_size: usize,
}

impl<'a, T: CallTransport> ChainReader<'a, T> {
    pub const fn new(chain: &'a ChainInfo, transport: &'a T, fetcher: &'a ResilientFetcher) -> Self {
        Self {
            chain,
            transport,
            fetcher,
            chunk_size: crate::multicall::DEFAULT_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n;
        self
    }

    pub fn batcher(&self) -> ReadBatcher<'a, T> {
        ReadBatcher::new(self.transport, self.chain.multicall).with_chunk_size(self.chunk_size)
    }

    /// Cache key scoped to this chain.
    pub fn key(&self, op: &str, wallet: Option<Address>, object: Address) -> String {
        let wallet = wallet.map(|w| w.to_string()).unwrap_or_default();
        cache_key(op, &self.chain.name, &wallet, &object.to_string())
    }

    /// Cache key for one batched read that covers several objects.
    pub fn batch_key(&self, op: &str, wallet: Option<Address>, objects: &[Address]) -> String {
        let wallet = wallet.map(|w| w.to_string()).unwrap_or_default();
        let objects = objects
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        cache_key(op, &self.chain.name, &wallet, &objects)
    }

    pub const fn static_ttl(&self) -> Duration {
        self.fetcher.static_ttl
    }

    pub const fn volatile_ttl(&self) -> Duration {
        self.fetcher.volatile_ttl
    }

    /// Run `calls` as one batched read under `key`. A cached batch is only ever a batch that
    /// went through; individual reverts inside it are part of the cached value.
    pub async fn read(
        &self,
        key: &str,
        ttl: Duration,
        calls: &[ReadCall],
    ) -> Result<Vec<CallResult>, FetchError> {
        let batcher = self.batcher();
        let batcher = &batcher;
        self.fetcher
            .fetch(key, ttl, move || batcher.batch(calls))
            .await
    }

    pub async fn native_balance(&self, wallet: Address) -> Result<U256, FetchError> {
        let key = cache_key("native_balance", &self.chain.name, &wallet.to_string(), "");
        let transport = self.transport;
        self.fetcher
            .fetch(&key, self.volatile_ttl(), move || transport.native_balance(wallet))
            .await
    }
}
