use crate::{config::ChainInfo, errors::FetchError};
use alloy::{
    network::TransactionBuilder as _,
    primitives::{Address, Bytes, U256},
    providers::{Provider as _, RootProvider},
    rpc::types::TransactionRequest,
    sol,
    transports::{RpcError, TransportErrorKind},
};
use alloy::transports::http::Client;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

const DEFAULT_RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type EvmProvider = RootProvider;

sol! {
    #[sol(rpc)]
    contract IERC20 {
        function name() external view returns (string);
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function symbol() external view returns (string);
    }
}

/// Read-only access to one chain: raw `eth_call` and native balance.
///
/// The engine only ever talks to chains through this seam, so tests can swap in an in-memory
/// implementation.
pub trait CallTransport: Send + Sync {
    fn chain_name(&self) -> &str;

    fn call(&self, to: Address, data: Bytes) -> impl Future<Output = Result<Bytes, FetchError>> + Send;

    fn native_balance(&self, owner: Address) -> impl Future<Output = Result<U256, FetchError>> + Send;
}

/// Map an alloy RPC failure onto the fetch taxonomy.
///
/// JSON-RPC error responses are application-level (a revert, bad params) unless they look like
/// throttling; everything else is a transport failure.
pub fn classify_rpc_error(e: &RpcError<TransportErrorKind>) -> FetchError {
    if let Some(payload) = e.as_error_resp() {
        let msg = payload.message.to_string();
        let lower = msg.to_lowercase();
        if payload.code == 429 || lower.contains("rate limit") || lower.contains("too many requests")
        {
            return FetchError::RateLimited(msg);
        }
        return FetchError::Reverted(msg);
    }
    let s = format!("{e:#}");
    let lower = s.to_lowercase();
    if lower.contains("429") || lower.contains("too many requests") {
        FetchError::RateLimited(s)
    } else {
        FetchError::Transport(s)
    }
}

#[derive(Debug)]
pub struct EvmChain {
    pub info: Arc<ChainInfo>,
    urls: Vec<String>,
    timeout: Duration,
    /// Index of the endpoint to use next. Advanced on transport failure so the retry wrapper's
    /// next attempt lands on a fallback RPC.
    cursor: AtomicUsize,
}

impl EvmChain {
    pub fn new(info: Arc<ChainInfo>, timeout: Duration) -> Self {
        let urls = info.all_rpc_urls();
        Self {
            info,
            urls,
            timeout,
            cursor: AtomicUsize::new(0),
        }
    }

    fn provider_for_url(url: &str, timeout: Duration) -> Result<EvmProvider, FetchError> {
        let u: reqwest::Url = url
            .parse()
            .map_err(|e| FetchError::ConfigurationMissing(format!("invalid rpc url {url}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(DEFAULT_RPC_CONNECT_TIMEOUT.min(timeout))
            .build()
            .map_err(|e| FetchError::Transport(format!("build rpc http client: {e}")))?;
        let http = alloy::transports::http::Http::with_client(client, u);
        let rpc_client = alloy::rpc::client::RpcClient::new(http, false);
        Ok(RootProvider::new(rpc_client))
    }

    fn current_provider(&self) -> Result<(usize, EvmProvider), FetchError> {
        if self.urls.is_empty() {
            return Err(FetchError::ConfigurationMissing(format!(
                "no rpc endpoints configured for {}",
                self.info.name
            )));
        }
        let idx = self.cursor.load(Ordering::Relaxed) % self.urls.len();
        let url = self.urls.get(idx).map_or("", String::as_str);
        Ok((idx, Self::provider_for_url(url, self.timeout)?))
    }

    fn rotate_after_failure(&self, idx: usize, err: &FetchError) {
        if !err.is_retryable() || self.urls.len() < 2 {
            return;
        }
        let next = (idx + 1) % self.urls.len();
        // Only rotate if nobody else already moved past this endpoint.
        if self
            .cursor
            .compare_exchange(idx, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            debug!(chain = %self.info.name, next = %self.urls.get(next).map_or("", String::as_str), "rotating rpc endpoint");
        }
    }

    /// Ask the endpoint which chain it serves, so a misconfigured RPC can be caught before
    /// its answers end up in a report.
    pub async fn probe_chain_id(&self) -> Result<u64, FetchError> {
        let (idx, p) = self.current_provider()?;
        match p.get_chain_id().await {
            Ok(id) => Ok(id),
            Err(e) => {
                let fe = classify_rpc_error(&e);
                self.rotate_after_failure(idx, &fe);
                Err(fe)
            }
        }
    }
}

impl CallTransport for EvmChain {
    fn chain_name(&self) -> &str {
        &self.info.name
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, FetchError> {
        let (idx, p) = self.current_provider()?;
        let tx = TransactionRequest::default().with_to(to).with_input(data);
        match p.call(tx).await {
            Ok(out) => Ok(out),
            Err(e) => {
                let fe = classify_rpc_error(&e);
                self.rotate_after_failure(idx, &fe);
                Err(fe)
            }
        }
    }

    async fn native_balance(&self, owner: Address) -> Result<U256, FetchError> {
        let (idx, p) = self.current_provider()?;
        match p.get_balance(owner).await {
            Ok(v) => Ok(v),
            Err(e) => {
                let fe = classify_rpc_error(&e);
                self.rotate_after_failure(idx, &fe);
                Err(fe)
            }
        }
    }
}
