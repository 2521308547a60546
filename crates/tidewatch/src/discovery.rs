//! Token discovery and balance fetch for one chain.
//!
//! Tokens come from the explorer's ERC20 transfer history when an API key is configured, merged
//! with the chain's static list. Balances are read in fixed-size concurrent batches with a pause
//! in between to stay under public RPC rate limits.

use crate::{
    chains::evm::{CallTransport, IERC20},
    config::{ChainInfo, DiscoveryConfig, HttpConfig},
    errors::{FetchError, ReportError},
    fetch::ResilientFetcher,
    multicall::{CallResult, ReadCall},
    reader::ChainReader,
};
use alloy::primitives::{Address, U256};
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashSet, str::FromStr as _, time::Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceSource {
    Native,
    Erc20,
}

#[derive(Debug, Clone)]
pub struct TokenBalance {
    /// `None` for the native asset.
    pub token: Option<Address>,
    pub raw: U256,
    pub decimals: Option<u8>,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub source: BalanceSource,
    pub error: Option<ReportError>,
}

impl TokenBalance {
    fn native(chain: &ChainInfo, raw: U256, error: Option<ReportError>) -> Self {
        Self {
            token: None,
            raw,
            decimals: Some(chain.native.decimals),
            symbol: Some(chain.native.symbol.clone()),
            name: Some(chain.native.symbol.clone()),
            source: BalanceSource::Native,
            error,
        }
    }

    fn failed(token: Address, e: &FetchError) -> Self {
        Self {
            token: Some(token),
            raw: U256::ZERO,
            decimals: None,
            symbol: None,
            name: None,
            source: BalanceSource::Erc20,
            error: Some(e.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    message: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenTransfer {
    contract_address: String,
}

/// Etherscan-compatible (v2, multi-chain) explorer client.
#[derive(Debug, Clone)]
pub struct Explorer {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl Explorer {
    pub fn new(http: &HttpConfig, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(format!("build explorer http client: {e}")))?;
        Ok(Self {
            client,
            base_url: http.explorer_api_base_url.trim().to_owned(),
            api_key: http
                .explorer_api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_owned),
        })
    }

    pub const fn has_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Every ERC20 contract that appears in the wallet's token transfer history, deduplicated.
    pub async fn token_contracts(
        &self,
        chain_id: u64,
        wallet: Address,
    ) -> Result<Vec<Address>, FetchError> {
        let Some(key) = &self.api_key else {
            return Err(FetchError::ConfigurationMissing(
                "explorer_api_key is not set".to_owned(),
            ));
        };
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("chainid", chain_id.to_string()),
                ("module", "account".to_owned()),
                ("action", "tokentx".to_owned()),
                ("address", format!("{wallet:#x}")),
                ("page", "1".to_owned()),
                ("offset", "10000".to_owned()),
                ("sort", "desc".to_owned()),
                ("apikey", key.clone()),
            ])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| FetchError::from_reqwest(&e))?;
        let body: ExplorerResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::Decode(format!("explorer json: {e}")))?;
        parse_token_contracts(body)
    }
}

fn parse_token_contracts(body: ExplorerResponse) -> Result<Vec<Address>, FetchError> {
    if body.status != "1" {
        // "No transactions found" is an empty history, not a failure.
        if body.message.to_ascii_lowercase().starts_with("no transactions") {
            return Ok(Vec::new());
        }
        let detail = body.result.as_str().unwrap_or(body.message.as_str()).to_owned();
        let lower = detail.to_ascii_lowercase();
        return Err(if lower.contains("rate limit") {
            FetchError::RateLimited(detail)
        } else if lower.contains("api key") {
            FetchError::ConfigurationMissing(detail)
        } else {
            FetchError::Http {
                status: 200,
                message: detail,
            }
        });
    }
    let transfers: Vec<TokenTransfer> = serde_json::from_value(body.result)
        .map_err(|e| FetchError::Decode(format!("explorer tokentx result: {e}")))?;
    let addrs = transfers
        .iter()
        .filter_map(|t| Address::from_str(t.contract_address.trim()).ok());
    Ok(dedup(addrs))
}

/// Keep first occurrence order. Addresses compare by bytes, so checksum casing never matters.
fn dedup(addrs: impl IntoIterator<Item = Address>) -> Vec<Address> {
    let mut seen = HashSet::new();
    addrs.into_iter().filter(|a| seen.insert(*a)).collect()
}

/// Tokens to check on `chain`, plus an annotation when discovery was degraded.
pub async fn discover_tokens(
    explorer: &Explorer,
    fetcher: &ResilientFetcher,
    chain: &ChainInfo,
    wallet: Address,
) -> (Vec<Address>, Option<ReportError>) {
    let static_list = chain.static_tokens.iter().copied();
    if !chain.explorer {
        return (dedup(static_list), None);
    }
    if !explorer.has_key() {
        let e = FetchError::ConfigurationMissing(format!(
            "no explorer api key; {} uses its static token list",
            chain.name
        ));
        return (dedup(static_list), Some(e.into()));
    }

    let key = crate::cache::cache_key("token_discovery", &chain.name, &wallet.to_string(), "");
    let chain_id = chain.chain_id;
    match fetcher
        .fetch(&key, fetcher.volatile_ttl, move || explorer.token_contracts(chain_id, wallet))
        .await
    {
        Ok(found) => {
            debug!(chain = %chain.name, discovered = found.len(), "token discovery");
            (dedup(found.into_iter().chain(static_list)), None)
        }
        Err(e) => {
            warn!(chain = %chain.name, error = %e, "token discovery failed, using static list");
            (dedup(static_list), Some(e.into()))
        }
    }
}

/// Native balance plus one `balanceOf/decimals/symbol/name` batch per token.
///
/// Never fails: any element that cannot be read comes back as a zero balance with its error.
pub async fn fetch_balances<T: CallTransport>(
    reader: &ChainReader<'_, T>,
    cfg: &DiscoveryConfig,
    tokens: &[Address],
    wallet: Address,
) -> Vec<TokenBalance> {
    let chain = reader.chain;
    let native = match reader.native_balance(wallet).await {
        Ok(raw) => TokenBalance::native(chain, raw, None),
        Err(e) => {
            warn!(chain = %chain.name, error = %e, "native balance failed");
            TokenBalance::native(chain, U256::ZERO, Some(e.into()))
        }
    };

    let mut out = Vec::with_capacity(tokens.len() + 1);
    out.push(native);
    let pause = Duration::from_millis(cfg.balance_batch_pause_ms);
    let mut batches = tokens.chunks(cfg.balance_batch_size.max(1)).peekable();
    while let Some(batch) = batches.next() {
        let got = join_all(batch.iter().map(|&t| token_balance(reader, t, wallet))).await;
        out.extend(got);
        if batches.peek().is_some() && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
    info!(chain = %chain.name, tokens = tokens.len(), "balances fetched");
    out
}

async fn token_balance<T: CallTransport>(
    reader: &ChainReader<'_, T>,
    token: Address,
    wallet: Address,
) -> TokenBalance {
    let calls = [
        ReadCall::new(token, &IERC20::balanceOfCall { account: wallet }),
        ReadCall::new(token, &IERC20::decimalsCall {}),
        ReadCall::new(token, &IERC20::symbolCall {}),
        ReadCall::new(token, &IERC20::nameCall {}),
    ];
    let key = reader.key("erc20_balance_meta", Some(wallet), token);
    let out = match reader.read(&key, reader.volatile_ttl(), &calls).await {
        Ok(out) => out,
        Err(e) => {
            debug!(chain = %reader.chain.name, %token, error = %e, "token read failed");
            return TokenBalance::failed(token, &e);
        }
    };
    let balance = out.first().and_then(CallResult::get::<U256>);
    let error = match (&balance, out.first()) {
        (None, Some(r)) => Some(ReportError::new(
            "call_reverted",
            r.error.clone().unwrap_or_else(|| "balanceOf failed".to_owned()),
        )),
        _ => None,
    };
    TokenBalance {
        token: Some(token),
        raw: balance.unwrap_or_default(),
        decimals: out.get(1).and_then(CallResult::get::<u8>),
        symbol: out.get(2).and_then(CallResult::get::<String>),
        name: out.get(3).and_then(CallResult::get::<String>),
        source: BalanceSource::Erc20,
        error,
    }
}
