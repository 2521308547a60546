//! USD pricing against a CoinGecko-compatible API: by contract address first, then by a
//! well-known symbol table, with the native asset priced by its configured id.

use crate::{
    cache::cache_key,
    config::{ChainInfo, HttpConfig},
    errors::{FetchError, ReportError},
    fetch::ResilientFetcher,
};
use alloy::primitives::Address;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr as _,
    time::Duration,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteSource {
    ByAddress,
    BySymbol,
    Native,
    Unavailable,
}

impl QuoteSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ByAddress => "by_address",
            Self::BySymbol => "by_symbol",
            Self::Native => "native",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    pub usd: Option<Decimal>,
    pub source: QuoteSource,
}

impl PriceQuote {
    pub const fn new(usd: Decimal, source: QuoteSource) -> Self {
        Self {
            usd: Some(usd),
            source,
        }
    }

    pub const fn unavailable() -> Self {
        Self {
            usd: None,
            source: QuoteSource::Unavailable,
        }
    }
}

impl Default for PriceQuote {
    fn default() -> Self {
        Self::unavailable()
    }
}

/// Price-source ids for assets that are commonly held but often missing from by-address
/// lookups (bridged variants, wrappers).
pub fn symbol_price_id(symbol: &str) -> Option<&'static str> {
    match symbol.trim().to_ascii_uppercase().as_str() {
        "ETH" => Some("ethereum"),
        "WETH" => Some("weth"),
        "STETH" => Some("staked-ether"),
        "WSTETH" => Some("wrapped-steth"),
        "BTC" => Some("bitcoin"),
        "WBTC" | "BTC.B" => Some("wrapped-bitcoin"),
        "USDC" | "USDC.E" | "USDBC" => Some("usd-coin"),
        "USDT" | "USDT.E" | "USDT0" => Some("tether"),
        "DAI" | "DAI.E" => Some("dai"),
        "POL" | "MATIC" | "WPOL" | "WMATIC" => Some("polygon-ecosystem-token"),
        "BNB" | "WBNB" => Some("binancecoin"),
        "AVAX" | "WAVAX" => Some("avalanche-2"),
        "ARB" => Some("arbitrum"),
        "OP" => Some("optimism"),
        "LINK" => Some("chainlink"),
        "UNI" => Some("uniswap"),
        "AAVE" => Some("aave"),
        _ => None,
    }
}

/// JSON numbers come back as f64 literals; go through their text so no float math happens.
fn decimal_from_json(v: &Value) -> Option<Decimal> {
    let s = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    Decimal::from_str(&s)
        .or_else(|_| Decimal::from_scientific(&s))
        .ok()
}

/// `{ "<key>": { "usd": <number> }, ... }` into `key -> usd`. Entries without a usd price are
/// dropped.
fn parse_usd_map(body: HashMap<String, HashMap<String, Value>>) -> HashMap<String, Decimal> {
    body.into_iter()
        .filter_map(|(k, v)| {
            let usd = v.get("usd").and_then(decimal_from_json)?;
            Some((k.to_ascii_lowercase(), usd))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PriceClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    key_is_demo: bool,
}

impl PriceClient {
    pub fn new(http: &HttpConfig, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(format!("build price http client: {e}")))?;
        Ok(Self {
            client,
            base_url: http.price_api_base_url.trim().trim_end_matches('/').to_owned(),
            api_key: http
                .price_api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_owned),
            key_is_demo: http.price_api_key_is_demo,
        })
    }

    async fn get_usd_map(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<HashMap<String, Decimal>, FetchError> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .get(url)
            .query(query)
            .header("accept", "application/json");
        if let Some(k) = &self.api_key {
            let header = if self.key_is_demo {
                "x-cg-demo-api-key"
            } else {
                "x-cg-pro-api-key"
            };
            req = req.header(header, k);
        }
        let resp = req
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| FetchError::from_reqwest(&e))?;
        let body: HashMap<String, HashMap<String, Value>> = resp
            .json()
            .await
            .map_err(|e| FetchError::Decode(format!("price json: {e}")))?;
        Ok(parse_usd_map(body))
    }

    /// `/simple/token_price/{platform}` for one batch of contract addresses.
    pub async fn by_address(
        &self,
        platform: &str,
        addresses: &[Address],
    ) -> Result<HashMap<Address, Decimal>, FetchError> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = addresses
            .iter()
            .map(|a| format!("{a:#x}"))
            .collect::<Vec<_>>()
            .join(",");
        let m = self
            .get_usd_map(
                &format!("/simple/token_price/{platform}"),
                &[
                    ("contract_addresses", joined),
                    ("vs_currencies", "usd".to_owned()),
                ],
            )
            .await?;
        Ok(m.into_iter()
            .filter_map(|(k, v)| Address::from_str(&k).ok().map(|a| (a, v)))
            .collect())
    }

    /// `/simple/price` for a set of asset ids.
    pub async fn by_id(&self, ids: &[String]) -> Result<HashMap<String, Decimal>, FetchError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.get_usd_map(
            "/simple/price",
            &[("ids", ids.join(",")), ("vs_currencies", "usd".to_owned())],
        )
        .await
    }
}

#[derive(Debug, Clone)]
pub struct TokenRef {
    pub address: Address,
    pub symbol: Option<String>,
}

/// All quotes for one chain. Lookups never fail: a token without a quote is `unavailable`.
#[derive(Debug, Clone, Default)]
pub struct ChainQuotes {
    pub tokens: HashMap<Address, PriceQuote>,
    pub native: PriceQuote,
    pub errors: Vec<ReportError>,
}

impl ChainQuotes {
    pub fn token(&self, address: &Address) -> PriceQuote {
        self.tokens.get(address).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Pricer {
    client: PriceClient,
    batch_size: usize,
}

impl Pricer {
    pub fn new(client: PriceClient, batch_size: usize) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
        }
    }

    /// Quote every token and the native asset of `chain`.
    ///
    /// Order: by contract address (batched), then by symbol for whatever is left, with the
    /// native id folded into the symbol request. Source failures are annotated, never thrown.
    pub async fn quote_chain(
        &self,
        fetcher: &ResilientFetcher,
        chain: &ChainInfo,
        tokens: &[TokenRef],
    ) -> ChainQuotes {
        let mut out = ChainQuotes::default();

        if let Some(platform) = chain.price_platform.as_deref() {
            let addrs: Vec<Address> = tokens.iter().map(|t| t.address).collect();
            for chunk in addrs.chunks(self.batch_size) {
                let joined = chunk.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
                let key = cache_key("price_by_address", &chain.name, "", &joined);
                let client = &self.client;
                match fetcher
                    .fetch(&key, fetcher.volatile_ttl, move || client.by_address(platform, chunk))
                    .await
                {
                    Ok(m) => {
                        for (a, usd) in m {
                            out.tokens.insert(a, PriceQuote::new(usd, QuoteSource::ByAddress));
                        }
                    }
                    Err(e) => {
                        warn!(chain = %chain.name, error = %e, "price lookup by address failed");
                        out.errors.push(price_error(&e));
                    }
                }
            }
        }

        let mut by_symbol: BTreeMap<String, Vec<Address>> = BTreeMap::new();
        for t in tokens {
            if out.tokens.contains_key(&t.address) {
                continue;
            }
            if let Some(id) = t.symbol.as_deref().and_then(symbol_price_id) {
                by_symbol.entry(id.to_owned()).or_default().push(t.address);
            }
        }
        let mut ids: Vec<String> = by_symbol.keys().cloned().collect();
        if let Some(native) = &chain.native.price_id {
            if !ids.contains(native) {
                ids.push(native.clone());
            }
        }
        if ids.is_empty() {
            return out;
        }
        ids.sort();

        let key = cache_key("price_by_id", "", "", &ids.join(","));
        let client = &self.client;
        let ids_ref = &ids;
        match fetcher
            .fetch(&key, fetcher.volatile_ttl, move || client.by_id(ids_ref))
            .await
        {
            Ok(m) => {
                for (id, addrs) in &by_symbol {
                    if let Some(usd) = m.get(id) {
                        for a in addrs {
                            out.tokens.insert(*a, PriceQuote::new(*usd, QuoteSource::BySymbol));
                        }
                    }
                }
                if let Some(usd) = chain.native.price_id.as_ref().and_then(|id| m.get(id)) {
                    out.native = PriceQuote::new(*usd, QuoteSource::Native);
                }
            }
            Err(e) => {
                warn!(chain = %chain.name, error = %e, "price lookup by id failed");
                out.errors.push(price_error(&e));
            }
        }
        debug!(chain = %chain.name, quoted = out.tokens.len(), "prices resolved");
        out
    }
}

fn price_error(e: &FetchError) -> ReportError {
    ReportError::new("price_unavailable", format!("{}: {e}", e.code()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicall::testing::{chain_info, fetcher};

    #[test]
    fn well_known_symbols_map_to_ids() {
        assert_eq!(symbol_price_id("usdc"), Some("usd-coin"));
        assert_eq!(symbol_price_id("USDbC"), Some("usd-coin"));
        assert_eq!(symbol_price_id("WETH"), Some("weth"));
        assert_eq!(symbol_price_id("SHIB2"), None);
    }

    #[test]
    fn usd_map_parses_numbers_without_floats() -> eyre::Result<()> {
        let body: HashMap<String, HashMap<String, Value>> = serde_json::from_str(
            r#"{
                "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48": {"usd": 0.999876},
                "ethereum": {"usd": 3012.55},
                "tiny": {"usd": 1e-7},
                "missing": {}
            }"#,
        )?;
        let m = parse_usd_map(body);
        assert_eq!(
            m.get("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").copied(),
            Some(Decimal::from_str("0.999876")?)
        );
        assert_eq!(m.get("ethereum").copied(), Some(Decimal::from_str("3012.55")?));
        assert_eq!(m.get("tiny").copied(), Some(Decimal::from_str("0.0000001")?));
        assert!(!m.contains_key("missing"));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_price_source_leaves_everything_unavailable() -> eyre::Result<()> {
        let http = HttpConfig {
            price_api_base_url: "http://127.0.0.1:1".to_owned(),
            ..HttpConfig::default()
        };
        let pricer = Pricer::new(PriceClient::new(&http, Duration::from_millis(500))?, 50);
        let info = chain_info("ethereum");
        let token = Address::repeat_byte(0x20);
        let quotes = pricer
            .quote_chain(
                &fetcher(),
                &info,
                &[TokenRef {
                    address: token,
                    symbol: Some("USDC".to_owned()),
                }],
            )
            .await;

        assert_eq!(quotes.token(&token), PriceQuote::unavailable());
        assert_eq!(quotes.native, PriceQuote::unavailable());
        assert!(!quotes.errors.is_empty(), "chain should be annotated");
        assert!(quotes.errors.iter().all(|e| e.code == "price_unavailable"));
        Ok(())
    }
}
