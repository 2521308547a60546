use crate::retry::BackoffConfig;
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, str::FromStr as _, sync::Arc, time::Duration};
use thiserror::Error;

pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate chain id {chain_id}: {first} and {second}")]
    DuplicateChainId {
        chain_id: u64,
        first: String,
        second: String,
    },

    #[error("chain {chain}: missing required key `{key}`")]
    MissingKey { chain: String, key: &'static str },

    #[error("{context}: invalid address {value:?}: {reason}")]
    InvalidAddress {
        context: String,
        value: String,
        reason: String,
    },

    #[error("protocol {protocol} references unknown chain {chain}")]
    UnknownChain { protocol: &'static str, chain: String },

    #[error("{name} must use https (or http://localhost for local testing): {url}")]
    InsecureUrl { name: &'static str, url: String },
}

pub fn is_loopback_http(url: &str) -> bool {
    fn host_prefix_ok(s: &str, prefix: &str) -> bool {
        if !s.starts_with(prefix) {
            return false;
        }
        matches!(s.as_bytes().get(prefix.len()), None | Some(b':' | b'/'))
    }
    let u = url.trim();
    host_prefix_ok(u, "http://127.0.0.1")
        || host_prefix_ok(u, "http://localhost")
        || host_prefix_ok(u, "http://[::1]")
}

fn ensure_https_or_loopback(name: &'static str, url: &str) -> Result<(), ConfigError> {
    let u = url.trim();
    if u.starts_with("https://") || is_loopback_http(u) {
        return Ok(());
    }
    Err(ConfigError::InsecureUrl {
        name,
        url: u.to_owned(),
    })
}

fn parse_addr(context: &str, value: &str) -> Result<Address, ConfigError> {
    Address::from_str(value.trim()).map_err(|e| ConfigError::InvalidAddress {
        context: context.to_owned(),
        value: value.to_owned(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Total attempts per upstream call (including the first).
    pub attempts: usize,
    /// Base delay for exponential backoff (milliseconds).
    pub base_delay_ms: u64,
    /// Cap on any single backoff sleep (milliseconds).
    pub max_delay_ms: u64,
    /// Cache TTL for descriptive data: token metadata, reserve lists (seconds).
    pub static_ttl_seconds: u64,
    /// Cache TTL for balances and prices (seconds).
    pub volatile_ttl_seconds: u64,
    /// Per-request timeout for every HTTP/RPC call (seconds).
    pub request_timeout_seconds: u64,
    /// Soft bound on cached keys.
    pub cache_max_entries: usize,
    /// Maximum calls packed into one multicall `eth_call`.
    pub multicall_chunk_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            static_ttl_seconds: 300,
            volatile_ttl_seconds: 30,
            request_timeout_seconds: 10,
            cache_max_entries: 10_000,
            multicall_chunk_size: 200,
        }
    }
}

impl FetchConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            attempts: self.attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            jitter: true,
        }
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Token balances fetched concurrently per batch.
    pub balance_batch_size: usize,
    /// Pause between balance batches (milliseconds).
    pub balance_batch_pause_ms: u64,
    /// Contract addresses per price-source request.
    pub price_batch_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            balance_batch_size: 10,
            balance_batch_pause_ms: 500,
            price_batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// CoinGecko-compatible price API base URL.
    pub price_api_base_url: String,
    /// Optional price API key (sent as `x-cg-pro-api-key` / `x-cg-demo-api-key` header).
    pub price_api_key: Option<String>,
    /// Whether `price_api_key` is a demo-tier key.
    pub price_api_key_is_demo: bool,
    /// Etherscan-compatible explorer API base URL (multi-chain, `chainid` query parameter).
    pub explorer_api_base_url: String,
    /// Explorer API key. Without it token discovery falls back to static token lists.
    pub explorer_api_key: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            price_api_base_url: "https://api.coingecko.com/api/v3".into(),
            price_api_key: None,
            price_api_key_is_demo: true,
            explorer_api_base_url: "https://api.etherscan.io/v2/api".into(),
            explorer_api_key: None,
        }
    }
}

/// Per-chain config-file overrides. For a chain that is not built in, `chain_id`, `rpc_url`
/// and `native_symbol` are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainOverride {
    pub chain_id: Option<u64>,
    pub rpc_url: Option<String>,
    pub fallback_rpc_urls: Option<Vec<String>>,
    pub native_symbol: Option<String>,
    pub native_decimals: Option<u8>,
    pub native_price_id: Option<String>,
    pub multicall: Option<String>,
    pub price_platform: Option<String>,
    /// Disable explorer-based discovery for this chain.
    pub disable_explorer: bool,
    /// Extra ERC20 addresses always checked on this chain.
    pub extra_tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolOverrides {
    /// Extra yield vaults keyed by chain name.
    pub vaults: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TidewatchConfig {
    pub fetch: FetchConfig,
    pub discovery: DiscoveryConfig,
    pub http: HttpConfig,
    pub chains: BTreeMap<String, ChainOverride>,
    pub protocols: ProtocolOverrides,
}

impl TidewatchConfig {
    /// Merge the built-in tables with this config and validate the result.
    pub fn resolve(&self) -> Result<(ChainRegistry, ProtocolTable), ConfigError> {
        ensure_https_or_loopback("price_api_base_url", &self.http.price_api_base_url)?;
        ensure_https_or_loopback("explorer_api_base_url", &self.http.explorer_api_base_url)?;
        let chains = ChainRegistry::build(BUILTIN_CHAINS, &self.chains)?;
        let protocols = ProtocolTable::build(&chains, &self.protocols)?;
        Ok((chains, protocols))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeCurrency {
    pub symbol: String,
    pub decimals: u8,
    /// Price-source asset id (e.g. `ethereum`).
    pub price_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainInfo {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub fallback_rpc_urls: Vec<String>,
    pub native: NativeCurrency,
    pub multicall: Option<Address>,
    /// Price-source platform id used for by-address token lookups.
    pub price_platform: Option<String>,
    pub explorer: bool,
    pub static_tokens: Vec<Address>,
}

impl ChainInfo {
    /// Primary RPC first, then deduplicated fallbacks.
    pub fn all_rpc_urls(&self) -> Vec<String> {
        let mut urls = Vec::with_capacity(1 + self.fallback_rpc_urls.len());
        if !self.rpc_url.trim().is_empty() {
            urls.push(self.rpc_url.trim().to_owned());
        }
        for u in &self.fallback_rpc_urls {
            let t = u.trim();
            if t.is_empty() || urls.iter().any(|x| x == t) {
                continue;
            }
            urls.push(t.to_owned());
        }
        urls
    }
}

/// A single built-in chain definition used by the table-driven registry.
struct ChainDef {
    name: &'static str,
    chain_id: u64,
    rpc_url: &'static str,
    fallbacks: &'static [&'static str],
    native_symbol: &'static str,
    native_price_id: &'static str,
    price_platform: &'static str,
    static_tokens: &'static [&'static str],
}

const BUILTIN_CHAINS: &[ChainDef] = &[
    ChainDef {
        name: "ethereum",
        chain_id: 1,
        rpc_url: "https://eth.llamarpc.com",
        fallbacks: &[
            "https://ethereum-rpc.publicnode.com",
            "https://rpc.ankr.com/eth",
            "https://cloudflare-eth.com",
        ],
        native_symbol: "ETH",
        native_price_id: "ethereum",
        price_platform: "ethereum",
        static_tokens: &[
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", // USDC
            "0xdAC17F958D2ee523a2206206994597C13D831ec7", // USDT
            "0x6B175474E89094C44Da98b954EedeAC495271d0F", // DAI
            "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", // WETH
            "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599", // WBTC
        ],
    },
    ChainDef {
        name: "base",
        chain_id: 8453,
        rpc_url: "https://base.llamarpc.com",
        fallbacks: &[
            "https://mainnet.base.org",
            "https://base-rpc.publicnode.com",
        ],
        native_symbol: "ETH",
        native_price_id: "ethereum",
        price_platform: "base",
        static_tokens: &[
            "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913", // USDC
            "0x4200000000000000000000000000000000000006", // WETH
        ],
    },
    ChainDef {
        name: "arbitrum",
        chain_id: 42161,
        rpc_url: "https://arbitrum.llamarpc.com",
        fallbacks: &[
            "https://arb1.arbitrum.io/rpc",
            "https://arbitrum-rpc.publicnode.com",
        ],
        native_symbol: "ETH",
        native_price_id: "ethereum",
        price_platform: "arbitrum-one",
        static_tokens: &[
            "0xaf88d065e77c8cC2239327C5EDb3A432268e5831", // USDC
            "0x82aF49447D8a07e3bd95BD0d56f35241523fBab1", // WETH
        ],
    },
    ChainDef {
        name: "optimism",
        chain_id: 10,
        rpc_url: "https://optimism.llamarpc.com",
        fallbacks: &[
            "https://mainnet.optimism.io",
            "https://optimism-rpc.publicnode.com",
        ],
        native_symbol: "ETH",
        native_price_id: "ethereum",
        price_platform: "optimistic-ethereum",
        static_tokens: &[
            "0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85", // USDC
            "0x4200000000000000000000000000000000000006", // WETH
        ],
    },
    ChainDef {
        name: "polygon",
        chain_id: 137,
        rpc_url: "https://polygon.llamarpc.com",
        fallbacks: &[
            "https://polygon-rpc.com",
            "https://polygon-bor-rpc.publicnode.com",
        ],
        native_symbol: "POL",
        native_price_id: "polygon-ecosystem-token",
        price_platform: "polygon-pos",
        static_tokens: &[
            "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359", // USDC
            "0x7ceB23fD6bC0adD59E62ac25578270cFf1b9f619", // WETH
        ],
    },
    ChainDef {
        name: "bnb",
        chain_id: 56,
        rpc_url: "https://bsc.llamarpc.com",
        fallbacks: &[
            "https://bsc-dataseed.binance.org",
            "https://bsc-rpc.publicnode.com",
        ],
        native_symbol: "BNB",
        native_price_id: "binancecoin",
        price_platform: "binance-smart-chain",
        static_tokens: &["0x55d398326f99059fF775485246999027B3197955"], // USDT
    },
    ChainDef {
        name: "avalanche",
        chain_id: 43114,
        rpc_url: "https://avalanche-c-chain.llamarpc.com",
        fallbacks: &[
            "https://api.avax.network/ext/bc/C/rpc",
            "https://avalanche-c-chain-rpc.publicnode.com",
        ],
        native_symbol: "AVAX",
        native_price_id: "avalanche-2",
        price_platform: "avalanche",
        static_tokens: &["0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E"], // USDC
    },
];

pub fn is_builtin_chain(name: &str) -> bool {
    BUILTIN_CHAINS.iter().any(|d| d.name == name)
}

fn chain_from_def(def: &ChainDef) -> Result<ChainInfo, ConfigError> {
    let static_tokens = def
        .static_tokens
        .iter()
        .map(|t| parse_addr(def.name, t))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ChainInfo {
        name: def.name.to_owned(),
        chain_id: def.chain_id,
        rpc_url: def.rpc_url.to_owned(),
        fallback_rpc_urls: def.fallbacks.iter().map(|&s| s.to_owned()).collect(),
        native: NativeCurrency {
            symbol: def.native_symbol.to_owned(),
            decimals: 18,
            price_id: Some(def.native_price_id.to_owned()),
        },
        multicall: Some(parse_addr(def.name, MULTICALL3_ADDRESS)?),
        price_platform: Some(def.price_platform.to_owned()),
        explorer: true,
        static_tokens,
    })
}

fn chain_from_override(name: &str, ov: &ChainOverride) -> Result<ChainInfo, ConfigError> {
    let missing = |key: &'static str| ConfigError::MissingKey {
        chain: name.to_owned(),
        key,
    };
    Ok(ChainInfo {
        name: name.to_owned(),
        chain_id: ov.chain_id.ok_or_else(|| missing("chain_id"))?,
        rpc_url: ov.rpc_url.clone().ok_or_else(|| missing("rpc_url"))?,
        fallback_rpc_urls: Vec::new(),
        native: NativeCurrency {
            symbol: ov.native_symbol.clone().ok_or_else(|| missing("native_symbol"))?,
            decimals: 18,
            price_id: None,
        },
        multicall: None,
        price_platform: None,
        explorer: false,
        static_tokens: Vec::new(),
    })
}

fn apply_override(chain: &mut ChainInfo, ov: &ChainOverride) -> Result<(), ConfigError> {
    if let Some(id) = ov.chain_id {
        chain.chain_id = id;
    }
    if let Some(u) = &ov.rpc_url {
        chain.rpc_url.clone_from(u);
    }
    if let Some(fb) = &ov.fallback_rpc_urls {
        chain.fallback_rpc_urls.clone_from(fb);
    }
    if let Some(s) = &ov.native_symbol {
        chain.native.symbol.clone_from(s);
    }
    if let Some(d) = ov.native_decimals {
        chain.native.decimals = d;
    }
    if let Some(p) = &ov.native_price_id {
        chain.native.price_id = Some(p.clone());
    }
    if let Some(m) = &ov.multicall {
        chain.multicall = if m.trim().is_empty() {
            None
        } else {
            Some(parse_addr(&chain.name, m)?)
        };
    }
    if let Some(p) = &ov.price_platform {
        chain.price_platform = Some(p.clone());
    }
    if ov.disable_explorer {
        chain.explorer = false;
    }
    for t in &ov.extra_tokens {
        let a = parse_addr(&chain.name, t)?;
        if !chain.static_tokens.contains(&a) {
            chain.static_tokens.push(a);
        }
    }
    Ok(())
}

/// Immutable chain table, looked up by name or by chain id.
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    by_name: BTreeMap<String, Arc<ChainInfo>>,
    by_id: BTreeMap<u64, String>,
}

impl ChainRegistry {
    fn build(
        defs: &[ChainDef],
        overrides: &BTreeMap<String, ChainOverride>,
    ) -> Result<Self, ConfigError> {
        let mut chains: BTreeMap<String, ChainInfo> = BTreeMap::new();
        for def in defs {
            chains.insert(def.name.to_owned(), chain_from_def(def)?);
        }
        for (name, ov) in overrides {
            let key = name.trim().to_lowercase();
            if let Some(existing) = chains.get_mut(&key) {
                apply_override(existing, ov)?;
            } else {
                let mut c = chain_from_override(&key, ov)?;
                apply_override(&mut c, ov)?;
                chains.insert(key, c);
            }
        }
        Self::from_chains(chains.into_values())
    }

    /// Build from explicit chain definitions, enforcing the name <-> chain id bijection.
    pub fn from_chains(chains: impl IntoIterator<Item = ChainInfo>) -> Result<Self, ConfigError> {
        let mut by_name = BTreeMap::new();
        let mut by_id: BTreeMap<u64, String> = BTreeMap::new();
        for c in chains {
            if let Some(first) = by_id.get(&c.chain_id) {
                return Err(ConfigError::DuplicateChainId {
                    chain_id: c.chain_id,
                    first: first.clone(),
                    second: c.name,
                });
            }
            by_id.insert(c.chain_id, c.name.clone());
            by_name.insert(c.name.clone(), Arc::new(c));
        }
        Ok(Self { by_name, by_id })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ChainInfo>> {
        self.by_name.get(name.trim().to_lowercase().as_str())
    }

    pub fn by_chain_id(&self, chain_id: u64) -> Option<&Arc<ChainInfo>> {
        self.by_id.get(&chain_id).and_then(|n| self.by_name.get(n))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChainInfo>> {
        self.by_name.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LidoDeployment {
    pub steth: Address,
    pub wsteth: Option<Address>,
}

/// Static per-protocol, per-chain addresses. A missing chain key means "unsupported".
#[derive(Debug, Clone, Default)]
pub struct ProtocolTable {
    /// Aave v3 `Pool` per chain.
    pub aave_v3: BTreeMap<String, Address>,
    pub lido: BTreeMap<String, LidoDeployment>,
    /// Yearn-style vaults (`pricePerShare()`) per chain.
    pub vaults: BTreeMap<String, Vec<Address>>,
    /// Compound v3 Comet markets per chain.
    pub compound_v3: BTreeMap<String, Vec<Address>>,
}

const AAVE_V3_POOLS: &[(&str, &str)] = &[
    ("ethereum", "0x87870Bca3F3fD6335C3F4ce8392D69350B4fA4E2"),
    ("base", "0xA238Dd80C259a72e81d7e4664a9801593F98d1c5"),
    ("arbitrum", "0x794a61358D6845594F94dc1DB02A252b5b4814aD"),
    ("optimism", "0x794a61358D6845594F94dc1DB02A252b5b4814aD"),
    ("polygon", "0x794a61358D6845594F94dc1DB02A252b5b4814aD"),
    ("avalanche", "0x794a61358D6845594F94dc1DB02A252b5b4814aD"),
];

// Compound v3 Comet addresses (USDC markets).
const COMPOUND_V3_COMETS: &[(&str, &str)] = &[
    ("ethereum", "0xc3d688B66703497DAA19211EEdff47f25384cdc3"),
    ("base", "0xb125E6687d4313864e53df431d5425969c15Eb2F"),
    ("arbitrum", "0x9c4ec768c28520B50860ea7a15bd7213a9fF58bf"),
    ("optimism", "0x2e44e174f7D53F0212823acC11C01A11d58c5bCB"),
    ("polygon", "0xF25212E676D1F7F89Cd72fFEe66158f541246445"),
];

const YEARN_VAULTS: &[(&str, &str)] = &[
    ("ethereum", "0xa354F35829Ae975e850e23e9615b11Da1B3dC4DE"), // yvUSDC
    ("ethereum", "0xdA816459F1AB5631232FE5e97a05BBBb94970c95"), // yvDAI
    ("ethereum", "0xa258C4606Ca8206D8aA700cE2143D7db854D168c"), // yvWETH
];

const LIDO_STETH: &str = "0xae7ab96520DE3A18E5e111B5EaAb095312D7fE84";
const LIDO_WSTETH: &str = "0x7f39C581F595B53c5cb19bD0b3f8dA6c935E2Ca0";

impl ProtocolTable {
    fn build(chains: &ChainRegistry, overrides: &ProtocolOverrides) -> Result<Self, ConfigError> {
        let known = |protocol: &'static str, chain: &str| -> Result<(), ConfigError> {
            if chains.get(chain).is_some() {
                Ok(())
            } else {
                Err(ConfigError::UnknownChain {
                    protocol,
                    chain: chain.to_owned(),
                })
            }
        };

        let mut t = Self::default();
        for (chain, pool) in AAVE_V3_POOLS {
            known("aave_v3", chain)?;
            t.aave_v3
                .insert((*chain).to_owned(), parse_addr("aave_v3", pool)?);
        }
        for (chain, comet) in COMPOUND_V3_COMETS {
            known("compound_v3", chain)?;
            t.compound_v3
                .entry((*chain).to_owned())
                .or_default()
                .push(parse_addr("compound_v3", comet)?);
        }
        for (chain, vault) in YEARN_VAULTS {
            known("vaults", chain)?;
            t.vaults
                .entry((*chain).to_owned())
                .or_default()
                .push(parse_addr("vaults", vault)?);
        }
        for (chain, extra) in &overrides.vaults {
            let chain = chain.trim().to_lowercase();
            known("vaults", &chain)?;
            let list = t.vaults.entry(chain.clone()).or_default();
            for v in extra {
                let a = parse_addr(&format!("vaults.{chain}"), v)?;
                if !list.contains(&a) {
                    list.push(a);
                }
            }
        }
        known("lido", "ethereum")?;
        t.lido.insert(
            "ethereum".to_owned(),
            LidoDeployment {
                steth: parse_addr("lido", LIDO_STETH)?,
                wsteth: Some(parse_addr("lido", LIDO_WSTETH)?),
            },
        );
        Ok(t)
    }
}
