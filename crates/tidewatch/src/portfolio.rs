//! Report assembly: validate the request, fan out per chain and per protocol, merge.

use crate::{
    cache::cache_key,
    chains::evm::{CallTransport, EvmChain},
    config::{ChainInfo, ChainRegistry, DiscoveryConfig, ProtocolTable, TidewatchConfig},
    discovery::{discover_tokens, fetch_balances, Explorer},
    errors::{FetchError, ReportError},
    fetch::ResilientFetcher,
    price::{PriceClient, Pricer, TokenRef},
    protocols::{self, ProtocolKind, ProtocolReport},
    reader::ChainReader,
    valuation::{price_balances, total_usd, PricedBalance},
};
use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use eyre::Context as _;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::{str::FromStr as _, sync::Arc, time::Duration};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ReportRequest {
    pub wallet: String,
    /// Empty means every configured chain.
    pub chains: Vec<String>,
    /// Empty means every protocol deployed on each chain.
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    pub chain: String,
    pub chain_id: u64,
    pub balances: Vec<PricedBalance>,
    pub total_usd: Decimal,
    pub errors: Vec<ReportError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioReport {
    pub wallet: Address,
    pub generated_at: DateTime<Utc>,
    pub total_usd: Decimal,
    pub chains: Vec<ChainReport>,
    pub protocols: Vec<ProtocolReport>,
}

/// Result of asking a chain's RPC which network it serves.
#[derive(Debug, Clone, Serialize)]
pub struct ChainProbe {
    pub chain: String,
    pub expected_chain_id: u64,
    pub reported_chain_id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

impl ChainProbe {
    fn from_outcome(chain: &ChainInfo, outcome: Result<u64, FetchError>) -> Self {
        let (reported, error) = match outcome {
            Ok(id) if id == chain.chain_id => (Some(id), None),
            Ok(id) => (
                Some(id),
                Some(ReportError::new(
                    "chain_id_mismatch",
                    format!("{} rpc serves chain id {id}, expected {}", chain.name, chain.chain_id),
                )),
            ),
            Err(e) => (None, Some(e.into())),
        };
        Self {
            chain: chain.name.clone(),
            expected_chain_id: chain.chain_id,
            reported_chain_id: reported,
            ok: error.is_none(),
            error,
        }
    }
}

/// A validated request.
#[derive(Debug, Clone)]
pub struct Plan {
    pub wallet: Address,
    pub chains: Vec<Arc<ChainInfo>>,
    /// `None` when no protocol filter was given.
    pub protocols: Option<Vec<ProtocolKind>>,
}

/// Wallet addresses must be `0x` + 40 hex digits. Mixed-case input must carry a valid EIP-55
/// checksum; all-lower or all-upper input is accepted as is.
pub fn parse_wallet(s: &str) -> Result<Address, FetchError> {
    let s = s.trim();
    let hex = s
        .strip_prefix("0x")
        .ok_or_else(|| FetchError::InvalidInput(format!("wallet address must start with 0x: {s:?}")))?;
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FetchError::InvalidInput(format!(
            "wallet address must be 40 hex digits: {s:?}"
        )));
    }
    let mixed = hex.bytes().any(|b| b.is_ascii_lowercase()) && hex.bytes().any(|b| b.is_ascii_uppercase());
    let parsed = if mixed {
        Address::parse_checksummed(s, None).map_err(|e| e.to_string())
    } else {
        Address::from_str(s).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| FetchError::InvalidInput(format!("{s}: {e}")))
}

pub struct Engine {
    chains: ChainRegistry,
    protocols: ProtocolTable,
    fetcher: Arc<ResilientFetcher>,
    pricer: Pricer,
    explorer: Explorer,
    discovery: DiscoveryConfig,
    timeout: Duration,
    chunk_size: usize,
}

impl Engine {
    pub fn new(cfg: &TidewatchConfig) -> eyre::Result<Self> {
        let (chains, protocols) = cfg.resolve().context("load chain and protocol tables")?;
        let timeout = cfg.fetch.request_timeout();
        let pricer = Pricer::new(
            PriceClient::new(&cfg.http, timeout).context("price client")?,
            cfg.discovery.price_batch_size,
        );
        let explorer = Explorer::new(&cfg.http, timeout).context("explorer client")?;
        Ok(Self {
            chains,
            protocols,
            fetcher: Arc::new(ResilientFetcher::from_config(&cfg.fetch)),
            pricer,
            explorer,
            discovery: cfg.discovery.clone(),
            timeout,
            chunk_size: cfg.fetch.multicall_chunk_size.max(1),
        })
    }

    pub const fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    /// Ask every configured chain's RPC for its chain id, concurrently.
    pub async fn probe_chains(&self) -> Vec<ChainProbe> {
        join_all(self.chains.iter().map(|c| async move {
            let transport = EvmChain::new(Arc::clone(c), self.timeout);
            let outcome = self
                .fetcher
                .fetch(
                    &cache_key("chain_id", &c.name, "", ""),
                    self.fetcher.static_ttl,
                    || transport.probe_chain_id(),
                )
                .await;
            ChainProbe::from_outcome(c, outcome)
        }))
        .await
    }

    /// Reject malformed wallets and unknown chain or protocol names before anything is fetched.
    pub fn plan(&self, req: &ReportRequest) -> Result<Plan, FetchError> {
        let wallet = parse_wallet(&req.wallet)?;

        let chains = if req.chains.is_empty() {
            self.chains.iter().map(Arc::clone).collect()
        } else {
            let mut out: Vec<Arc<ChainInfo>> = Vec::with_capacity(req.chains.len());
            for name in &req.chains {
                let c = self.chains.get(name).ok_or_else(|| {
                    let known: Vec<&str> = self.chains.names().collect();
                    FetchError::InvalidInput(format!(
                        "unknown chain {name:?} (known: {})",
                        known.join(", ")
                    ))
                })?;
                if !out.iter().any(|x| x.name == c.name) {
                    out.push(Arc::clone(c));
                }
            }
            out
        };

        let protocols = if req.protocols.is_empty() {
            None
        } else {
            let mut out = Vec::with_capacity(req.protocols.len());
            for name in &req.protocols {
                let k = ProtocolKind::parse(name)
                    .ok_or_else(|| FetchError::InvalidInput(format!("unknown protocol {name:?}")))?;
                if !out.contains(&k) {
                    out.push(k);
                }
            }
            Some(out)
        };

        Ok(Plan {
            wallet,
            chains,
            protocols,
        })
    }

    /// Protocols to run on `chain`. Without a filter, staking is only read where it is
    /// deployed; an explicit filter runs exactly what was asked for.
    fn kinds_for(&self, chain: &ChainInfo, requested: Option<&[ProtocolKind]>) -> Vec<ProtocolKind> {
        match requested {
            Some(k) => k.to_vec(),
            None => ProtocolKind::ALL
                .into_iter()
                .filter(|k| *k != ProtocolKind::Lido || self.protocols.lido.contains_key(&chain.name))
                .collect(),
        }
    }

    pub async fn report(&self, req: &ReportRequest) -> Result<PortfolioReport, FetchError> {
        let plan = self.plan(req)?;
        info!(wallet = %plan.wallet, chains = plan.chains.len(), "building report");

        let per_chain = join_all(plan.chains.iter().map(|c| {
            let kinds = self.kinds_for(c, plan.protocols.as_deref());
            async move {
                let transport = EvmChain::new(Arc::clone(c), self.timeout);
                self.chain_report(c, &transport, plan.wallet, &kinds).await
            }
        }))
        .await;

        let mut chains = Vec::with_capacity(per_chain.len());
        let mut protocols = Vec::new();
        for (c, p) in per_chain {
            chains.push(c);
            protocols.extend(p);
        }
        let total = total_usd(chains.iter().map(|c| &c.total_usd));
        Ok(PortfolioReport {
            wallet: plan.wallet,
            generated_at: Utc::now(),
            total_usd: total,
            chains,
            protocols,
        })
    }

    /// One chain: protocol positions and priced balances, concurrently. Never fails; every
    /// degraded branch is annotated in the result.
    pub async fn chain_report<T: CallTransport>(
        &self,
        chain: &ChainInfo,
        transport: &T,
        wallet: Address,
        kinds: &[ProtocolKind],
    ) -> (ChainReport, Vec<ProtocolReport>) {
        let reader = ChainReader::new(chain, transport, &self.fetcher).with_chunk_size(self.chunk_size);
        let reader = &reader;

        let positions = join_all(
            kinds
                .iter()
                .map(|&k| protocols::resolve(k, reader, &self.protocols, wallet)),
        );

        let balances = async {
            let (tokens, note) = discover_tokens(&self.explorer, &self.fetcher, chain, wallet).await;
            let balances = fetch_balances(reader, &self.discovery, &tokens, wallet).await;

            let mut errors: Vec<ReportError> = note.into_iter().collect();
            if balances.iter().all(|b| b.error.is_some()) {
                if let Some(e) = balances.first().and_then(|b| b.error.clone()) {
                    errors.push(e);
                }
            }

            let refs: Vec<TokenRef> = balances
                .iter()
                .filter(|b| !b.raw.is_zero())
                .filter_map(|b| {
                    Some(TokenRef {
                        address: b.token?,
                        symbol: b.symbol.clone(),
                    })
                })
                .collect();
            let quotes = self.pricer.quote_chain(&self.fetcher, chain, &refs).await;
            errors.extend(quotes.errors.iter().cloned());

            let priced = price_balances(balances, &quotes);
            let total = total_usd(priced.iter().map(|b| &b.value_usd));
            ChainReport {
                chain: chain.name.clone(),
                chain_id: chain.chain_id,
                balances: priced,
                total_usd: total,
                errors,
            }
        };

        tokio::join!(balances, positions)
    }
}
