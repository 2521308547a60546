//! Protocol position resolvers.
//!
//! Each supported protocol reads a wallet's positions on one chain through a [`ChainReader`].
//! Dispatch is a closed enum: adding a protocol means adding a variant, a module and a table
//! entry in `config`.

use crate::{
    amount::format_units,
    chains::evm::CallTransport,
    config::ProtocolTable,
    errors::{FetchError, ReportError},
    reader::ChainReader,
};
use alloy::primitives::{Address, U256};
use serde::Serialize;
use tracing::{debug, warn};

pub mod aave;
pub mod compound;
pub mod lido;
pub mod vaults;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    AaveV3,
    Lido,
    Yearn,
    CompoundV3,
}

impl ProtocolKind {
    pub const ALL: [Self; 4] = [Self::AaveV3, Self::Lido, Self::Yearn, Self::CompoundV3];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AaveV3 => "aave_v3",
            Self::Lido => "lido",
            Self::Yearn => "yearn",
            Self::CompoundV3 => "compound_v3",
        }
    }

    /// Parse a user-supplied protocol name. Accepts the canonical names and a few aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "aave" | "aave_v3" | "aavev3" => Some(Self::AaveV3),
            "lido" | "steth" => Some(Self::Lido),
            "yearn" | "vault" | "vaults" => Some(Self::Yearn),
            "compound" | "compound_v3" | "comet" => Some(Self::CompoundV3),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wallet's exposure in one protocol object (reserve, vault, market, staking token).
///
/// Amounts are decimal strings in whole-token units with full on-chain precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Position {
    pub protocol: ProtocolKind,
    pub chain: String,
    pub asset: Address,
    pub symbol: String,
    pub decimals: u8,
    pub supplied: String,
    pub borrowed: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supply_apy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub borrow_apy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub underlying: Option<String>,
}

/// Raw position amounts before formatting.
#[derive(Debug, Clone)]
pub struct RawPosition {
    pub asset: Address,
    pub symbol: String,
    pub decimals: u8,
    pub supplied: U256,
    pub borrowed: U256,
    pub supply_apy: Option<String>,
    pub borrow_apy: Option<String>,
    pub underlying: Option<String>,
}

impl RawPosition {
    /// Format into a [`Position`], or `None` when the wallet has no exposure.
    pub fn into_position(self, protocol: ProtocolKind, chain: &str) -> Option<Position> {
        if self.supplied.is_zero() && self.borrowed.is_zero() {
            return None;
        }
        Some(Position {
            protocol,
            chain: chain.to_owned(),
            asset: self.asset,
            symbol: self.symbol,
            decimals: self.decimals,
            supplied: format_units(self.supplied, self.decimals),
            borrowed: format_units(self.borrowed, self.decimals),
            supply_apy: self.supply_apy,
            borrow_apy: self.borrow_apy,
            underlying: self.underlying,
        })
    }
}

/// A protocol object (reserve, vault, market, staking token) that could not be read and was
/// left out of the positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectError {
    pub object: Address,
    #[serde(flatten)]
    pub error: ReportError,
}

/// What a resolver produced for one protocol on one chain.
#[derive(Debug, Clone, Default)]
pub struct Settled {
    pub positions: Vec<Position>,
    pub errors: Vec<ObjectError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolReport {
    pub protocol: ProtocolKind,
    pub chain: String,
    pub positions: Vec<Position>,
    /// The protocol as a whole failed; `positions` is empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
    /// Individual objects that failed while their siblings were reported.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ObjectError>,
}

/// Resolve one protocol on one chain. Never fails: a protocol-level failure becomes an empty
/// report carrying the error.
pub async fn resolve<T: CallTransport>(
    kind: ProtocolKind,
    reader: &ChainReader<'_, T>,
    table: &ProtocolTable,
    wallet: Address,
) -> ProtocolReport {
    let chain = reader.chain.name.as_str();
    let res = match kind {
        ProtocolKind::AaveV3 => aave::positions(reader, table.aave_v3.get(chain).copied(), wallet).await,
        ProtocolKind::Lido => lido::positions(reader, table.lido.get(chain), wallet).await,
        ProtocolKind::Yearn => {
            let vaults = table.vaults.get(chain).map_or(&[][..], Vec::as_slice);
            vaults::positions(reader, vaults, wallet).await
        }
        ProtocolKind::CompoundV3 => {
            let comets = table.compound_v3.get(chain).map_or(&[][..], Vec::as_slice);
            compound::positions(reader, comets, wallet).await
        }
    };
    match res {
        Ok(settled) => {
            debug!(
                %chain,
                protocol = %kind,
                positions = settled.positions.len(),
                failed_objects = settled.errors.len(),
                "protocol resolved"
            );
            ProtocolReport {
                protocol: kind,
                chain: chain.to_owned(),
                positions: settled.positions,
                error: None,
                errors: settled.errors,
            }
        }
        Err(e) => {
            warn!(%chain, protocol = %kind, error = %e, "protocol read failed");
            ProtocolReport {
                protocol: kind,
                chain: chain.to_owned(),
                positions: Vec::new(),
                error: Some(e.into()),
                errors: Vec::new(),
            }
        }
    }
}

/// Collect per-object outcomes. Failed objects are logged and annotated; the protocol itself
/// only fails when every object failed.
fn settle(
    kind: ProtocolKind,
    chain: &str,
    outcomes: Vec<(Address, Result<Option<Position>, FetchError>)>,
) -> Result<Settled, FetchError> {
    let total = outcomes.len();
    let mut settled = Settled::default();
    let mut last_err = None;
    for (object, outcome) in outcomes {
        match outcome {
            Ok(Some(p)) => settled.positions.push(p),
            Ok(None) => {}
            Err(e) => {
                warn!(%chain, protocol = %kind, %object, error = %e, "skipping object");
                settled.errors.push(ObjectError {
                    object,
                    error: (&e).into(),
                });
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) if settled.errors.len() == total => Err(e),
        _ => Ok(settled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names_round_trip_and_aliases() {
        for k in ProtocolKind::ALL {
            assert_eq!(ProtocolKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(ProtocolKind::parse(" Aave "), Some(ProtocolKind::AaveV3));
        assert_eq!(ProtocolKind::parse("compound-v3"), Some(ProtocolKind::CompoundV3));
        assert_eq!(ProtocolKind::parse("maker"), None);
    }

    #[test]
    fn zero_amounts_never_become_positions() {
        let raw = RawPosition {
            asset: Address::ZERO,
            symbol: "USDC".into(),
            decimals: 6,
            supplied: U256::ZERO,
            borrowed: U256::ZERO,
            supply_apy: Some("2.50".into()),
            borrow_apy: None,
            underlying: None,
        };
        assert!(raw.clone().into_position(ProtocolKind::AaveV3, "ethereum").is_none());

        let borrowed_only = RawPosition {
            borrowed: U256::from(1_u64),
            ..raw
        };
        let p = borrowed_only.into_position(ProtocolKind::AaveV3, "ethereum");
        assert_eq!(p.map(|p| p.borrowed).as_deref(), Some("0.000001"));
    }

    #[test]
    fn settle_fails_only_when_every_object_failed() {
        let err = || FetchError::Transport("down".into());
        let ok = settle(
            ProtocolKind::Yearn,
            "ethereum",
            vec![(Address::ZERO, Ok(None)), (Address::ZERO, Err(err()))],
        );
        assert!(
            ok.as_ref().is_ok_and(|s| s.positions.is_empty() && s.errors.len() == 1),
            "got {ok:?}"
        );

        let all_failed = settle(
            ProtocolKind::Yearn,
            "ethereum",
            vec![(Address::ZERO, Err(err())), (Address::ZERO, Err(err()))],
        );
        assert!(all_failed.is_err());

        let none = settle(ProtocolKind::Yearn, "ethereum", Vec::new());
        assert!(none.is_ok_and(|s| s.positions.is_empty() && s.errors.is_empty()));
    }

    #[tokio::test]
    async fn report_keeps_good_vaults_and_names_the_broken_one() {
        use crate::{
            chains::evm::IERC20,
            multicall::testing::{chain_info, fetcher, MockChain},
        };
        let good = Address::repeat_byte(0x40);
        let broken = Address::repeat_byte(0x41);
        let (info, chain, fetcher) = (chain_info("ethereum"), MockChain::default(), fetcher());
        chain.respond::<IERC20::balanceOfCall>(good, &U256::from(3_000_000_u64));
        chain.respond::<vaults::IYearnVault::pricePerShareCall>(good, &U256::from(1_000_000_u64));
        chain.respond::<IERC20::decimalsCall>(good, &6_u8);
        chain.respond::<IERC20::symbolCall>(good, &"yvUSDC".to_owned());
        let mut table = ProtocolTable::default();
        table.vaults.insert("ethereum".to_owned(), vec![good, broken]);
        let reader = ChainReader::new(&info, &chain, &fetcher);

        let report = resolve(ProtocolKind::Yearn, &reader, &table, Address::repeat_byte(0x99)).await;
        assert!(report.error.is_none(), "got {:?}", report.error);
        assert_eq!(report.positions.len(), 1_usize);
        assert_eq!(
            report.errors.iter().map(|e| e.object).collect::<Vec<_>>(),
            vec![broken]
        );
        let json = serde_json::to_value(&report).unwrap_or_default();
        assert_eq!(json["errors"][0]["code"], "call_reverted", "json: {json}");
    }
}
