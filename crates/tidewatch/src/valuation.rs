use crate::{
    amount::{format_units, to_decimal_units},
    discovery::{BalanceSource, TokenBalance},
    errors::ReportError,
    price::{ChainQuotes, PriceQuote, QuoteSource},
};
use alloy::primitives::{Address, U256};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// A balance with its price and USD value, as it appears in a chain report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PricedBalance {
    /// `None` for the native asset.
    pub token: Option<Address>,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub decimals: Option<u8>,
    pub source: BalanceSource,
    /// Base-unit integer amount.
    pub raw: String,
    /// Whole-token amount; `None` when decimals are unknown.
    pub amount: Option<String>,
    pub unit_price_usd: Option<Decimal>,
    pub price_source: QuoteSource,
    pub value_usd: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

/// `raw / 10^decimals * unit_price`, rounded to the cent. Anything that cannot be represented
/// is worth zero rather than a guess.
pub fn value_usd(raw: U256, decimals: u8, unit_price: Decimal) -> Decimal {
    let v = to_decimal_units(raw, decimals)
        .and_then(|amount| amount.checked_mul(unit_price))
        .unwrap_or(Decimal::ZERO);
    cents(v)
}

fn cents(v: Decimal) -> Decimal {
    let mut r = v.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    r.rescale(2);
    r
}

pub fn price_balance(b: TokenBalance, quote: PriceQuote) -> PricedBalance {
    let value = match (b.decimals, quote.usd) {
        (Some(d), Some(p)) => value_usd(b.raw, d, p),
        _ => cents(Decimal::ZERO),
    };
    PricedBalance {
        token: b.token,
        amount: b.decimals.map(|d| format_units(b.raw, d)),
        raw: b.raw.to_string(),
        symbol: b.symbol,
        name: b.name,
        decimals: b.decimals,
        source: b.source,
        unit_price_usd: quote.usd,
        price_source: quote.source,
        value_usd: value,
        error: b.error,
    }
}

/// Price a chain's balances. Zero ERC20 balances are dropped; the native balance always stays.
pub fn price_balances(balances: Vec<TokenBalance>, quotes: &ChainQuotes) -> Vec<PricedBalance> {
    balances
        .into_iter()
        .filter(|b| b.source == BalanceSource::Native || !b.raw.is_zero())
        .map(|b| {
            let quote = match b.token {
                Some(t) => quotes.token(&t),
                None => quotes.native.clone(),
            };
            price_balance(b, quote)
        })
        .collect()
}

pub fn total_usd<'a>(values: impl IntoIterator<Item = &'a Decimal>) -> Decimal {
    cents(
        values
            .into_iter()
            .fold(Decimal::ZERO, |acc, v| acc.saturating_add(*v)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    fn erc20(raw: u64, decimals: u8, symbol: &str) -> TokenBalance {
        TokenBalance {
            token: Some(Address::repeat_byte(0x20)),
            raw: U256::from(raw),
            decimals: Some(decimals),
            symbol: Some(symbol.to_owned()),
            name: None,
            source: BalanceSource::Erc20,
            error: None,
        }
    }

    #[test]
    fn one_usdc_is_one_dollar() -> eyre::Result<()> {
        let p = price_balance(
            erc20(1_000_000, 6, "USDC"),
            PriceQuote::new(Decimal::ONE, QuoteSource::ByAddress),
        );
        assert_eq!(p.amount.as_deref(), Some("1"));
        assert_eq!(p.value_usd, Decimal::from_str("1.00")?);
        assert_eq!(p.value_usd.to_string(), "1.00");
        Ok(())
    }

    #[test]
    fn positive_balance_without_price_is_worth_exactly_zero() {
        let p = price_balance(erc20(5_000_000, 6, "XYZ"), PriceQuote::unavailable());
        assert_eq!(p.value_usd, Decimal::ZERO);
        assert_eq!(p.price_source, QuoteSource::Unavailable);
        assert_eq!(p.amount.as_deref(), Some("5"));
    }

    #[test]
    fn absurd_decimals_are_worth_dust_not_the_raw_integer() {
        let p = price_balance(
            erc20(5, 200, "USDC"),
            PriceQuote::new(Decimal::ONE, QuoteSource::BySymbol),
        );
        assert_eq!(p.value_usd, Decimal::ZERO, "raw units must be scaled by 10^decimals");
        assert!(p.amount.as_deref().is_some_and(|a| a.starts_with("0.0")), "amount: {:?}", p.amount);
    }

    #[test]
    fn unknown_decimals_values_at_zero() {
        let mut b = erc20(5, 6, "XYZ");
        b.decimals = None;
        let p = price_balance(b, PriceQuote::new(Decimal::ONE_HUNDRED, QuoteSource::BySymbol));
        assert_eq!(p.value_usd, Decimal::ZERO);
        assert_eq!(p.amount, None);
    }

    #[test]
    fn zero_tokens_are_dropped_but_native_stays() {
        let native = TokenBalance {
            token: None,
            raw: U256::ZERO,
            decimals: Some(18),
            symbol: Some("ETH".to_owned()),
            name: Some("ETH".to_owned()),
            source: BalanceSource::Native,
            error: None,
        };
        let out = price_balances(vec![native, erc20(0, 6, "USDC")], &ChainQuotes::default());
        assert_eq!(out.len(), 1_usize);
        assert_eq!(out.first().map(|b| b.source), Some(BalanceSource::Native));
    }

    #[test]
    fn totals_do_not_depend_on_order() -> eyre::Result<()> {
        let quote = |s: &str| -> eyre::Result<PriceQuote> {
            Ok(PriceQuote::new(Decimal::from_str(s)?, QuoteSource::ByAddress))
        };
        let a = price_balance(erc20(1_234_567, 6, "A"), quote("0.333")?).value_usd;
        let b = price_balance(erc20(7_654_321, 6, "B"), quote("2.5")?).value_usd;
        let c = price_balance(erc20(3, 0, "C"), quote("1999.999")?).value_usd;
        let fwd = total_usd([a, b, c].iter());
        let rev = total_usd([c, b, a].iter());
        assert_eq!(fwd, rev);
        assert_eq!(fwd, total_usd([a, b, c].iter()), "valuation should be idempotent");
        assert_eq!(fwd.to_string(), "6019.55");
        Ok(())
    }
}
