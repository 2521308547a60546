use alloy::primitives::U256;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr as _;

/// 1e27, the fixed-point scale of Aave-style interest rates.
pub const RAY_DECIMALS: u32 = 27;

/// Decimal carries at most 28 significant digits.
const DECIMAL_MAX_DIGITS: usize = 28;

pub const SECONDS_PER_YEAR: u64 = 31_536_000;

/// `10^exp` as a U256, or `None` on overflow.
pub fn u256_pow10(exp: u32) -> Option<U256> {
    U256::from(10_u64).checked_pow(U256::from(exp))
}

/// Format a base-unit integer amount into a UI decimal string without using floats.
///
/// Examples:
/// - base=1500000, decimals=6 => "1.5"
/// - base=1, decimals=6 => "0.000001"
pub fn format_units(base: U256, decimals: u8) -> String {
    let digits = base.to_string();
    let places = usize::from(decimals);
    if places == 0 {
        return digits;
    }
    // Works on the digit string so decimals past 77 (10^d overflowing U256) stay exact.
    let (whole, frac) = if digits.len() > places {
        digits.split_at(digits.len() - places)
    } else {
        ("0", digits.as_str())
    };
    let frac = format!("{frac:0>places$}");
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        whole.to_owned()
    } else {
        format!("{whole}.{frac}")
    }
}

/// Convert a base-unit amount into a `Decimal` of whole tokens.
///
/// The integer part is exact; fractional digits beyond what `Decimal` can hold are truncated.
/// Returns `None` when the integer part alone does not fit.
pub fn to_decimal_units(base: U256, decimals: u8) -> Option<Decimal> {
    let s = format_units(base, decimals);
    let (whole, frac) = s.split_once('.').unwrap_or((s.as_str(), ""));
    if whole.len() > DECIMAL_MAX_DIGITS {
        return None;
    }
    let whole_sig = if whole == "0" { 0 } else { whole.len() };
    let room = DECIMAL_MAX_DIGITS.saturating_sub(whole_sig);
    let frac_kept: String = frac.chars().take(room).collect();
    let text = if frac_kept.is_empty() {
        whole.to_owned()
    } else {
        format!("{whole}.{frac_kept}")
    };
    Decimal::from_str(&text).ok()
}

/// Render a decimal as a fixed two-place percentage string ("2.50").
pub fn percent_2dp(d: Decimal) -> String {
    let mut r = d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    r.rescale(2);
    r.to_string()
}

/// Convert a ray-scaled (1e27) annual rate into a percentage with two decimals:
/// `rate / 1e27 * 100`.
pub fn ray_to_apy_percent(rate: U256) -> Option<String> {
    let pct = to_decimal_units(rate, 25)?;
    Some(percent_2dp(pct))
}

/// Convert a per-second rate scaled by 1e18 (Compound v3) into an annual percentage.
pub fn per_second_rate_to_apr_percent(rate_per_second: U256) -> Option<String> {
    let annual = rate_per_second.checked_mul(U256::from(SECONDS_PER_YEAR))?;
    // annual / 1e18 * 100 == annual / 1e16
    let pct = to_decimal_units(annual, 16)?;
    Some(percent_2dp(pct))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_base_to_ui() {
        assert_eq!(format_units(U256::from(1_500_000_u64), 6), "1.5");
        assert_eq!(format_units(U256::from(1_u64), 6), "0.000001");
        assert_eq!(format_units(U256::from(10_000_000_u64), 6), "10");
        assert_eq!(format_units(U256::ZERO, 18), "0");
        assert_eq!(format_units(U256::from(42_u64), 0), "42");
    }

    #[test]
    fn full_precision_is_preserved_for_wei_amounts() {
        let wei = U256::from(123_456_789_012_345_678_901_u128);
        assert_eq!(format_units(wei, 18), "123.456789012345678901");
    }

    #[test]
    fn decimal_units_match_human_balance() -> eyre::Result<()> {
        let d = to_decimal_units(U256::from(1_000_000_u64), 6)
            .ok_or_else(|| eyre::eyre!("conversion failed"))?;
        assert_eq!(d, Decimal::ONE);
        Ok(())
    }

    #[test]
    fn decimals_beyond_u256_range_scale_down_not_up() {
        let s = format_units(U256::from(5_u64), 200);
        assert!(s.starts_with("0.0"), "got {s}");
        assert!(s.ends_with('5'), "got {s}");
        assert_eq!(s.len(), 202_usize, "one digit per decimal place after \"0.\"");
        assert_eq!(to_decimal_units(U256::from(5_u64), 200), Some(Decimal::ZERO));
        assert_eq!(format_units(U256::from(1_500_000_u64), 78), format!("0.{}15", "0".repeat(71)));
    }

    #[test]
    fn huge_integer_part_is_rejected_not_wrapped() {
        assert!(to_decimal_units(U256::MAX, 0).is_none(), "U256::MAX should not fit");
    }

    #[test]
    fn ray_rate_to_percent() {
        // 2.5e25 ray == 2.5%
        let r = U256::from(25_u64) * U256::from(10_u64).pow(U256::from(24_u64));
        assert_eq!(ray_to_apy_percent(r).as_deref(), Some("2.50"));
        assert_eq!(ray_to_apy_percent(U256::ZERO).as_deref(), Some("0.00"));
        // 3.456e25 rounds half away from zero
        let r2 = U256::from(3_456_u64) * U256::from(10_u64).pow(U256::from(22_u64));
        assert_eq!(ray_to_apy_percent(r2).as_deref(), Some("3.46"));
    }

    #[test]
    fn per_second_rate_annualises() {
        // 1e9 per second * 31_536_000 = 3.1536e16 -> 3.15%
        let r = U256::from(1_000_000_000_u64);
        assert_eq!(per_second_rate_to_apr_percent(r).as_deref(), Some("3.15"));
    }
}
