//! Leveraged-token symbol filter: excludes leveraged/ETF-style tokens
//! (e.g. `BTC3L`, `ETHBULL`, `ADADOWN`) from scanning since their
//! price tracks a multiple of the underlying rather than the underlying
//! itself, which would otherwise register as spurious arbitrage.

use once_cell::sync::Lazy;
use regex::Regex;

struct Pattern {
    regex: Regex,
    label: &'static str,
}

static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        Pattern {
            regex: Regex::new(r"(?i)^[A-Z0-9]{1,10}[1-5][SL]$").unwrap(),
            label: "leveraged-suffix",
        },
        Pattern {
            regex: Regex::new(r"(?i)^[A-Z0-9]{1,10}(UP|DOWN)$").unwrap(),
            label: "up-down",
        },
        Pattern {
            regex: Regex::new(r"(?i)^[A-Z0-9]{1,10}(BULL|BEAR)$").unwrap(),
            label: "bull-bear",
        },
        Pattern {
            regex: Regex::new(r"(?i)^[A-Z0-9]{1,10}\d[LS]$").unwrap(),
            label: "digit-long-short",
        },
    ]
});

/// Returns the matched pattern's label if `base_asset` looks like a
/// leveraged token, else `None`.
pub fn matched_pattern(base_asset: &str) -> Option<&'static str> {
    PATTERNS
        .iter()
        .find(|p| p.regex.is_match(base_asset))
        .map(|p| p.label)
}

pub fn is_leveraged_token(base_asset: &str) -> bool {
    matched_pattern(base_asset).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_numeric_leverage_suffix() {
        assert!(is_leveraged_token("BTC3L"));
        assert!(is_leveraged_token("eth2s"));
    }

    #[test]
    fn detects_up_down() {
        assert!(is_leveraged_token("ADADOWN"));
        assert!(is_leveraged_token("btcup"));
    }

    #[test]
    fn detects_bull_bear() {
        assert!(is_leveraged_token("BTCBULL"));
        assert!(is_leveraged_token("ethbear"));
    }

    #[test]
    fn plain_assets_are_not_flagged() {
        assert!(!is_leveraged_token("BTC"));
        assert!(!is_leveraged_token("ETH"));
        assert!(!is_leveraged_token("USDT"));
    }
}
