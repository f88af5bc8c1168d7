//! Network-name normalisation: a pure, case- and punctuation-insensitive
//! mapping from whatever string a venue uses for a rail to its
//! canonical normalised name.

use std::collections::HashMap;

pub const UNKNOWN_NETWORK: &str = "UNKNOWN_NETWORK";
pub const DEFAULT_NETWORK: &str = "DEFAULT";

/// Built-in aliases covering the common rails; `EngineConfig` may extend
/// this with operator-curated entries from the TOML bundle, which take
/// priority over these defaults.
fn builtin_aliases() -> &'static [(&'static str, &'static str)] {
    &[
        ("ETH", "ERC20"),
        ("ETHEREUM", "ERC20"),
        ("ERC20", "ERC20"),
        ("ERC_20", "ERC20"),
        ("BSC", "BEP20"),
        ("BNB", "BEP20"),
        ("BEP20", "BEP20"),
        ("BEP_20", "BEP20"),
        ("BNBSMARTCHAIN", "BEP20"),
        ("TRX", "TRC20"),
        ("TRON", "TRC20"),
        ("TRC20", "TRC20"),
        ("TRC_20", "TRC20"),
        ("SOL", "SOLANA"),
        ("SOLANA", "SOLANA"),
        ("MATIC", "POLYGON"),
        ("POLYGON", "POLYGON"),
        ("ARB", "ARBITRUM"),
        ("ARBITRUM", "ARBITRUM"),
        ("ARBITRUMONE", "ARBITRUM"),
        ("OP", "OPTIMISM"),
        ("OPTIMISM", "OPTIMISM"),
        ("AVAX", "AVALANCHE"),
        ("AVAXC", "AVALANCHE"),
        ("AVALANCHE", "AVALANCHE"),
        ("AVALANCHEC", "AVALANCHE"),
    ]
}

/// Strips punctuation/parentheses and upper-cases, so alias-table keys
/// match case-insensitively regardless of how a venue punctuates them.
pub fn clean(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Normalises a raw network string to its canonical name, consulting
/// `overrides` first (operator-curated table from configuration) and
/// falling back to the built-in alias set, then the cleaned input
/// itself if nothing matches. Pure and idempotent: `normalize(normalize(x))
/// == normalize(x)`.
pub fn normalize(raw: &str, overrides: &HashMap<String, String>) -> String {
    if raw.trim().is_empty() {
        return UNKNOWN_NETWORK.to_string();
    }
    let cleaned = clean(raw);
    if let Some(mapped) = overrides.get(&cleaned) {
        return clean(mapped);
    }
    for (alias, canonical) in builtin_aliases() {
        if *alias == cleaned {
            return canonical.to_string();
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_aliases_map_to_same_canonical_name() {
        let overrides = HashMap::new();
        assert_eq!(normalize("ETH", &overrides), "ERC20");
        assert_eq!(normalize("Ethereum", &overrides), "ERC20");
        assert_eq!(normalize("ETH (ERC20)", &overrides), "ERC20");
    }

    #[test]
    fn normalization_is_idempotent() {
        let overrides = HashMap::new();
        for raw in ["ETH", "Tron (TRC20)", "random-chain", ""] {
            let once = normalize(raw, &overrides);
            let twice = normalize(&once, &overrides);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn empty_input_is_unknown() {
        let overrides = HashMap::new();
        assert_eq!(normalize("   ", &overrides), UNKNOWN_NETWORK);
    }

    #[test]
    fn override_table_takes_priority() {
        let mut overrides = HashMap::new();
        overrides.insert("WEIRD".to_string(), "BEP20".to_string());
        assert_eq!(normalize("weird", &overrides), "BEP20");
    }

    #[test]
    fn unrecognized_network_falls_back_to_cleaned_input() {
        let overrides = HashMap::new();
        assert_eq!(normalize("MyChain!", &overrides), "MYCHAIN");
    }
}
