//! Picks the cheapest usable transfer rail between two venues for one
//! asset, out of whatever networks both sides happen to support.
//!
//! Inputs are the two venues' raw `fetch_currencies().networks` rows;
//! output is every viable [`NetworkRoute`], ranked cheapest (in quote
//! terms) first, with configured per-token and general preferences as
//! tie-breakers.

use crate::toml_config::PathBlacklistEntry;
use crate::types::{NetworkOption, NetworkRoute, NetworkSource};
use crate::{network_alias, types::AssetId};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

/// Everything the selector needs that isn't specific to one call:
/// aliasing, preference ordering, and blacklist/whitelist tables, all
/// sourced from the static configuration bundle.
pub struct NetworkSelectorTables<'a> {
    pub network_aliases: &'a HashMap<String, String>,
    pub token_network_preference: &'a HashMap<String, Vec<String>>,
    pub network_preference: &'a [String],
    pub default_withdraw_fees: &'a HashMap<String, Decimal>,
    pub path_blacklist: &'a HashSet<PathBlacklistEntry>,
    pub whitelist: &'a HashSet<PathBlacklistEntry>,
    pub enforce_whitelist: bool,
    /// Per-(venue, asset) restriction to a fixed set of withdrawal
    /// networks (spec.md §4.3.1 step 2), keyed by the *source* venue.
    /// Network names here are normalised the same way as any other
    /// network string before comparison.
    pub token_network_restriction: &'a HashMap<(String, String), Vec<String>>,
}

struct Candidate {
    normalized_name: String,
    from: NetworkOption,
    to: NetworkOption,
}

/// Builds every ranked, eligible route for moving `asset` from
/// `from_venue` to `to_venue`, given both sides' currently-reported
/// network rows. `fee_prices` maps a fee currency to its quote price,
/// already resolved by the caller (the analyzer holds the balance
/// manager, not this module).
pub fn select_routes(
    asset: &str,
    from_venue: &str,
    to_venue: &str,
    amount: Option<Decimal>,
    from_networks: &[NetworkOption],
    to_networks: &[NetworkOption],
    fee_prices: &HashMap<AssetId, Decimal>,
    tables: &NetworkSelectorTables<'_>,
) -> Vec<NetworkRoute> {
    let restriction: Option<HashSet<String>> = tables
        .token_network_restriction
        .get(&(from_venue.to_string(), asset.to_string()))
        .map(|allowed| {
            allowed
                .iter()
                .map(|n| network_alias::normalize(n, tables.network_aliases))
                .collect()
        });

    let mut by_name: HashMap<String, Candidate> = HashMap::new();
    for from in from_networks {
        if !from.active || !from.can_withdraw {
            continue;
        }
        let name = network_alias::normalize(&from.network, tables.network_aliases);
        if name == network_alias::UNKNOWN_NETWORK {
            continue;
        }
        if let Some(allowed) = &restriction {
            if !allowed.contains(&name) {
                continue;
            }
        }
        by_name.insert(name.clone(), Candidate { normalized_name: name, from: from.clone(), to: from.clone() });
    }

    let mut matched: Vec<Candidate> = Vec::new();
    for to in to_networks {
        if !to.active || !to.can_deposit {
            continue;
        }
        let name = network_alias::normalize(&to.network, tables.network_aliases);
        if name == network_alias::UNKNOWN_NETWORK {
            continue;
        }
        if let Some(candidate) = by_name.remove(&name) {
            matched.push(Candidate { normalized_name: name, from: candidate.from, to: to.clone() });
        }
    }

    let token_pref = tables.token_network_preference.get(asset);

    let mut routes: Vec<NetworkRoute> = Vec::new();
    for candidate in matched {
        if is_blacklisted(asset, from_venue, to_venue, &candidate.normalized_name, tables.path_blacklist) {
            continue;
        }
        if tables.enforce_whitelist
            && !is_whitelisted(asset, from_venue, to_venue, &candidate.normalized_name, tables.whitelist)
        {
            continue;
        }

        let (fee_native, source) = if let Some(curated) = tables.default_withdraw_fees.get(asset) {
            (*curated, NetworkSource::OperatorCurated)
        } else {
            (candidate.from.withdraw_fee, NetworkSource::LiveMetadata)
        };

        let min_withdrawal_native = candidate.from.min_withdraw;
        if let Some(amount) = amount {
            if amount < min_withdrawal_native {
                continue;
            }
        }

        let fee_currency = candidate.from.fee_currency.clone();
        let fee_price = fee_prices.get(&fee_currency).copied().unwrap_or(Decimal::ZERO);
        let fee_quote = fee_native * fee_price;

        let priority_score_token = token_pref
            .and_then(|prefs| prefs.iter().position(|n| n == &candidate.normalized_name))
            .map(|idx| idx as i64)
            .unwrap_or(i64::MAX);
        let priority_score_general = tables
            .network_preference
            .iter()
            .position(|n| n == &candidate.normalized_name)
            .map(|idx| idx as i64)
            .unwrap_or(i64::MAX);

        routes.push(NetworkRoute {
            normalized_name: candidate.normalized_name,
            withdraw_code_on_from: candidate.from.network.clone(),
            deposit_code_on_to: candidate.to.network.clone(),
            fee_native,
            fee_currency,
            fee_quote,
            min_withdrawal_native,
            source,
            priority_score_token,
            priority_score_general,
        });
    }

    routes.sort_by(|a, b| {
        a.fee_quote
            .cmp(&b.fee_quote)
            .then(a.priority_score_token.cmp(&b.priority_score_token))
            .then(a.priority_score_general.cmp(&b.priority_score_general))
    });
    routes
}

fn is_blacklisted(asset: &str, from: &str, to: &str, network: &str, blacklist: &HashSet<PathBlacklistEntry>) -> bool {
    blacklist.iter().any(|e| {
        e.asset.eq_ignore_ascii_case(asset)
            && e.from.eq_ignore_ascii_case(from)
            && e.to.eq_ignore_ascii_case(to)
            && e.network.eq_ignore_ascii_case(network)
    })
}

fn is_whitelisted(asset: &str, from: &str, to: &str, network: &str, whitelist: &HashSet<PathBlacklistEntry>) -> bool {
    whitelist.iter().any(|e| {
        e.asset.eq_ignore_ascii_case(asset)
            && e.from.eq_ignore_ascii_case(from)
            && e.to.eq_ignore_ascii_case(to)
            && e.network.eq_ignore_ascii_case(network)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn network(name: &str, can_withdraw: bool, can_deposit: bool, fee: Decimal, min_withdraw: Decimal) -> NetworkOption {
        NetworkOption {
            network: name.to_string(),
            active: true,
            can_deposit,
            can_withdraw,
            withdraw_fee: fee,
            fee_currency: "BTC".to_string(),
            min_withdraw,
            requires_memo: false,
        }
    }

    fn empty_tables() -> (
        HashMap<String, String>,
        HashMap<String, Vec<String>>,
        Vec<String>,
        HashMap<String, Decimal>,
        HashSet<PathBlacklistEntry>,
        HashSet<PathBlacklistEntry>,
    ) {
        (HashMap::new(), HashMap::new(), Vec::new(), HashMap::new(), HashSet::new(), HashSet::new())
    }

    #[test]
    fn picks_cheapest_common_network() {
        let (aliases, token_pref, general_pref, fallback_fees, blacklist, whitelist) = empty_tables();
        let tables = NetworkSelectorTables {
            network_aliases: &aliases,
            token_network_preference: &token_pref,
            network_preference: &general_pref,
            default_withdraw_fees: &fallback_fees,
            path_blacklist: &blacklist,
            whitelist: &whitelist,
            enforce_whitelist: false,
            token_network_restriction: &HashMap::new(),
        };
        let from = vec![
            network("ERC20", true, true, dec!(0.001), dec!(0.01)),
            network("BEP20", true, true, dec!(0.0001), dec!(0.01)),
        ];
        let to = vec![network("ETH", true, true, dec!(0), dec!(0)), network("BSC", true, true, dec!(0), dec!(0))];
        let mut fee_prices = HashMap::new();
        fee_prices.insert("BTC".to_string(), dec!(50000));

        let routes = select_routes("BTC", "binance", "kucoin", None, &from, &to, &fee_prices, &tables);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].normalized_name, "BEP20");
    }

    #[test]
    fn blacklisted_path_is_excluded() {
        let (aliases, token_pref, general_pref, fallback_fees, _blacklist, whitelist) = empty_tables();
        let mut blacklist = HashSet::new();
        blacklist.insert(PathBlacklistEntry {
            asset: "BTC".into(),
            from: "binance".into(),
            to: "kucoin".into(),
            network: "ERC20".into(),
        });
        let tables = NetworkSelectorTables {
            network_aliases: &aliases,
            token_network_preference: &token_pref,
            network_preference: &general_pref,
            default_withdraw_fees: &fallback_fees,
            path_blacklist: &blacklist,
            whitelist: &whitelist,
            enforce_whitelist: false,
            token_network_restriction: &HashMap::new(),
        };
        let from = vec![network("ERC20", true, true, dec!(0.001), dec!(0.01))];
        let to = vec![network("ETH", true, true, dec!(0), dec!(0))];
        let routes = select_routes("BTC", "binance", "kucoin", None, &from, &to, &HashMap::new(), &tables);
        assert!(routes.is_empty());
    }

    #[test]
    fn enforced_whitelist_drops_unlisted_paths() {
        let (aliases, token_pref, general_pref, fallback_fees, blacklist, _whitelist) = empty_tables();
        let tables = NetworkSelectorTables {
            network_aliases: &aliases,
            token_network_preference: &token_pref,
            network_preference: &general_pref,
            default_withdraw_fees: &fallback_fees,
            path_blacklist: &blacklist,
            whitelist: &HashSet::new(),
            enforce_whitelist: true,
            token_network_restriction: &HashMap::new(),
        };
        let from = vec![network("ERC20", true, true, dec!(0.001), dec!(0.01))];
        let to = vec![network("ETH", true, true, dec!(0), dec!(0))];
        let routes = select_routes("BTC", "binance", "kucoin", None, &from, &to, &HashMap::new(), &tables);
        assert!(routes.is_empty());
    }

    #[test]
    fn amount_below_minimum_withdrawal_is_excluded() {
        let (aliases, token_pref, general_pref, fallback_fees, blacklist, whitelist) = empty_tables();
        let tables = NetworkSelectorTables {
            network_aliases: &aliases,
            token_network_preference: &token_pref,
            network_preference: &general_pref,
            default_withdraw_fees: &fallback_fees,
            path_blacklist: &blacklist,
            whitelist: &whitelist,
            enforce_whitelist: false,
            token_network_restriction: &HashMap::new(),
        };
        let from = vec![network("ERC20", true, true, dec!(0.001), dec!(1))];
        let to = vec![network("ETH", true, true, dec!(0), dec!(0))];
        let routes = select_routes("BTC", "binance", "kucoin", Some(dec!(0.1)), &from, &to, &HashMap::new(), &tables);
        assert!(routes.is_empty());
    }

    #[test]
    fn missing_live_fee_falls_back_to_curated_table() {
        let (aliases, token_pref, general_pref, _fallback_fees, blacklist, whitelist) = empty_tables();
        let mut fallback_fees = HashMap::new();
        fallback_fees.insert("BTC".to_string(), dec!(0.0005));
        let tables = NetworkSelectorTables {
            network_aliases: &aliases,
            token_network_preference: &token_pref,
            network_preference: &general_pref,
            default_withdraw_fees: &fallback_fees,
            path_blacklist: &blacklist,
            whitelist: &whitelist,
            enforce_whitelist: false,
            token_network_restriction: &HashMap::new(),
        };
        let from = vec![network("ERC20", true, true, Decimal::ZERO, dec!(0.01))];
        let to = vec![network("ETH", true, true, dec!(0), dec!(0))];
        let routes = select_routes("BTC", "binance", "kucoin", None, &from, &to, &HashMap::new(), &tables);
        assert_eq!(routes[0].fee_native, dec!(0.0005));
        assert_eq!(routes[0].source, NetworkSource::OperatorCurated);
    }

    #[test]
    fn curated_fee_table_wins_over_live_metadata() {
        let (aliases, token_pref, general_pref, _fallback_fees, blacklist, whitelist) = empty_tables();
        let mut fallback_fees = HashMap::new();
        fallback_fees.insert("BTC".to_string(), dec!(0.0005));
        let tables = NetworkSelectorTables {
            network_aliases: &aliases,
            token_network_preference: &token_pref,
            network_preference: &general_pref,
            default_withdraw_fees: &fallback_fees,
            path_blacklist: &blacklist,
            whitelist: &whitelist,
            enforce_whitelist: false,
            token_network_restriction: &HashMap::new(),
        };
        let from = vec![network("ERC20", true, true, dec!(0.002), dec!(0.01))];
        let to = vec![network("ETH", true, true, dec!(0), dec!(0))];
        let routes = select_routes("BTC", "binance", "kucoin", None, &from, &to, &HashMap::new(), &tables);
        assert_eq!(routes[0].fee_native, dec!(0.0005));
        assert_eq!(routes[0].source, NetworkSource::OperatorCurated);
    }

    #[test]
    fn token_preference_breaks_ties_over_general_preference() {
        let (aliases, _token_pref, general_pref, fallback_fees, blacklist, whitelist) = empty_tables();
        let mut token_pref = HashMap::new();
        token_pref.insert("BTC".to_string(), vec!["BEP20".to_string(), "ERC20".to_string()]);
        let tables = NetworkSelectorTables {
            network_aliases: &aliases,
            token_network_preference: &token_pref,
            network_preference: &general_pref,
            default_withdraw_fees: &fallback_fees,
            path_blacklist: &blacklist,
            whitelist: &whitelist,
            enforce_whitelist: false,
            token_network_restriction: &HashMap::new(),
        };
        let from = vec![
            network("ERC20", true, true, dec!(0.001), dec!(0.01)),
            network("BEP20", true, true, dec!(0.001), dec!(0.01)),
        ];
        let to = vec![network("ETH", true, true, dec!(0), dec!(0)), network("BSC", true, true, dec!(0), dec!(0))];
        let routes = select_routes("BTC", "binance", "kucoin", None, &from, &to, &HashMap::new(), &tables);
        assert_eq!(routes[0].normalized_name, "BEP20");
    }

    #[test]
    fn token_network_restriction_limits_withdrawal_side() {
        let (aliases, token_pref, general_pref, fallback_fees, blacklist, whitelist) = empty_tables();
        let mut restriction = HashMap::new();
        restriction.insert(("binance".to_string(), "BTC".to_string()), vec!["BEP20".to_string()]);
        let tables = NetworkSelectorTables {
            network_aliases: &aliases,
            token_network_preference: &token_pref,
            network_preference: &general_pref,
            default_withdraw_fees: &fallback_fees,
            path_blacklist: &blacklist,
            whitelist: &whitelist,
            enforce_whitelist: false,
            token_network_restriction: &restriction,
        };
        let from = vec![
            network("ERC20", true, true, dec!(0.001), dec!(0.01)),
            network("BEP20", true, true, dec!(0.0001), dec!(0.01)),
        ];
        let to = vec![network("ETH", true, true, dec!(0), dec!(0)), network("BSC", true, true, dec!(0), dec!(0))];
        let routes = select_routes("BTC", "binance", "kucoin", None, &from, &to, &HashMap::new(), &tables);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].normalized_name, "BEP20");
    }
}
