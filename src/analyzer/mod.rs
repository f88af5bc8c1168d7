//! Analyzer: turns gross scanner opportunities into costed,
//! network-routed, stability-gated [`AnalyzedOpportunity`] records.
//!
//! A candidate survives, in order: the asset/path blacklist, the route
//! cooldown, a minimum run of consecutive cycles seen (the "stability"
//! requirement that filters out one-tick noise), trading-fee and
//! withdrawal-fee netting against the configured minimum, and finally
//! a depth check on both legs.

use crate::balance::BalanceManager;
use crate::cooldown::RouteCooldown;
use crate::depth::{check_depth_on_venue, DepthVerdict};
use crate::gateway::ExchangeGateway;
use crate::network_selector::{select_routes, NetworkSelectorTables};
use crate::scanner::Scanner;
use crate::toml_config::PathBlacklistEntry;
use crate::types::{AnalyzedOpportunity, Opportunity, Side, VenueId};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

pub struct AnalyzerConfig {
    pub min_net_pct: Decimal,
    pub min_liquidity_quote: Decimal,
    pub slippage_pct: Decimal,
    pub stability_cycles: u32,
    pub top_n: usize,
    pub trade_amount_quote: Decimal,
    pub enforce_whitelist: bool,
}

pub struct AnalyzerTables {
    pub asset_blacklist: HashSet<(String, String)>,
    pub path_blacklist: HashSet<PathBlacklistEntry>,
    pub whitelist: HashSet<PathBlacklistEntry>,
    pub network_aliases: HashMap<String, String>,
    pub token_network_preference: HashMap<String, Vec<String>>,
    pub network_preference: Vec<String>,
    pub default_withdraw_fees: HashMap<String, Decimal>,
    pub token_network_restriction: HashMap<(String, String), Vec<String>>,
}

pub struct Analyzer {
    config: AnalyzerConfig,
    tables: AnalyzerTables,
    /// Consecutive-cycle sighting count per opportunity id. Rebuilt
    /// every cycle: an identity missing from the latest candidate set
    /// is dropped, so stability never survives a gap.
    stability: HashMap<String, u32>,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig, tables: AnalyzerTables) -> Self {
        Self { config, tables, stability: HashMap::new() }
    }

    /// Drops the stability count for `opportunity_id`, so a just-executed
    /// route must earn a fresh run of sightings before it can fire again.
    pub fn mark_executed(&mut self, opportunity_id: &str) {
        self.stability.remove(opportunity_id);
    }

    fn update_stability(&mut self, candidates: &[Opportunity]) {
        let mut next = HashMap::with_capacity(candidates.len());
        for c in candidates {
            let count = self.stability.get(&c.id).copied().unwrap_or(0) + 1;
            next.insert(c.id.clone(), count);
        }
        self.stability = next;
    }

    pub async fn analyze(
        &mut self,
        candidates: Vec<Opportunity>,
        gateways: &HashMap<VenueId, Arc<dyn ExchangeGateway>>,
        scanner: &Scanner,
        balances: &BalanceManager,
        cooldown: &mut RouteCooldown,
        cycle: u64,
    ) -> Vec<AnalyzedOpportunity> {
        self.update_stability(&candidates);

        let mut stable: Vec<Opportunity> = candidates
            .into_iter()
            .filter(|c| !self.tables.asset_blacklist.contains(&(c.buy_venue.clone(), c.asset.clone())))
            .filter(|c| !self.tables.asset_blacklist.contains(&(c.sell_venue.clone(), c.asset.clone())))
            .filter(|c| !cooldown.is_cooled_down(&c.asset, &c.buy_venue, &c.sell_venue, cycle))
            .filter(|c| self.stability.get(&c.id).copied().unwrap_or(0) >= self.config.stability_cycles)
            .collect();

        stable.sort_by(|a, b| b.gross_spread_pct.cmp(&a.gross_spread_pct));
        stable.truncate(self.config.top_n);

        let mut analyzed = Vec::new();
        for candidate in stable {
            match self.enrich(&candidate, gateways, scanner, balances).await {
                Some(result) if result.net_pct >= self.config.min_net_pct => analyzed.push(result),
                Some(result) => {
                    debug!(
                        id = candidate.id, net_pct = %result.net_pct,
                        "opportunity netted below minimum after fees"
                    );
                }
                None => {
                    cooldown.record_failure(&candidate.asset, &candidate.buy_venue, &candidate.sell_venue, cycle);
                }
            }
        }

        analyzed.sort_by(|a, b| b.net_pct.cmp(&a.net_pct));
        analyzed
    }

    async fn enrich(
        &self,
        candidate: &Opportunity,
        gateways: &HashMap<VenueId, Arc<dyn ExchangeGateway>>,
        scanner: &Scanner,
        balances: &BalanceManager,
    ) -> Option<AnalyzedOpportunity> {
        let buy_gateway = gateways.get(&candidate.buy_venue)?;
        let sell_gateway = gateways.get(&candidate.sell_venue)?;
        let symbol = format!("{}/{}", candidate.asset, candidate.quote_asset);

        let buy_fee_pct = scanner
            .market_info(&candidate.buy_venue, &symbol)
            .map(|m| m.taker_fee * Decimal::ONE_HUNDRED)
            .unwrap_or(Decimal::ZERO);
        let sell_fee_pct = scanner
            .market_info(&candidate.sell_venue, &symbol)
            .map(|m| m.taker_fee * Decimal::ONE_HUNDRED)
            .unwrap_or(Decimal::ZERO);

        let from_networks = buy_gateway
            .get_networks(&candidate.asset)
            .instrument(info_span!("get_networks", venue = %candidate.buy_venue))
            .await
            .unwrap_or_else(|e| {
                warn!(venue = candidate.buy_venue, error = %e, "get_networks failed");
                Vec::new()
            });
        let to_networks = sell_gateway
            .get_networks(&candidate.asset)
            .instrument(info_span!("get_networks", venue = %candidate.sell_venue))
            .await
            .unwrap_or_else(|e| {
                warn!(venue = candidate.sell_venue, error = %e, "get_networks failed");
                Vec::new()
            });

        let mut fee_prices = HashMap::new();
        for currency in from_networks.iter().map(|n| &n.fee_currency).chain(to_networks.iter().map(|n| &n.fee_currency)) {
            if !fee_prices.contains_key(currency) {
                fee_prices.insert(currency.clone(), balances.price_of(currency).await);
            }
        }

        let tables = NetworkSelectorTables {
            network_aliases: &self.tables.network_aliases,
            token_network_preference: &self.tables.token_network_preference,
            network_preference: &self.tables.network_preference,
            default_withdraw_fees: &self.tables.default_withdraw_fees,
            path_blacklist: &self.tables.path_blacklist,
            whitelist: &self.tables.whitelist,
            enforce_whitelist: self.config.enforce_whitelist,
            token_network_restriction: &self.tables.token_network_restriction,
        };
        let potential_networks = select_routes(
            &candidate.asset,
            &candidate.buy_venue,
            &candidate.sell_venue,
            None,
            &from_networks,
            &to_networks,
            &fee_prices,
            &tables,
        );
        let chosen_network = potential_networks.first()?.clone();

        let trade_notional = self.config.trade_amount_quote;
        let buy_depth = check_depth_on_venue(
            buy_gateway.as_ref(),
            &symbol,
            Side::Buy,
            trade_notional,
            self.config.min_liquidity_quote,
            self.config.slippage_pct,
        )
        .await;
        let sell_depth = check_depth_on_venue(
            sell_gateway.as_ref(),
            &symbol,
            Side::Sell,
            trade_notional,
            self.config.min_liquidity_quote,
            self.config.slippage_pct,
        )
        .await;
        let is_liquid = buy_depth == DepthVerdict::Sufficient && sell_depth == DepthVerdict::Sufficient;
        if !is_liquid {
            return None;
        }

        let withdrawal_fee_quote = chosen_network.fee_quote;
        let withdrawal_fee_pct = if trade_notional.is_zero() {
            Decimal::ZERO
        } else {
            withdrawal_fee_quote / trade_notional * Decimal::ONE_HUNDRED
        };
        let net_pct = candidate.gross_spread_pct - buy_fee_pct - sell_fee_pct - withdrawal_fee_pct;

        Some(AnalyzedOpportunity {
            opportunity: candidate.clone(),
            buy_fee_pct,
            sell_fee_pct,
            withdrawal_fee_quote,
            net_pct,
            potential_networks,
            chosen_network,
            stability_count: self.stability.get(&candidate.id).copied().unwrap_or(0),
            is_stable: true,
            is_liquid,
            trade_notional,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::DryRunGateway;
    use crate::types::{DepthLevel, MarketInfo, NetworkOption, OrderBookSnapshot};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn config() -> AnalyzerConfig {
        AnalyzerConfig {
            min_net_pct: dec!(0.1),
            min_liquidity_quote: dec!(10),
            slippage_pct: dec!(5),
            stability_cycles: 2,
            top_n: 10,
            trade_amount_quote: dec!(100),
            enforce_whitelist: false,
        }
    }

    fn tables() -> AnalyzerTables {
        AnalyzerTables {
            asset_blacklist: HashSet::new(),
            path_blacklist: HashSet::new(),
            whitelist: HashSet::new(),
            network_aliases: HashMap::new(),
            token_network_preference: HashMap::new(),
            network_preference: Vec::new(),
            default_withdraw_fees: HashMap::new(),
            token_network_restriction: HashMap::new(),
        }
    }

    fn candidate() -> Opportunity {
        Opportunity {
            id: "binance:kucoin:BTC/USDT".into(),
            asset: "BTC".into(),
            quote_asset: "USDT".into(),
            buy_venue: "binance".into(),
            sell_venue: "kucoin".into(),
            buy_price: dec!(100),
            sell_price: dec!(110),
            gross_spread_pct: dec!(10),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn unstable_opportunities_are_filtered_before_reaching_top_n() {
        let mut analyzer = Analyzer::new(config(), tables());
        analyzer.update_stability(&[candidate()]);
        assert_eq!(analyzer.stability.get("binance:kucoin:BTC/USDT"), Some(&1));
        analyzer.update_stability(&[]);
        assert!(analyzer.stability.is_empty());
    }

    #[tokio::test]
    async fn stable_opportunity_with_network_and_depth_produces_analyzed_result() {
        let binance = Arc::new(DryRunGateway::new("binance"));
        binance.seed_market(MarketInfo {
            symbol: "BTC/USDT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            active: true,
            is_spot: true,
            taker_fee: dec!(0.001),
            min_amount: dec!(0.0001),
            min_cost: dec!(10),
            amount_precision: None,
        });
        binance.seed_book(
            "BTC/USDT",
            OrderBookSnapshot {
                venue: "binance".into(),
                symbol: "BTC/USDT".into(),
                bids: vec![],
                asks: vec![DepthLevel { price: dec!(100), quantity: dec!(100) }],
                fetched_at: Utc::now(),
            },
        );
        binance.seed_networks(
            "BTC",
            vec![NetworkOption {
                network: "ERC20".into(),
                active: true,
                can_deposit: true,
                can_withdraw: true,
                withdraw_fee: dec!(0.0001),
                fee_currency: "BTC".into(),
                min_withdraw: dec!(0.0001),
                requires_memo: false,
            }],
        );

        let kucoin = Arc::new(DryRunGateway::new("kucoin"));
        kucoin.seed_market(MarketInfo {
            symbol: "BTC/USDT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            active: true,
            is_spot: true,
            taker_fee: dec!(0.001),
            min_amount: dec!(0.0001),
            min_cost: dec!(10),
            amount_precision: None,
        });
        kucoin.seed_book(
            "BTC/USDT",
            OrderBookSnapshot {
                venue: "kucoin".into(),
                symbol: "BTC/USDT".into(),
                bids: vec![DepthLevel { price: dec!(110), quantity: dec!(100) }],
                asks: vec![],
                fetched_at: Utc::now(),
            },
        );
        kucoin.seed_networks(
            "BTC",
            vec![NetworkOption {
                network: "ETH".into(),
                active: true,
                can_deposit: true,
                can_withdraw: true,
                withdraw_fee: dec!(0),
                fee_currency: "BTC".into(),
                min_withdraw: dec!(0),
                requires_memo: false,
            }],
        );

        let mut gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>> = HashMap::new();
        gateways.insert("binance".into(), binance);
        gateways.insert("kucoin".into(), kucoin);

        let mut scanner = Scanner::new("USDT", dec!(1), dec!(20));
        scanner.init_markets(&gateways).await;

        let pricing = crate::balance::PricingTable {
            quote_asset: "USDT".to_string(),
            stablecoins: HashSet::new(),
            static_prices: HashMap::new(),
        };
        let balance_gateways = gateways.clone();
        let balances = BalanceManager::new(balance_gateways, "binance".into(), pricing, std::time::Duration::from_secs(60));

        let mut analyzer = Analyzer::new(config(), tables());
        let mut cooldown = RouteCooldown::new(10);

        analyzer.analyze(vec![candidate()], &gateways, &scanner, &balances, &mut cooldown, 1).await;
        let results = analyzer.analyze(vec![candidate()], &gateways, &scanner, &balances, &mut cooldown, 2).await;

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.chosen_network.normalized_name, "ERC20");
        assert!(result.net_pct > Decimal::ZERO);
        assert!(result.is_liquid);
    }
}
