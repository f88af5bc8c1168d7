//! Engine: assembles the five components from a [`TomlConfig`] and
//! drives the per-cycle pipeline — BalanceManager snapshot, Scanner,
//! Analyzer, and (at most one) Executor run — the way the teacher's
//! `paper_trading/engine.rs` drives its Collector/Strategy/Executor
//! loop, except as a plain sequential `async fn run` instead of
//! broadcast channels: spec.md §5 calls for a strict single-active-cycle
//! pipeline, not fan-out pub/sub between components.

use crate::analyzer::{Analyzer, AnalyzerConfig, AnalyzerTables};
use crate::balance::{BalanceManager, PricingTable};
use crate::cooldown::RouteCooldown;
use crate::gateway::ExchangeGateway;
use crate::rebalancer::{Rebalancer, RebalancerConfig, RebalancerTables};
use crate::executor::{Executor, ExecutorConfig};
use crate::scanner::Scanner;
use crate::toml_config::TomlConfig;
use crate::trade_log::TradeLogger;
use crate::types::VenueId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, Instrument};

/// Minimum number of gateways the engine needs to make sense of "cross
/// exchange" at all (spec.md §6's "fewer than 2 usable venues" fatal
/// initialisation failure).
pub const MIN_USABLE_VENUES: usize = 2;

pub struct Engine {
    gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>>,
    scanner: Scanner,
    analyzer: Analyzer,
    /// Independent from the [`BalanceManager`] the executor owns
    /// internally: `BalanceManager` isn't `Clone`, and the cycle loop's
    /// analyzer enrichment needs to read balances concurrently with the
    /// executor polling arrival on an in-flight transfer leg.
    balances: BalanceManager,
    executor: Executor,
    cooldown: RouteCooldown,
    trade_log: TradeLogger,
    cycle_sleep: Duration,
    post_trade_cooldown: Duration,
}

/// Turns the flat, serde-shaped lists in [`TomlConfig`] into the
/// keyed lookup tables each component actually consumes.
fn token_network_restriction_map(config: &TomlConfig) -> HashMap<(String, String), Vec<String>> {
    config
        .token_network_restriction
        .iter()
        .map(|r| ((r.venue.clone(), r.asset.clone()), r.allowed_networks.clone()))
        .collect()
}

fn memo_required_set(config: &TomlConfig) -> HashSet<String> {
    config.memo_required_assets.iter().cloned().collect()
}

impl Engine {
    /// `trade_log_dir` is a separate argument rather than a TOML field:
    /// it's an output path, not a tunable, the same distinction the
    /// teacher draws between `config.rs` (where things come from) and
    /// `price_logger.rs` (where things go).
    pub fn new(
        gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>>,
        config: &TomlConfig,
        trade_log_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        let general = &config.general;

        let network_aliases = config.network_aliases.clone();
        let token_network_preference = config.token_network_preference.clone();
        let network_preference = config.network_preference.clone();
        let default_withdraw_fees = config.default_withdraw_fees.clone();
        let path_blacklist = config.path_blacklist_set();
        let whitelist = config.whitelist_set();
        let token_network_restriction = token_network_restriction_map(config);

        let analyzer = Analyzer::new(
            AnalyzerConfig {
                min_net_pct: general.min_net_pct,
                min_liquidity_quote: general.min_liquidity_quote,
                slippage_pct: general.slippage_pct,
                stability_cycles: general.stability_cycles,
                top_n: general.top_n,
                trade_amount_quote: general.trade_amount_quote,
                enforce_whitelist: general.enforce_whitelist,
            },
            AnalyzerTables {
                asset_blacklist: config.asset_blacklist_set(),
                path_blacklist: path_blacklist.clone(),
                whitelist: whitelist.clone(),
                network_aliases: network_aliases.clone(),
                token_network_preference: token_network_preference.clone(),
                network_preference: network_preference.clone(),
                default_withdraw_fees: default_withdraw_fees.clone(),
                token_network_restriction: token_network_restriction.clone(),
            },
        );

        let rebalancer = Rebalancer::new(
            gateways.clone(),
            RebalancerTables {
                network_aliases,
                token_network_preference,
                network_preference,
                default_withdraw_fees,
                path_blacklist,
                whitelist,
                enforce_whitelist: general.enforce_whitelist,
                memo_required_assets: memo_required_set(config),
                token_network_restriction,
            },
            RebalancerConfig {
                order_fetch_attempts: general.order_fetch_attempts,
                order_fetch_delay_ms: general.order_fetch_delay_ms,
                min_liquidity_quote: general.min_liquidity_quote,
                slippage_pct: general.slippage_pct,
                jit_min_conversion_quote: general.jit_min_conversion_quote,
            },
        );

        let reference_venue = config
            .enabled_venues()
            .first()
            .map(|v| v.id.clone())
            .unwrap_or_default();
        let stablecoins: HashSet<String> = ["USDT", "USDC", "BUSD", "DAI", "TUSD"].iter().map(|s| s.to_string()).collect();
        let make_pricing = || PricingTable {
            quote_asset: general.quote_asset.clone(),
            stablecoins: stablecoins.clone(),
            static_prices: config.estimated_prices.clone(),
        };
        let executor_balances = BalanceManager::new(gateways.clone(), reference_venue.clone(), make_pricing(), Duration::from_secs(30));
        let cycle_balances = BalanceManager::new(gateways.clone(), reference_venue, make_pricing(), Duration::from_secs(30));

        let executor = Executor::new(
            gateways.clone(),
            rebalancer,
            executor_balances,
            ExecutorConfig {
                quote_asset: general.quote_asset.clone(),
                trade_amount_quote: general.trade_amount_quote,
                min_effective_trade_quote: general.min_effective_trade_quote,
                reserve_buffer_quote: general.reserve_buffer_quote,
                transfer_fee_buffer_quote: general.transfer_fee_buffer_quote,
                jit_min_conversion_quote: general.jit_min_conversion_quote,
                jit_funding_wait_secs: general.jit_funding_wait_secs,
                base_asset_transfer_wait_secs: general.base_asset_transfer_wait_secs(),
                arrival_poll_interval_secs: general.arrival_poll_interval_secs,
                jit_liquid_assets: general.jit_liquid_assets.clone(),
                prefer_cost_based_buy: general.prefer_cost_based_buy,
                retry_partial_buy_remainder: general.retry_partial_buy_remainder,
                hold_on_exhausted_open: general.hold_on_exhausted_open,
            },
        );

        Self {
            gateways,
            scanner: Scanner::new(general.quote_asset.clone(), general.min_gross_pct, general.max_gross_pct),
            analyzer,
            balances: cycle_balances,
            executor,
            cooldown: RouteCooldown::new(general.route_cooldown_cycles),
            trade_log: TradeLogger::new(trade_log_dir),
            cycle_sleep: Duration::from_millis(general.cycle_sleep_ms),
            post_trade_cooldown: Duration::from_secs(general.post_trade_cooldown_secs),
        }
    }

    /// Loads every venue's markets and computes the common-pair table
    /// once before the first cycle.
    pub async fn init(&mut self) {
        self.scanner.init_markets(&self.gateways).await;
    }

    /// Runs one scan→analyse→(execute) cycle. Returns `true` if an
    /// execution was attempted, so callers can apply the post-trade
    /// cooldown instead of the regular inter-cycle sleep.
    pub async fn run_cycle(&mut self, cycle: u64) -> bool {
        let span = info_span!("cycle", cycle);
        async {
            let candidates = self.scanner.scan_once(&self.gateways).await;
            let analyzed = self
                .analyzer
                .analyze(candidates, &self.gateways, &self.scanner, &self.balances, &mut self.cooldown, cycle)
                .await;

            let Some(best) = analyzed.into_iter().next() else {
                self.cooldown.cleanup(cycle);
                return false;
            };

            info!(
                asset = %best.opportunity.asset, buy = %best.opportunity.buy_venue, sell = %best.opportunity.sell_venue,
                net_pct = %best.net_pct, "executing opportunity"
            );
            self.analyzer.mark_executed(&best.opportunity.id);
            let outcome = self.executor.execute(&best, &self.scanner).await;

            if outcome.log.final_state.is_failure() {
                self.cooldown.record_failure(&best.opportunity.asset, &best.opportunity.buy_venue, &best.opportunity.sell_venue, cycle);
            } else {
                self.cooldown.record_success(&best.opportunity.asset, &best.opportunity.buy_venue, &best.opportunity.sell_venue);
            }
            self.cooldown.cleanup(cycle);

            self.trade_log.append(&outcome.log);
            true
        }
        .instrument(span)
        .await
    }

    /// Drives the main loop for up to `max_cycles` (if set), sleeping
    /// the regular inter-cycle delay or the post-trade cooldown as
    /// appropriate, and checking `should_stop` at every suspension
    /// point between cycles so shutdown is prompt rather than deferred
    /// to the next scan.
    pub async fn run<F>(&mut self, max_cycles: Option<u64>, mut should_stop: F)
    where
        F: FnMut() -> bool,
    {
        let mut cycle: u64 = 0;
        loop {
            if should_stop() {
                info!("shutdown signal observed; stopping before next cycle");
                break;
            }
            if let Some(max) = max_cycles {
                if cycle >= max {
                    info!(cycle, "reached configured cycle limit");
                    break;
                }
            }

            let traded = self.run_cycle(cycle).await;
            cycle += 1;

            if should_stop() {
                info!("shutdown signal observed after cycle; stopping");
                break;
            }
            let sleep_for = if traded { self.post_trade_cooldown } else { self.cycle_sleep };
            tokio::time::sleep(sleep_for).await;
        }
    }
}
