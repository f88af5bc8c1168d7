//! Executor: drives one [`AnalyzedOpportunity`] through its buy,
//! transfer, and sell legs as an explicit state machine (no
//! exception-based control flow — every failure mode is its own
//! terminal [`ExecutionState`]).
//!
//! The three legs share one executor instance so [`Self::active_routes`]
//! can refuse to start a second attempt on a route that's already mid-flight
//! (`SetupErrorAlreadyActive`).

use crate::balance::BalanceManager;
use crate::gateway::{AccountPurpose, ExchangeGateway, OrderStatus};
use crate::quantize::{quantize_down, resolve_quantum_for_asset};
use crate::rebalancer::{QuoteFundingOutcome, Rebalancer};
use crate::scanner::Scanner;
use crate::types::{
    AnalyzedOpportunity, CompletedArbitrageLog, ExecutionState, RebalanceOperation, TradeExecutionDetails, VenueId,
};
use chrono::Utc;
use dashmap::DashSet;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct ExecutorConfig {
    pub quote_asset: String,
    pub trade_amount_quote: Decimal,
    /// Floor under `trade_amount_quote` (or whatever the analyzer sized
    /// the opportunity at) below which a trade isn't worth funding —
    /// `target_cost = max(trade_notional, min_effective_trade_quote)`.
    pub min_effective_trade_quote: Decimal,
    pub reserve_buffer_quote: Decimal,
    pub transfer_fee_buffer_quote: Decimal,
    pub jit_min_conversion_quote: Decimal,
    pub jit_funding_wait_secs: u64,
    pub base_asset_transfer_wait_secs: u64,
    pub arrival_poll_interval_secs: u64,
    pub jit_liquid_assets: Vec<String>,
    /// Open question (a): prefer `place_market_buy_with_cost` over an
    /// amount-based buy when the venue supports both.
    pub prefer_cost_based_buy: bool,
    /// Open question (b): on a partial buy fill, attempt one bounded
    /// extra buy for the unfilled remainder rather than proceeding with
    /// whatever filled.
    pub retry_partial_buy_remainder: bool,
    /// Open question (c): when an order is still open after every fetch
    /// attempt, skip the best-effort cancel and fail the leg with the
    /// order left resting on the venue, rather than canceling it. Either
    /// way the leg is abandoned this cycle — this only controls whether
    /// the resting order is torn down first.
    pub hold_on_exhausted_open: bool,
}

pub struct ExecutionOutcome {
    pub log: CompletedArbitrageLog,
    pub transitions: Vec<TradeExecutionDetails>,
}

pub struct Executor {
    gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>>,
    rebalancer: Rebalancer,
    balances: BalanceManager,
    config: ExecutorConfig,
    /// Routes (`asset|buy|sell`) with an attempt currently in flight.
    active_routes: DashSet<String>,
}

impl Executor {
    pub fn new(
        gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>>,
        rebalancer: Rebalancer,
        balances: BalanceManager,
        config: ExecutorConfig,
    ) -> Self {
        Self { gateways, rebalancer, balances, config, active_routes: DashSet::new() }
    }

    fn route_key(analyzed: &AnalyzedOpportunity) -> String {
        format!("{}|{}|{}", analyzed.opportunity.asset, analyzed.opportunity.buy_venue, analyzed.opportunity.sell_venue)
    }

    pub async fn execute(&self, analyzed: &AnalyzedOpportunity, scanner: &Scanner) -> ExecutionOutcome {
        let opp = &analyzed.opportunity;
        let started_at = Utc::now();
        let mut transitions = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        macro_rules! record {
            ($state:expr, $message:expr) => {{
                transitions.push(TradeExecutionDetails {
                    opportunity_id: opp.id.clone(),
                    state: $state,
                    message: $message,
                    recorded_at: Utc::now(),
                });
            }};
        }

        macro_rules! finish {
            ($state:expr) => {{
                record!($state, None);
                return ExecutionOutcome {
                    log: CompletedArbitrageLog {
                        opportunity_id: opp.id.clone(),
                        asset: opp.asset.clone(),
                        quote_asset: opp.quote_asset.clone(),
                        buy_venue: opp.buy_venue.clone(),
                        sell_venue: opp.sell_venue.clone(),
                        network_used: analyzed.chosen_network.normalized_name.clone(),
                        buy_fill_price: Decimal::ZERO,
                        sell_fill_price: Decimal::ZERO,
                        initial_buy_cost_quote: Decimal::ZERO,
                        net_base_after_buy_fee: Decimal::ZERO,
                        base_received_on_sell_venue: Decimal::ZERO,
                        quote_received: Decimal::ZERO,
                        final_net_profit_quote: Decimal::ZERO,
                        final_net_profit_pct: Decimal::ZERO,
                        final_state: $state,
                        error_messages: errors,
                        started_at,
                        finished_at: Utc::now(),
                    },
                    transitions,
                };
            }};
        }

        if !analyzed.is_liquid {
            finish!(ExecutionState::SetupErrorNotLiquid);
        }
        if analyzed.potential_networks.is_empty() {
            finish!(ExecutionState::SetupErrorNoNetwork);
        }
        let route_key = Self::route_key(analyzed);
        if !self.active_routes.insert(route_key.clone()) {
            finish!(ExecutionState::SetupErrorAlreadyActive);
        }

        let outcome = self.run_legs(analyzed, scanner, started_at, &mut transitions, &mut errors).await;
        self.active_routes.remove(&route_key);
        outcome
    }

    async fn run_legs(
        &self,
        analyzed: &AnalyzedOpportunity,
        scanner: &Scanner,
        started_at: chrono::DateTime<Utc>,
        transitions: &mut Vec<TradeExecutionDetails>,
        errors: &mut Vec<String>,
    ) -> ExecutionOutcome {
        let opp = &analyzed.opportunity;
        let symbol = format!("{}/{}", opp.asset, opp.quote_asset);

        macro_rules! record {
            ($state:expr, $message:expr) => {
                transitions.push(TradeExecutionDetails {
                    opportunity_id: opp.id.clone(),
                    state: $state,
                    message: $message,
                    recorded_at: Utc::now(),
                })
            };
        }
        macro_rules! fail {
            ($state:expr, $err:expr) => {{
                errors.push($err);
                record!($state, Some(errors.last().unwrap().clone()));
                return ExecutionOutcome {
                    log: CompletedArbitrageLog {
                        opportunity_id: opp.id.clone(),
                        asset: opp.asset.clone(),
                        quote_asset: opp.quote_asset.clone(),
                        buy_venue: opp.buy_venue.clone(),
                        sell_venue: opp.sell_venue.clone(),
                        network_used: analyzed.chosen_network.normalized_name.clone(),
                        buy_fill_price: Decimal::ZERO,
                        sell_fill_price: Decimal::ZERO,
                        initial_buy_cost_quote: Decimal::ZERO,
                        net_base_after_buy_fee: Decimal::ZERO,
                        base_received_on_sell_venue: Decimal::ZERO,
                        quote_received: Decimal::ZERO,
                        final_net_profit_quote: Decimal::ZERO,
                        final_net_profit_pct: Decimal::ZERO,
                        final_state: $state,
                        error_messages: errors.clone(),
                        started_at,
                        finished_at: Utc::now(),
                    },
                    transitions: std::mem::take(transitions),
                };
            }};
        }

        record!(ExecutionState::BuyLegPending, None);

        let mut markets = HashMap::new();
        if let Some(m) = scanner.market_info(&opp.buy_venue, &symbol) {
            markets.insert(symbol.clone(), m.clone());
        }

        let target_cost = analyzed.trade_notional.max(self.config.min_effective_trade_quote);
        let locally_available = self
            .rebalancer
            .locally_convert_to_quote(
                &opp.buy_venue,
                &opp.quote_asset,
                target_cost,
                &opp.asset,
                &self.config.jit_liquid_assets,
                &self.balances,
                &markets,
            )
            .await;
        if locally_available < target_cost {
            match self
                .rebalancer
                .ensure_quote_for_trade(
                    &opp.buy_venue,
                    &opp.quote_asset,
                    target_cost,
                    self.config.reserve_buffer_quote,
                    self.config.transfer_fee_buffer_quote,
                    &self.config.jit_liquid_assets,
                    &self.balances,
                    &markets,
                    None,
                )
                .await
            {
                Ok(QuoteFundingOutcome::AlreadySufficient(_)) => {}
                Ok(QuoteFundingOutcome::TransferInitiated(op)) => {
                    let arrived = self.wait_for_arrival(&opp.buy_venue, &opp.quote_asset, op.quantity, self.config.jit_funding_wait_secs).await;
                    self.rebalancer.release(&op);
                    if !arrived {
                        fail!(
                            ExecutionState::JitFundingFailedArrivalTimeout,
                            format!("{} did not arrive on {} within {}s", opp.quote_asset, opp.buy_venue, self.config.jit_funding_wait_secs)
                        );
                    }
                }
                Err(e) => {
                    fail!(ExecutionState::JitFundingFailedNoSource, e.to_string());
                }
            }
        }

        let Some(buy_gateway) = self.gateways.get(&opp.buy_venue) else {
            fail!(ExecutionState::BuyLegFailedOrderRejected, format!("no gateway for {}", opp.buy_venue));
        };

        let buy_handle = if self.config.prefer_cost_based_buy && buy_gateway.supports_cost_based_buy() {
            buy_gateway.place_market_buy_with_cost(&symbol, analyzed.trade_notional).await
        } else {
            let quantum = resolve_quantum_for_asset(buy_gateway.as_ref(), &opp.asset, markets.get(&symbol).and_then(|m| m.amount_precision)).await;
            let amount = quantize_down(analyzed.trade_notional / opp.buy_price, quantum);
            if amount.is_zero() {
                fail!(ExecutionState::BuyLegFailedOrderRejected, "quantized buy amount is zero".to_string());
            }
            buy_gateway.place_market_buy(&symbol, amount).await
        };
        let buy_handle = match buy_handle {
            Ok(h) => h,
            Err(e) => fail!(ExecutionState::BuyLegFailedOrderRejected, e.to_string()),
        };

        let mut buy_status = match self
            .rebalancer
            .fetch_order_with_retry(buy_gateway.as_ref(), &opp.buy_venue, &buy_handle.venue_order_id, &symbol)
            .await
        {
            Ok(s) => s,
            Err(e) => fail!(ExecutionState::BuyLegFailedOrderRejected, e.to_string()),
        };
        if !buy_status.is_terminal() {
            if !self.config.hold_on_exhausted_open {
                self.rebalancer.cancel_best_effort(buy_gateway.as_ref(), &opp.buy_venue, &buy_status.venue_order_id, &symbol).await;
            }
            fail!(ExecutionState::BuyLegFailedOrderRejected, format!("buy order {} still open after retries", buy_status.venue_order_id));
        }
        if buy_status.is_canceled_zero_fill() || buy_status.filled_quantity.is_zero() {
            fail!(ExecutionState::BuyLegFailedZeroFill, "buy order filled zero quantity".to_string());
        }

        if self.config.retry_partial_buy_remainder {
            let target_base = analyzed.trade_notional / opp.buy_price;
            let remainder = target_base - buy_status.filled_quantity;
            if remainder > Decimal::ZERO {
                if let Ok(extra_handle) = buy_gateway.place_market_buy(&symbol, remainder).await {
                    if let Ok(extra_status) = self
                        .rebalancer
                        .fetch_order_with_retry(buy_gateway.as_ref(), &opp.buy_venue, &extra_handle.venue_order_id, &symbol)
                        .await
                    {
                        if extra_status.is_terminal() && !extra_status.filled_quantity.is_zero() {
                            buy_status = merge_fills(&buy_status, &extra_status);
                        } else if !extra_status.is_terminal() && !self.config.hold_on_exhausted_open {
                            self.rebalancer
                                .cancel_best_effort(buy_gateway.as_ref(), &opp.buy_venue, &extra_status.venue_order_id, &symbol)
                                .await;
                        }
                    }
                }
            }
        }
        record!(ExecutionState::BuyLegFilled, None);

        let net_base_after_buy_fee = buy_status.filled_quantity - buy_status.fee_amount.min(buy_status.filled_quantity);

        record!(ExecutionState::TransferLegPending, None);
        let network = &analyzed.chosen_network;
        let transfer_amount = net_base_after_buy_fee;
        let transfer_quantum = resolve_quantum_for_asset(buy_gateway.as_ref(), &opp.asset, None).await;
        let transfer_result = self
            .rebalancer
            .transfer_between_venues(&opp.asset, &opp.buy_venue, &opp.sell_venue, transfer_amount, transfer_quantum, network)
            .await;
        let transfer_op = match transfer_result {
            Ok(op) => op,
            Err(e @ crate::error::ArbError::NoCompatibleNetwork { .. }) => {
                fail!(ExecutionState::TransferLegFailedNoCompatibleNetwork, e.to_string())
            }
            Err(e @ crate::error::ArbError::MemoRequired { .. }) => {
                fail!(ExecutionState::TransferLegFailedMemoRequired, e.to_string())
            }
            Err(e @ crate::error::ArbError::AddressIncompatible { .. }) => {
                fail!(ExecutionState::TransferLegFailedNoAddress, e.to_string())
            }
            Err(e) => fail!(ExecutionState::TransferLegFailedWithdrawRejected, e.to_string()),
        };

        record!(ExecutionState::TransferLegInitiatedWaitingArrival, None);
        let timeout_secs = self.config.base_asset_transfer_wait_secs;
        if !self.wait_for_arrival(&opp.sell_venue, &opp.asset, transfer_op.quantity, timeout_secs).await {
            self.rebalancer.release(&transfer_op);
            fail!(ExecutionState::TransferLegFailedArrivalTimeout, format!("{} did not arrive within {timeout_secs}s", opp.asset));
        }
        self.rebalancer.release(&transfer_op);

        record!(ExecutionState::SellLegPending, None);
        let Some(sell_gateway) = self.gateways.get(&opp.sell_venue) else {
            fail!(ExecutionState::SellLegFailedOrderRejected, format!("no gateway for {}", opp.sell_venue));
        };
        let sell_amount_raw = self.balances.account_free(&opp.sell_venue, &opp.asset, AccountPurpose::Trading).await.unwrap_or(transfer_op.quantity);
        let sell_quantum = resolve_quantum_for_asset(
            sell_gateway.as_ref(),
            &opp.asset,
            scanner.market_info(&opp.sell_venue, &symbol).and_then(|m| m.amount_precision),
        )
        .await;
        let sell_amount = quantize_down(sell_amount_raw, sell_quantum);
        if let Some(m) = scanner.market_info(&opp.sell_venue, &symbol) {
            if sell_amount < m.min_amount {
                fail!(ExecutionState::SellLegFailedMinAmount, format!("{sell_amount} below minimum {}", m.min_amount));
            }
        }

        let sell_handle = match sell_gateway.place_market_sell(&symbol, sell_amount).await {
            Ok(h) => h,
            Err(e) => fail!(ExecutionState::SellLegFailedOrderRejected, e.to_string()),
        };
        let sell_status = match self
            .rebalancer
            .fetch_order_with_retry(sell_gateway.as_ref(), &opp.sell_venue, &sell_handle.venue_order_id, &symbol)
            .await
        {
            Ok(s) => s,
            Err(e) => fail!(ExecutionState::SellLegFailedOrderRejected, e.to_string()),
        };
        if !sell_status.is_terminal() {
            if !self.config.hold_on_exhausted_open {
                self.rebalancer.cancel_best_effort(sell_gateway.as_ref(), &opp.sell_venue, &sell_status.venue_order_id, &symbol).await;
            }
            fail!(ExecutionState::SellLegFailedOrderRejected, format!("sell order {} still open after retries", sell_status.venue_order_id));
        }
        if sell_status.is_canceled_zero_fill() || sell_status.filled_quantity.is_zero() {
            fail!(ExecutionState::SellLegFailedZeroFill, "sell order filled zero quantity".to_string());
        }

        let quote_received = sell_status.cost_quote - sell_status.fee_amount.min(sell_status.cost_quote);
        let final_net_profit_quote = quote_received - buy_status.cost_quote;
        let final_net_profit_pct = if buy_status.cost_quote.is_zero() {
            Decimal::ZERO
        } else {
            final_net_profit_quote / buy_status.cost_quote * Decimal::ONE_HUNDRED
        };
        let final_state = if final_net_profit_quote > Decimal::ZERO {
            ExecutionState::CompletedSuccess
        } else if final_net_profit_quote < Decimal::ZERO {
            ExecutionState::CompletedLoss
        } else {
            ExecutionState::CompletedUnknownProfit
        };
        record!(final_state, None);

        ExecutionOutcome {
            log: CompletedArbitrageLog {
                opportunity_id: opp.id.clone(),
                asset: opp.asset.clone(),
                quote_asset: opp.quote_asset.clone(),
                buy_venue: opp.buy_venue.clone(),
                sell_venue: opp.sell_venue.clone(),
                network_used: network.normalized_name.clone(),
                buy_fill_price: buy_status.average_fill_price,
                sell_fill_price: sell_status.average_fill_price,
                initial_buy_cost_quote: buy_status.cost_quote,
                net_base_after_buy_fee,
                base_received_on_sell_venue: sell_amount,
                quote_received,
                final_net_profit_quote,
                final_net_profit_pct,
                final_state,
                error_messages: errors.clone(),
                started_at,
                finished_at: Utc::now(),
            },
            transitions: std::mem::take(transitions),
        }
    }

    /// Polls the sell venue's trading-account free balance for `asset`
    /// until it reaches at least `expected_amount` or `timeout_secs`
    /// elapses.
    async fn wait_for_arrival(&self, venue: &str, asset: &str, expected_amount: Decimal, timeout_secs: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            let free = self.balances.account_free(venue, asset, AccountPurpose::Trading).await.unwrap_or(Decimal::ZERO);
            if free >= expected_amount {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(self.config.arrival_poll_interval_secs.max(1))).await;
        }
    }
}

/// Combines an initial partial fill with a follow-up fill of the same
/// order's unfilled remainder into one logical fill, averaging price
/// over total cost and summing quantity and fees.
fn merge_fills(first: &OrderStatus, second: &OrderStatus) -> OrderStatus {
    let filled_quantity = first.filled_quantity + second.filled_quantity;
    let cost_quote = first.cost_quote + second.cost_quote;
    OrderStatus {
        venue_order_id: first.venue_order_id.clone(),
        filled_quantity,
        average_fill_price: if filled_quantity.is_zero() { first.average_fill_price } else { cost_quote / filled_quantity },
        cost_quote,
        fee_amount: first.fee_amount + second.fee_amount,
        fee_currency: first.fee_currency.clone(),
        is_complete: true,
        is_canceled: false,
        is_rejected: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::DryRunGateway;
    use crate::network_selector::NetworkSelectorTables;
    use crate::rebalancer::{RebalancerConfig, RebalancerTables};
    use crate::types::{DepthLevel, MarketInfo, NetworkOption, NetworkRoute, NetworkSource, OrderBookSnapshot, Opportunity};
    use rust_decimal_macros::dec;
    use std::collections::{HashMap as StdHashMap, HashSet};

    fn market(symbol: &str) -> MarketInfo {
        MarketInfo {
            symbol: symbol.into(),
            base: symbol.split('/').next().unwrap().into(),
            quote: symbol.split('/').nth(1).unwrap().into(),
            active: true,
            is_spot: true,
            taker_fee: dec!(0.001),
            min_amount: dec!(0.0001),
            min_cost: dec!(10),
            amount_precision: None,
        }
    }

    fn route() -> NetworkRoute {
        NetworkRoute {
            normalized_name: "ERC20".into(),
            withdraw_code_on_from: "ERC20".into(),
            deposit_code_on_to: "ERC20".into(),
            fee_native: dec!(0.0001),
            fee_currency: "BTC".into(),
            fee_quote: dec!(5),
            min_withdrawal_native: dec!(0.0001),
            source: NetworkSource::LiveMetadata,
            priority_score_token: 0,
            priority_score_general: 0,
        }
    }

    fn analyzed() -> AnalyzedOpportunity {
        AnalyzedOpportunity {
            opportunity: Opportunity {
                id: "binance:kucoin:BTC/USDT".into(),
                asset: "BTC".into(),
                quote_asset: "USDT".into(),
                buy_venue: "binance".into(),
                sell_venue: "kucoin".into(),
                buy_price: dec!(100),
                sell_price: dec!(110),
                gross_spread_pct: dec!(10),
                detected_at: Utc::now(),
            },
            buy_fee_pct: dec!(0.1),
            sell_fee_pct: dec!(0.1),
            withdrawal_fee_quote: dec!(5),
            net_pct: dec!(9.7),
            potential_networks: vec![route()],
            chosen_network: route(),
            stability_count: 3,
            is_stable: true,
            is_liquid: true,
            trade_notional: dec!(100),
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            quote_asset: "USDT".into(),
            trade_amount_quote: dec!(100),
            min_effective_trade_quote: dec!(20),
            reserve_buffer_quote: dec!(5),
            transfer_fee_buffer_quote: dec!(2),
            jit_min_conversion_quote: dec!(10),
            jit_funding_wait_secs: 1,
            base_asset_transfer_wait_secs: 1,
            arrival_poll_interval_secs: 1,
            jit_liquid_assets: vec![],
            prefer_cost_based_buy: true,
            retry_partial_buy_remainder: false,
            hold_on_exhausted_open: false,
        }
    }

    fn rebalancer_tables() -> RebalancerTables {
        RebalancerTables {
            network_aliases: StdHashMap::new(),
            token_network_preference: StdHashMap::new(),
            network_preference: Vec::new(),
            default_withdraw_fees: StdHashMap::new(),
            path_blacklist: HashSet::new(),
            whitelist: HashSet::new(),
            enforce_whitelist: false,
            memo_required_assets: HashSet::new(),
            token_network_restriction: StdHashMap::new(),
        }
    }

    fn rebalancer_config() -> RebalancerConfig {
        RebalancerConfig {
            order_fetch_attempts: 3,
            order_fetch_delay_ms: 1,
            min_liquidity_quote: dec!(10),
            slippage_pct: dec!(5),
            jit_min_conversion_quote: dec!(10),
        }
    }

    async fn setup() -> (Executor, Scanner) {
        let binance = Arc::new(DryRunGateway::new("binance"));
        binance.seed_trading_balance("USDT", dec!(1000));
        binance.seed_market(market("BTC/USDT"));
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
        binance.seed_withdrawal_balance("BTC", dec!(10));
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
        kucoin.seed_market(market("BTC/USDT"));
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
        // Simulate the transfer having already arrived: seed the base
        // asset directly into kucoin's trading balance up front.
        kucoin.seed_trading_balance("BTC", dec!(1));

        let mut gateways: StdHashMap<VenueId, Arc<dyn ExchangeGateway>> = StdHashMap::new();
        gateways.insert("binance".into(), binance);
        gateways.insert("kucoin".into(), kucoin);

        let mut scanner = Scanner::new("USDT", dec!(1), dec!(20));
        scanner.init_markets(&gateways).await;

        let pricing = crate::balance::PricingTable {
            quote_asset: "USDT".to_string(),
            stablecoins: HashSet::new(),
            static_prices: StdHashMap::new(),
        };
        let balances = BalanceManager::new(gateways.clone(), "binance".into(), pricing, Duration::from_secs(60));
        let rebalancer = Rebalancer::new(gateways.clone(), rebalancer_tables(), rebalancer_config());
        let executor = Executor::new(gateways, rebalancer, balances, config());
        (executor, scanner)
    }

    /// Same topology as [`setup`], but the buy leg's order never reaches
    /// a terminal state (used to exercise the cancel/hold-open policy).
    async fn setup_stuck_open(cfg: ExecutorConfig) -> (Executor, Scanner, Arc<DryRunGateway>) {
        let binance = Arc::new(DryRunGateway::new("binance"));
        binance.seed_trading_balance("USDT", dec!(1000));
        binance.seed_market(market("BTC/USDT"));
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
        binance.seed_withdrawal_balance("BTC", dec!(10));
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
        binance.force_stuck_open("BTC/USDT");

        let kucoin = Arc::new(DryRunGateway::new("kucoin"));
        kucoin.seed_market(market("BTC/USDT"));
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
        kucoin.seed_trading_balance("BTC", dec!(1));

        let mut gateways: StdHashMap<VenueId, Arc<dyn ExchangeGateway>> = StdHashMap::new();
        gateways.insert("binance".into(), binance.clone());
        gateways.insert("kucoin".into(), kucoin);

        let mut scanner = Scanner::new("USDT", dec!(1), dec!(20));
        scanner.init_markets(&gateways).await;

        let pricing = crate::balance::PricingTable {
            quote_asset: "USDT".to_string(),
            stablecoins: HashSet::new(),
            static_prices: StdHashMap::new(),
        };
        let balances = BalanceManager::new(gateways.clone(), "binance".into(), pricing, Duration::from_secs(60));
        let rebalancer = Rebalancer::new(gateways.clone(), rebalancer_tables(), rebalancer_config());
        let executor = Executor::new(gateways, rebalancer, balances, cfg);
        (executor, scanner, binance)
    }

    #[tokio::test]
    async fn buy_leg_still_open_after_retries_is_canceled_by_default() {
        let (executor, scanner, binance) = setup_stuck_open(config()).await;
        let outcome = executor.execute(&analyzed(), &scanner).await;
        assert_eq!(outcome.log.final_state, ExecutionState::BuyLegFailedOrderRejected);
        assert!(outcome.log.error_messages.iter().any(|m| m.contains("still open")));
        let status = binance.get_order_status("1", "BTC/USDT").await.unwrap();
        assert!(status.is_canceled, "order should have been canceled");
    }

    #[tokio::test]
    async fn buy_leg_still_open_after_retries_is_held_when_configured() {
        let mut cfg = config();
        cfg.hold_on_exhausted_open = true;
        let (executor, scanner, binance) = setup_stuck_open(cfg).await;
        let outcome = executor.execute(&analyzed(), &scanner).await;
        assert_eq!(outcome.log.final_state, ExecutionState::BuyLegFailedOrderRejected);
        assert!(outcome.log.error_messages.iter().any(|m| m.contains("still open")));
        let status = binance.get_order_status("1", "BTC/USDT").await.unwrap();
        assert!(!status.is_canceled, "order should have been left resting, not canceled");
    }

    #[tokio::test]
    async fn retry_partial_buy_remainder_tops_up_a_partial_fill() {
        let binance = Arc::new(DryRunGateway::new("binance"));
        binance.seed_trading_balance("USDT", dec!(1000));
        binance.seed_market(market("BTC/USDT"));
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
        binance.seed_withdrawal_balance("BTC", dec!(10));
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
        // Every order placed on this symbol (both the initial buy and
        // the retried remainder) fills exactly 0.4 BTC.
        binance.force_fill("BTC/USDT", dec!(0.4));

        let kucoin = Arc::new(DryRunGateway::new("kucoin"));
        kucoin.seed_market(market("BTC/USDT"));
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
        kucoin.seed_trading_balance("BTC", dec!(1));

        let mut gateways: StdHashMap<VenueId, Arc<dyn ExchangeGateway>> = StdHashMap::new();
        gateways.insert("binance".into(), binance);
        gateways.insert("kucoin".into(), kucoin);

        let mut scanner = Scanner::new("USDT", dec!(1), dec!(20));
        scanner.init_markets(&gateways).await;

        let pricing =
            crate::balance::PricingTable { quote_asset: "USDT".to_string(), stablecoins: HashSet::new(), static_prices: StdHashMap::new() };
        let balances = BalanceManager::new(gateways.clone(), "binance".into(), pricing, Duration::from_secs(60));
        let rebalancer = Rebalancer::new(gateways.clone(), rebalancer_tables(), rebalancer_config());
        let mut cfg = config();
        cfg.retry_partial_buy_remainder = true;
        let executor = Executor::new(gateways, rebalancer, balances, cfg);

        let outcome = executor.execute(&analyzed(), &scanner).await;
        assert!(!outcome.log.final_state.is_failure(), "{:?}: {:?}", outcome.log.final_state, outcome.log.error_messages);
        assert_eq!(outcome.log.net_base_after_buy_fee, dec!(0.8));
    }

    #[tokio::test]
    async fn happy_path_completes_successfully() {
        let (executor, scanner) = setup().await;
        let outcome = executor.execute(&analyzed(), &scanner).await;
        assert!(outcome.log.final_state.is_terminal());
        assert!(!outcome.log.final_state.is_failure(), "{:?}: {:?}", outcome.log.final_state, outcome.log.error_messages);
    }

    #[tokio::test]
    async fn not_liquid_short_circuits_before_any_leg() {
        let (executor, scanner) = setup().await;
        let mut opp = analyzed();
        opp.is_liquid = false;
        let outcome = executor.execute(&opp, &scanner).await;
        assert_eq!(outcome.log.final_state, ExecutionState::SetupErrorNotLiquid);
    }

    #[tokio::test]
    async fn no_network_short_circuits() {
        let (executor, scanner) = setup().await;
        let mut opp = analyzed();
        opp.potential_networks.clear();
        let outcome = executor.execute(&opp, &scanner).await;
        assert_eq!(outcome.log.final_state, ExecutionState::SetupErrorNoNetwork);
    }

    #[tokio::test]
    async fn arrival_timeout_fails_cleanly() {
        let (executor, scanner) = setup().await;
        // No BTC seeded on kucoin's trading balance this time, so the
        // arrival wait exhausts its 1s timeout.
        let binance = Arc::new(DryRunGateway::new("binance"));
        binance.seed_trading_balance("USDT", dec!(1000));
        binance.seed_market(market("BTC/USDT"));
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
        binance.seed_withdrawal_balance("BTC", dec!(10));
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
        kucoin.seed_market(market("BTC/USDT"));
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
        let mut gateways: StdHashMap<VenueId, Arc<dyn ExchangeGateway>> = StdHashMap::new();
        gateways.insert("binance".into(), binance);
        gateways.insert("kucoin".into(), kucoin);
        let mut fresh_scanner = Scanner::new("USDT", dec!(1), dec!(20));
        fresh_scanner.init_markets(&gateways).await;
        let pricing = crate::balance::PricingTable {
            quote_asset: "USDT".to_string(),
            stablecoins: HashSet::new(),
            static_prices: StdHashMap::new(),
        };
        let balances = BalanceManager::new(gateways.clone(), "binance".into(), pricing, Duration::from_secs(60));
        let rebalancer = Rebalancer::new(gateways.clone(), rebalancer_tables(), rebalancer_config());
        let fresh_executor = Executor::new(gateways, rebalancer, balances, config());

        let _ = &scanner;
        let _ = &executor;
        let outcome = fresh_executor.execute(&analyzed(), &fresh_scanner).await;
        assert_eq!(outcome.log.final_state, ExecutionState::TransferLegFailedArrivalTimeout);
    }
}
