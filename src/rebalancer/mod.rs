//! Rebalancer: moves capital between venues and sub-accounts, and
//! converts idle assets into quote currency when a leg needs funding
//! sooner than an opportunity's own sell proceeds would provide it.
//!
//! Named for what they do rather than when they're called:
//! [`Rebalancer::internal_transfer`] (same-venue sub-account move),
//! [`Rebalancer::transfer_between_venues`] (on-chain withdrawal +
//! deposit), [`Rebalancer::convert_to_quote`] (market sell into the
//! quote asset with a retrying order-status fetch),
//! [`Rebalancer::locally_convert_to_quote`] (same-venue JIT funding from
//! another asset already held there), and
//! [`Rebalancer::ensure_quote_for_trade`] (cross-venue JIT funding: pull
//! quote from wherever else has it spare, or convert it there first).

use crate::balance::BalanceManager;
use crate::depth::{check_depth_on_venue, DepthVerdict};
use crate::error::{ArbError, ArbResult};
use crate::gateway::{AccountPurpose, DepositAddress, ExchangeGateway, OrderStatus};
use crate::network_selector::{select_routes, NetworkSelectorTables};
use crate::quantize::quantize_down;
use crate::toml_config::PathBlacklistEntry;
use crate::types::{MarketInfo, NetworkRoute, RebalanceOperation, RebalanceStatus, Side, VenueId};
use anyhow::anyhow;
use chrono::Utc;
use dashmap::DashSet;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct RebalancerTables {
    pub network_aliases: HashMap<String, String>,
    pub token_network_preference: HashMap<String, Vec<String>>,
    pub network_preference: Vec<String>,
    pub default_withdraw_fees: HashMap<String, Decimal>,
    pub path_blacklist: HashSet<PathBlacklistEntry>,
    pub whitelist: HashSet<PathBlacklistEntry>,
    pub enforce_whitelist: bool,
    /// Assets for which a deposit address without a memo/tag is a hard
    /// failure rather than a best-effort attempt, since funds sent
    /// without one are unrecoverable on these rails.
    pub memo_required_assets: HashSet<String>,
    pub token_network_restriction: HashMap<(String, String), Vec<String>>,
}

pub struct RebalancerConfig {
    pub order_fetch_attempts: u32,
    pub order_fetch_delay_ms: u64,
    pub min_liquidity_quote: Decimal,
    pub slippage_pct: Decimal,
    pub jit_min_conversion_quote: Decimal,
}

pub struct Rebalancer {
    gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>>,
    tables: RebalancerTables,
    config: RebalancerConfig,
    /// Dedup set of `asset|from|to|amount` keys for transfers currently
    /// in flight, so two concurrent execution paths can't launch the
    /// same withdrawal twice.
    in_flight: DashSet<String>,
}

impl Rebalancer {
    pub fn new(
        gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>>,
        tables: RebalancerTables,
        config: RebalancerConfig,
    ) -> Self {
        Self { gateways, tables, config, in_flight: DashSet::new() }
    }

    fn gateway(&self, venue: &str) -> ArbResult<&Arc<dyn ExchangeGateway>> {
        self.gateways
            .get(venue)
            .ok_or_else(|| ArbError::Config(format!("no gateway configured for venue {venue}")))
    }

    pub async fn internal_transfer(
        &self,
        venue: &str,
        asset: &str,
        amount: Decimal,
        from: AccountPurpose,
        to: AccountPurpose,
    ) -> ArbResult<()> {
        self.gateway(venue)?.internal_transfer(asset, amount, from, to).await?;
        Ok(())
    }

    /// Resolves the cheapest route between two venues when the caller
    /// hasn't already pinned one (the executor, once a transfer leg is
    /// underway, does not re-select — see [`crate::executor`]).
    pub async fn resolve_network(
        &self,
        asset: &str,
        from_venue: &str,
        to_venue: &str,
        amount: Option<Decimal>,
        fee_prices: &HashMap<String, Decimal>,
    ) -> ArbResult<NetworkRoute> {
        let from_gw = self.gateway(from_venue)?;
        let to_gw = self.gateway(to_venue)?;
        let from_networks = from_gw.get_networks(asset).await?;
        let to_networks = to_gw.get_networks(asset).await?;
        let tables = NetworkSelectorTables {
            network_aliases: &self.tables.network_aliases,
            token_network_preference: &self.tables.token_network_preference,
            network_preference: &self.tables.network_preference,
            default_withdraw_fees: &self.tables.default_withdraw_fees,
            path_blacklist: &self.tables.path_blacklist,
            whitelist: &self.tables.whitelist,
            enforce_whitelist: self.tables.enforce_whitelist,
            token_network_restriction: &self.tables.token_network_restriction,
        };
        let routes = select_routes(asset, from_venue, to_venue, amount, &from_networks, &to_networks, fee_prices, &tables);
        routes.into_iter().next().ok_or_else(|| ArbError::NoCompatibleNetwork {
            source_venue: from_venue.to_string(),
            dest_venue: to_venue.to_string(),
            asset: asset.to_string(),
        })
    }

    fn validate_address(&self, venue: &str, asset: &str, network: &NetworkRoute, address: DepositAddress) -> ArbResult<DepositAddress> {
        if self.tables.memo_required_assets.contains(asset) && address.memo.is_none() {
            return Err(ArbError::MemoRequired {
                venue: venue.to_string(),
                asset: asset.to_string(),
                network: network.normalized_name.clone(),
            });
        }
        Ok(address)
    }

    /// Attempt order: (a) ask for an address scoped to the
    /// chosen network; (b) fall back to a no-hint lookup and accept it
    /// if the venue's reported network matches, or if the venue only
    /// ever hands back its single default address (spec.md §4.4.2: a
    /// `DEFAULT`-reported address is compatible with any specific
    /// network request); (c) explicitly create one if the venue
    /// supports that and neither lookup worked.
    pub async fn acquire_deposit_address(&self, to_venue: &str, asset: &str, network: &NetworkRoute) -> ArbResult<DepositAddress> {
        let gw = self.gateway(to_venue)?;

        if let Ok(addr) = gw.get_deposit_address(asset, Some(&network.deposit_code_on_to)).await {
            return self.validate_address(to_venue, asset, network, addr);
        }

        if let Ok(addr) = gw.get_deposit_address(asset, None).await {
            let reported = crate::network_alias::normalize(&addr.network, &self.tables.network_aliases);
            if deposit_network_compatible(&network.normalized_name, &reported) {
                return self.validate_address(to_venue, asset, network, addr);
            }
        }

        if gw.supports_create_deposit_address() {
            let addr = gw.create_deposit_address(asset, &network.deposit_code_on_to).await?;
            return self.validate_address(to_venue, asset, network, addr);
        }

        Err(ArbError::AddressIncompatible {
            venue: to_venue.to_string(),
            asset: asset.to_string(),
            requested: network.normalized_name.clone(),
            returned: "none".to_string(),
        })
    }

    /// Quantizes `raw_amount`, de-duplicates against in-flight
    /// transfers, resolves a deposit address, and withdraws.
    pub async fn transfer_between_venues(
        &self,
        asset: &str,
        from_venue: &str,
        to_venue: &str,
        raw_amount: Decimal,
        quantum: Decimal,
        network: &NetworkRoute,
    ) -> ArbResult<RebalanceOperation> {
        let amount = quantize_down(raw_amount, quantum);
        if amount <= Decimal::ZERO {
            return Err(ArbError::BelowQuantum { asset: asset.to_string(), amount: amount.to_string() });
        }

        let dedup_key = RebalanceOperation::dedup_key(asset, from_venue, to_venue, amount);
        if !self.in_flight.insert(dedup_key.clone()) {
            return Err(ArbError::Config(format!("transfer {dedup_key} is already in flight")));
        }

        let result = self.do_transfer(asset, from_venue, to_venue, amount, network).await;
        if result.is_err() {
            self.in_flight.remove(&dedup_key);
        }
        result
    }

    async fn do_transfer(
        &self,
        asset: &str,
        from_venue: &str,
        to_venue: &str,
        amount: Decimal,
        network: &NetworkRoute,
    ) -> ArbResult<RebalanceOperation> {
        let address = self.acquire_deposit_address(to_venue, asset, network).await?;
        let from_gw = self.gateway(from_venue)?;
        let venue_withdrawal_id = from_gw.withdraw(asset, &network.withdraw_code_on_from, amount, &address).await?;
        info!(asset, from_venue, to_venue, %amount, network = network.normalized_name, "withdrawal initiated");
        Ok(RebalanceOperation {
            id: venue_withdrawal_id,
            asset: asset.to_string(),
            source_venue: from_venue.to_string(),
            dest_venue: to_venue.to_string(),
            network: network.normalized_name.clone(),
            quantity: amount,
            status: RebalanceStatus::Initiated,
            initiated_at: Utc::now(),
        })
    }

    /// Marks a transfer as no longer occupying its dedup slot, whether
    /// it completed or was abandoned.
    pub fn release(&self, op: &RebalanceOperation) {
        self.in_flight.remove(&RebalanceOperation::dedup_key(&op.asset, &op.source_venue, &op.dest_venue, op.quantity));
    }

    /// Market-sells `amount` of `asset` into quote on `venue`, checking
    /// depth first, quantizing to the asset's real quantum, then polls
    /// the resulting order to a terminal state. A non-terminal order
    /// after retry exhaustion is canceled best-effort before erroring.
    pub async fn convert_to_quote(
        &self,
        venue: &str,
        asset: &str,
        quote_asset: &str,
        amount: Decimal,
        market: &MarketInfo,
        expected_notional_quote: Decimal,
    ) -> ArbResult<OrderStatus> {
        let gw = self.gateway(venue)?;
        let quantum = crate::quantize::resolve_quantum_for_asset(gw.as_ref(), asset, market.amount_precision).await;
        let amount = quantize_down(amount, quantum);
        if amount < market.min_amount {
            return Err(ArbError::BelowQuantum { asset: asset.to_string(), amount: amount.to_string() });
        }
        let symbol = format!("{asset}/{quote_asset}");

        let depth = check_depth_on_venue(
            gw.as_ref(),
            &symbol,
            Side::Sell,
            expected_notional_quote,
            self.config.min_liquidity_quote,
            self.config.slippage_pct,
        )
        .await;
        if depth != DepthVerdict::Sufficient {
            return Err(ArbError::InsufficientDepth {
                venue: venue.to_string(),
                symbol,
                requested: expected_notional_quote.to_string(),
                available: format!("{depth:?}"),
            });
        }

        let handle = gw.place_market_sell(&symbol, amount).await?;
        let status = self.fetch_order_with_retry(gw.as_ref(), venue, &handle.venue_order_id, &symbol).await?;
        if !status.is_terminal() {
            self.cancel_best_effort(gw.as_ref(), venue, &handle.venue_order_id, &symbol).await;
            return Err(ArbError::Other(anyhow!(
                "conversion order {} on {venue} did not reach a terminal state",
                handle.venue_order_id
            )));
        }
        if status.is_canceled_zero_fill() {
            return Err(ArbError::CanceledZeroFill { venue: venue.to_string(), order_id: handle.venue_order_id });
        }
        Ok(status)
    }

    /// Polls `get_order_status` until it reports a terminal state,
    /// tolerating transport retryable errors and a brief grace window
    /// where the order hasn't shown up on the venue's API yet (spec
    /// §4.5.2). Returns the last observed status on exhaustion rather
    /// than erroring, so the caller can apply its own cancellation
    /// policy to a still-open order instead of having one forced here.
    pub async fn fetch_order_with_retry(
        &self,
        gw: &dyn ExchangeGateway,
        venue: &str,
        order_id: &str,
        symbol: &str,
    ) -> ArbResult<OrderStatus> {
        let mut last_status: Option<OrderStatus> = None;
        for attempt in 0..self.config.order_fetch_attempts {
            match gw.get_order_status(order_id, symbol).await {
                Ok(status) if status.is_terminal() => return Ok(status),
                Ok(open_or_partial) => {
                    last_status = Some(open_or_partial);
                    tokio::time::sleep(Duration::from_millis(self.config.order_fetch_delay_ms)).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(venue, order_id, attempt, error = %e, "order fetch failed, retrying");
                    tokio::time::sleep(Duration::from_millis(self.config.order_fetch_delay_ms)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        last_status.ok_or_else(|| {
            ArbError::Other(anyhow!(
                "order {order_id} on {venue} returned no status after {} attempts",
                self.config.order_fetch_attempts
            ))
        })
    }

    /// Best-effort cancel of a non-terminal order; failures are logged
    /// and swallowed rather than propagated, since the caller is already
    /// on a failure path regardless of whether the cancel itself lands.
    pub async fn cancel_best_effort(&self, gw: &dyn ExchangeGateway, venue: &str, order_id: &str, symbol: &str) {
        if let Err(e) = gw.cancel_order(order_id, symbol).await {
            warn!(venue, order_id, error = %e, "best-effort cancel failed");
        }
    }

    /// Resolves the quote-denominated price of every fee currency a
    /// transfer between these two venues might charge in, the way
    /// `Analyzer::enrich` does for a leg's own network pick.
    async fn fee_prices_for(
        &self,
        asset: &str,
        from_venue: &str,
        to_venue: &str,
        balances: &BalanceManager,
    ) -> ArbResult<HashMap<String, Decimal>> {
        let from_gw = self.gateway(from_venue)?;
        let to_gw = self.gateway(to_venue)?;
        let from_networks = from_gw.get_networks(asset).await.unwrap_or_default();
        let to_networks = to_gw.get_networks(asset).await.unwrap_or_default();
        let mut fee_prices = HashMap::new();
        for currency in from_networks.iter().chain(to_networks.iter()).map(|n| &n.fee_currency) {
            if !fee_prices.contains_key(currency) {
                fee_prices.insert(currency.clone(), balances.price_of(currency).await);
            }
        }
        Ok(fee_prices)
    }

    /// Resolves a route and the asset's real quantum, then initiates the
    /// withdrawal. Returns `None` instead of propagating on any failure
    /// so [`Self::ensure_quote_for_trade`]'s venue walk can just try the
    /// next candidate source.
    async fn attempt_cross_venue_transfer(
        &self,
        asset: &str,
        from_venue: &str,
        to_venue: &str,
        amount: Decimal,
        balances: &BalanceManager,
    ) -> Option<RebalanceOperation> {
        let fee_prices = self.fee_prices_for(asset, from_venue, to_venue, balances).await.ok()?;
        let route = self.resolve_network(asset, from_venue, to_venue, Some(amount), &fee_prices).await.ok()?;
        let gw = self.gateway(from_venue).ok()?;
        let quantum = crate::quantize::resolve_quantum_for_asset(gw.as_ref(), asset, None).await;
        match self.transfer_between_venues(asset, from_venue, to_venue, amount, quantum, &route).await {
            Ok(op) => Some(op),
            Err(e) => {
                warn!(from_venue, to_venue, asset, error = %e, "cross-venue quote transfer attempt failed");
                None
            }
        }
    }

    /// Converts other JIT-liquid assets already sitting on `venue` into
    /// quote currency until `needed_quote` is covered or the liquid
    /// asset list is exhausted — the buy leg's own-venue funding step,
    /// tried before reaching across venues via
    /// [`Self::ensure_quote_for_trade`] (spec.md §4.4, local tier).
    /// Returns the quote balance actually available afterward.
    pub async fn locally_convert_to_quote(
        &self,
        venue: &str,
        quote_asset: &str,
        needed_quote: Decimal,
        exclude_asset: &str,
        jit_liquid_assets: &[String],
        balances: &BalanceManager,
        markets: &HashMap<String, MarketInfo>,
    ) -> Decimal {
        let mut available = balances.account_free(venue, quote_asset, AccountPurpose::Trading).await.unwrap_or(Decimal::ZERO);
        if available >= needed_quote {
            return available;
        }

        for asset in jit_liquid_assets {
            if available >= needed_quote {
                break;
            }
            if asset.eq_ignore_ascii_case(exclude_asset) || asset.eq_ignore_ascii_case(quote_asset) {
                continue;
            }
            let free = balances.account_free(venue, asset, AccountPurpose::Trading).await.unwrap_or(Decimal::ZERO);
            if free.is_zero() {
                continue;
            }
            let shortfall = needed_quote - available;
            if shortfall < self.config.jit_min_conversion_quote {
                continue;
            }
            let symbol = format!("{asset}/{quote_asset}");
            let Some(market) = markets.get(&symbol) else { continue };
            match self.convert_to_quote(venue, asset, quote_asset, free, market, shortfall).await {
                Ok(status) => {
                    available += status.cost_quote - status.fee_amount.min(status.cost_quote);
                }
                Err(e) => {
                    warn!(venue, asset, error = %e, "local JIT conversion attempt failed");
                }
            }
        }

        available
    }

    /// Funds `target_venue`'s trading-account quote balance from
    /// elsewhere when local conversion wasn't enough: walks candidate
    /// source venues whose free quote, net of `reserve_buffer_quote`,
    /// covers the deficit plus `transfer_fee_buffer_quote`, and
    /// initiates a transfer from the first one that qualifies
    /// (`preferred_source`, if given and eligible, is tried first).
    /// Failing that, converts a configured JIT-liquid asset on some
    /// source venue into quote there and transfers the proceeds instead
    /// (spec.md §4.4, cross-venue tier).
    ///
    /// Returns [`QuoteFundingOutcome::TransferInitiated`] rather than a
    /// balance: the caller still has to wait for arrival before the
    /// funds are usable on `target_venue`.
    #[allow(clippy::too_many_arguments)]
    pub async fn ensure_quote_for_trade(
        &self,
        target_venue: &str,
        quote_asset: &str,
        needed_quote: Decimal,
        reserve_buffer_quote: Decimal,
        transfer_fee_buffer_quote: Decimal,
        jit_liquid_assets: &[String],
        balances: &BalanceManager,
        markets: &HashMap<String, MarketInfo>,
        preferred_source: Option<&str>,
    ) -> ArbResult<QuoteFundingOutcome> {
        let available = balances.account_free(target_venue, quote_asset, AccountPurpose::Trading).await.unwrap_or(Decimal::ZERO);
        if available >= needed_quote {
            return Ok(QuoteFundingOutcome::AlreadySufficient(available));
        }
        let required = (needed_quote - available) + transfer_fee_buffer_quote;

        let mut candidates: Vec<String> = self.gateways.keys().filter(|v| v.as_str() != target_venue).cloned().collect();
        candidates.sort_by_key(|v| if Some(v.as_str()) == preferred_source { 0 } else { 1 });

        for source in &candidates {
            let free = balances.account_free(source, quote_asset, AccountPurpose::Trading).await.unwrap_or(Decimal::ZERO);
            if free - reserve_buffer_quote < required {
                continue;
            }
            if let Some(op) = self.attempt_cross_venue_transfer(quote_asset, source, target_venue, required, balances).await {
                return Ok(QuoteFundingOutcome::TransferInitiated(op));
            }
        }

        for source in &candidates {
            for asset in jit_liquid_assets {
                if asset.eq_ignore_ascii_case(quote_asset) {
                    continue;
                }
                let holding = balances.account_free(source, asset, AccountPurpose::Trading).await.unwrap_or(Decimal::ZERO);
                if holding.is_zero() {
                    continue;
                }
                let holding_value = holding * balances.price_of(asset).await;
                if holding_value < self.config.jit_min_conversion_quote {
                    continue;
                }
                let symbol = format!("{asset}/{quote_asset}");
                let Some(market) = markets.get(&symbol) else { continue };
                let yielded = match self.convert_to_quote(source, asset, quote_asset, holding, market, required).await {
                    Ok(status) => status.cost_quote - status.fee_amount.min(status.cost_quote),
                    Err(e) => {
                        warn!(%source, asset, error = %e, "JIT conversion on source venue failed");
                        continue;
                    }
                };
                if yielded < required {
                    warn!(%source, asset, %yielded, %required, "JIT conversion yield did not cover target deficit");
                    continue;
                }
                if let Some(op) = self.attempt_cross_venue_transfer(quote_asset, source, target_venue, required, balances).await {
                    return Ok(QuoteFundingOutcome::TransferInitiated(op));
                }
            }
        }

        Err(ArbError::FundingShortfall { venue: target_venue.to_string(), needed: needed_quote.to_string(), available: available.to_string() })
    }
}

/// Outcome of [`Rebalancer::ensure_quote_for_trade`]: either the target
/// venue already had enough on its own, or a cross-venue transfer was
/// initiated and the caller must wait for arrival before proceeding.
#[derive(Debug, Clone)]
pub enum QuoteFundingOutcome {
    AlreadySufficient(Decimal),
    TransferInitiated(RebalanceOperation),
}

/// Whether a no-hint deposit-address lookup that reported `returned` is
/// usable for a route that asked for `requested`: an exact match always
/// is, and so is a venue that only ever hands back its single `DEFAULT`
/// address, since that address still accepts the requested network.
fn deposit_network_compatible(requested: &str, returned: &str) -> bool {
    returned == requested || returned == crate::network_alias::DEFAULT_NETWORK
}
