//! A deterministic, in-memory [`ExchangeGateway`] used by the dry-run
//! harness (`bin/dry_run_sim.rs`) and by unit tests that need a gateway
//! without touching the network. Mirrors the `DRY_RUN` contract:
//! no mutating call ever reaches a real venue, and order/withdrawal ids
//! are deterministic.

use super::{
    AccountPurpose, AssetPrecision, DepositAddress, ExchangeGateway, OrderHandle, OrderStatus,
    PrecisionMode, TimeoutCell,
};
use crate::error::GatewayError;
use crate::types::{ExchangeBalance, MarketInfo, NetworkOption, OrderBookSnapshot, TickerPrice};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory gateway seeded with fixed balances, books, and networks.
/// Orders placed against it fill instantly at the requested price.
pub struct DryRunGateway {
    venue: String,
    trading_balances: DashMap<String, Decimal>,
    withdrawal_balances: DashMap<String, Decimal>,
    books: DashMap<String, OrderBookSnapshot>,
    networks: DashMap<String, Vec<NetworkOption>>,
    markets: DashMap<String, MarketInfo>,
    precisions: DashMap<String, AssetPrecision>,
    orders: DashMap<String, OrderStatus>,
    order_symbols: DashMap<String, String>,
    tickers: DashMap<String, TickerPrice>,
    next_order_id: AtomicU64,
    timeout: TimeoutCell,
    /// When set, every order placed against this symbol fills short of
    /// the requested amount — used to exercise the zero-fill / partial
    /// fill failure paths in tests.
    fill_override: DashMap<String, Decimal>,
    /// When set, orders placed against this symbol stay open
    /// (`is_complete: false`) until explicitly canceled — used to
    /// exercise the non-terminal-after-retries path in tests.
    stuck_open: DashMap<String, ()>,
    /// When set, a network-scoped deposit-address lookup fails, forcing
    /// callers down to the no-hint tier — used to exercise the
    /// no-hint/DEFAULT-compatibility path in tests.
    reject_scoped_deposit_address: std::sync::atomic::AtomicBool,
    /// Network reported by a no-hint deposit-address lookup, keyed by
    /// asset; defaults to `"DEFAULT"` when unseeded.
    no_hint_deposit_network: DashMap<String, String>,
}

impl DryRunGateway {
    pub fn new(venue: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            trading_balances: DashMap::new(),
            withdrawal_balances: DashMap::new(),
            books: DashMap::new(),
            networks: DashMap::new(),
            markets: DashMap::new(),
            precisions: DashMap::new(),
            orders: DashMap::new(),
            order_symbols: DashMap::new(),
            tickers: DashMap::new(),
            next_order_id: AtomicU64::new(1),
            timeout: TimeoutCell::default(),
            fill_override: DashMap::new(),
            stuck_open: DashMap::new(),
            reject_scoped_deposit_address: std::sync::atomic::AtomicBool::new(false),
            no_hint_deposit_network: DashMap::new(),
        }
    }

    /// Seeds both the trading and withdrawal sub-account views with the
    /// same balance, matching a venue that does not distinguish them.
    pub fn seed_balance(&self, asset: &str, free: Decimal) {
        self.trading_balances.insert(asset.to_string(), free);
        self.withdrawal_balances.insert(asset.to_string(), free);
    }

    pub fn seed_trading_balance(&self, asset: &str, free: Decimal) {
        self.trading_balances.insert(asset.to_string(), free);
    }

    pub fn seed_withdrawal_balance(&self, asset: &str, free: Decimal) {
        self.withdrawal_balances.insert(asset.to_string(), free);
    }

    pub fn seed_book(&self, symbol: &str, book: OrderBookSnapshot) {
        self.books.insert(symbol.to_string(), book);
    }

    /// Seeds an explicit ticker; when absent, [`Self::get_ticker`]
    /// derives one from the seeded book's top of book instead.
    pub fn seed_ticker(&self, symbol: &str, ticker: TickerPrice) {
        self.tickers.insert(symbol.to_string(), ticker);
    }

    fn derive_ticker(&self, symbol: &str) -> TickerPrice {
        if let Some(t) = self.tickers.get(symbol) {
            return *t.value();
        }
        let book = self.books.get(symbol);
        TickerPrice {
            ask: book.as_ref().and_then(|b| b.best_ask()),
            bid: book.as_ref().and_then(|b| b.best_bid()),
            last: None,
            close: None,
        }
    }

    pub fn seed_networks(&self, asset: &str, options: Vec<NetworkOption>) {
        self.networks.insert(asset.to_string(), options);
    }

    pub fn seed_market(&self, market: MarketInfo) {
        self.markets.insert(market.symbol.clone(), market);
    }

    pub fn seed_precision(&self, asset: &str, precision: AssetPrecision) {
        self.precisions.insert(asset.to_string(), precision);
    }

    pub fn force_fill(&self, symbol: &str, filled: Decimal) {
        self.fill_override.insert(symbol.to_string(), filled);
    }

    pub fn force_stuck_open(&self, symbol: &str) {
        self.stuck_open.insert(symbol.to_string(), ());
    }

    pub fn reject_scoped_deposit_address(&self) {
        self.reject_scoped_deposit_address.store(true, Ordering::Relaxed);
    }

    pub fn seed_no_hint_deposit_network(&self, asset: &str, network: &str) {
        self.no_hint_deposit_network.insert(asset.to_string(), network.to_string());
    }

    fn balances_for(&self, purpose: AccountPurpose) -> &DashMap<String, Decimal> {
        match purpose {
            AccountPurpose::Trading => &self.trading_balances,
            AccountPurpose::Withdrawal => &self.withdrawal_balances,
        }
    }

    fn place(&self, symbol: &str, requested: Decimal, price: Decimal) -> OrderHandle {
        let id = self.next_order_id.fetch_add(1, Ordering::Relaxed).to_string();
        let filled = self
            .fill_override
            .get(symbol)
            .map(|f| *f.value())
            .unwrap_or(requested);
        let stuck = self.stuck_open.contains_key(symbol);
        self.orders.insert(
            id.clone(),
            OrderStatus {
                venue_order_id: id.clone(),
                filled_quantity: if stuck { Decimal::ZERO } else { filled },
                average_fill_price: price,
                cost_quote: if stuck { Decimal::ZERO } else { filled * price },
                fee_amount: Decimal::ZERO,
                fee_currency: String::new(),
                is_complete: !stuck,
                is_canceled: false,
                is_rejected: false,
            },
        );
        self.order_symbols.insert(id.clone(), symbol.to_string());
        OrderHandle { venue_order_id: id }
    }
}

#[async_trait]
impl ExchangeGateway for DryRunGateway {
    fn venue_id(&self) -> &str {
        &self.venue
    }

    fn supports_cost_based_buy(&self) -> bool {
        true
    }

    fn supports_create_deposit_address(&self) -> bool {
        true
    }

    async fn load_markets(&self) -> Result<Vec<MarketInfo>, GatewayError> {
        Ok(self.markets.iter().map(|e| e.value().clone()).collect())
    }

    async fn get_balances(&self, purpose: AccountPurpose) -> Result<Vec<ExchangeBalance>, GatewayError> {
        let now = Utc::now();
        Ok(self
            .balances_for(purpose)
            .iter()
            .map(|e| ExchangeBalance {
                venue: self.venue.clone(),
                asset: e.key().clone(),
                free: *e.value(),
                locked: Decimal::ZERO,
                fetched_at: now,
            })
            .collect())
    }

    async fn get_tickers(&self, symbols: &[String]) -> Result<HashMap<String, TickerPrice>, GatewayError> {
        Ok(symbols.iter().map(|s| (s.clone(), self.derive_ticker(s))).collect())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<TickerPrice, GatewayError> {
        Ok(self.derive_ticker(symbol))
    }

    async fn get_order_book(&self, symbol: &str, _depth: usize) -> Result<OrderBookSnapshot, GatewayError> {
        self.books
            .get(symbol)
            .map(|b| b.value().clone())
            .ok_or_else(|| GatewayError::Rejected {
                venue: self.venue.clone(),
                message: format!("no seeded book for {symbol}"),
            })
    }

    async fn get_networks(&self, asset: &str) -> Result<Vec<NetworkOption>, GatewayError> {
        Ok(self.networks.get(asset).map(|v| v.value().clone()).unwrap_or_default())
    }

    async fn get_asset_precision(&self, asset: &str) -> Result<AssetPrecision, GatewayError> {
        Ok(self.precisions.get(asset).map(|p| *p.value()).unwrap_or(AssetPrecision {
            mode: PrecisionMode::Unknown,
            value: Decimal::new(1, 8),
        }))
    }

    async fn get_deposit_address(
        &self,
        asset: &str,
        network: Option<&str>,
    ) -> Result<DepositAddress, GatewayError> {
        if network.is_some() && self.reject_scoped_deposit_address.load(Ordering::Relaxed) {
            return Err(GatewayError::Rejected {
                venue: self.venue.clone(),
                message: "scoped deposit address lookup unavailable".to_string(),
            });
        }
        let network = match network {
            Some(n) => n.to_string(),
            None => self
                .no_hint_deposit_network
                .get(asset)
                .map(|v| v.value().clone())
                .unwrap_or_else(|| "DEFAULT".to_string()),
        };
        Ok(DepositAddress {
            address: format!("{}-{}-{}-deposit", self.venue, asset, network),
            memo: None,
            network,
        })
    }

    async fn create_deposit_address(&self, asset: &str, network: &str) -> Result<DepositAddress, GatewayError> {
        Ok(DepositAddress {
            address: format!("{}-{}-{}-deposit", self.venue, asset, network),
            memo: None,
            network: network.to_string(),
        })
    }

    async fn internal_transfer(
        &self,
        asset: &str,
        amount: Decimal,
        from: AccountPurpose,
        to: AccountPurpose,
    ) -> Result<(), GatewayError> {
        if from == to {
            return Ok(());
        }
        let source = self.balances_for(from);
        let mut entry = source.entry(asset.to_string()).or_insert(Decimal::ZERO);
        if *entry < amount {
            return Err(GatewayError::InsufficientBalance {
                venue: self.venue.clone(),
                asset: asset.to_string(),
            });
        }
        *entry -= amount;
        drop(entry);
        *self.balances_for(to).entry(asset.to_string()).or_insert(Decimal::ZERO) += amount;
        Ok(())
    }

    async fn place_market_buy(&self, symbol: &str, base_amount: Decimal) -> Result<OrderHandle, GatewayError> {
        let price = self
            .books
            .get(symbol)
            .and_then(|b| b.best_ask())
            .unwrap_or(Decimal::ONE);
        Ok(self.place(symbol, base_amount, price))
    }

    async fn place_market_buy_with_cost(
        &self,
        symbol: &str,
        quote_cost: Decimal,
    ) -> Result<OrderHandle, GatewayError> {
        let price = self
            .books
            .get(symbol)
            .and_then(|b| b.best_ask())
            .unwrap_or(Decimal::ONE);
        if price.is_zero() {
            return Err(GatewayError::Rejected {
                venue: self.venue.clone(),
                message: "no price available for cost-based buy".to_string(),
            });
        }
        Ok(self.place(symbol, quote_cost / price, price))
    }

    async fn place_market_sell(&self, symbol: &str, base_amount: Decimal) -> Result<OrderHandle, GatewayError> {
        let price = self
            .books
            .get(symbol)
            .and_then(|b| b.best_bid())
            .unwrap_or(Decimal::ONE);
        Ok(self.place(symbol, base_amount, price))
    }

    async fn get_order_status(&self, venue_order_id: &str, _symbol: &str) -> Result<OrderStatus, GatewayError> {
        self.orders
            .get(venue_order_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| GatewayError::Rejected {
                venue: self.venue.clone(),
                message: format!("unknown order {venue_order_id}"),
            })
    }

    async fn cancel_order(&self, venue_order_id: &str, _symbol: &str) -> Result<(), GatewayError> {
        if let Some(mut order) = self.orders.get_mut(venue_order_id) {
            order.is_canceled = true;
        }
        Ok(())
    }

    async fn withdraw(
        &self,
        asset: &str,
        _network: &str,
        quantity: Decimal,
        _destination: &DepositAddress,
    ) -> Result<String, GatewayError> {
        let mut entry = self
            .withdrawal_balances
            .entry(asset.to_string())
            .or_insert(Decimal::ZERO);
        if *entry < quantity {
            return Err(GatewayError::InsufficientBalance {
                venue: self.venue.clone(),
                asset: asset.to_string(),
            });
        }
        *entry -= quantity;
        Ok(format!("dryrun-withdrawal-{}", uuid_like(&self.venue)))
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.get()
    }

    fn set_timeout_ms(&self, timeout_ms: u64) {
        self.timeout.set(timeout_ms);
    }
}

fn uuid_like(seed: &str) -> String {
    format!("{:x}", seed.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64)))
}
