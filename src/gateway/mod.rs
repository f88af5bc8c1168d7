//! [`ExchangeGateway`]: the capability boundary between the engine and a
//! concrete venue's HTTP/WebSocket client. No concrete client
//! is implemented here — callers provide one (or use
//! [`mock::DryRunGateway`] for paper trading / `DRY_RUN`) and the rest of
//! the engine is written against the trait only.

pub mod mock;

use crate::error::GatewayError;
use crate::types::{ExchangeBalance, MarketInfo, NetworkOption, OrderBookSnapshot, TickerPrice};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which of a venue's sub-accounts a balance or transfer applies to
/// a venue may expose spot, funding, main, trade as distinct
/// sub-accounts. The engine only ever distinguishes the two
/// purposes it actually needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountPurpose {
    Trading,
    Withdrawal,
}

/// How a venue's published currency precision should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionMode {
    TickSize,
    DecimalPlaces,
    /// The venue did not say; the quantisation heuristic applies (spec
    /// §4.4.1: "a heuristic otherwise").
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct AssetPrecision {
    pub mode: PrecisionMode,
    /// The tick size directly, or the decimal-place count expressed as
    /// a `Decimal` integer, depending on `mode`.
    pub value: Decimal,
}

/// Result of placing an order, before it is necessarily filled.
#[derive(Debug, Clone)]
pub struct OrderHandle {
    pub venue_order_id: String,
}

/// Fill state of a previously placed order, in `fetch_order`'s shape
/// narrowed to the fields the executor and rebalancer need.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatus {
    pub venue_order_id: String,
    pub filled_quantity: Decimal,
    pub average_fill_price: Decimal,
    pub cost_quote: Decimal,
    pub fee_amount: Decimal,
    pub fee_currency: String,
    pub is_complete: bool,
    pub is_canceled: bool,
    pub is_rejected: bool,
}

impl OrderStatus {
    /// `closed`, `canceled`, or another terminal-other status — as
    /// opposed to `open`/`partial`, which is not terminal.
    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.is_canceled || self.is_rejected
    }

    /// A canceled order with nothing filled is a failure, never a
    /// success, even if the venue's status string looks closed-like.
    pub fn is_canceled_zero_fill(&self) -> bool {
        self.is_canceled && self.filled_quantity.is_zero()
    }
}

/// A deposit address (and optional memo/tag) for one asset on one
/// network at one venue.
#[derive(Debug, Clone, PartialEq)]
pub struct DepositAddress {
    pub address: String,
    pub memo: Option<String>,
    pub network: String,
}

/// Capability boundary abstracting a single exchange's REST/WS surface.
///
/// Implementations are expected to be cheap to clone or already wrapped
/// in `Arc`, since the engine fans calls out across venues concurrently
/// within a cycle. `set_timeout_ms` takes `&self` rather than `&mut
/// self` so the trait stays object-safe behind `Arc<dyn
/// ExchangeGateway>`; implementations back it with an atomic (see
/// [`TimeoutCell`]).
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn venue_id(&self) -> &str;

    /// Whether this venue supports on-chain transfers at all (some
    /// sandboxed or fiat-only venues do not; such venues should signal
    /// absence rather than error.
    fn supports_transfer(&self) -> bool {
        true
    }

    /// Whether `create_market_buy_order_with_cost` is honoured
    /// reliably enough to prefer it over an amount-based buy.
    fn supports_cost_based_buy(&self) -> bool {
        false
    }

    /// Whether `create_deposit_address` exists on this venue; not every
    /// venue supports minting a fresh address on demand.
    fn supports_create_deposit_address(&self) -> bool {
        false
    }

    /// Whether order-book depth is queryable at all; a venue lacking
    /// support defaults the depth check to pass.
    fn supports_order_book(&self) -> bool {
        true
    }

    async fn load_markets(&self) -> Result<Vec<MarketInfo>, GatewayError>;

    async fn get_balances(&self, purpose: AccountPurpose) -> Result<Vec<ExchangeBalance>, GatewayError>;

    /// Bulk ticker fetch; the scanner and balance manager both drive
    /// off this rather than per-symbol calls.
    async fn get_tickers(&self, symbols: &[String]) -> Result<HashMap<String, TickerPrice>, GatewayError>;

    async fn get_ticker(&self, symbol: &str) -> Result<TickerPrice, GatewayError>;

    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot, GatewayError>;

    async fn get_networks(&self, asset: &str) -> Result<Vec<NetworkOption>, GatewayError>;

    async fn get_asset_precision(&self, asset: &str) -> Result<AssetPrecision, GatewayError>;

    /// Fetch a deposit address. `network` is `None` for a no-hint
    /// lookup.
    async fn get_deposit_address(
        &self,
        asset: &str,
        network: Option<&str>,
    ) -> Result<DepositAddress, GatewayError>;

    /// Create an address for `network` if the venue supports it (spec
    /// §4.4.2 attempt (c)). Default errs for venues that don't.
    async fn create_deposit_address(
        &self,
        asset: &str,
        network: &str,
    ) -> Result<DepositAddress, GatewayError> {
        let _ = network;
        Err(GatewayError::Rejected {
            venue: self.venue_id().to_string(),
            message: format!("{} does not support create_deposit_address for {asset}", self.venue_id()),
        })
    }

    /// Moves `amount` of `asset` between two sub-accounts on the same
    /// venue. Venues that do not distinguish the two purposes are
    /// expected to treat this as a no-op success.
    async fn internal_transfer(
        &self,
        asset: &str,
        amount: Decimal,
        from: AccountPurpose,
        to: AccountPurpose,
    ) -> Result<(), GatewayError>;

    async fn place_market_buy(&self, symbol: &str, base_amount: Decimal) -> Result<OrderHandle, GatewayError>;

    /// Cost-based market buy (spend exactly `quote_cost`). Only called
    /// when [`Self::supports_cost_based_buy`] is true.
    async fn place_market_buy_with_cost(
        &self,
        symbol: &str,
        quote_cost: Decimal,
    ) -> Result<OrderHandle, GatewayError> {
        let _ = (symbol, quote_cost);
        Err(GatewayError::Rejected {
            venue: self.venue_id().to_string(),
            message: "cost-based market buy not supported".to_string(),
        })
    }

    async fn place_market_sell(&self, symbol: &str, base_amount: Decimal) -> Result<OrderHandle, GatewayError>;

    async fn get_order_status(&self, venue_order_id: &str, symbol: &str) -> Result<OrderStatus, GatewayError>;

    async fn cancel_order(&self, venue_order_id: &str, symbol: &str) -> Result<(), GatewayError>;

    async fn withdraw(
        &self,
        asset: &str,
        network: &str,
        quantity: Decimal,
        destination: &DepositAddress,
    ) -> Result<String, GatewayError>;

    fn timeout_ms(&self) -> u64;

    fn set_timeout_ms(&self, timeout_ms: u64);
}

/// Shared atomic storage for the mutable `timeout_ms` field every
/// concrete gateway needs; embed as a struct field and delegate.
pub struct TimeoutCell(AtomicU64);

impl TimeoutCell {
    pub fn new(initial_ms: u64) -> Self {
        Self(AtomicU64::new(initial_ms))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::Relaxed);
    }
}

impl Default for TimeoutCell {
    fn default() -> Self {
        Self::new(10_000)
    }
}
