//! Core data model for the cross-exchange arbitrage pipeline.
//!
//! Mirrors the shape the scanner, analyzer, rebalancer, and executor pass
//! between each other: balances, scanned opportunities, chosen network
//! routes, and the execution/rebalance records that get logged once a
//! cycle finishes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Venue identifier, e.g. `"binance"`, `"kucoin"`.
pub type VenueId = String;

/// Asset identifier in its canonical, upper-cased form, e.g. `"USDT"`.
pub type AssetId = String;

/// Trading symbol as the venue names it, e.g. `"BTC/USDT"`.
pub type Symbol = String;

/// A balance of one asset held on one venue, as last refreshed by the
/// [`crate::balance::BalanceManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeBalance {
    pub venue: VenueId,
    pub asset: AssetId,
    pub free: Decimal,
    pub locked: Decimal,
    pub fetched_at: DateTime<Utc>,
}

impl ExchangeBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Per-asset balance line within a [`VenueBalance`] snapshot:
/// `{free, used, total, usd_value}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
    pub usd_value: Decimal,
}

/// One venue's aggregated balance view, as produced by
/// [`crate::balance::BalanceManager::snapshot`]: `(venue, total_usd,
/// assets)`. Invariant: `total_usd == assets.values().map(|a|
/// a.usd_value).sum()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueBalance {
    pub venue: VenueId,
    pub total_usd: Decimal,
    pub assets: HashMap<AssetId, AssetBalance>,
}

impl VenueBalance {
    pub fn free_of(&self, asset: &str) -> Decimal {
        self.assets.get(asset).map(|a| a.free).unwrap_or(Decimal::ZERO)
    }
}

/// A single network a venue supports for depositing or withdrawing an
/// asset, as the venue names it (a `fetch_currencies().networks` map
/// entry) — before name normalization (see [`crate::network_alias`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkOption {
    pub network: String,
    pub active: bool,
    pub can_deposit: bool,
    pub can_withdraw: bool,
    pub withdraw_fee: Decimal,
    pub fee_currency: AssetId,
    pub min_withdraw: Decimal,
    pub requires_memo: bool,
}

/// Trust tier of the source a [`NetworkRoute`] candidate's fee data came
/// from: the operator-curated static table is preferred when it has an
/// entry for the asset, live venue metadata is the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkSource {
    OperatorCurated,
    LiveMetadata,
}

/// A fully-resolved, rankable transfer route between two venues for one
/// asset — distinct from the per-venue capability row [`NetworkOption`]
/// above, which only describes one venue's side of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRoute {
    pub normalized_name: String,
    pub withdraw_code_on_from: String,
    pub deposit_code_on_to: String,
    pub fee_native: Decimal,
    pub fee_currency: AssetId,
    pub fee_quote: Decimal,
    pub min_withdrawal_native: Decimal,
    pub source: NetworkSource,
    pub priority_score_token: i64,
    pub priority_score_general: i64,
}

/// Market metadata as loaded once at startup via `load_markets`: which
/// symbols are tradeable, at what taker fee, and under what amount/cost
/// minimums.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub symbol: Symbol,
    pub base: AssetId,
    pub quote: AssetId,
    pub active: bool,
    pub is_spot: bool,
    pub taker_fee: Decimal,
    pub min_amount: Decimal,
    pub min_cost: Decimal,
    /// Market-level amount precision (tick size), when published — the
    /// second source quantisation consults, after currency-level
    /// precision.
    pub amount_precision: Option<Decimal>,
}

/// A ticker snapshot for one symbol, in the shape `fetch_ticker`/
/// `fetch_tickers` return it. Price fields fall back ask|bid→last→close;
/// see [`TickerPrice::effective_ask`]/[`effective_bid`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickerPrice {
    pub ask: Option<Decimal>,
    pub bid: Option<Decimal>,
    pub last: Option<Decimal>,
    pub close: Option<Decimal>,
}

impl TickerPrice {
    pub fn effective_ask(&self) -> Option<Decimal> {
        self.ask.or(self.last).or(self.close)
    }

    pub fn effective_bid(&self) -> Option<Decimal> {
        self.bid.or(self.last).or(self.close)
    }
}

/// An asset-quantity pair expressed as a depth level in an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// A top-of-book/depth snapshot for one symbol on one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub fetched_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Cumulative quantity fillable at or better than `price_limit`,
    /// walking the book from the top. Used by the depth check to bound
    /// expected slippage.
    pub fn fillable_quantity(&self, side: Side, price_limit: Decimal) -> Decimal {
        let levels = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        let mut total = Decimal::ZERO;
        for level in levels {
            let within_limit = match side {
                Side::Buy => level.price <= price_limit,
                Side::Sell => level.price >= price_limit,
            };
            if !within_limit {
                break;
            }
            total += level.quantity;
        }
        total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// A candidate arbitrage surfaced by the scanner: buy `asset` on
/// `buy_venue`, transfer it, sell on `sell_venue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub asset: AssetId,
    pub quote_asset: AssetId,
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub gross_spread_pct: Decimal,
    pub detected_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn gross_profit_pct(buy_price: Decimal, sell_price: Decimal) -> Decimal {
        if buy_price.is_zero() {
            return Decimal::ZERO;
        }
        (sell_price - buy_price) / buy_price * Decimal::ONE_HUNDRED
    }
}

/// The analyzer's verdict on an [`Opportunity`] after applying fees,
/// network routing, depth, and stability checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzedOpportunity {
    pub opportunity: Opportunity,
    pub buy_fee_pct: Decimal,
    pub sell_fee_pct: Decimal,
    pub withdrawal_fee_quote: Decimal,
    pub net_pct: Decimal,
    /// Ranked transfer candidates from the network selector, cheapest
    /// first.
    pub potential_networks: Vec<NetworkRoute>,
    pub chosen_network: NetworkRoute,
    pub stability_count: u32,
    pub is_stable: bool,
    pub is_liquid: bool,
    pub trade_notional: Decimal,
}

/// Record of one buy/transfer/sell execution cycle, written to the
/// trade log once the executor reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedArbitrageLog {
    pub opportunity_id: String,
    pub asset: AssetId,
    pub quote_asset: AssetId,
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    pub network_used: String,
    pub buy_fill_price: Decimal,
    pub sell_fill_price: Decimal,
    pub initial_buy_cost_quote: Decimal,
    pub net_base_after_buy_fee: Decimal,
    pub base_received_on_sell_venue: Decimal,
    pub quote_received: Decimal,
    pub final_net_profit_quote: Decimal,
    pub final_net_profit_pct: Decimal,
    pub final_state: ExecutionState,
    /// Append-only diagnostics accumulated across the attempt; never
    /// cleared, only ever pushed to.
    pub error_messages: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CompletedArbitrageLog {
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
    }
}

/// Fine-grained execution detail captured at each executor transition,
/// useful for debugging a stalled or failed cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecutionDetails {
    pub opportunity_id: String,
    pub state: ExecutionState,
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Executor state machine. The three `Completed*` variants
/// are all terminal-successful (the trade closed, regardless of
/// whether it made money); every other terminal variant is a failure
/// that aborted before the sell leg closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Pending,
    BuyLegPending,
    BuyLegFilled,
    TransferLegPending,
    TransferLegInitiatedWaitingArrival,
    SellLegPending,
    CompletedSuccess,
    CompletedLoss,
    CompletedUnknownProfit,
    SetupErrorNotLiquid,
    SetupErrorNoNetwork,
    SetupErrorAlreadyActive,
    BuyLegFailedFundingShortfall,
    BuyLegFailedOrderRejected,
    BuyLegFailedZeroFill,
    JitFundingFailedNoSource,
    JitFundingFailedArrivalTimeout,
    TransferLegFailedNoCompatibleNetwork,
    TransferLegFailedNoAddress,
    TransferLegFailedMemoRequired,
    TransferLegFailedWithdrawRejected,
    TransferLegFailedArrivalTimeout,
    SellLegFailedMinAmount,
    SellLegFailedOrderRejected,
    SellLegFailedZeroFill,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ExecutionState::Pending
                | ExecutionState::BuyLegPending
                | ExecutionState::BuyLegFilled
                | ExecutionState::TransferLegPending
                | ExecutionState::TransferLegInitiatedWaitingArrival
                | ExecutionState::SellLegPending
        )
    }

    /// True for any terminal state that is not one of the three
    /// `Completed*` outcomes — i.e. the attempt aborted before a sell
    /// ever closed.
    pub fn is_failure(&self) -> bool {
        self.is_terminal()
            && !matches!(
                self,
                ExecutionState::CompletedSuccess
                    | ExecutionState::CompletedLoss
                    | ExecutionState::CompletedUnknownProfit
            )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A pending or in-flight rebalance transfer between two venues,
/// issued by the rebalancer to pre-position capital.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceOperation {
    pub id: String,
    pub asset: AssetId,
    pub source_venue: VenueId,
    pub dest_venue: VenueId,
    pub network: String,
    pub quantity: Decimal,
    pub status: RebalanceStatus,
    pub initiated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceStatus {
    Initiated,
    AwaitingArrival,
    Completed,
    Failed,
}

impl RebalanceOperation {
    /// De-duplication key (`asset|from|to|quantized_amount`) so two
    /// concurrent execution paths cannot launch the same transfer.
    pub fn dedup_key(asset: &str, from: &str, to: &str, quantized_amount: Decimal) -> String {
        format!("{asset}|{from}|{to}|{quantized_amount}")
    }
}
