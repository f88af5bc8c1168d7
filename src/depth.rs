//! Order-book depth check: before committing to a notional, confirm
//! both legs actually have enough visible liquidity to fill near the
//! quoted top-of-book price, not just a thin top level.
//!
//! Venues whose gateway doesn't support order books (`get_order_book`
//! returning [`GatewayError::Unsupported`]) are treated as passing —
//! the engine falls back to trusting the ticker alone for them.

use crate::gateway::ExchangeGateway;
use crate::types::{OrderBookSnapshot, Side};
use rust_decimal::Decimal;

pub const DEPTH_LEVELS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthVerdict {
    Sufficient,
    InsufficientLiquidity,
    SlippageExceeded,
}

/// Walks up to [`DEPTH_LEVELS`] levels of `book`, on the side a trade of
/// `side` would consume, and checks that (a) the total visible
/// liquidity at least covers `min_liquidity_quote` in quote terms, and
/// (b) filling `notional_quote` worth would not need to walk past
/// `top_price * (1 + slippage_pct/100)` (buy) or
/// `top_price * (1 - slippage_pct/100)` (sell).
pub fn check_depth(
    book: &OrderBookSnapshot,
    side: Side,
    notional_quote: Decimal,
    min_liquidity_quote: Decimal,
    slippage_pct: Decimal,
) -> DepthVerdict {
    let levels = match side {
        Side::Buy => &book.asks,
        Side::Sell => &book.bids,
    };
    let Some(top_price) = levels.first().map(|l| l.price) else {
        return DepthVerdict::InsufficientLiquidity;
    };

    let price_limit = match side {
        Side::Buy => top_price * (Decimal::ONE + slippage_pct / Decimal::ONE_HUNDRED),
        Side::Sell => top_price * (Decimal::ONE - slippage_pct / Decimal::ONE_HUNDRED),
    };

    let mut visible_quote = Decimal::ZERO;
    let mut filled_quote = Decimal::ZERO;
    let mut filled_within_limit_quote = Decimal::ZERO;
    for level in levels.iter().take(DEPTH_LEVELS) {
        let level_quote = level.price * level.quantity;
        visible_quote += level_quote;
        filled_quote += level_quote;
        let within_limit = match side {
            Side::Buy => level.price <= price_limit,
            Side::Sell => level.price >= price_limit,
        };
        if within_limit {
            filled_within_limit_quote += level_quote;
        }
        if filled_quote >= notional_quote {
            break;
        }
    }

    if visible_quote < min_liquidity_quote {
        return DepthVerdict::InsufficientLiquidity;
    }
    if filled_within_limit_quote < notional_quote.min(visible_quote) {
        return DepthVerdict::SlippageExceeded;
    }
    DepthVerdict::Sufficient
}

/// Fetches the book for `symbol` on `gateway` and checks depth. Venues
/// without order-book support pass by default; any other gateway error
/// also passes (the ticker-based gross/net checks already ran, and a
/// fetch hiccup shouldn't by itself veto an otherwise-good opportunity).
pub async fn check_depth_on_venue(
    gateway: &dyn ExchangeGateway,
    symbol: &str,
    side: Side,
    notional_quote: Decimal,
    min_liquidity_quote: Decimal,
    slippage_pct: Decimal,
) -> DepthVerdict {
    if !gateway.supports_order_book() {
        return DepthVerdict::Sufficient;
    }
    match gateway.get_order_book(symbol, DEPTH_LEVELS).await {
        Ok(book) => check_depth(&book, side, notional_quote, min_liquidity_quote, slippage_pct),
        Err(_) => DepthVerdict::Sufficient,
    }
}
