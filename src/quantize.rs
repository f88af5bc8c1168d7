//! Amount quantisation: every trade and transfer amount is rounded
//! *down* to the asset's inferred quantum, so the engine never
//! requests more precision than a venue accepts.
//!
//! Precision is inferred in order: currency-level precision if
//! published (tick-size under `TICK_SIZE`, decimal places under
//! `DECIMAL_PLACES`, a heuristic when the mode is unknown), then any
//! market-level amount precision, then a fallback quantum of 1e-8.

use crate::gateway::{AssetPrecision, ExchangeGateway, PrecisionMode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

const FALLBACK_QUANTUM_EXPONENT: u32 = 8;

fn decimal_places_to_quantum(places: Decimal) -> Decimal {
    let exponent = places.to_u32().unwrap_or(FALLBACK_QUANTUM_EXPONENT);
    Decimal::new(1, exponent)
}

/// `value == 0` in `Unknown` mode means the venue published nothing;
/// otherwise guess tick-size vs. decimal-place-count from the shape of
/// the number (an integer in `[1, 18]` reads as a decimal-place count,
/// anything else as a tick size directly).
fn quantum_from_currency_precision(precision: AssetPrecision) -> Option<Decimal> {
    match precision.mode {
        PrecisionMode::TickSize => Some(precision.value),
        PrecisionMode::DecimalPlaces => Some(decimal_places_to_quantum(precision.value)),
        PrecisionMode::Unknown => {
            if precision.value.is_zero() {
                None
            } else if precision.value >= Decimal::ONE
                && precision.value == precision.value.trunc()
                && precision.value <= Decimal::from(18)
            {
                Some(decimal_places_to_quantum(precision.value))
            } else {
                Some(precision.value)
            }
        }
    }
}

/// Resolves the quantum to round to, consulting currency precision
/// first, then the market-level amount precision, then the fallback.
pub fn resolve_quantum(currency_precision: AssetPrecision, market_amount_precision: Option<Decimal>) -> Decimal {
    quantum_from_currency_precision(currency_precision)
        .or(market_amount_precision)
        .unwrap_or_else(|| Decimal::new(1, FALLBACK_QUANTUM_EXPONENT))
}

/// Fetches `asset`'s precision from the venue and resolves it to a
/// quantum the same way [`resolve_quantum`] does; a failed or unknown
/// lookup just falls through to the market/fallback tiers instead of
/// failing the caller — a missing precision isn't fatal, trading or
/// transferring at the 1e-8 default is.
pub async fn resolve_quantum_for_asset(
    gw: &dyn ExchangeGateway,
    asset: &str,
    market_amount_precision: Option<Decimal>,
) -> Decimal {
    let precision = gw
        .get_asset_precision(asset)
        .await
        .unwrap_or(AssetPrecision { mode: PrecisionMode::Unknown, value: Decimal::ZERO });
    resolve_quantum(precision, market_amount_precision)
}

/// Rounds `amount` down to the nearest multiple of `quantum`.
/// Idempotent: `quantize_down(quantize_down(x, q), q) == quantize_down(x, q)`.
/// Invariant: `quantize_down(x, q) <= x`.
pub fn quantize_down(amount: Decimal, quantum: Decimal) -> Decimal {
    if quantum <= Decimal::ZERO {
        return amount;
    }
    (amount / quantum).floor() * quantum
}
