//! BalanceManager: aggregates per-venue balances and prices
//! them in the quote asset via a cached, single-flighted ticker oracle.
//!
//! The ticker cache follows the same shape as the teacher's
//! `tax/price_oracle.rs` `PriceOracle` (an `RwLock`-protected cache with
//! a TTL), and the per-venue balance table follows `pool/state.rs`'s
//! `Arc<DashMap<..>>`-wrapped, cheaply-`Clone`-able manager pattern.

use crate::error::GatewayError;
use crate::gateway::{AccountPurpose, ExchangeGateway};
use crate::types::{AssetBalance, ExchangeBalance, VenueBalance, VenueId};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

/// Cached quote-denominated price for one asset, refreshed from a
/// reference venue's ticker fetch.
#[derive(Debug, Clone)]
struct CachedPrice {
    price: Decimal,
    fetched_at: Instant,
}

/// Single-flighted ticker cache: concurrent callers waiting on the same
/// refresh share one in-flight fetch rather than issuing N redundant
/// calls.
struct TickerCache {
    prices: DashMap<String, CachedPrice>,
    ttl: Duration,
    refresh_lock: Mutex<()>,
}

impl TickerCache {
    fn new(ttl: Duration) -> Self {
        Self {
            prices: DashMap::new(),
            ttl,
            refresh_lock: Mutex::new(()),
        }
    }

    fn get_fresh(&self, asset: &str) -> Option<Decimal> {
        self.prices.get(asset).and_then(|entry| {
            if entry.fetched_at.elapsed() < self.ttl {
                Some(entry.price)
            } else {
                None
            }
        })
    }

    fn insert(&self, asset: &str, price: Decimal) {
        self.prices.insert(
            asset.to_string(),
            CachedPrice { price, fetched_at: Instant::now() },
        );
    }
}

/// Static fallback prices and the stablecoin/quote-asset identity,
/// consulted after cache and direct-fetch both miss.
pub struct PricingTable {
    pub quote_asset: AssetSet,
    pub stablecoins: HashSet<String>,
    pub static_prices: HashMap<String, Decimal>,
}

/// A single configured quote asset (kept as a type alias boundary so
/// callers don't reach for `String` directly).
pub type AssetSet = String;

pub struct BalanceManager {
    gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>>,
    reference_venue: VenueId,
    ticker_cache: TickerCache,
    pricing: PricingTable,
}

impl BalanceManager {
    pub fn new(
        gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>>,
        reference_venue: VenueId,
        pricing: PricingTable,
        ticker_ttl: Duration,
    ) -> Self {
        Self {
            gateways,
            reference_venue,
            ticker_cache: TickerCache::new(ticker_ttl),
            pricing,
        }
    }

    /// Queries every venue concurrently across both account-type
    /// purposes and reduces each into a merged [`VenueBalance`] view
    /// keyed by asset. A failure on one venue does not prevent
    /// returning the others: each venue is reduced independently.
    pub async fn snapshot(&self, with_usd_values: bool) -> HashMap<VenueId, VenueBalance> {
        let mut set = tokio::task::JoinSet::new();
        for (venue_id, gateway) in &self.gateways {
            let venue_id = venue_id.clone();
            let gateway = Arc::clone(gateway);
            set.spawn(
                async move {
                    let trading = gateway.get_balances(AccountPurpose::Trading).await;
                    let withdrawal = gateway.get_balances(AccountPurpose::Withdrawal).await;
                    (venue_id, trading, withdrawal)
                }
                .instrument(info_span!("balance_fetch", venue = %gateway.venue_id())),
            );
        }

        let mut out: HashMap<VenueId, VenueBalance> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            let (venue_id, trading, withdrawal) = match joined {
                Ok(triple) => triple,
                Err(e) => {
                    warn!(error = %e, "balance fetch task panicked");
                    continue;
                }
            };
            let mut merged: HashMap<String, ExchangeBalance> = HashMap::new();
            for result in [trading, withdrawal] {
                match result {
                    Ok(balances) => {
                        for balance in balances {
                            merged
                                .entry(balance.asset.clone())
                                .and_modify(|existing| {
                                    existing.free += balance.free;
                                    existing.locked += balance.locked;
                                })
                                .or_insert(balance);
                        }
                    }
                    Err(GatewayError::AuthFailed { venue, message }) => {
                        warn!(venue, message, "auth failure fetching balances; venue should be retired");
                    }
                    Err(e) => {
                        warn!(venue = venue_id, error = %e, "balance fetch failed for venue");
                    }
                }
            }
            let assets: HashMap<String, AssetBalance> = merged
                .into_values()
                .map(|b| {
                    (
                        b.asset,
                        AssetBalance {
                            free: b.free,
                            used: b.locked,
                            total: b.free + b.locked,
                            usd_value: Decimal::ZERO,
                        },
                    )
                })
                .collect();
            out.insert(
                venue_id.clone(),
                VenueBalance { venue: venue_id, total_usd: Decimal::ZERO, assets },
            );
        }

        if with_usd_values {
            self.attach_usd_values(&mut out).await;
        }

        out
    }

    /// Reads the free balance of `asset` on `venue` for one account
    /// purpose.
    pub async fn account_free(&self, venue: &str, asset: &str, purpose: AccountPurpose) -> Option<Decimal> {
        let gateway = self.gateways.get(venue)?;
        let balances = gateway.get_balances(purpose).await.ok()?;
        balances
            .into_iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .map(|b| b.free)
    }

    /// (a) value every asset at its quote price and (b) roll the
    /// per-venue total up from the priced lines.
    async fn attach_usd_values(&self, snapshot: &mut HashMap<VenueId, VenueBalance>) {
        let assets: HashSet<String> = snapshot
            .values()
            .flat_map(|v| v.assets.keys().cloned())
            .collect();
        let mut prices = HashMap::with_capacity(assets.len());
        for asset in assets {
            prices.insert(asset.clone(), self.price_of(&asset).await);
        }

        for venue_balance in snapshot.values_mut() {
            let mut total = Decimal::ZERO;
            for (asset, balance) in venue_balance.assets.iter_mut() {
                let price = prices.get(asset).copied().unwrap_or(Decimal::ZERO);
                balance.usd_value = balance.total * price;
                total += balance.usd_value;
            }
            venue_balance.total_usd = total;
        }
    }

    /// Resolves the quote-denominated price of `asset` via: (a)
    /// quote/stablecoin short-circuit; (b) fresh cache; (c) a direct
    /// ticker fetch on the reference venue, single-flighted; (d) a
    /// static fallback table; else 0 with a warning.
    pub async fn price_of(&self, asset: &str) -> Decimal {
        if asset.eq_ignore_ascii_case(&self.pricing.quote_asset)
            || self.pricing.stablecoins.contains(&asset.to_uppercase())
        {
            return Decimal::ONE;
        }

        if let Some(price) = self.ticker_cache.get_fresh(asset) {
            return price;
        }

        let _permit = self.ticker_cache.refresh_lock.lock().await;
        if let Some(price) = self.ticker_cache.get_fresh(asset) {
            return price;
        }

        if let Some(gateway) = self.gateways.get(&self.reference_venue) {
            let symbol = format!("{}/{}", asset, self.pricing.quote_asset);
            if let Ok(ticker) = gateway.get_ticker(&symbol).await {
                if let Some(price) = ticker.effective_bid().or_else(|| ticker.effective_ask()) {
                    self.ticker_cache.insert(asset, price);
                    return price;
                }
            }
        }

        if let Some(price) = self.pricing.static_prices.get(asset) {
            debug!(asset, "using static fallback price");
            return *price;
        }

        warn!(asset, "no price available; valuing as zero");
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::DryRunGateway;
    use crate::types::TickerPrice;
    use rust_decimal_macros::dec;

    fn pricing() -> PricingTable {
        PricingTable {
            quote_asset: "USDT".to_string(),
            stablecoins: ["USDT", "USDC"].iter().map(|s| s.to_string()).collect(),
            static_prices: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn quote_asset_prices_at_one() {
        let mgr = BalanceManager::new(HashMap::new(), "binance".into(), pricing(), Duration::from_secs(60));
        assert_eq!(mgr.price_of("USDT").await, Decimal::ONE);
        assert_eq!(mgr.price_of("usdc").await, Decimal::ONE);
    }

    #[tokio::test]
    async fn snapshot_reduces_each_venue_independently() {
        let binance = Arc::new(DryRunGateway::new("binance"));
        binance.seed_balance("BTC", dec!(1));
        let kucoin = Arc::new(DryRunGateway::new("kucoin"));
        kucoin.seed_balance("ETH", dec!(5));

        let mut gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>> = HashMap::new();
        gateways.insert("binance".into(), binance);
        gateways.insert("kucoin".into(), kucoin);

        let mgr = BalanceManager::new(gateways, "binance".into(), pricing(), Duration::from_secs(60));
        let snap = mgr.snapshot(false).await;
        assert_eq!(snap.len(), 2);
        assert!(snap["binance"].assets.contains_key("BTC"));
    }

    #[tokio::test]
    async fn snapshot_with_usd_values_rolls_up_total() {
        let binance = Arc::new(DryRunGateway::new("binance"));
        binance.seed_balance("BTC", dec!(2));
        binance.seed_ticker("BTC/USDT", TickerPrice { ask: Some(dec!(50000)), bid: Some(dec!(50000)), last: None, close: None });

        let mut gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>> = HashMap::new();
        gateways.insert("binance".into(), binance);

        let mgr = BalanceManager::new(gateways, "binance".into(), pricing(), Duration::from_secs(60));
        let snap = mgr.snapshot(true).await;
        let venue = &snap["binance"];
        assert_eq!(venue.assets["BTC"].usd_value, dec!(100000));
        assert_eq!(venue.total_usd, dec!(100000));
    }

    #[tokio::test]
    async fn price_of_falls_back_to_reference_venue_ticker() {
        let binance = Arc::new(DryRunGateway::new("binance"));
        binance.seed_ticker("BTC/USDT", TickerPrice { ask: None, bid: Some(dec!(50000)), last: None, close: None });
        let mut gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>> = HashMap::new();
        gateways.insert("binance".into(), binance);

        let mgr = BalanceManager::new(gateways, "binance".into(), pricing(), Duration::from_secs(60));
        assert_eq!(mgr.price_of("BTC").await, dec!(50000));
    }

    #[tokio::test]
    async fn price_of_falls_back_to_static_table_when_no_ticker() {
        let mut static_prices = HashMap::new();
        static_prices.insert("DOGE".to_string(), dec!(0.1));
        let pricing = PricingTable {
            quote_asset: "USDT".to_string(),
            stablecoins: HashSet::new(),
            static_prices,
        };
        let mgr = BalanceManager::new(HashMap::new(), "binance".into(), pricing, Duration::from_secs(60));
        assert_eq!(mgr.price_of("DOGE").await, dec!(0.1));
    }
}
