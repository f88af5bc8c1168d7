//! Scanner: intersects markets across venues into the common
//! spot pairs quoted in the configured stablecoin, then turns bulk
//! ticker snapshots into gross opportunities.

use crate::gateway::ExchangeGateway;
use crate::leveraged_token::is_leveraged_token;
use crate::types::{MarketInfo, Opportunity, TickerPrice, VenueId};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

pub struct Scanner {
    quote_asset: String,
    min_gross_pct: Decimal,
    max_gross_pct: Decimal,
    /// Common pairs per ordered (buy_venue, sell_venue) computed once at
    /// startup; the scanner is otherwise stateless between calls.
    common_pairs: HashMap<(VenueId, VenueId), Vec<String>>,
    /// Market metadata keyed by (venue, symbol), loaded alongside the
    /// common-pair table so the analyzer can reuse it for fees and
    /// amount precision without a second `load_markets` round-trip.
    markets: HashMap<(VenueId, String), MarketInfo>,
}

impl Scanner {
    pub fn new(quote_asset: impl Into<String>, min_gross_pct: Decimal, max_gross_pct: Decimal) -> Self {
        Self {
            quote_asset: quote_asset.into(),
            min_gross_pct,
            max_gross_pct,
            common_pairs: HashMap::new(),
            markets: HashMap::new(),
        }
    }

    pub fn market_info(&self, venue: &str, symbol: &str) -> Option<&MarketInfo> {
        self.markets.get(&(venue.to_string(), symbol.to_string()))
    }

    /// One-time initialisation: loads markets on every venue
    /// concurrently — one slow venue doesn't block the others — and
    /// computes, for each ordered venue pair, the symbols
    /// eligible on both sides (quoted in the configured stablecoin,
    /// active, spot, not a leveraged-token symbol).
    pub async fn init_markets(&mut self, gateways: &HashMap<VenueId, Arc<dyn ExchangeGateway>>) {
        let mut set = tokio::task::JoinSet::new();
        for (venue, gateway) in gateways {
            let venue = venue.clone();
            let gateway = Arc::clone(gateway);
            set.spawn(
                async move {
                    let markets = gateway.load_markets().await;
                    (venue, markets)
                }
                .instrument(info_span!("load_markets", venue = %gateway.venue_id())),
            );
        }

        let mut eligible: HashMap<VenueId, HashSet<String>> = HashMap::new();
        self.markets.clear();
        while let Some(joined) = set.join_next().await {
            let (venue, markets) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "load_markets task panicked");
                    continue;
                }
            };
            let markets = match markets {
                Ok(m) => m,
                Err(e) => {
                    warn!(venue, error = %e, "load_markets failed for venue");
                    continue;
                }
            };
            let symbols: HashSet<String> = markets
                .iter()
                .filter(|m| {
                    m.active
                        && m.is_spot
                        && m.quote.eq_ignore_ascii_case(&self.quote_asset)
                        && !is_leveraged_token(&m.base)
                })
                .map(|m| m.symbol.clone())
                .collect();
            for market in markets {
                self.markets.insert((venue.clone(), market.symbol.clone()), market);
            }
            eligible.insert(venue, symbols);
        }

        self.common_pairs.clear();
        for (venue_a, symbols_a) in &eligible {
            for (venue_b, symbols_b) in &eligible {
                if venue_a == venue_b {
                    continue;
                }
                let common: Vec<String> = symbols_a.intersection(symbols_b).cloned().collect();
                if !common.is_empty() {
                    self.common_pairs.insert((venue_a.clone(), venue_b.clone()), common);
                }
            }
        }
        debug!(routes = self.common_pairs.len(), "scanner computed common pairs");
    }

    /// The symbols this venue needs ticker data for, across every common
    /// pair it participates in (either side).
    fn symbols_needed(&self, venue: &str) -> Vec<String> {
        let mut symbols = HashSet::new();
        for ((buy_venue, sell_venue), pair_symbols) in &self.common_pairs {
            if buy_venue == venue || sell_venue == venue {
                symbols.extend(pair_symbols.iter().cloned());
            }
        }
        symbols.into_iter().collect()
    }

    /// Fetches tickers in bulk per venue, concurrently, and for every
    /// common pair generates both directions. A candidate becomes a
    /// gross opportunity iff ask(buy)>0, bid(sell)>0, ask<bid, and
    /// gross_pct falls within [MIN_GROSS, MAX_GROSS].
    pub async fn scan_once(&self, gateways: &HashMap<VenueId, Arc<dyn ExchangeGateway>>) -> Vec<Opportunity> {
        let mut set = tokio::task::JoinSet::new();
        for (venue, gateway) in gateways {
            let venue = venue.clone();
            let gateway = Arc::clone(gateway);
            let symbols = self.symbols_needed(&venue);
            if symbols.is_empty() {
                continue;
            }
            set.spawn(
                async move {
                    let tickers = gateway.get_tickers(&symbols).await;
                    (venue, tickers)
                }
                .instrument(info_span!("fetch_tickers", venue = %gateway.venue_id())),
            );
        }

        let mut tickers: HashMap<VenueId, HashMap<String, TickerPrice>> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            let (venue, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "ticker fetch task panicked");
                    continue;
                }
            };
            match result {
                Ok(map) => {
                    tickers.insert(venue, map);
                }
                Err(e) => warn!(venue, error = %e, "ticker fetch failed for venue"),
            }
        }

        self.evaluate(&tickers)
    }

    fn evaluate(&self, tickers: &HashMap<VenueId, HashMap<String, TickerPrice>>) -> Vec<Opportunity> {
        let mut opportunities = Vec::new();
        for ((buy_venue, sell_venue), symbols) in &self.common_pairs {
            let (Some(buy_tickers), Some(sell_tickers)) =
                (tickers.get(buy_venue), tickers.get(sell_venue))
            else {
                continue;
            };
            for symbol in symbols {
                let (Some(buy_ticker), Some(sell_ticker)) =
                    (buy_tickers.get(symbol), sell_tickers.get(symbol))
                else {
                    continue;
                };
                if let Some(opp) = self.evaluate_candidate(buy_venue, sell_venue, symbol, buy_ticker, sell_ticker) {
                    opportunities.push(opp);
                }
            }
        }
        opportunities
    }

    fn evaluate_candidate(
        &self,
        buy_venue: &str,
        sell_venue: &str,
        symbol: &str,
        buy_ticker: &TickerPrice,
        sell_ticker: &TickerPrice,
    ) -> Option<Opportunity> {
        let ask = buy_ticker.effective_ask()?;
        let bid = sell_ticker.effective_bid()?;
        if ask <= Decimal::ZERO || bid <= Decimal::ZERO || ask >= bid {
            return None;
        }
        let gross_pct = Opportunity::gross_profit_pct(ask, bid);
        if gross_pct < self.min_gross_pct || gross_pct > self.max_gross_pct {
            return None;
        }
        let base = symbol.split('/').next().unwrap_or(symbol).to_string();
        Some(Opportunity {
            id: format!("{buy_venue}:{sell_venue}:{symbol}"),
            asset: base,
            quote_asset: self.quote_asset.clone(),
            buy_venue: buy_venue.to_string(),
            sell_venue: sell_venue.to_string(),
            buy_price: ask,
            sell_price: bid,
            gross_spread_pct: gross_pct,
            detected_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(ask: Option<Decimal>, bid: Option<Decimal>) -> TickerPrice {
        TickerPrice { ask, bid, last: None, close: None }
    }

    #[test]
    fn candidate_within_gross_bounds_becomes_opportunity() {
        let scanner = Scanner::new("USDT", dec!(1), dec!(13));
        let opp = scanner.evaluate_candidate(
            "binance",
            "kucoin",
            "BTC/USDT",
            &ticker(Some(dec!(100)), None),
            &ticker(None, Some(dec!(104))),
        );
        let opp = opp.expect("expected opportunity");
        assert_eq!(opp.buy_price, dec!(100));
        assert_eq!(opp.sell_price, dec!(104));
        assert_eq!(opp.gross_spread_pct, dec!(4.00));
    }

    #[test]
    fn ask_above_bid_is_rejected() {
        let scanner = Scanner::new("USDT", dec!(1), dec!(13));
        let opp = scanner.evaluate_candidate(
            "binance",
            "kucoin",
            "BTC/USDT",
            &ticker(Some(dec!(105)), None),
            &ticker(None, Some(dec!(104))),
        );
        assert!(opp.is_none());
    }

    #[test]
    fn gross_outside_bounds_is_rejected() {
        let scanner = Scanner::new("USDT", dec!(1), dec!(2));
        let opp = scanner.evaluate_candidate(
            "binance",
            "kucoin",
            "BTC/USDT",
            &ticker(Some(dec!(100)), None),
            &ticker(None, Some(dec!(104))),
        );
        assert!(opp.is_none());
    }

    #[test]
    fn missing_ask_and_bid_yields_no_opportunity() {
        let scanner = Scanner::new("USDT", dec!(1), dec!(13));
        let empty = TickerPrice { ask: None, bid: None, last: None, close: None };
        let opp = scanner.evaluate_candidate("binance", "kucoin", "BTC/USDT", &empty, &empty);
        assert!(opp.is_none());
    }

    #[test]
    fn ticker_falls_back_to_last_then_close() {
        let t = TickerPrice { ask: None, bid: None, last: Some(dec!(50)), close: Some(dec!(49)) };
        assert_eq!(t.effective_ask(), Some(dec!(50)));
        let t2 = TickerPrice { ask: None, bid: None, last: None, close: Some(dec!(49)) };
        assert_eq!(t2.effective_ask(), Some(dec!(49)));
    }

    #[tokio::test]
    async fn scan_once_end_to_end_with_dry_run_gateways() {
        use crate::gateway::mock::DryRunGateway;
        use crate::types::{DepthLevel, OrderBookSnapshot};

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
                asks: vec![DepthLevel { price: dec!(100), quantity: dec!(10) }],
                fetched_at: Utc::now(),
            },
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
                bids: vec![DepthLevel { price: dec!(104), quantity: dec!(10) }],
                asks: vec![],
                fetched_at: Utc::now(),
            },
        );

        let mut gateways: HashMap<VenueId, Arc<dyn ExchangeGateway>> = HashMap::new();
        gateways.insert("binance".into(), binance);
        gateways.insert("kucoin".into(), kucoin);

        let mut scanner = Scanner::new("USDT", dec!(1), dec!(13));
        scanner.init_markets(&gateways).await;
        let opps = scanner.scan_once(&gateways).await;
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].buy_venue, "binance");
        assert_eq!(opps[0].sell_venue, "kucoin");
    }
}
