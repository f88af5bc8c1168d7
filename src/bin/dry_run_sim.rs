//! Dry-run simulation binary.
//!
//! Runs a fixed number of cycles against in-memory [`DryRunGateway`]
//! mocks seeded with a deterministic spread, with no network
//! dependency — the cheapest way to exercise the full
//! scan/analyse/execute pipeline end to end, the way the teacher's
//! `bin/paper_trading.rs` exercises its Collector/Strategy/Executor
//! loop against live data.
//!
//! Usage:
//!   cargo run --bin dry-run-sim [cycles]

use chrono::Utc;
use rust_decimal_macros::dec;
use spot_arb_engine::engine::Engine;
use spot_arb_engine::gateway::mock::DryRunGateway;
use spot_arb_engine::gateway::ExchangeGateway;
use spot_arb_engine::toml_config::{GeneralSection, TomlConfig, VenueSection};
use spot_arb_engine::types::{DepthLevel, MarketInfo, NetworkOption, OrderBookSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, Level};

fn seeded_venue(id: &str, ask: Option<rust_decimal::Decimal>, bid: Option<rust_decimal::Decimal>) -> Arc<DryRunGateway> {
    let gw = Arc::new(DryRunGateway::new(id));
    gw.seed_market(MarketInfo {
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
    gw.seed_book(
        "BTC/USDT",
        OrderBookSnapshot {
            venue: id.to_string(),
            symbol: "BTC/USDT".into(),
            bids: bid.map(|p| vec![DepthLevel { price: p, quantity: dec!(50) }]).unwrap_or_default(),
            asks: ask.map(|p| vec![DepthLevel { price: p, quantity: dec!(50) }]).unwrap_or_default(),
            fetched_at: Utc::now(),
        },
    );
    gw.seed_balance("USDT", dec!(1000));
    gw.seed_balance("BTC", dec!(1));
    gw.seed_networks(
        "BTC",
        vec![NetworkOption {
            network: "BTC".into(),
            active: true,
            can_deposit: true,
            can_withdraw: true,
            withdraw_fee: dec!(0.0002),
            fee_currency: "BTC".into(),
            min_withdraw: dec!(0.0001),
            requires_memo: false,
        }],
    );
    gw
}

fn demo_config() -> TomlConfig {
    TomlConfig {
        general: GeneralSection {
            quote_asset: "USDT".into(),
            min_gross_pct: dec!(1),
            max_gross_pct: dec!(13),
            min_net_pct: dec!(0.1),
            min_liquidity_quote: dec!(50),
            slippage_pct: dec!(0.5),
            trade_amount_quote: dec!(100),
            min_effective_trade_quote: dec!(20),
            reserve_buffer_quote: dec!(5),
            transfer_fee_buffer_quote: dec!(2),
            jit_min_conversion_quote: dec!(10),
            stability_cycles: 1,
            top_n: 10,
            cycle_sleep_ms: 100,
            post_trade_cooldown_secs: 1,
            route_cooldown_cycles: 5,
            jit_funding_wait_secs: 5,
            arrival_poll_interval_secs: 1,
            order_fetch_attempts: 5,
            order_fetch_delay_ms: 10,
            enforce_whitelist: false,
            prefer_cost_based_buy: true,
            retry_partial_buy_remainder: false,
            hold_on_exhausted_open: false,
            dry_run: true,
            jit_liquid_assets: vec!["BTC".into(), "USDC".into()],
        },
        venues: vec![
            VenueSection {
                id: "binance".into(),
                enabled: true,
                trading_account_type: "spot".into(),
                withdrawal_account_type: "spot".into(),
                min_internal_transfer: dec!(1),
                withdrawal_wallet_type_hint: None,
                supports_transfer: true,
            },
            VenueSection {
                id: "kucoin".into(),
                enabled: true,
                trading_account_type: "spot".into(),
                withdrawal_account_type: "spot".into(),
                min_internal_transfer: dec!(1),
                withdrawal_wallet_type_hint: None,
                supports_transfer: true,
            },
        ],
        network_aliases: HashMap::new(),
        network_preference: Vec::new(),
        token_network_preference: HashMap::new(),
        asset_blacklist: Vec::new(),
        path_blacklist: Vec::new(),
        whitelist: Vec::new(),
        estimated_prices: HashMap::new(),
        default_withdraw_fees: HashMap::new(),
        memo_required_assets: Vec::new(),
        token_network_restriction: Vec::new(),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).with_target(false).init();

    let cycles: u64 = std::env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(5);

    let binance = seeded_venue("binance", Some(dec!(100)), None);
    let kucoin = seeded_venue("kucoin", None, Some(dec!(104)));

    let mut gateways: HashMap<String, Arc<dyn ExchangeGateway>> = HashMap::new();
    gateways.insert("binance".into(), binance);
    gateways.insert("kucoin".into(), kucoin);

    let config = demo_config();
    let mut engine = Engine::new(gateways, &config, "dry_run_trade_logs");
    engine.init().await;

    info!(cycles, "starting dry-run simulation");
    engine.run(Some(cycles), || false).await;
    info!("dry-run simulation finished");
}
