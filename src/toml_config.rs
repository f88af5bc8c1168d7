//! Static configuration bundle, loaded from a TOML file.
//!
//! The file format itself is out of scope for the engine's core logic —
//! what matters is that every tunable the components need lands in one
//! immutable `EngineConfig` value, built with `serde` defaults the same
//! way the teacher's `paper_trading/toml_config.rs` builds its
//! `TomlConfig`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub general: GeneralSection,
    #[serde(default)]
    pub venues: Vec<VenueSection>,
    #[serde(default)]
    pub network_aliases: HashMap<String, String>,
    #[serde(default)]
    pub network_preference: Vec<String>,
    #[serde(default)]
    pub token_network_preference: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub asset_blacklist: Vec<AssetBlacklistEntry>,
    #[serde(default)]
    pub path_blacklist: Vec<PathBlacklistEntry>,
    #[serde(default)]
    pub whitelist: Vec<PathBlacklistEntry>,
    #[serde(default)]
    pub estimated_prices: HashMap<String, Decimal>,
    #[serde(default)]
    pub default_withdraw_fees: HashMap<String, Decimal>,
    /// Assets for which a deposit address without a memo/tag is a hard
    /// failure (spec.md §4.4.2), e.g. `["XRP", "EOS"]`.
    #[serde(default)]
    pub memo_required_assets: Vec<String>,
    #[serde(default)]
    pub token_network_restriction: Vec<TokenNetworkRestriction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenNetworkRestriction {
    pub venue: String,
    pub asset: String,
    pub allowed_networks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralSection {
    pub quote_asset: String,

    #[serde(default = "default_min_gross")]
    pub min_gross_pct: Decimal,
    #[serde(default = "default_max_gross")]
    pub max_gross_pct: Decimal,
    #[serde(default = "default_min_net")]
    pub min_net_pct: Decimal,

    #[serde(default = "default_min_liquidity")]
    pub min_liquidity_quote: Decimal,
    #[serde(default = "default_slippage")]
    pub slippage_pct: Decimal,

    #[serde(default = "default_trade_amount")]
    pub trade_amount_quote: Decimal,
    #[serde(default = "default_min_effective_trade")]
    pub min_effective_trade_quote: Decimal,
    #[serde(default = "default_reserve_buffer")]
    pub reserve_buffer_quote: Decimal,
    #[serde(default = "default_transfer_fee_buffer")]
    pub transfer_fee_buffer_quote: Decimal,
    #[serde(default = "default_jit_min_conversion")]
    pub jit_min_conversion_quote: Decimal,

    #[serde(default = "default_stability_cycles")]
    pub stability_cycles: u32,
    /// Cycles a route is suppressed for after its first analyzer or
    /// executor failure (0 disables the cooldown). Escalates 5x per
    /// repeated failure, capped — see [`crate::cooldown::RouteCooldown`].
    #[serde(default = "default_route_cooldown_cycles")]
    pub route_cooldown_cycles: u64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_cycle_sleep_ms")]
    pub cycle_sleep_ms: u64,
    #[serde(default = "default_post_trade_cooldown_secs")]
    pub post_trade_cooldown_secs: u64,

    #[serde(default = "default_jit_funding_wait_secs")]
    pub jit_funding_wait_secs: u64,
    #[serde(default = "default_arrival_poll_secs")]
    pub arrival_poll_interval_secs: u64,

    #[serde(default = "default_order_fetch_attempts")]
    pub order_fetch_attempts: u32,
    #[serde(default = "default_order_fetch_delay_ms")]
    pub order_fetch_delay_ms: u64,

    #[serde(default)]
    pub enforce_whitelist: bool,
    #[serde(default = "default_true")]
    pub prefer_cost_based_buy: bool,
    #[serde(default)]
    pub retry_partial_buy_remainder: bool,
    #[serde(default)]
    pub hold_on_exhausted_open: bool,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_jit_liquid_assets")]
    pub jit_liquid_assets: Vec<String>,
}

fn default_min_gross() -> Decimal { Decimal::new(1, 0) }
fn default_max_gross() -> Decimal { Decimal::new(13, 0) }
fn default_min_net() -> Decimal { Decimal::new(1, 1) }
fn default_min_liquidity() -> Decimal { Decimal::new(200, 0) }
fn default_slippage() -> Decimal { Decimal::new(5, 1) }
fn default_trade_amount() -> Decimal { Decimal::new(100, 0) }
fn default_min_effective_trade() -> Decimal { Decimal::new(20, 0) }
fn default_reserve_buffer() -> Decimal { Decimal::new(5, 0) }
fn default_transfer_fee_buffer() -> Decimal { Decimal::new(2, 0) }
fn default_jit_min_conversion() -> Decimal { Decimal::new(10, 0) }
fn default_stability_cycles() -> u32 { 2 }
fn default_route_cooldown_cycles() -> u64 { 20 }
fn default_top_n() -> usize { 10 }
fn default_cycle_sleep_ms() -> u64 { 5_000 }
fn default_post_trade_cooldown_secs() -> u64 { 60 }
fn default_jit_funding_wait_secs() -> u64 { 120 }
fn default_arrival_poll_secs() -> u64 { 10 }
fn default_order_fetch_attempts() -> u32 { 5 }
fn default_order_fetch_delay_ms() -> u64 { 1_000 }
fn default_true() -> bool { true }
fn default_jit_liquid_assets() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string(), "USDC".to_string()]
}

/// `BASE_ASSET_TRANSFER_WAIT` is always 3x the JIT quote-funding wait.
impl GeneralSection {
    pub fn base_asset_transfer_wait_secs(&self) -> u64 {
        self.jit_funding_wait_secs * 3
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueSection {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Account-type query param used for order placement and holding
    /// the trading balance.
    #[serde(default = "default_account_type")]
    pub trading_account_type: String,
    /// Account-type query param for the withdrawal-eligible balance.
    #[serde(default = "default_account_type")]
    pub withdrawal_account_type: String,
    #[serde(default = "default_min_internal_transfer")]
    pub min_internal_transfer: Decimal,
    pub withdrawal_wallet_type_hint: Option<String>,
    #[serde(default)]
    pub supports_transfer: bool,
}

fn default_account_type() -> String { "spot".to_string() }
fn default_min_internal_transfer() -> Decimal { Decimal::new(1, 0) }

#[derive(Debug, Clone, Deserialize)]
pub struct AssetBlacklistEntry {
    pub venue: String,
    pub asset: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Hash)]
pub struct PathBlacklistEntry {
    pub asset: String,
    pub from: String,
    pub to: String,
    pub network: String,
}

impl TomlConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| "failed to parse TOML configuration")?;
        Ok(config)
    }

    pub fn enabled_venues(&self) -> Vec<&VenueSection> {
        self.venues.iter().filter(|v| v.enabled).collect()
    }

    pub fn asset_blacklist_set(&self) -> HashSet<(String, String)> {
        self.asset_blacklist
            .iter()
            .map(|e| (e.venue.clone(), e.asset.clone()))
            .collect()
    }

    pub fn path_blacklist_set(&self) -> HashSet<PathBlacklistEntry> {
        self.path_blacklist.iter().cloned().collect()
    }

    pub fn whitelist_set(&self) -> HashSet<PathBlacklistEntry> {
        self.whitelist.iter().cloned().collect()
    }
}
