//! Environment-driven configuration: venue API credentials and the
//! path to the static TOML configuration bundle.
//!
//! Credentials never live in the TOML file on disk (spec.md §6 lists
//! them as part of the configuration bundle, but per-venue secrets are
//! exactly the kind of thing that doesn't belong in a checked-in or
//! backed-up text file) — they're read from the environment the same
//! way the teacher's `load_config()` reads `PRIVATE_KEY`/`RPC_URL`.

use anyhow::{Context, Result};
use std::collections::HashMap;

/// One venue's credential set, as read from `VENUE_<ID>_KEY` /
/// `VENUE_<ID>_SECRET` / `VENUE_<ID>_PASSPHRASE` (passphrase optional,
/// only a handful of venues need one).
#[derive(Debug, Clone)]
pub struct VenueCredentials {
    pub venue_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

/// Process-level configuration: where the static bundle lives and what
/// credentials are available to construct gateways with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub toml_config_path: String,
    pub credentials: HashMap<String, VenueCredentials>,
}

/// Loads `.env` (if present) then resolves `CONFIG_PATH` plus one
/// [`VenueCredentials`] per `VENUE_IDS` entry. Missing credentials for a
/// venue named in `VENUE_IDS` are fatal — per spec.md §7, bad/absent
/// credentials are an auth-class configuration error, not something to
/// silently skip.
pub fn load_runtime_config() -> Result<RuntimeConfig> {
    dotenv::dotenv().ok();

    let toml_config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let venue_ids = std::env::var("VENUE_IDS").context("VENUE_IDS not set (comma-separated venue ids)")?;

    let mut credentials = HashMap::new();
    for venue_id in venue_ids.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let prefix = venue_id.to_uppercase().replace('-', "_");
        let api_key = std::env::var(format!("VENUE_{prefix}_KEY"))
            .with_context(|| format!("VENUE_{prefix}_KEY not set for venue {venue_id}"))?;
        let api_secret = std::env::var(format!("VENUE_{prefix}_SECRET"))
            .with_context(|| format!("VENUE_{prefix}_SECRET not set for venue {venue_id}"))?;
        let passphrase = std::env::var(format!("VENUE_{prefix}_PASSPHRASE")).ok();

        credentials.insert(
            venue_id.to_string(),
            VenueCredentials { venue_id: venue_id.to_string(), api_key, api_secret, passphrase },
        );
    }

    Ok(RuntimeConfig { toml_config_path, credentials })
}
