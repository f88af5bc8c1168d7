//! Error taxonomy for the arbitrage engine.
//!
//! Gateway-facing errors are modeled explicitly so the scanner, analyzer,
//! and executor can distinguish retryable transport failures from
//! terminal venue rejections without parsing strings.

use thiserror::Error;

/// Errors surfaced by an [`crate::gateway::ExchangeGateway`] implementation.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("network error talking to {venue}: {message}")]
    Network { venue: String, message: String },

    #[error("rate limited by {venue}, retry after {retry_after_ms:?}ms")]
    RateLimited {
        venue: String,
        retry_after_ms: Option<u64>,
    },

    #[error("{venue} rejected request: {message}")]
    Rejected { venue: String, message: String },

    #[error("{venue} reported insufficient balance for {asset}")]
    InsufficientBalance { venue: String, asset: String },

    #[error("{venue} has no deposit address for asset {asset} on network {network}")]
    NoDepositAddress {
        venue: String,
        asset: String,
        network: String,
    },

    #[error("{venue} authentication failed: {message}")]
    AuthFailed { venue: String, message: String },

    #[error("{venue} timed out after {timeout_ms}ms")]
    Timeout { venue: String, timeout_ms: u64 },
}

impl GatewayError {
    /// Transport-level failures worth a bounded retry; venue-level
    /// rejections (bad balance, missing address, auth) are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Network { .. }
                | GatewayError::RateLimited { .. }
                | GatewayError::Timeout { .. }
        )
    }

    pub fn venue(&self) -> &str {
        match self {
            GatewayError::Network { venue, .. }
            | GatewayError::RateLimited { venue, .. }
            | GatewayError::Rejected { venue, .. }
            | GatewayError::InsufficientBalance { venue, .. }
            | GatewayError::NoDepositAddress { venue, .. }
            | GatewayError::AuthFailed { venue, .. }
            | GatewayError::Timeout { venue, .. } => venue,
        }
    }
}

/// Top-level engine error, covering the pipeline stages that sit above
/// individual gateway calls.
#[derive(Debug, Error)]
pub enum ArbError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("no compatible network between {source_venue} (withdraw) and {dest_venue} (deposit) for asset {asset}")]
    NoCompatibleNetwork {
        source_venue: String,
        dest_venue: String,
        asset: String,
    },

    #[error("order book depth insufficient for {symbol} on {venue}: requested {requested}, available {available}")]
    InsufficientDepth {
        venue: String,
        symbol: String,
        requested: String,
        available: String,
    },

    #[error("quantized amount {amount} is below the minimum tradeable quantum for {asset}")]
    BelowQuantum { asset: String, amount: String },

    #[error("route {source_venue}->{dest_venue}:{asset} is cooling down for another {remaining_secs}s")]
    RouteCoolingDown {
        source_venue: String,
        dest_venue: String,
        asset: String,
        remaining_secs: u64,
    },

    #[error("asset {asset} is blocked by the leveraged-token filter (matched pattern {pattern})")]
    LeveragedTokenBlocked { asset: String, pattern: String },

    #[error("executor reached terminal failure state {state} for opportunity {opportunity_id}")]
    ExecutionFailed {
        opportunity_id: String,
        state: String,
    },

    #[error("arrival wait on {venue} for {asset} timed out after {waited_secs}s (expected +{expected})")]
    ArrivalTimeout {
        venue: String,
        asset: String,
        waited_secs: u64,
        expected: String,
    },

    #[error("{venue} requires a memo/tag for {asset} on network {network} but none was returned")]
    MemoRequired {
        venue: String,
        asset: String,
        network: String,
    },

    #[error("deposit address on {venue} for {asset} returned network {returned} incompatible with requested {requested}")]
    AddressIncompatible {
        venue: String,
        asset: String,
        requested: String,
        returned: String,
    },

    #[error("insufficient quote funding for {venue}: needed {needed}, best available {available}")]
    FundingShortfall {
        venue: String,
        needed: String,
        available: String,
    },

    #[error("order {order_id} on {venue} was canceled with zero fill")]
    CanceledZeroFill { venue: String, order_id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ArbResult<T> = Result<T, ArbError>;
