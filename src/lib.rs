//! # meter-gate
//!
//! Tenant admission and metered usage billing.
//!
//! A tenant is admitted when it is an admin, holds an active paid period, or still
//! has free trial uses left. Paid periods come from plan purchases or one-time
//! redeem codes. Finished work is billed per minute against the tenant's price
//! schedule, with tiered rates that reset every UTC day, and every asynchronous
//! task is charged exactly once.
//!
//! ```rust,no_run
//! use meter_gate::{AccessGate, GateConfig, UsageEvent};
//! use rust_decimal_macros::dec;
//!
//! #[tokio::main]
//! async fn main() -> meter_gate::Result<()> {
//!     let config = GateConfig::builder()
//!         .trial_limit(3)
//!         .admin("ops")
//!         .snapshot_path("gate-state.json")
//!         .build();
//!     let gate = AccessGate::open(config).await?;
//!
//!     let status = gate.consume("base-1");
//!     if status.allowed {
//!         let receipt = gate.record_usage(&UsageEvent::new("base-1").minutes(dec!(2)))?;
//!         println!("charged {} ({} today)", receipt.charged_cost, receipt.daily_cost);
//!     } else {
//!         println!("{}", status.message);
//!     }
//!
//!     gate.flush().await;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod billing;
pub mod charge;
pub mod clock;
pub mod config;
pub mod gate;
pub mod observability;
pub mod persistence;
pub mod pricing;
pub mod subscription;
pub mod tenant;

pub use billing::{BillingLedger, DailyUsage, UsageEvent, UsageReceipt, UsageTotal};
pub use charge::{ChargeBridge, PendingCharge};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigSource, EnvConfigSource, GateConfig, MemoryConfigSource};
pub use gate::AccessGate;
pub use observability::{LedgerMetrics, MetricsSummary};
pub use persistence::{JsonFileStore, LedgerSnapshot, MemoryStore, SnapshotStore, SyncMode};
pub use pricing::{PricingOverride, PricingProfile, TieredPrice};
pub use subscription::{AccessReason, AccessStatus, RedeemCode, RedeemOutcome, SubscriptionLedger};
pub use tenant::TenantKey;

/// Error type for meter-gate operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing tenant, blank code, non-positive duration or malformed pricing.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Lookup failed, e.g. an unknown redeem code.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The target is in a state that forbids the operation, e.g. a used redeem code.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Snapshot could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Admin operation attempted without authorization.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected caller input
    Validation,
    /// Unknown identifiers
    Lookup,
    /// State conflicts (already used, already billed)
    Conflict,
    /// Admin-only operations
    Authorization,
    /// Startup configuration
    Configuration,
    /// Storage, IO and serialization failures
    Internal,
}

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Error::Persistence(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Error::Unauthorized(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidInput(_) => ErrorCategory::Validation,
            Error::NotFound(_) => ErrorCategory::Lookup,
            Error::Conflict(_) => ErrorCategory::Conflict,
            Error::Unauthorized(_) => ErrorCategory::Authorization,
            Error::Config(_) => ErrorCategory::Configuration,
            Error::Persistence(_) | Error::Io(_) | Error::Json(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_authorization_error(&self) -> bool {
        self.category() == ErrorCategory::Authorization
    }

    pub fn is_configuration_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    /// Caller mistakes, as opposed to failures of the gate itself.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self.category(),
            ErrorCategory::Internal | ErrorCategory::Configuration
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::InvalidValue { key, message } => {
                Error::Config(format!("Invalid value for {}: {}", key, message))
            }
            config::ConfigError::Env(e) => Error::Config(e.to_string()),
        }
    }
}

/// Result type alias for meter-gate operations.
pub type Result<T> = std::result::Result<T, Error>;
