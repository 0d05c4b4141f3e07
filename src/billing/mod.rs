//! Metered usage billing against per-tenant pricing.

mod ledger;
mod usage;

pub use ledger::BillingLedger;
pub use usage::{DailyUsage, UsageEvent, UsageReceipt, UsageTotal};
