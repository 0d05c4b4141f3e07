//! Tenant admission: free trials, paid periods, admin accounts and redeem codes.

mod ledger;
mod redeem;

pub use ledger::{
    AccessReason, AccessStatus, DEFAULT_TRIAL_LIMIT, RedeemOutcome, SubscriptionLedger,
};
pub use redeem::{RedeemCode, hash_code};
