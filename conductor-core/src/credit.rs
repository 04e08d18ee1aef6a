use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunId;

/// A provisional hold against a tenant's credit balance. Exactly one active
/// reservation exists per run; `consumed <= reserved <= max_amount` holds
/// until release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditReservation {
    pub run_id: RunId,
    pub tenant_id: String,
    pub reserved: i64,
    pub consumed: i64,
    pub max_amount: i64,
    pub expires_at: DateTime<Utc>,
    pub released: bool,
    pub created_at: DateTime<Utc>,
}

impl CreditReservation {
    /// Amount still spendable without a top-up.
    pub fn available(&self) -> i64 {
        self.reserved - self.consumed
    }

    /// Amount refunded to the tenant when the reservation is released.
    pub fn unconsumed(&self) -> i64 {
        self.reserved - self.consumed
    }
}
