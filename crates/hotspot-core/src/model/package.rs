// ── Packages ──

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use super::ids::PackageId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    /// Integer minor units (IDR has none, so rupiah).
    pub price: i64,
    /// `0` means unlimited.
    pub quota_gb: Decimal,
    pub duration_days: i64,
    pub is_active: bool,
}

impl Package {
    pub fn is_unlimited(&self) -> bool {
        self.quota_gb.is_zero()
    }

    /// Quota in MB (`1 GB = 1024 MB`), rounded half away from zero.
    pub fn quota_mb(&self) -> i64 {
        (self.quota_gb * Decimal::from(1024))
            .round()
            .to_i64()
            .unwrap_or(i64::MAX)
    }
}
