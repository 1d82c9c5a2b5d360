// ── Domain model ──
//
// Canonical records persisted by the store. Enum-valued columns carry a
// snake_case string form (strum) that matches the CHECK constraints.

pub mod debt;
pub mod device;
pub mod ids;
pub mod ledger;
pub mod mac;
pub mod package;
pub mod phone;
pub mod transaction;
pub mod user;

pub use debt::UserQuotaDebt;
pub use device::UserDevice;
pub use ids::{DebtId, PackageId, TransactionId, UserDeviceId, UserId};
pub use ledger::{AddressListAudit, LedgerEntry};
pub use mac::{MacAddress, normalize_mac};
pub use package::Package;
pub use phone::{PhoneNumber, normalize_to_e164};
pub use transaction::{
    EventSource, OrderKind, Transaction, TransactionEvent, TransactionStatus, new_debt_order_id,
    new_package_order_id,
};
pub use user::{ApprovalStatus, QuotaSnapshot, User, UserRole};
