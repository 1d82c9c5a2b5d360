// ── Persistence seam ──
//
// Every mutation runs inside a `StoreTx`. Row reads named `lock_*` take a
// row lock (`SELECT ... FOR UPDATE` on PostgreSQL) that is held until the
// transaction commits or rolls back. Dropping a transaction without
// committing rolls it back.

mod memory;
mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::CoreError;
use crate::model::{
    AddressListAudit, DebtId, LedgerEntry, MacAddress, Package, PackageId, PhoneNumber,
    Transaction, TransactionEvent, TransactionId, User, UserDevice, UserDeviceId, UserId,
    UserQuotaDebt,
};

/// Outcome of a ledger append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAppend {
    Inserted,
    /// `(user, source, idempotency_key)` already present.
    Duplicate,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, CoreError>;

    /// Raw `application_settings` rows.
    async fn load_settings(&self) -> Result<HashMap<String, String>, CoreError>;

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), CoreError>;

    async fn health_check(&self) -> Result<(), CoreError>;
}

#[async_trait]
pub trait StoreTx: Send {
    // ── Users ────────────────────────────────────────────────────────
    async fn get_user(&mut self, id: UserId) -> Result<Option<User>, CoreError>;
    async fn lock_user(&mut self, id: UserId) -> Result<Option<User>, CoreError>;
    async fn find_user_by_phone(&mut self, phone: &PhoneNumber) -> Result<Option<User>, CoreError>;
    async fn insert_user(&mut self, user: &User) -> Result<(), CoreError>;
    async fn update_user(&mut self, user: &User) -> Result<(), CoreError>;
    /// Approved, active users (periodic re-sync).
    async fn active_user_ids(&mut self) -> Result<Vec<UserId>, CoreError>;
    /// Users with `manual_debt_mb > 0`.
    async fn users_with_manual_debt(&mut self) -> Result<Vec<UserId>, CoreError>;

    // ── Devices ──────────────────────────────────────────────────────
    async fn devices_for_user(&mut self, user_id: UserId) -> Result<Vec<UserDevice>, CoreError>;
    async fn get_device(&mut self, id: UserDeviceId) -> Result<Option<UserDevice>, CoreError>;
    async fn authorized_device_by_mac(
        &mut self,
        mac: &MacAddress,
    ) -> Result<Option<UserDevice>, CoreError>;
    async fn upsert_device(&mut self, device: &UserDevice) -> Result<(), CoreError>;
    async fn delete_device(&mut self, id: UserDeviceId) -> Result<(), CoreError>;

    // ── Packages ─────────────────────────────────────────────────────
    async fn get_package(&mut self, id: PackageId) -> Result<Option<Package>, CoreError>;
    async fn insert_package(&mut self, package: &Package) -> Result<(), CoreError>;

    // ── Transactions ─────────────────────────────────────────────────
    async fn get_transaction(&mut self, order_id: &str) -> Result<Option<Transaction>, CoreError>;
    async fn lock_transaction(&mut self, order_id: &str)
    -> Result<Option<Transaction>, CoreError>;
    async fn insert_transaction(&mut self, txn: &Transaction) -> Result<(), CoreError>;
    async fn update_transaction(&mut self, txn: &Transaction) -> Result<(), CoreError>;
    async fn insert_transaction_event(&mut self, event: &TransactionEvent)
    -> Result<(), CoreError>;
    async fn transaction_events(
        &mut self,
        id: TransactionId,
    ) -> Result<Vec<TransactionEvent>, CoreError>;
    /// Non-terminal (`unknown`/`pending`) transactions created before `before`.
    async fn open_transactions(
        &mut self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, CoreError>;

    // ── Manual debts ─────────────────────────────────────────────────
    /// Unpaid items of a user, row-locked. Order is unspecified.
    async fn lock_open_debts(&mut self, user_id: UserId) -> Result<Vec<UserQuotaDebt>, CoreError>;
    async fn lock_debt(&mut self, id: DebtId) -> Result<Option<UserQuotaDebt>, CoreError>;
    async fn insert_debt(&mut self, debt: &UserQuotaDebt) -> Result<(), CoreError>;
    async fn update_debt(&mut self, debt: &UserQuotaDebt) -> Result<(), CoreError>;

    // ── Ledger & audits ──────────────────────────────────────────────
    async fn ledger_entry(
        &mut self,
        user_id: UserId,
        source: &str,
        idempotency_key: &str,
    ) -> Result<Option<LedgerEntry>, CoreError>;
    /// Append inside a savepoint. A uniqueness clash rolls back only the
    /// savepoint and reports `Duplicate`; other failures also roll back the
    /// savepoint and are returned, leaving the outer transaction usable.
    async fn append_ledger(&mut self, entry: &LedgerEntry) -> Result<LedgerAppend, CoreError>;
    async fn ledger_for_user(&mut self, user_id: UserId) -> Result<Vec<LedgerEntry>, CoreError>;
    async fn insert_address_list_audit(&mut self, audit: &AddressListAudit)
    -> Result<(), CoreError>;

    async fn commit(self: Box<Self>) -> Result<(), CoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), CoreError>;
}
