// In-memory store
//
// Transactions are fully serialized: `begin()` takes the single state mutex
// and works on a copy that `commit()` writes back. Unique constraints of the
// PostgreSQL schema are enforced so tests observe the same conflicts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LedgerAppend, Store, StoreTx};
use crate::error::CoreError;
use crate::model::{
    AddressListAudit, DebtId, LedgerEntry, MacAddress, Package, PackageId, PhoneNumber,
    Transaction, TransactionEvent, TransactionId, TransactionStatus, User, UserDevice,
    UserDeviceId, UserId, UserQuotaDebt,
};

#[derive(Debug, Clone, Default)]
struct State {
    users: HashMap<UserId, User>,
    devices: HashMap<UserDeviceId, UserDevice>,
    packages: HashMap<PackageId, Package>,
    transactions: HashMap<String, Transaction>,
    events: Vec<TransactionEvent>,
    debts: HashMap<DebtId, UserQuotaDebt>,
    ledger: Vec<LedgerEntry>,
    audits: Vec<AddressListAudit>,
    settings: HashMap<String, String>,
}

/// Process-local store for tests and single-process demos.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every address-list audit row written so far.
    pub async fn address_list_audits(&self) -> Vec<AddressListAudit> {
        self.state.lock().await.audits.clone()
    }

    /// Every ledger row written so far, oldest first.
    pub async fn ledger(&self) -> Vec<LedgerEntry> {
        self.state.lock().await.ledger.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, CoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }

    async fn load_settings(&self) -> Result<HashMap<String, String>, CoreError> {
        Ok(self.state.lock().await.settings.clone())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .settings
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    work: State,
}

fn integrity(message: impl Into<String>) -> CoreError {
    CoreError::Integrity {
        message: message.into(),
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    // ── Users ────────────────────────────────────────────────────────

    async fn get_user(&mut self, id: UserId) -> Result<Option<User>, CoreError> {
        Ok(self.work.users.get(&id).cloned())
    }

    async fn lock_user(&mut self, id: UserId) -> Result<Option<User>, CoreError> {
        Ok(self.work.users.get(&id).cloned())
    }

    async fn find_user_by_phone(&mut self, phone: &PhoneNumber) -> Result<Option<User>, CoreError> {
        Ok(self.work.users.values().find(|u| &u.phone == phone).cloned())
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), CoreError> {
        if self.work.users.values().any(|u| u.phone == user.phone) {
            return Err(integrity(format!("duplicate phone {}", user.phone)));
        }
        self.work.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user(&mut self, user: &User) -> Result<(), CoreError> {
        if user.used_mb.is_sign_negative() || user.purchased_mb < 0 {
            return Err(integrity("users quota check violated"));
        }
        match self.work.users.get_mut(&user.id) {
            Some(slot) => {
                *slot = user.clone();
                Ok(())
            }
            None => Err(CoreError::not_found("user", user.id)),
        }
    }

    async fn active_user_ids(&mut self) -> Result<Vec<UserId>, CoreError> {
        let mut ids: Vec<UserId> = self
            .work
            .users
            .values()
            .filter(|u| u.is_active && u.approval_status == crate::model::ApprovalStatus::Approved)
            .map(|u| u.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn users_with_manual_debt(&mut self) -> Result<Vec<UserId>, CoreError> {
        let mut ids: Vec<UserId> = self
            .work
            .users
            .values()
            .filter(|u| u.manual_debt_mb > 0)
            .map(|u| u.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    // ── Devices ──────────────────────────────────────────────────────

    async fn devices_for_user(&mut self, user_id: UserId) -> Result<Vec<UserDevice>, CoreError> {
        let mut devices: Vec<UserDevice> = self
            .work
            .devices
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.first_seen_at);
        Ok(devices)
    }

    async fn get_device(&mut self, id: UserDeviceId) -> Result<Option<UserDevice>, CoreError> {
        Ok(self.work.devices.get(&id).cloned())
    }

    async fn authorized_device_by_mac(
        &mut self,
        mac: &MacAddress,
    ) -> Result<Option<UserDevice>, CoreError> {
        Ok(self
            .work
            .devices
            .values()
            .find(|d| d.authorized && &d.mac == mac)
            .cloned())
    }

    async fn upsert_device(&mut self, device: &UserDevice) -> Result<(), CoreError> {
        if device.authorized
            && self
                .work
                .devices
                .values()
                .any(|d| d.id != device.id && d.authorized && d.mac == device.mac)
        {
            return Err(integrity(format!("MAC {} already authorized", device.mac)));
        }
        self.work.devices.insert(device.id, device.clone());
        Ok(())
    }

    async fn delete_device(&mut self, id: UserDeviceId) -> Result<(), CoreError> {
        self.work.devices.remove(&id);
        Ok(())
    }

    // ── Packages ─────────────────────────────────────────────────────

    async fn get_package(&mut self, id: PackageId) -> Result<Option<Package>, CoreError> {
        Ok(self.work.packages.get(&id).cloned())
    }

    async fn insert_package(&mut self, package: &Package) -> Result<(), CoreError> {
        self.work.packages.insert(package.id, package.clone());
        Ok(())
    }

    // ── Transactions ─────────────────────────────────────────────────

    async fn get_transaction(&mut self, order_id: &str) -> Result<Option<Transaction>, CoreError> {
        Ok(self.work.transactions.get(order_id).cloned())
    }

    async fn lock_transaction(
        &mut self,
        order_id: &str,
    ) -> Result<Option<Transaction>, CoreError> {
        Ok(self.work.transactions.get(order_id).cloned())
    }

    async fn insert_transaction(&mut self, txn: &Transaction) -> Result<(), CoreError> {
        if self.work.transactions.contains_key(&txn.order_id) {
            return Err(integrity(format!("duplicate order id {}", txn.order_id)));
        }
        self.work
            .transactions
            .insert(txn.order_id.clone(), txn.clone());
        Ok(())
    }

    async fn update_transaction(&mut self, txn: &Transaction) -> Result<(), CoreError> {
        match self.work.transactions.get_mut(&txn.order_id) {
            Some(slot) => {
                *slot = txn.clone();
                Ok(())
            }
            None => Err(CoreError::not_found("transaction", &txn.order_id)),
        }
    }

    async fn insert_transaction_event(
        &mut self,
        event: &TransactionEvent,
    ) -> Result<(), CoreError> {
        self.work.events.push(event.clone());
        Ok(())
    }

    async fn transaction_events(
        &mut self,
        id: TransactionId,
    ) -> Result<Vec<TransactionEvent>, CoreError> {
        Ok(self
            .work
            .events
            .iter()
            .filter(|e| e.transaction_id == id)
            .cloned()
            .collect())
    }

    async fn open_transactions(
        &mut self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, CoreError> {
        let mut open: Vec<Transaction> = self
            .work
            .transactions
            .values()
            .filter(|t| {
                matches!(
                    t.status,
                    TransactionStatus::Unknown | TransactionStatus::Pending
                ) && t.created_at < before
            })
            .cloned()
            .collect();
        open.sort_by_key(|t| t.created_at);
        Ok(open)
    }

    // ── Manual debts ─────────────────────────────────────────────────

    async fn lock_open_debts(&mut self, user_id: UserId) -> Result<Vec<UserQuotaDebt>, CoreError> {
        Ok(self
            .work
            .debts
            .values()
            .filter(|d| d.user_id == user_id && !d.is_paid)
            .cloned()
            .collect())
    }

    async fn lock_debt(&mut self, id: DebtId) -> Result<Option<UserQuotaDebt>, CoreError> {
        Ok(self.work.debts.get(&id).cloned())
    }

    async fn insert_debt(&mut self, debt: &UserQuotaDebt) -> Result<(), CoreError> {
        if debt.amount_mb <= 0 {
            return Err(integrity("debt amount must be positive"));
        }
        self.work.debts.insert(debt.id, debt.clone());
        Ok(())
    }

    async fn update_debt(&mut self, debt: &UserQuotaDebt) -> Result<(), CoreError> {
        if debt.paid_mb > debt.amount_mb {
            return Err(integrity("paid_mb exceeds amount_mb"));
        }
        self.work.debts.insert(debt.id, debt.clone());
        Ok(())
    }

    // ── Ledger & audits ──────────────────────────────────────────────

    async fn ledger_entry(
        &mut self,
        user_id: UserId,
        source: &str,
        idempotency_key: &str,
    ) -> Result<Option<LedgerEntry>, CoreError> {
        Ok(self
            .work
            .ledger
            .iter()
            .find(|e| {
                e.user_id == user_id && e.source == source && e.idempotency_key == idempotency_key
            })
            .cloned())
    }

    async fn append_ledger(&mut self, entry: &LedgerEntry) -> Result<LedgerAppend, CoreError> {
        let exists = self.work.ledger.iter().any(|e| {
            e.user_id == entry.user_id
                && e.source == entry.source
                && e.idempotency_key == entry.idempotency_key
        });
        if exists {
            return Ok(LedgerAppend::Duplicate);
        }
        self.work.ledger.push(entry.clone());
        Ok(LedgerAppend::Inserted)
    }

    async fn ledger_for_user(&mut self, user_id: UserId) -> Result<Vec<LedgerEntry>, CoreError> {
        Ok(self
            .work
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_address_list_audit(
        &mut self,
        audit: &AddressListAudit,
    ) -> Result<(), CoreError> {
        self.work.audits.push(audit.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        let Self { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), CoreError> {
        Ok(())
    }
}
