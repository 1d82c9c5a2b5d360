// Shared fixtures for the engine integration tests.
//
// `MemoryRouter` keeps hotspot tables in plain vectors and can be switched
// offline; `FakeProvider` answers checkout, status and cancel from a map of
// scripted provider statuses and signs webhooks with a fixed server key.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hotspot_core::error::CoreError;
use hotspot_core::gateway::HotspotGateway;
use hotspot_core::jobs::JobPeriods;
use hotspot_core::locks::LockManager;
use hotspot_core::metrics::InMemoryMetrics;
use hotspot_core::notify::NotificationDispatcher;
use hotspot_core::model::{
    AddressListAudit, ApprovalStatus, DebtId, LedgerEntry, MacAddress, Package, PackageId,
    PhoneNumber, Transaction, TransactionEvent, TransactionId, User, UserDevice, UserDeviceId,
    UserId, UserQuotaDebt, normalize_mac, normalize_to_e164,
};
use hotspot_core::payment::{
    CheckoutRequest, CheckoutSession, PaymentProvider, ProviderStatus, notification_signature,
};
use hotspot_core::portal::{Portal, PortalParts};
use hotspot_core::settings::{Settings, SettingsProvider};
use hotspot_core::store::{LedgerAppend, MemoryStore, Store, StoreTx};
use hotspot_routeros::{
    AddressListEntry, AddressListSpec, BindingType, DhcpLeaseSpec, HotspotActive, HotspotUser,
    HotspotUserSpec, IpBinding, IpBindingSpec, MacSource, RowId, UpsertOutcome,
};
use rust_decimal::Decimal;
use serde_json::{Value, json};

pub const SERVER_KEY: &str = "SB-Mid-server-test";

// ── Router ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub id: RowId,
    pub list: String,
    pub address: String,
    pub comment: String,
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub id: RowId,
    pub mac: String,
    pub address: String,
    pub comment: String,
}

#[derive(Debug, Default)]
pub struct RouterTables {
    pub users: Vec<HotspotUser>,
    pub bindings: Vec<IpBinding>,
    pub address_lists: Vec<ListEntry>,
    pub leases: Vec<Lease>,
    pub hosts: Vec<(String, String)>,
    pub arp: Vec<(String, String)>,
    pub active: Vec<HotspotActive>,
    pub connections: Vec<String>,
    /// `ip -> mac` answers for `find_mac_by_ip`.
    pub neighbours: HashMap<String, String>,
    /// MACs whose ip-binding ignores writes.
    pub pinned: HashSet<String>,
    /// `(list, address)` rows that removals leave in place.
    pub pinned_entries: HashSet<(String, String)>,
}

#[derive(Debug, Default)]
pub struct MemoryRouter {
    pub tables: Mutex<RouterTables>,
    offline: AtomicBool,
    drop_list_writes: AtomicBool,
    next_id: AtomicU32,
}

impl MemoryRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Acknowledge address-list upserts without storing them.
    pub fn set_list_writes_dropped(&self, dropped: bool) {
        self.drop_list_writes.store(dropped, Ordering::SeqCst);
    }

    pub fn add_neighbour(&self, ip: &str, mac: &str) {
        let mut t = self.tables.lock().unwrap();
        t.neighbours.insert(ip.to_owned(), mac.to_owned());
        t.hosts.push((mac.to_owned(), ip.to_owned()));
        t.arp.push((mac.to_owned(), ip.to_owned()));
    }

    pub fn add_session(&self, user: &str, ip: &str, mac: &str) {
        let id = self.row_id();
        self.tables.lock().unwrap().active.push(HotspotActive {
            id,
            user: Some(user.to_owned()),
            address: Some(ip.to_owned()),
            mac: Some(mac.to_owned()),
            uptime_secs: 60,
            bytes_in: 0,
            bytes_out: 0,
        });
    }

    pub fn profile_of(&self, name: &str) -> Option<String> {
        let t = self.tables.lock().unwrap();
        t.users.iter().find(|u| u.name == name).and_then(|u| u.profile.clone())
    }

    pub fn binding_for(&self, mac: &str) -> Option<IpBinding> {
        let t = self.tables.lock().unwrap();
        t.bindings.iter().find(|b| b.mac.as_deref() == Some(mac)).cloned()
    }

    /// Lists `address` is currently a member of, sorted.
    pub fn lists_of(&self, address: &str) -> Vec<String> {
        let t = self.tables.lock().unwrap();
        let mut lists: Vec<String> = t
            .address_lists
            .iter()
            .filter(|e| e.address == address)
            .map(|e| e.list.clone())
            .collect();
        lists.sort();
        lists
    }

    /// Force a binding type behind the engine's back. Later upserts for the
    /// MAC are acknowledged but not applied, like a router script reverting
    /// them.
    pub fn tamper_binding(&self, mac: &str, binding_type: BindingType) {
        let mut t = self.tables.lock().unwrap();
        for b in t.bindings.iter_mut().filter(|b| b.mac.as_deref() == Some(mac)) {
            b.binding_type = binding_type;
        }
        t.pinned.insert(mac.to_owned());
    }

    /// Leave a managed address-list row that later removals cannot clear,
    /// like an entry another tool keeps re-adding.
    pub fn plant_list_entry(&self, list: &str, address: &str, comment: &str) {
        let id = self.row_id();
        let mut t = self.tables.lock().unwrap();
        t.address_lists.push(ListEntry {
            id,
            list: list.to_owned(),
            address: address.to_owned(),
            comment: comment.to_owned(),
        });
        t.pinned_entries.insert((list.to_owned(), address.to_owned()));
    }

    fn row_id(&self) -> RowId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        RowId::parse(&format!("{n:X}")).unwrap()
    }

    fn check(&self) -> Result<(), CoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CoreError::Gateway {
                message: "connection refused".into(),
                connection: true,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HotspotGateway for MemoryRouter {
    fn router_key(&self) -> String {
        "memory:8728".into()
    }

    async fn system_identity(&self) -> Result<String, CoreError> {
        self.check()?;
        Ok("hs-gw".into())
    }

    async fn find_hotspot_user(&self, name: &str) -> Result<Option<HotspotUser>, CoreError> {
        self.check()?;
        let t = self.tables.lock().unwrap();
        Ok(t.users.iter().find(|u| u.name == name).cloned())
    }

    async fn ensure_hotspot_user(
        &self,
        spec: &HotspotUserSpec,
    ) -> Result<(HotspotUser, bool), CoreError> {
        self.check()?;
        if let Some(existing) = self.find_hotspot_user(&spec.name).await? {
            return Ok((existing, false));
        }
        let row = HotspotUser {
            id: self.row_id(),
            name: spec.name.clone(),
            profile: Some(spec.profile.clone()),
            server: spec.server.clone(),
            comment: Some(spec.comment.clone()),
            disabled: false,
        };
        self.tables.lock().unwrap().users.push(row.clone());
        Ok((row, true))
    }

    async fn set_hotspot_user_profile(&self, id: &RowId, profile: &str) -> Result<(), CoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        let user = t.users.iter_mut().find(|u| u.id == *id).ok_or_else(|| CoreError::Gateway {
            message: "no such item".into(),
            connection: false,
        })?;
        user.profile = Some(profile.to_owned());
        Ok(())
    }

    async fn ip_bindings_for_mac(&self, mac: &str) -> Result<Vec<IpBinding>, CoreError> {
        self.check()?;
        let t = self.tables.lock().unwrap();
        Ok(t.bindings
            .iter()
            .filter(|b| b.mac.as_deref() == Some(mac))
            .cloned()
            .collect())
    }

    async fn upsert_ip_binding(&self, spec: &IpBindingSpec) -> Result<UpsertOutcome, CoreError> {
        self.check()?;
        let id = self.row_id();
        let mut t = self.tables.lock().unwrap();
        let pinned = t.pinned.contains(&spec.mac);
        if let Some(b) = t.bindings.iter_mut().find(|b| b.mac.as_deref() == Some(spec.mac.as_str())) {
            if pinned
                || (b.binding_type == spec.binding_type && b.comment.as_deref() == Some(spec.comment.as_str()))
            {
                return Ok(UpsertOutcome::Unchanged { id: b.id.clone() });
            }
            let previous_address = b.address.clone();
            b.binding_type = spec.binding_type;
            b.address.clone_from(&spec.address);
            b.comment = Some(spec.comment.clone());
            return Ok(UpsertOutcome::Updated {
                id: b.id.clone(),
                previous_address,
            });
        }
        t.bindings.push(IpBinding {
            id: id.clone(),
            mac: Some(spec.mac.clone()),
            address: spec.address.clone(),
            server: spec.server.clone(),
            binding_type: spec.binding_type,
            comment: Some(spec.comment.clone()),
            disabled: false,
        });
        Ok(UpsertOutcome::Created { id: Some(id) })
    }

    async fn remove_ip_bindings_for_mac(&self, mac: &str) -> Result<usize, CoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        let before = t.bindings.len();
        t.bindings.retain(|b| b.mac.as_deref() != Some(mac));
        Ok(before - t.bindings.len())
    }

    async fn upsert_dhcp_static_lease(
        &self,
        spec: &DhcpLeaseSpec,
    ) -> Result<UpsertOutcome, CoreError> {
        self.check()?;
        let id = self.row_id();
        let mut t = self.tables.lock().unwrap();
        if let Some(l) = t.leases.iter_mut().find(|l| l.mac == spec.mac) {
            if l.address == spec.address {
                return Ok(UpsertOutcome::Unchanged { id: l.id.clone() });
            }
            let previous = std::mem::replace(&mut l.address, spec.address.clone());
            return Ok(UpsertOutcome::Updated {
                id: l.id.clone(),
                previous_address: Some(previous),
            });
        }
        t.leases.push(Lease {
            id: id.clone(),
            mac: spec.mac.clone(),
            address: spec.address.clone(),
            comment: spec.comment.clone(),
        });
        Ok(UpsertOutcome::Created { id: Some(id) })
    }

    async fn remove_dhcp_leases_for_mac(&self, mac: &str) -> Result<usize, CoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        let before = t.leases.len();
        t.leases.retain(|l| l.mac != mac);
        Ok(before - t.leases.len())
    }

    async fn address_list_entries(
        &self,
        address: &str,
    ) -> Result<Vec<AddressListEntry>, CoreError> {
        self.check()?;
        let t = self.tables.lock().unwrap();
        Ok(t.address_lists
            .iter()
            .filter(|e| e.address == address)
            .map(|e| AddressListEntry {
                id: e.id.clone(),
                list: e.list.clone(),
                address: e.address.clone(),
                comment: Some(e.comment.clone()),
                dynamic: false,
            })
            .collect())
    }

    async fn upsert_address_list_entry(
        &self,
        spec: &AddressListSpec,
    ) -> Result<UpsertOutcome, CoreError> {
        self.check()?;
        let id = self.row_id();
        let mut t = self.tables.lock().unwrap();
        if let Some(e) = t
            .address_lists
            .iter()
            .find(|e| e.list == spec.list && e.address == spec.address)
        {
            return Ok(UpsertOutcome::Unchanged { id: e.id.clone() });
        }
        let owned = t.address_lists.iter_mut().find(|e| {
            e.list == spec.list && e.comment.split('|').any(|part| part == spec.owner_token)
        });
        if let Some(e) = owned {
            let previous = std::mem::replace(&mut e.address, spec.address.clone());
            e.comment.clone_from(&spec.comment);
            return Ok(UpsertOutcome::Updated {
                id: e.id.clone(),
                previous_address: Some(previous),
            });
        }
        if self.drop_list_writes.load(Ordering::SeqCst) {
            return Ok(UpsertOutcome::Created { id: Some(id) });
        }
        t.address_lists.push(ListEntry {
            id: id.clone(),
            list: spec.list.clone(),
            address: spec.address.clone(),
            comment: spec.comment.clone(),
        });
        Ok(UpsertOutcome::Created { id: Some(id) })
    }

    async fn remove_address_list_entries(
        &self,
        address: &str,
        lists: &[String],
    ) -> Result<usize, CoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        let before = t.address_lists.len();
        let pinned = std::mem::take(&mut t.pinned_entries);
        t.address_lists.retain(|e| {
            !(e.address == address
                && lists.contains(&e.list)
                && !pinned.contains(&(e.list.clone(), e.address.clone())))
        });
        t.pinned_entries = pinned;
        Ok(before - t.address_lists.len())
    }

    async fn remove_hotspot_hosts_for_mac(&self, mac: &str) -> Result<usize, CoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        let before = t.hosts.len();
        t.hosts.retain(|(m, _)| m != mac);
        Ok(before - t.hosts.len())
    }

    async fn remove_arp_for_mac(&self, mac: &str) -> Result<usize, CoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        let before = t.arp.len();
        t.arp.retain(|(m, _)| m != mac);
        Ok(before - t.arp.len())
    }

    async fn hotspot_active_for_user(&self, user: &str) -> Result<Vec<HotspotActive>, CoreError> {
        self.check()?;
        let t = self.tables.lock().unwrap();
        Ok(t.active
            .iter()
            .filter(|a| a.user.as_deref() == Some(user))
            .cloned()
            .collect())
    }

    async fn remove_hotspot_active_for_user(&self, user: &str) -> Result<usize, CoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        let before = t.active.len();
        t.active.retain(|a| a.user.as_deref() != Some(user));
        Ok(before - t.active.len())
    }

    async fn remove_connections_for_ip(&self, ip: &str) -> Result<usize, CoreError> {
        self.check()?;
        let mut t = self.tables.lock().unwrap();
        let before = t.connections.len();
        t.connections.retain(|c| c != ip);
        Ok(before - t.connections.len())
    }

    async fn find_mac_by_ip(&self, ip: &str) -> Result<Option<(String, MacSource)>, CoreError> {
        self.check()?;
        let t = self.tables.lock().unwrap();
        Ok(t.neighbours
            .get(ip)
            .map(|mac| (mac.clone(), MacSource::HotspotHost)))
    }
}

// ── Payment provider ────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FakeProvider {
    /// Scripted answers for `status`, keyed by order id.
    pub statuses: Mutex<HashMap<String, Value>>,
    pub checkouts: Mutex<Vec<CheckoutRequest>>,
    pub fail_checkout: AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, order_id: &str, transaction_status: &str) {
        let body = provider_body(order_id, transaction_status, "50000.00");
        self.statuses
            .lock()
            .unwrap()
            .insert(order_id.to_owned(), body);
    }
}

/// A provider body with a valid signature.
pub fn provider_body(order_id: &str, transaction_status: &str, gross_amount: &str) -> Value {
    let status_code = match transaction_status {
        "settlement" | "capture" => "200",
        "pending" => "201",
        _ => "202",
    };
    json!({
        "order_id": order_id,
        "transaction_status": transaction_status,
        "status_code": status_code,
        "gross_amount": gross_amount,
        "payment_type": "qris",
        "signature_key": notification_signature(order_id, status_code, gross_amount, SERVER_KEY),
    })
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create_checkout(&self, req: &CheckoutRequest) -> Result<CheckoutSession, CoreError> {
        if self.fail_checkout.load(Ordering::SeqCst) {
            return Err(CoreError::Payment {
                message: "provider unavailable".into(),
                status: Some(503),
            });
        }
        self.checkouts.lock().unwrap().push(req.clone());
        Ok(CheckoutSession {
            token: format!("snap-{}", req.order_id),
            redirect_url: format!("https://pay.example/{}", req.order_id),
        })
    }

    async fn status(&self, order_id: &str) -> Result<ProviderStatus, CoreError> {
        let body = self.statuses.lock().unwrap().get(order_id).cloned();
        match body {
            Some(body) => ProviderStatus::from_json(body),
            None => Err(CoreError::not_found("transaction", order_id)),
        }
    }

    async fn cancel(&self, order_id: &str) -> Result<ProviderStatus, CoreError> {
        self.script(order_id, "cancel");
        self.status(order_id).await
    }

    fn verify_notification(&self, n: &ProviderStatus) -> bool {
        n.signature_key.as_deref()
            == Some(
                notification_signature(&n.order_id, &n.status_code, &n.gross_amount, SERVER_KEY)
                    .as_str(),
            )
    }
}

// ── Store with a failing ledger ─────────────────────────────────────

/// `MemoryStore` whose next ledger append for a key ending in `suffix`
/// fails with a storage error. Everything else is delegated.
pub struct FlakyLedgerStore {
    inner: MemoryStore,
    suffix: String,
    armed: Arc<AtomicBool>,
}

impl FlakyLedgerStore {
    pub fn new(inner: MemoryStore, suffix: &str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            suffix: suffix.to_owned(),
            armed: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn tripped(&self) -> bool {
        !self.armed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for FlakyLedgerStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, CoreError> {
        Ok(Box::new(FlakyTx {
            inner: self.inner.begin().await?,
            suffix: self.suffix.clone(),
            armed: Arc::clone(&self.armed),
        }))
    }

    async fn load_settings(&self) -> Result<HashMap<String, String>, CoreError> {
        self.inner.load_settings().await
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.inner.put_setting(key, value).await
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        self.inner.health_check().await
    }
}

struct FlakyTx {
    inner: Box<dyn StoreTx>,
    suffix: String,
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl StoreTx for FlakyTx {
    async fn get_user(&mut self, id: UserId) -> Result<Option<User>, CoreError> {
        self.inner.get_user(id).await
    }
    async fn lock_user(&mut self, id: UserId) -> Result<Option<User>, CoreError> {
        self.inner.lock_user(id).await
    }
    async fn find_user_by_phone(&mut self, phone: &PhoneNumber) -> Result<Option<User>, CoreError> {
        self.inner.find_user_by_phone(phone).await
    }
    async fn insert_user(&mut self, user: &User) -> Result<(), CoreError> {
        self.inner.insert_user(user).await
    }
    async fn update_user(&mut self, user: &User) -> Result<(), CoreError> {
        self.inner.update_user(user).await
    }
    async fn active_user_ids(&mut self) -> Result<Vec<UserId>, CoreError> {
        self.inner.active_user_ids().await
    }
    async fn users_with_manual_debt(&mut self) -> Result<Vec<UserId>, CoreError> {
        self.inner.users_with_manual_debt().await
    }
    async fn devices_for_user(&mut self, user_id: UserId) -> Result<Vec<UserDevice>, CoreError> {
        self.inner.devices_for_user(user_id).await
    }
    async fn get_device(&mut self, id: UserDeviceId) -> Result<Option<UserDevice>, CoreError> {
        self.inner.get_device(id).await
    }
    async fn authorized_device_by_mac(
        &mut self,
        mac: &MacAddress,
    ) -> Result<Option<UserDevice>, CoreError> {
        self.inner.authorized_device_by_mac(mac).await
    }
    async fn upsert_device(&mut self, device: &UserDevice) -> Result<(), CoreError> {
        self.inner.upsert_device(device).await
    }
    async fn delete_device(&mut self, id: UserDeviceId) -> Result<(), CoreError> {
        self.inner.delete_device(id).await
    }
    async fn get_package(&mut self, id: PackageId) -> Result<Option<Package>, CoreError> {
        self.inner.get_package(id).await
    }
    async fn insert_package(&mut self, package: &Package) -> Result<(), CoreError> {
        self.inner.insert_package(package).await
    }
    async fn get_transaction(&mut self, order_id: &str) -> Result<Option<Transaction>, CoreError> {
        self.inner.get_transaction(order_id).await
    }
    async fn lock_transaction(
        &mut self,
        order_id: &str,
    ) -> Result<Option<Transaction>, CoreError> {
        self.inner.lock_transaction(order_id).await
    }
    async fn insert_transaction(&mut self, txn: &Transaction) -> Result<(), CoreError> {
        self.inner.insert_transaction(txn).await
    }
    async fn update_transaction(&mut self, txn: &Transaction) -> Result<(), CoreError> {
        self.inner.update_transaction(txn).await
    }
    async fn insert_transaction_event(
        &mut self,
        event: &TransactionEvent,
    ) -> Result<(), CoreError> {
        self.inner.insert_transaction_event(event).await
    }
    async fn transaction_events(
        &mut self,
        id: TransactionId,
    ) -> Result<Vec<TransactionEvent>, CoreError> {
        self.inner.transaction_events(id).await
    }
    async fn open_transactions(
        &mut self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, CoreError> {
        self.inner.open_transactions(before).await
    }
    async fn lock_open_debts(&mut self, user_id: UserId) -> Result<Vec<UserQuotaDebt>, CoreError> {
        self.inner.lock_open_debts(user_id).await
    }
    async fn lock_debt(&mut self, id: DebtId) -> Result<Option<UserQuotaDebt>, CoreError> {
        self.inner.lock_debt(id).await
    }
    async fn insert_debt(&mut self, debt: &UserQuotaDebt) -> Result<(), CoreError> {
        self.inner.insert_debt(debt).await
    }
    async fn update_debt(&mut self, debt: &UserQuotaDebt) -> Result<(), CoreError> {
        self.inner.update_debt(debt).await
    }
    async fn ledger_entry(
        &mut self,
        user_id: UserId,
        source: &str,
        idempotency_key: &str,
    ) -> Result<Option<LedgerEntry>, CoreError> {
        self.inner.ledger_entry(user_id, source, idempotency_key).await
    }
    async fn append_ledger(&mut self, entry: &LedgerEntry) -> Result<LedgerAppend, CoreError> {
        if entry.idempotency_key.ends_with(&self.suffix) && self.armed.swap(false, Ordering::SeqCst) {
            return Err(CoreError::Storage {
                message: "ledger write timed out".into(),
            });
        }
        self.inner.append_ledger(entry).await
    }
    async fn ledger_for_user(&mut self, user_id: UserId) -> Result<Vec<LedgerEntry>, CoreError> {
        self.inner.ledger_for_user(user_id).await
    }
    async fn insert_address_list_audit(
        &mut self,
        audit: &AddressListAudit,
    ) -> Result<(), CoreError> {
        self.inner.insert_address_list_audit(audit).await
    }
    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        self.inner.commit().await
    }
    async fn rollback(self: Box<Self>) -> Result<(), CoreError> {
        self.inner.rollback().await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub store: MemoryStore,
    pub router: Arc<MemoryRouter>,
    pub provider: Arc<FakeProvider>,
    pub metrics: Arc<InMemoryMetrics>,
    pub portal: Portal,
}

pub fn harness() -> Harness {
    harness_with(Settings::default())
}

pub fn harness_with(settings: Settings) -> Harness {
    harness_full(settings, LockManager::local(), None)
}

pub fn harness_full(
    settings: Settings,
    locks: LockManager,
    notifier: Option<Arc<NotificationDispatcher>>,
) -> Harness {
    let store = MemoryStore::new();
    harness_on(store.clone(), Arc::new(store), settings, locks, notifier)
}

/// Harness whose portal writes through `engine_store`; `store` stays the
/// backing memory store the fixtures read and seed directly.
pub fn harness_on(
    store: MemoryStore,
    engine_store: Arc<dyn Store>,
    settings: Settings,
    locks: LockManager,
    notifier: Option<Arc<NotificationDispatcher>>,
) -> Harness {
    let router = MemoryRouter::new();
    let provider = FakeProvider::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let portal = Portal::assemble(PortalParts {
        store: engine_store,
        gateway: router.clone(),
        provider: provider.clone(),
        settings: Arc::new(SettingsProvider::fixed(settings)),
        locks: Arc::new(locks),
        metrics: metrics.clone(),
        notifier,
        jobs: JobPeriods::default(),
    });
    Harness {
        store,
        router,
        provider,
        metrics,
        portal,
    }
}

impl Harness {
    /// Approved, active user with 10 GB purchased, 30 days left.
    pub async fn user(&self) -> User {
        self.user_with(|_| {}).await
    }

    pub async fn user_with(&self, edit: impl FnOnce(&mut User)) -> User {
        let now = Utc::now();
        let mut user = User::new(normalize_to_e164("081234567890").unwrap(), "Sari", now);
        user.is_active = true;
        user.approval_status = ApprovalStatus::Approved;
        user.purchased_mb = 10_240;
        user.used_mb = Decimal::ZERO;
        user.expiry = Some(now + Duration::days(30));
        edit(&mut user);
        let mut tx = self.store.begin().await.unwrap();
        tx.insert_user(&user).await.unwrap();
        tx.commit().await.unwrap();
        user
    }

    pub async fn package(&self, quota_gb: i64, days: i64) -> Package {
        let package = Package {
            id: PackageId::new(),
            name: format!("{quota_gb} GB / {days} hari"),
            price: 50_000,
            quota_gb: Decimal::from(quota_gb),
            duration_days: days,
            is_active: true,
        };
        let mut tx = self.store.begin().await.unwrap();
        tx.insert_package(&package).await.unwrap();
        tx.commit().await.unwrap();
        package
    }

    /// Authorized device with a known IP, stored directly.
    pub async fn device(&self, user: &User, mac: &str, ip: &str) -> UserDevice {
        let now = Utc::now();
        let mut device = UserDevice::new(user.id, normalize_mac(mac).unwrap(), Some(ip.into()), now);
        device.authorized = true;
        device.authorized_at = Some(now);
        let mut tx = self.store.begin().await.unwrap();
        tx.upsert_device(&device).await.unwrap();
        tx.commit().await.unwrap();
        device
    }

    pub async fn reload(&self, user: &User) -> User {
        let mut tx = self.store.begin().await.unwrap();
        let fresh = tx.get_user(user.id).await.unwrap().unwrap();
        tx.commit().await.unwrap();
        fresh
    }

    pub async fn update(&self, user: &User) {
        let mut tx = self.store.begin().await.unwrap();
        tx.update_user(user).await.unwrap();
        tx.commit().await.unwrap();
    }
}
