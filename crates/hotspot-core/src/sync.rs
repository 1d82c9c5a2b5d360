// ── Hotspot sync ──
//
// Converges the router's view of one user onto the policy decision: hotspot
// user profile, IP bindings, address-list membership and optional static
// DHCP leases. One sync per router runs at a time under a named lock.
// Steps report individually; only a connection-level router failure aborts
// the run.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hotspot_routeros::{
    AddressListSpec, BindingType, DhcpLeaseSpec, HotspotUserSpec, IpBindingSpec, UpsertOutcome,
};
use serde::Serialize;
use serde_json::json;
use strum::{AsRefStr, Display};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::gateway::HotspotGateway;
use crate::locks::LockManager;
use crate::metrics::{self, SharedMetrics};
use crate::model::{AddressListAudit, MacAddress, User, UserDevice, UserDeviceId, UserId};
use crate::policy::{self, AccessStatus, auto_debt_block_reason, auto_debt_limit_exceeded, is_auto_debt_block};
use crate::quota::{self, MutationMeta};
use crate::settings::{Settings, SettingsProvider};
use crate::store::{Store, StoreTx};

/// Who asked for a sync and what the caller observed about the client.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub user_id: UserId,
    pub client_ip: Option<IpAddr>,
    pub client_mac: Option<MacAddress>,
    pub source: String,
}

impl SyncRequest {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            client_ip: None,
            client_mac: None,
            source: "sync".into(),
        }
    }

    #[must_use]
    pub fn client(mut self, ip: Option<IpAddr>, mac: Option<MacAddress>) -> Self {
        self.client_ip = ip;
        self.client_mac = mac;
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

// ── Report ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncStep {
    DebtLimit,
    HotspotUser,
    IpBinding,
    AddressList,
    DhcpLease,
    Parity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepOutcome {
    Ok { changed: usize },
    Skipped { reason: String },
    Failed { errors: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: SyncStep,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// What the debt-limit check did to the user's block state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DebtLimitChange {
    Blocked,
    Unblocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub user_id: UserId,
    pub status: AccessStatus,
    pub profile: String,
    pub binding_type: BindingType,
    pub address_list: String,
    pub lock_degraded: bool,
    pub debt_limit: Option<DebtLimitChange>,
    pub steps: Vec<StepReport>,
}

impl SyncReport {
    /// At least one step failed.
    pub fn is_partial(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
    }

    pub fn step(&self, step: SyncStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step).map(|s| &s.outcome)
    }

    /// `ok` or `partial`, as stored in effect markers.
    pub fn status_token(&self) -> &'static str {
        if self.is_partial() { "partial" } else { "ok" }
    }
}

/// Per-step accumulator across devices.
#[derive(Debug, Default)]
struct Tally {
    changed: usize,
    errors: Vec<String>,
}

impl Tally {
    fn outcome(self) -> StepOutcome {
        if self.errors.is_empty() {
            StepOutcome::Ok {
                changed: self.changed,
            }
        } else {
            StepOutcome::Failed {
                errors: self.errors,
            }
        }
    }
}

/// Router state a finished sync should have left behind.
struct Projection<'a> {
    profile: &'a str,
    binding: BindingType,
    list: &'a str,
    other_lists: &'a [String],
    device_ips: &'a [(UserDeviceId, String)],
}

/// Totals of a bulk re-sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResyncSummary {
    pub synced: usize,
    pub partial: usize,
    pub failed: usize,
}

// ── Projection helpers ──────────────────────────────────────────────

/// Hotspot profile for a user's status. Unlimited users whose period lapsed
/// land on the expired profile; quota users with nothing purchased on habis.
pub fn target_profile(
    user: &User,
    status: AccessStatus,
    settings: &Settings,
    now: DateTime<Utc>,
) -> String {
    let p = &settings.profiles;
    let name = match status {
        AccessStatus::Unlimited if user.expiry.is_some_and(|e| e < now) => &p.expired,
        AccessStatus::Active | AccessStatus::Fup
            if !user.is_unlimited && user.purchased_mb == 0 =>
        {
            &p.habis
        }
        AccessStatus::Active => &p.active,
        AccessStatus::Fup => &p.fup,
        AccessStatus::Habis => &p.habis,
        AccessStatus::Expired => &p.expired,
        AccessStatus::Unlimited => &p.unlimited,
        AccessStatus::Inactive => &p.inactive,
        AccessStatus::Blocked => &p.blocked,
    };
    name.clone()
}

/// `<prefix>|user=…|uid=…|role=…|source=…|date=…|time=…`, stamped in the
/// portal's local offset.
pub fn managed_comment(
    settings: &Settings,
    user: &User,
    source: &str,
    stamp: DateTime<Utc>,
) -> String {
    let local = stamp.with_timezone(&settings.utc_offset);
    format!(
        "{}|user={}|uid={}|role={}|source={}|date={}|time={}",
        settings.managed_comment_prefix,
        user.hotspot_username,
        user.id,
        user.role,
        source,
        local.format("%Y-%m-%d"),
        local.format("%H:%M:%S"),
    )
}

/// Comment fragment identifying the address-list row of one device.
pub fn device_owner_token(mac: &MacAddress) -> String {
    format!("mac={mac}")
}

fn address_list_comment(base: &str, mac: &MacAddress, status: AccessStatus) -> String {
    format!("{base}|{}|status={status}", device_owner_token(mac))
}

pub(crate) fn in_hotspot_range(settings: &Settings, ip: IpAddr) -> bool {
    settings.hotspot_client_cidrs.iter().any(|net| net.contains(&ip))
}

/// IP to project for a device: the address observed on this request when
/// the request came from that device on the hotspot range, else the last
/// stored one.
fn device_ip(settings: &Settings, device: &UserDevice, req: &SyncRequest) -> Option<String> {
    let observed = req
        .client_ip
        .filter(|ip| req.client_mac.as_ref() == Some(&device.mac) && in_hotspot_range(settings, *ip))
        .map(|ip| ip.to_string());
    observed.or_else(|| device.last_ip.clone())
}

// ── Service ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HotspotSync {
    store: Arc<dyn Store>,
    gateway: Arc<dyn HotspotGateway>,
    settings: Arc<SettingsProvider>,
    locks: Arc<LockManager>,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for HotspotSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotspotSync")
            .field("gateway", &self.gateway)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl HotspotSync {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn HotspotGateway>,
        settings: Arc<SettingsProvider>,
        locks: Arc<LockManager>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
            locks,
            metrics,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn HotspotGateway> {
        &self.gateway
    }

    fn lock_key(&self) -> String {
        format!("hotspot-sync:{}", self.gateway.router_key())
    }

    /// Project one user onto the router. Holds the per-router sync lock for
    /// the whole run; fails with `SyncBusy` when it cannot be taken in time.
    #[instrument(skip_all, fields(user = %req.user_id, source = %req.source))]
    pub async fn sync_user(&self, req: SyncRequest) -> Result<SyncReport, CoreError> {
        let settings = self.settings.current();
        let guard = self
            .locks
            .acquire(&self.lock_key(), settings.sync_lock_ttl, settings.sync_lock_wait)
            .await?;
        if guard.degraded() {
            self.metrics.increment(metrics::SYNC_LOCK_DEGRADED);
        }
        let result = self.sync_locked(&req, &settings, guard.degraded()).await;
        guard.release().await;

        match &result {
            Ok(report) if report.is_partial() => {
                warn!(status = %report.status, profile = %report.profile, "hotspot sync partial");
            }
            Ok(report) => {
                info!(status = %report.status, profile = %report.profile, "hotspot sync done");
            }
            Err(e) => warn!(error = %e, "hotspot sync aborted"),
        }
        result
    }

    /// Re-sync every approved, active user. Each user takes the lock on its
    /// own so interactive syncs interleave.
    pub async fn resync_all(&self, source: &str) -> Result<ResyncSummary, CoreError> {
        let ids = {
            let mut tx = self.store.begin().await?;
            let ids = tx.active_user_ids().await?;
            tx.commit().await?;
            ids
        };
        let mut summary = ResyncSummary::default();
        for id in ids {
            match self.sync_user(SyncRequest::new(id).source(source)).await {
                Ok(report) if report.is_partial() => summary.partial += 1,
                Ok(_) => summary.synced += 1,
                Err(e) => {
                    summary.failed += 1;
                    if e.is_gateway_connection() {
                        warn!(error = %e, "router unreachable, stopping re-sync");
                        break;
                    }
                }
            }
        }
        Ok(summary)
    }

    async fn sync_locked(
        &self,
        req: &SyncRequest,
        settings: &Settings,
        lock_degraded: bool,
    ) -> Result<SyncReport, CoreError> {
        let now = Utc::now();

        // ── Load + debt limit ──
        let mut tx = self.store.begin().await?;
        let mut user = tx
            .lock_user(req.user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("user", req.user_id))?;
        let debt_limit = enforce_debt_limit(tx.as_mut(), &mut user, settings, &req.source, now).await?;
        let password_before = user.hotspot_password.clone();
        quota::ensure_hotspot_password(&mut user);
        if debt_limit.is_none() && user.hotspot_password != password_before {
            tx.update_user(&user).await?;
        }
        let devices: Vec<UserDevice> = tx
            .devices_for_user(user.id)
            .await?
            .into_iter()
            .filter(|d| d.authorized)
            .collect();
        tx.commit().await?;

        // ── Decision ──
        let status = policy::access_status(&user, &settings.policy, now);
        let profile = target_profile(&user, status, settings, now);
        let binding_type = policy::allowed_binding_type(&user, &settings.policy, now);
        let list = settings.address_lists.for_status(status).to_owned();
        debug!(%status, %profile, %binding_type, %list, devices = devices.len(), "sync decision");

        let mut report = SyncReport {
            user_id: user.id,
            status,
            profile: profile.clone(),
            binding_type,
            address_list: list.clone(),
            lock_degraded,
            debt_limit,
            steps: Vec::new(),
        };
        report.steps.push(StepReport {
            step: SyncStep::DebtLimit,
            outcome: StepOutcome::Ok {
                changed: usize::from(debt_limit.is_some()),
            },
        });

        // ── Hotspot user ──
        let mut tally = Tally::default();
        let spec = HotspotUserSpec {
            name: user.hotspot_username.clone(),
            password: user.hotspot_password.clone().unwrap_or_default(),
            profile: profile.clone(),
            server: settings.hotspot_server.clone(),
            comment: managed_comment(settings, &user, &req.source, user.created_at),
        };
        let mut provisioned = false;
        match self.gateway.ensure_hotspot_user(&spec).await {
            Ok((row, created)) => {
                provisioned = true;
                if created {
                    tally.changed += 1;
                } else if row.profile.as_deref() != Some(profile.as_str()) {
                    let set = self.gateway.set_hotspot_user_profile(&row.id, &profile).await;
                    self.absorb(&mut tally, SyncStep::HotspotUser, set.map(|()| true))?;
                }
            }
            Err(e) => {
                self.absorb::<bool>(&mut tally, SyncStep::HotspotUser, Err(e))?;
            }
        }
        self.finish(&mut report, SyncStep::HotspotUser, tally);

        // ── IP bindings ──
        let mut tally = Tally::default();
        for device in &devices {
            let stamp = device.authorized_at.unwrap_or(user.created_at);
            let spec = IpBindingSpec {
                mac: device.mac.to_string(),
                address: None,
                server: settings.hotspot_server.clone(),
                binding_type,
                comment: managed_comment(settings, &user, &req.source, stamp),
            };
            let result = self.gateway.upsert_ip_binding(&spec).await;
            self.absorb(&mut tally, SyncStep::IpBinding, result.map(|o| o.changed()))?;
        }
        self.finish(&mut report, SyncStep::IpBinding, tally);

        // ── Address lists ──
        let mut tally = Tally::default();
        let other_lists: Vec<String> = settings
            .address_lists
            .all()
            .into_iter()
            .filter(|l| *l != list)
            .collect();
        let mut audits = Vec::new();
        let mut device_ips = Vec::new();
        for device in &devices {
            let Some(ip) = device_ip(settings, device, req) else {
                debug!(mac = %device.mac, "no known IP for device, address list skipped");
                continue;
            };
            let removed = self.gateway.remove_address_list_entries(&ip, &other_lists).await;
            self.absorb(&mut tally, SyncStep::AddressList, removed.map(|n| n > 0))?;

            let stamp = device.authorized_at.unwrap_or(user.created_at);
            let base = managed_comment(settings, &user, &req.source, stamp);
            let spec = AddressListSpec {
                list: list.clone(),
                address: ip.clone(),
                comment: address_list_comment(&base, &device.mac, status),
                owner_token: device_owner_token(&device.mac),
            };
            let upserted = self.gateway.upsert_address_list_entry(&spec).await;
            let rotated_from = match &upserted {
                Ok(UpsertOutcome::Updated {
                    previous_address: Some(prev),
                    ..
                }) if *prev != ip => Some(prev.clone()),
                _ => None,
            };
            if self.absorb(&mut tally, SyncStep::AddressList, upserted.map(|o| o.changed()))? {
                let previous = rotated_from.or_else(|| device.last_ip.clone());
                if previous.as_deref() != Some(ip.as_str()) {
                    audits.push(AddressListAudit {
                        id: Uuid::new_v4(),
                        user_id: user.id,
                        mac: device.mac.clone(),
                        previous_ip: previous,
                        new_ip: ip.clone(),
                        list_name: list.clone(),
                        created_at: now,
                    });
                }
            }
            device_ips.push((device.id, ip));
        }
        self.finish(&mut report, SyncStep::AddressList, tally);

        // ── DHCP static leases ──
        match (settings.dhcp_static_lease_enabled, &settings.dhcp_lease_server_name) {
            (true, Some(server)) => {
                let mut tally = Tally::default();
                for device in &devices {
                    let Some(ip) = device_ip(settings, device, req) else {
                        continue;
                    };
                    let stamp = device.authorized_at.unwrap_or(user.created_at);
                    let spec = DhcpLeaseSpec {
                        mac: device.mac.to_string(),
                        address: ip,
                        server: server.clone(),
                        comment: managed_comment(settings, &user, &req.source, stamp),
                    };
                    let result = self.gateway.upsert_dhcp_static_lease(&spec).await;
                    self.absorb(&mut tally, SyncStep::DhcpLease, result.map(|o| o.changed()))?;
                }
                self.finish(&mut report, SyncStep::DhcpLease, tally);
            }
            (true, None) => report.steps.push(StepReport {
                step: SyncStep::DhcpLease,
                outcome: StepOutcome::Skipped {
                    reason: "dhcp lease server name not set".into(),
                },
            }),
            (false, _) => report.steps.push(StepReport {
                step: SyncStep::DhcpLease,
                outcome: StepOutcome::Skipped {
                    reason: "disabled".into(),
                },
            }),
        }

        // ── Parity read-back ──
        let projection = Projection {
            profile: &profile,
            binding: binding_type,
            list: &list,
            other_lists: &other_lists,
            device_ips: &device_ips,
        };
        let tally = self.check_parity(&user, &devices, &projection).await?;
        self.finish(&mut report, SyncStep::Parity, tally);

        // ── Persist ──
        let mut tx = self.store.begin().await?;
        if let Some(mut fresh) = tx.lock_user(user.id).await? {
            let profile_applied = matches!(
                report.step(SyncStep::HotspotUser),
                Some(StepOutcome::Ok { .. })
            );
            if provisioned && profile_applied {
                fresh.is_provisioned = true;
                fresh.hotspot_profile = Some(profile.clone());
                fresh.updated_at = now;
                tx.update_user(&fresh).await?;
            }
        }
        for (device_id, ip) in device_ips {
            if let Some(mut device) = tx.get_device(device_id).await? {
                if device.last_ip.as_deref() != Some(ip.as_str()) {
                    device.last_ip = Some(ip);
                    device.last_seen_at = now;
                    tx.upsert_device(&device).await?;
                }
            }
        }
        for audit in &audits {
            tx.insert_address_list_audit(audit).await?;
        }
        tx.commit().await?;

        Ok(report)
    }

    async fn check_parity(
        &self,
        user: &User,
        devices: &[UserDevice],
        want: &Projection<'_>,
    ) -> Result<Tally, CoreError> {
        let (profile, expected) = (want.profile, want.binding);
        let mut tally = Tally::default();
        let auto_debt_blocked = user.is_blocked && is_auto_debt_block(user.blocked_reason.as_deref());

        for device in devices {
            let bindings = match self.gateway.ip_bindings_for_mac(device.mac.as_str()).await {
                Ok(b) => b,
                Err(e) if e.is_gateway_connection() => return Err(e),
                Err(e) => {
                    tally.errors.push(format!("read ip-binding {}: {e}", device.mac));
                    continue;
                }
            };
            for binding in bindings.iter().filter(|b| b.binding_type != expected) {
                if auto_debt_blocked && binding.binding_type == BindingType::Blocked {
                    self.metrics.increment(metrics::AUTO_DEBT_BINDING_MISMATCH);
                    warn!(
                        mac = %device.mac,
                        "auto-debt block must stay app-level but router binding is blocked"
                    );
                } else {
                    warn!(
                        mac = %device.mac,
                        expected = %expected,
                        actual = %binding.binding_type,
                        "ip-binding does not match policy"
                    );
                }
                tally
                    .errors
                    .push(format!("{} binding is {}, want {expected}", device.mac, binding.binding_type));
            }
        }

        for (_, ip) in want.device_ips {
            let entries = match self.gateway.address_list_entries(ip).await {
                Ok(e) => e,
                Err(e) if e.is_gateway_connection() => return Err(e),
                Err(e) => {
                    tally.errors.push(format!("read address-list {ip}: {e}"));
                    continue;
                }
            };
            for entry in entries.iter().filter(|e| want.other_lists.contains(&e.list)) {
                warn!(address = %ip, list = %entry.list, expected = want.list, "stale address-list entry");
                tally
                    .errors
                    .push(format!("{ip} is in {}, want {}", entry.list, want.list));
            }
            if !entries.iter().any(|e| e.list == want.list) {
                warn!(address = %ip, expected = want.list, "address-list entry missing");
                tally.errors.push(format!("{ip} missing from {}", want.list));
            }
        }

        match self.gateway.find_hotspot_user(&user.hotspot_username).await {
            Ok(Some(row)) if row.profile.as_deref() != Some(profile) => {
                warn!(expected = profile, actual = ?row.profile, "hotspot profile does not match policy");
                tally.errors.push(format!(
                    "profile is {}, want {profile}",
                    row.profile.as_deref().unwrap_or("-")
                ));
            }
            Ok(_) => {}
            Err(e) if e.is_gateway_connection() => return Err(e),
            Err(e) => tally.errors.push(format!("read hotspot user: {e}")),
        }
        Ok(tally)
    }

    /// Fold a step result into the tally. Connection failures abort the
    /// sync; anything else is recorded. Returns whether the call succeeded
    /// and changed something.
    fn absorb<T: Into<bool>>(
        &self,
        tally: &mut Tally,
        step: SyncStep,
        result: Result<T, CoreError>,
    ) -> Result<bool, CoreError> {
        match result {
            Ok(changed) => {
                let changed = changed.into();
                if changed {
                    tally.changed += 1;
                }
                Ok(changed)
            }
            Err(e) if e.is_gateway_connection() => Err(e),
            Err(e) => {
                self.metrics.increment_labeled(metrics::SYNC_STEP_FAILED, step.as_ref());
                warn!(%step, error = %e, "sync step failed");
                tally.errors.push(e.to_string());
                Ok(false)
            }
        }
    }

    #[allow(clippy::unused_self)]
    fn finish(&self, report: &mut SyncReport, step: SyncStep, tally: Tally) {
        report.steps.push(StepReport {
            step,
            outcome: tally.outcome(),
        });
    }
}

/// Block on auto-debt above the limit, lift an auto-debt block once back
/// under it. Other block kinds are left alone. Writes the user and a
/// ledger row when anything changes.
pub async fn enforce_debt_limit(
    tx: &mut dyn StoreTx,
    user: &mut User,
    settings: &Settings,
    source: &str,
    now: DateTime<Utc>,
) -> Result<Option<DebtLimitChange>, CoreError> {
    let limit = settings.debt_limit_mb;
    let exceeded = auto_debt_limit_exceeded(user, limit);
    let auto_blocked = user.is_blocked && is_auto_debt_block(user.blocked_reason.as_deref());

    let before = user.snapshot();
    let change = if exceeded && !user.is_blocked {
        let debt = user.quota_debt_auto_mb();
        user.block(auto_debt_block_reason(debt, limit, source), None, now);
        info!(user = %user.id, debt_mb = %debt, limit_mb = limit, "auto-debt limit exceeded, user blocked");
        DebtLimitChange::Blocked
    } else if auto_blocked && !exceeded {
        user.unblock();
        info!(user = %user.id, "auto-debt back under limit, user unblocked");
        DebtLimitChange::Unblocked
    } else {
        return Ok(None);
    };

    quota::ensure_hotspot_password(user);
    user.updated_at = now;
    tx.update_user(user).await?;
    let key = format!("auto_debt_{change}:{}", now.timestamp_millis());
    let meta = MutationMeta::new("sync", key, now);
    let details = json!({
        "op": format!("auto_debt_{change}"),
        "limit_mb": limit,
        "source": source,
    });
    quota::record_ledger(tx, user, &before, &meta, details).await;
    Ok(Some(change))
}
