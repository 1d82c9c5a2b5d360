// ── Device binding ──
//
// Ties the device a request came from to a user. One authorized device per
// user: binding a new MAC de-authorizes the others and strips their
// managed router rows before the user is re-synced.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use hotspot_routeros::MacSource;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{CoreError, ForbiddenStatus};
use crate::model::{MacAddress, UserDevice, UserDeviceId, UserId, normalize_mac};
use crate::settings::{Settings, SettingsProvider};
use crate::store::Store;
use crate::sync::{HotspotSync, SyncReport, SyncRequest, in_hotspot_range};

const MAX_LABEL_LEN: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct BindOutcome {
    pub device: UserDevice,
    /// Router table the MAC was resolved from; `None` when only the
    /// client-supplied MAC was available.
    pub mac_source: Option<MacSource>,
    pub deauthorized: Vec<MacAddress>,
    pub sync: SyncReport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub devices: usize,
    pub router_rows_removed: usize,
    pub router_errors: usize,
}

#[derive(Clone)]
pub struct DeviceBinding {
    store: Arc<dyn Store>,
    sync: HotspotSync,
    settings: Arc<SettingsProvider>,
}

impl std::fmt::Debug for DeviceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBinding")
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl DeviceBinding {
    pub fn new(store: Arc<dyn Store>, sync: HotspotSync, settings: Arc<SettingsProvider>) -> Self {
        Self {
            store,
            sync,
            settings,
        }
    }

    /// Authorize the device behind `client_ip` for `user_id`.
    #[instrument(skip(self), fields(user = %user_id, ip = %client_ip))]
    pub async fn bind_current(
        &self,
        user_id: UserId,
        client_ip: IpAddr,
        client_mac: Option<&str>,
    ) -> Result<BindOutcome, CoreError> {
        let settings = self.settings.current();
        if !in_hotspot_range(&settings, client_ip) {
            return Err(CoreError::forbidden(
                ForbiddenStatus::NotOnHotspot,
                format!("{client_ip} is not on the hotspot network"),
            ));
        }
        let supplied = client_mac.map(normalize_mac).transpose()?;

        let ip = client_ip.to_string();
        let found = self.sync.gateway().find_mac_by_ip(&ip).await?;
        let (mac, mac_source) = match (found, supplied) {
            (Some((raw, source)), supplied) => {
                let router_mac = normalize_mac(&raw)?;
                if supplied.as_ref().is_some_and(|m| *m != router_mac) {
                    warn!(router = %router_mac, "client MAC disagrees with router");
                    return Err(CoreError::forbidden(
                        ForbiddenStatus::MacMismatch,
                        "device MAC does not match the router's record for this IP",
                    ));
                }
                (router_mac, Some(source))
            }
            (None, Some(mac)) => (mac, None),
            (None, None) => {
                return Err(CoreError::validation(
                    "mac",
                    format!("no device MAC known for {client_ip}"),
                ));
            }
        };
        debug!(%mac, source = ?mac_source, "device resolved");

        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let user = tx
            .lock_user(user_id)
            .await?
            .ok_or_else(|| CoreError::not_found("user", user_id))?;
        if let Some(owner) = tx.authorized_device_by_mac(&mac).await? {
            if owner.user_id != user.id {
                return Err(CoreError::Conflict {
                    message: format!("device {mac} is bound to another account"),
                });
            }
        }

        let devices = tx.devices_for_user(user.id).await?;
        let mut released = Vec::new();
        for mut other in devices.iter().filter(|d| d.authorized && d.mac != mac).cloned() {
            other.authorized = false;
            other.authorized_at = None;
            tx.upsert_device(&other).await?;
            released.push(other);
        }

        let mut device = devices
            .into_iter()
            .find(|d| d.mac == mac)
            .unwrap_or_else(|| UserDevice::new(user.id, mac.clone(), None, now));
        if !device.authorized {
            device.authorized = true;
            device.authorized_at = Some(now);
        }
        device.last_ip = Some(ip);
        device.last_seen_at = now;
        tx.upsert_device(&device).await?;
        tx.commit().await?;

        for other in &released {
            if let Err(e) = self.remove_router_rows(other, &settings).await {
                if e.is_gateway_connection() {
                    return Err(e);
                }
                warn!(mac = %other.mac, error = %e, "cleanup of released device failed");
            }
        }

        let sync = self
            .sync
            .sync_user(
                SyncRequest::new(user.id)
                    .client(Some(client_ip), Some(mac.clone()))
                    .source("bind_current"),
            )
            .await?;
        info!(%mac, released = released.len(), "device bound");

        Ok(BindOutcome {
            device,
            mac_source,
            deauthorized: released.into_iter().map(|d| d.mac).collect(),
            sync,
        })
    }

    /// Strip every managed router row of the user's authorized devices and
    /// de-authorize them. Router failures are counted, never fatal.
    #[instrument(skip(self), fields(user = %user_id))]
    pub async fn reset_network_on_logout(&self, user_id: UserId) -> Result<ResetSummary, CoreError> {
        let settings = self.settings.current();
        let (user, devices) = {
            let mut tx = self.store.begin().await?;
            let user = tx
                .get_user(user_id)
                .await?
                .ok_or_else(|| CoreError::not_found("user", user_id))?;
            let devices: Vec<UserDevice> = tx
                .devices_for_user(user_id)
                .await?
                .into_iter()
                .filter(|d| d.authorized)
                .collect();
            tx.commit().await?;
            (user, devices)
        };

        let mut summary = ResetSummary {
            devices: devices.len(),
            ..ResetSummary::default()
        };
        for device in &devices {
            match self.remove_router_rows(device, &settings).await {
                Ok(n) => summary.router_rows_removed += n,
                Err(e) => {
                    summary.router_errors += 1;
                    warn!(mac = %device.mac, error = %e, "router cleanup failed");
                }
            }
        }
        match self
            .sync
            .gateway()
            .remove_hotspot_active_for_user(&user.hotspot_username)
            .await
        {
            Ok(n) => summary.router_rows_removed += n,
            Err(e) => {
                summary.router_errors += 1;
                warn!(error = %e, "hotspot session removal failed");
            }
        }

        let mut tx = self.store.begin().await?;
        for mut device in devices {
            device.authorized = false;
            device.authorized_at = None;
            tx.upsert_device(&device).await?;
        }
        tx.commit().await?;
        info!(
            devices = summary.devices,
            removed = summary.router_rows_removed,
            errors = summary.router_errors,
            "network access reset"
        );
        Ok(summary)
    }

    pub async fn list_devices(&self, user_id: UserId) -> Result<Vec<UserDevice>, CoreError> {
        let mut tx = self.store.begin().await?;
        let mut devices = tx.devices_for_user(user_id).await?;
        tx.commit().await?;
        devices.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(devices)
    }

    pub async fn rename_device(
        &self,
        user_id: UserId,
        device_id: UserDeviceId,
        label: &str,
    ) -> Result<UserDevice, CoreError> {
        let label = label.trim();
        if label.is_empty() || label.chars().count() > MAX_LABEL_LEN {
            return Err(CoreError::validation(
                "label",
                format!("label must be 1 to {MAX_LABEL_LEN} characters"),
            ));
        }
        let mut tx = self.store.begin().await?;
        let mut device = tx
            .get_device(device_id)
            .await?
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| CoreError::not_found("device", device_id))?;
        device.label = Some(label.to_owned());
        tx.upsert_device(&device).await?;
        tx.commit().await?;
        Ok(device)
    }

    /// Delete a device. Router rows go first so a router failure leaves the
    /// row in place for a retry.
    pub async fn remove_device(&self, user_id: UserId, device_id: UserDeviceId) -> Result<(), CoreError> {
        let settings = self.settings.current();
        let device = {
            let mut tx = self.store.begin().await?;
            let device = tx
                .get_device(device_id)
                .await?
                .filter(|d| d.user_id == user_id)
                .ok_or_else(|| CoreError::not_found("device", device_id))?;
            tx.commit().await?;
            device
        };
        let removed = self.remove_router_rows(&device, &settings).await?;

        let mut tx = self.store.begin().await?;
        tx.delete_device(device_id).await?;
        tx.commit().await?;
        info!(mac = %device.mac, router_rows = removed, "device removed");
        Ok(())
    }

    async fn remove_router_rows(&self, device: &UserDevice, settings: &Settings) -> Result<usize, CoreError> {
        let gateway = self.sync.gateway();
        let mac = device.mac.as_str();
        let mut removed = gateway.remove_ip_bindings_for_mac(mac).await?;
        removed += gateway.remove_dhcp_leases_for_mac(mac).await?;
        removed += gateway.remove_hotspot_hosts_for_mac(mac).await?;
        removed += gateway.remove_arp_for_mac(mac).await?;
        if let Some(ip) = &device.last_ip {
            removed += gateway
                .remove_address_list_entries(ip, &settings.address_lists.all())
                .await?;
            removed += gateway.remove_connections_for_ip(ip).await?;
        }
        debug!(mac, removed, "router rows removed");
        Ok(removed)
    }
}
