// Typed RouterOS operations
//
// Every write path looks the target row up first. Rows whose comment does
// not start with the managed prefix belong to the operator and are never
// modified or removed from here.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::Error;
use crate::models::{
    AddressListEntry, ArpEntry, BindingType, BridgeHost, DhcpLease, FirewallConnection,
    HotspotActive, HotspotHost, HotspotUser, IpBinding, RowId,
};
use crate::pool::RouterOsPool;

/// What an upsert did to the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created { id: Option<RowId> },
    Updated {
        id: RowId,
        previous_address: Option<String>,
    },
    Unchanged { id: RowId },
    /// A row exists but carries an operator comment; left alone.
    SkippedUnmanaged { id: RowId },
}

impl UpsertOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Created { .. } | Self::Updated { .. })
    }
}

/// Desired hotspot user row.
#[derive(Debug, Clone)]
pub struct HotspotUserSpec {
    pub name: String,
    pub password: String,
    pub profile: String,
    pub server: Option<String>,
    pub comment: String,
}

/// Desired IP binding for one MAC.
#[derive(Debug, Clone)]
pub struct IpBindingSpec {
    pub mac: String,
    pub address: Option<String>,
    pub server: Option<String>,
    pub binding_type: BindingType,
    pub comment: String,
}

/// Desired static DHCP lease.
#[derive(Debug, Clone)]
pub struct DhcpLeaseSpec {
    pub mac: String,
    pub address: String,
    pub server: String,
    pub comment: String,
}

/// Desired address-list membership.
#[derive(Debug, Clone)]
pub struct AddressListSpec {
    pub list: String,
    pub address: String,
    pub comment: String,
    /// Comment fragment identifying this owner's earlier entry (e.g. `uid=…`),
    /// so a rotated IP is updated in place.
    pub owner_token: String,
}

/// Where `find_mac_by_ip_comprehensive` found its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MacSource {
    HotspotHost,
    HotspotActive,
    DhcpLease,
    Arp,
    BridgeHost,
}

#[derive(Debug, Clone)]
pub struct RouterOsClient {
    pool: Arc<RouterOsPool>,
    managed_prefix: String,
}

impl RouterOsClient {
    pub fn new(pool: Arc<RouterOsPool>, managed_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            managed_prefix: managed_prefix.into(),
        }
    }

    pub fn pool(&self) -> &RouterOsPool {
        &self.pool
    }

    pub fn managed_prefix(&self) -> &str {
        &self.managed_prefix
    }

    pub fn is_managed(&self, comment: Option<&str>) -> bool {
        comment.is_some_and(|c| c.starts_with(&self.managed_prefix))
    }

    async fn rows<T>(
        &self,
        cmd: Command,
        parse: impl Fn(&crate::models::Row) -> Result<T, Error>,
    ) -> Result<Vec<T>, Error> {
        let output = self.pool.execute(&cmd).await?;
        output.rows.iter().map(parse).collect()
    }

    /// Remove by id, treating an already-missing row as success.
    async fn remove_id(&self, menu: &str, id: &RowId) -> Result<bool, Error> {
        match self.pool.execute(&Command::remove(menu, id.as_str())).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ── System ──────────────────────────────────────────────────────

    pub async fn system_identity(&self) -> Result<String, Error> {
        let output = self.pool.execute(&Command::print("/system/identity")).await?;
        Ok(output
            .rows
            .first()
            .and_then(|r| r.non_empty("name"))
            .unwrap_or_default())
    }

    // ── Hotspot users ───────────────────────────────────────────────

    pub async fn find_hotspot_user(&self, name: &str) -> Result<Option<HotspotUser>, Error> {
        let cmd = Command::print(HotspotUser::MENU).query("name", name);
        Ok(self.rows(cmd, HotspotUser::from_row).await?.into_iter().next())
    }

    /// Create the user row when missing; returns the row and whether it was created.
    pub async fn ensure_hotspot_user(
        &self,
        spec: &HotspotUserSpec,
    ) -> Result<(HotspotUser, bool), Error> {
        if let Some(existing) = self.find_hotspot_user(&spec.name).await? {
            return Ok((existing, false));
        }

        let cmd = Command::add(HotspotUser::MENU)
            .attr("name", spec.name.clone())
            .attr("password", spec.password.clone())
            .attr("profile", spec.profile.clone())
            .attr_opt("server", spec.server.clone())
            .attr("comment", spec.comment.clone());
        match self.pool.execute(&cmd).await {
            Ok(_) => {}
            // lost a race with another writer
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        info!(user = %spec.name, profile = %spec.profile, "hotspot user created");

        let created = self
            .find_hotspot_user(&spec.name)
            .await?
            .ok_or_else(|| Error::MissingAttribute {
                path: HotspotUser::MENU.into(),
                attribute: format!("name={}", spec.name),
            })?;
        Ok((created, true))
    }

    pub async fn set_hotspot_user_profile(&self, id: &RowId, profile: &str) -> Result<(), Error> {
        let cmd = Command::set(HotspotUser::MENU, id.as_str()).attr("profile", profile);
        self.pool.execute(&cmd).await?;
        debug!(id = %id, profile, "hotspot user profile set");
        Ok(())
    }

    pub async fn set_hotspot_user_password(&self, id: &RowId, password: &str) -> Result<(), Error> {
        let cmd = Command::set(HotspotUser::MENU, id.as_str()).attr("password", password);
        self.pool.execute(&cmd).await.map(|_| ())
    }

    // ── IP bindings ─────────────────────────────────────────────────

    pub async fn ip_bindings_for_mac(&self, mac: &str) -> Result<Vec<IpBinding>, Error> {
        let cmd = Command::print(IpBinding::MENU).query("mac-address", mac);
        self.rows(cmd, IpBinding::from_row).await
    }

    pub async fn upsert_ip_binding(&self, spec: &IpBindingSpec) -> Result<UpsertOutcome, Error> {
        let existing = self.ip_bindings_for_mac(&spec.mac).await?;
        let (managed, unmanaged): (Vec<_>, Vec<_>) = existing
            .into_iter()
            .partition(|b| self.is_managed(b.comment.as_deref()));

        let Some((keep, duplicates)) = managed.split_first() else {
            if let Some(foreign) = unmanaged.first() {
                warn!(mac = %spec.mac, id = %foreign.id, "ip-binding owned by operator, not touching");
                return Ok(UpsertOutcome::SkippedUnmanaged {
                    id: foreign.id.clone(),
                });
            }
            let cmd = Command::add(IpBinding::MENU)
                .attr("mac-address", spec.mac.clone())
                .attr("type", spec.binding_type.as_str())
                .attr_opt("address", spec.address.clone())
                .attr_opt("server", spec.server.clone())
                .attr("comment", spec.comment.clone());
            let output = self.pool.execute(&cmd).await?;
            info!(mac = %spec.mac, binding = %spec.binding_type, "ip-binding created");
            return Ok(UpsertOutcome::Created {
                id: output.ret.as_deref().and_then(RowId::parse),
            });
        };

        for dup in duplicates {
            self.remove_id(IpBinding::MENU, &dup.id).await?;
        }

        let same = keep.binding_type == spec.binding_type
            && keep.address == spec.address
            && keep.comment.as_deref() == Some(spec.comment.as_str())
            && (spec.server.is_none() || keep.server == spec.server)
            && !keep.disabled;
        if same {
            return Ok(UpsertOutcome::Unchanged {
                id: keep.id.clone(),
            });
        }

        let cmd = Command::set(IpBinding::MENU, keep.id.as_str())
            .attr("type", spec.binding_type.as_str())
            .attr("address", spec.address.clone().unwrap_or_default())
            .attr_opt("server", spec.server.clone())
            .attr("comment", spec.comment.clone())
            .attr("disabled", "false");
        self.pool.execute(&cmd).await?;
        info!(mac = %spec.mac, binding = %spec.binding_type, "ip-binding updated");
        Ok(UpsertOutcome::Updated {
            id: keep.id.clone(),
            previous_address: keep.address.clone(),
        })
    }

    /// Remove managed bindings for a MAC; returns how many were removed.
    pub async fn remove_ip_bindings_for_mac(&self, mac: &str) -> Result<usize, Error> {
        let mut removed = 0;
        for binding in self.ip_bindings_for_mac(mac).await? {
            if self.is_managed(binding.comment.as_deref())
                && self.remove_id(IpBinding::MENU, &binding.id).await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── DHCP leases ─────────────────────────────────────────────────

    pub async fn dhcp_leases_for_mac(&self, mac: &str) -> Result<Vec<DhcpLease>, Error> {
        let cmd = Command::print(DhcpLease::MENU).query("mac-address", mac);
        self.rows(cmd, DhcpLease::from_row).await
    }

    pub async fn dhcp_leases_for_address(&self, address: &str) -> Result<Vec<DhcpLease>, Error> {
        let cmd = Command::print(DhcpLease::MENU).query("address", address);
        self.rows(cmd, DhcpLease::from_row).await
    }

    /// Pin a static lease for `mac` on the given DHCP server.
    pub async fn upsert_dhcp_static_lease(
        &self,
        spec: &DhcpLeaseSpec,
    ) -> Result<UpsertOutcome, Error> {
        let leases: Vec<DhcpLease> = self
            .dhcp_leases_for_mac(&spec.mac)
            .await?
            .into_iter()
            .filter(|l| l.server.as_deref().is_none_or(|s| s == spec.server))
            .collect();

        if let Some(lease) = leases
            .iter()
            .find(|l| !l.dynamic && self.is_managed(l.comment.as_deref()))
        {
            if lease.address.as_deref() == Some(spec.address.as_str())
                && lease.comment.as_deref() == Some(spec.comment.as_str())
            {
                return Ok(UpsertOutcome::Unchanged {
                    id: lease.id.clone(),
                });
            }
            let cmd = Command::set(DhcpLease::MENU, lease.id.as_str())
                .attr("address", spec.address.clone())
                .attr("comment", spec.comment.clone());
            self.pool.execute(&cmd).await?;
            info!(mac = %spec.mac, address = %spec.address, "dhcp static lease updated");
            return Ok(UpsertOutcome::Updated {
                id: lease.id.clone(),
                previous_address: lease.address.clone(),
            });
        }

        if let Some(foreign) = leases.iter().find(|l| !l.dynamic) {
            return Ok(UpsertOutcome::SkippedUnmanaged {
                id: foreign.id.clone(),
            });
        }

        let cmd = Command::add(DhcpLease::MENU)
            .attr("mac-address", spec.mac.clone())
            .attr("address", spec.address.clone())
            .attr("server", spec.server.clone())
            .attr("comment", spec.comment.clone());
        let output = self.pool.execute(&cmd).await?;
        info!(mac = %spec.mac, address = %spec.address, server = %spec.server, "dhcp static lease created");
        Ok(UpsertOutcome::Created {
            id: output.ret.as_deref().and_then(RowId::parse),
        })
    }

    pub async fn remove_dhcp_leases_for_mac(&self, mac: &str) -> Result<usize, Error> {
        let mut removed = 0;
        for lease in self.dhcp_leases_for_mac(mac).await? {
            if !lease.dynamic
                && self.is_managed(lease.comment.as_deref())
                && self.remove_id(DhcpLease::MENU, &lease.id).await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── Address lists ───────────────────────────────────────────────

    pub async fn address_list_entries(
        &self,
        list: Option<&str>,
        address: Option<&str>,
    ) -> Result<Vec<AddressListEntry>, Error> {
        let mut cmd = Command::print(AddressListEntry::MENU);
        if let Some(list) = list {
            cmd = cmd.query("list", list);
        }
        if let Some(address) = address {
            cmd = cmd.query("address", address);
        }
        self.rows(cmd, AddressListEntry::from_row).await
    }

    pub async fn upsert_address_list_entry(
        &self,
        spec: &AddressListSpec,
    ) -> Result<UpsertOutcome, Error> {
        let entries = self.address_list_entries(Some(&spec.list), None).await?;

        let owned: Vec<&AddressListEntry> = entries
            .iter()
            .filter(|e| {
                self.is_managed(e.comment.as_deref())
                    && e.comment
                        .as_deref()
                        .is_some_and(|c| c.split('|').any(|part| part == spec.owner_token))
            })
            .collect();

        if let Some(current) = owned.iter().find(|e| e.address == spec.address) {
            for stale in owned.iter().filter(|e| e.id != current.id) {
                self.remove_id(AddressListEntry::MENU, &stale.id).await?;
            }
            if current.comment.as_deref() == Some(spec.comment.as_str()) {
                return Ok(UpsertOutcome::Unchanged {
                    id: current.id.clone(),
                });
            }
            let cmd = Command::set(AddressListEntry::MENU, current.id.as_str())
                .attr("comment", spec.comment.clone());
            self.pool.execute(&cmd).await?;
            return Ok(UpsertOutcome::Updated {
                id: current.id.clone(),
                previous_address: None,
            });
        }

        if let Some(foreign) = entries
            .iter()
            .find(|e| e.address == spec.address && !self.is_managed(e.comment.as_deref()))
        {
            return Ok(UpsertOutcome::SkippedUnmanaged {
                id: foreign.id.clone(),
            });
        }

        if let Some((rotated, rest)) = owned.split_first() {
            for stale in rest {
                self.remove_id(AddressListEntry::MENU, &stale.id).await?;
            }
            let cmd = Command::set(AddressListEntry::MENU, rotated.id.as_str())
                .attr("address", spec.address.clone())
                .attr("comment", spec.comment.clone());
            self.pool.execute(&cmd).await?;
            info!(
                list = %spec.list,
                from = %rotated.address,
                to = %spec.address,
                "address-list entry moved to new IP"
            );
            return Ok(UpsertOutcome::Updated {
                id: rotated.id.clone(),
                previous_address: Some(rotated.address.clone()),
            });
        }

        let cmd = Command::add(AddressListEntry::MENU)
            .attr("list", spec.list.clone())
            .attr("address", spec.address.clone())
            .attr("comment", spec.comment.clone());
        let output = self.pool.execute(&cmd).await?;
        info!(list = %spec.list, address = %spec.address, "address-list entry added");
        Ok(UpsertOutcome::Created {
            id: output.ret.as_deref().and_then(RowId::parse),
        })
    }

    /// Remove managed entries for `address` from each of `lists`.
    pub async fn remove_address_list_entries(
        &self,
        address: &str,
        lists: &[String],
    ) -> Result<usize, Error> {
        let lists: HashSet<&str> = lists.iter().map(String::as_str).collect();
        let mut removed = 0;
        for entry in self.address_list_entries(None, Some(address)).await? {
            if lists.contains(entry.list.as_str())
                && !entry.dynamic
                && self.is_managed(entry.comment.as_deref())
                && self.remove_id(AddressListEntry::MENU, &entry.id).await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── ARP ─────────────────────────────────────────────────────────

    pub async fn arp_for_address(&self, address: &str) -> Result<Vec<ArpEntry>, Error> {
        let cmd = Command::print(ArpEntry::MENU).query("address", address);
        self.rows(cmd, ArpEntry::from_row).await
    }

    pub async fn arp_for_mac(&self, mac: &str) -> Result<Vec<ArpEntry>, Error> {
        let cmd = Command::print(ArpEntry::MENU).query("mac-address", mac);
        self.rows(cmd, ArpEntry::from_row).await
    }

    pub async fn remove_arp_entries(&self, entries: &[ArpEntry]) -> Result<usize, Error> {
        let mut removed = 0;
        for entry in entries {
            if self.remove_id(ArpEntry::MENU, &entry.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── Hotspot hosts & sessions ────────────────────────────────────

    pub async fn hotspot_hosts_for_address(&self, address: &str) -> Result<Vec<HotspotHost>, Error> {
        let cmd = Command::print(HotspotHost::MENU).query("address", address);
        self.rows(cmd, HotspotHost::from_row).await
    }

    pub async fn hotspot_hosts_for_mac(&self, mac: &str) -> Result<Vec<HotspotHost>, Error> {
        let cmd = Command::print(HotspotHost::MENU).query("mac-address", mac);
        self.rows(cmd, HotspotHost::from_row).await
    }

    pub async fn remove_hotspot_hosts_for_mac(&self, mac: &str) -> Result<usize, Error> {
        let mut removed = 0;
        for host in self.hotspot_hosts_for_mac(mac).await? {
            if self.remove_id(HotspotHost::MENU, &host.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn hotspot_active_for_address(
        &self,
        address: &str,
    ) -> Result<Vec<HotspotActive>, Error> {
        let cmd = Command::print(HotspotActive::MENU).query("address", address);
        self.rows(cmd, HotspotActive::from_row).await
    }

    pub async fn hotspot_active_for_user(&self, user: &str) -> Result<Vec<HotspotActive>, Error> {
        let cmd = Command::print(HotspotActive::MENU).query("user", user);
        self.rows(cmd, HotspotActive::from_row).await
    }

    /// Kick every active session of a hotspot user.
    pub async fn remove_hotspot_active_for_user(&self, user: &str) -> Result<usize, Error> {
        let mut removed = 0;
        for active in self.hotspot_active_for_user(user).await? {
            if self.remove_id(HotspotActive::MENU, &active.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── Bridge & connections ────────────────────────────────────────

    pub async fn bridge_hosts_for_mac(&self, mac: &str) -> Result<Vec<BridgeHost>, Error> {
        let cmd = Command::print(BridgeHost::MENU).query("mac-address", mac);
        self.rows(cmd, BridgeHost::from_row).await
    }

    /// Drop tracked connections originating from `ip`.
    pub async fn remove_connections_for_ip(&self, ip: &str) -> Result<usize, Error> {
        let cmd = Command::print(FirewallConnection::MENU);
        let conns = self.rows(cmd, FirewallConnection::from_row).await?;
        let mut removed = 0;
        for conn in conns.iter().filter(|c| c.src_ip() == Some(ip)) {
            if self.remove_id(FirewallConnection::MENU, &conn.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── IP → MAC resolution ─────────────────────────────────────────

    /// Resolve the MAC currently using `ip`.
    ///
    /// Sources in order: hotspot host, hotspot active, DHCP lease, complete
    /// ARP entry, then an incomplete ARP entry whose MAC the bridge still
    /// sees on a port.
    pub async fn find_mac_by_ip_comprehensive(
        &self,
        ip: &str,
    ) -> Result<Option<(String, MacSource)>, Error> {
        if let Some(mac) = self
            .hotspot_hosts_for_address(ip)
            .await?
            .into_iter()
            .find_map(|h| h.mac)
        {
            return Ok(Some((mac, MacSource::HotspotHost)));
        }

        if let Some(mac) = self
            .hotspot_active_for_address(ip)
            .await?
            .into_iter()
            .find_map(|a| a.mac)
        {
            return Ok(Some((mac, MacSource::HotspotActive)));
        }

        let leases = self.dhcp_leases_for_address(ip).await?;
        if let Some(mac) = leases
            .iter()
            .filter(|l| l.is_bound() || !l.dynamic)
            .find_map(|l| l.mac.clone())
        {
            return Ok(Some((mac, MacSource::DhcpLease)));
        }

        let arp = self.arp_for_address(ip).await?;
        if let Some(mac) = arp.iter().filter(|a| a.complete).find_map(|a| a.mac.clone()) {
            return Ok(Some((mac, MacSource::Arp)));
        }

        for candidate in arp.iter().filter_map(|a| a.mac.as_deref()) {
            if !self.bridge_hosts_for_mac(candidate).await?.is_empty() {
                return Ok(Some((candidate.to_owned(), MacSource::BridgeHost)));
            }
        }

        debug!(ip, "no router source knows this IP");
        Ok(None)
    }
}
