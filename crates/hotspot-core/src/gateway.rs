// ── Gateway seam ──
//
// The subset of router operations the sync and binding services need.
// `RouterOsGateway` forwards to the pooled RouterOS client; tests plug in
// an in-memory router.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use hotspot_routeros::{
    AddressListEntry, AddressListSpec, DhcpLeaseSpec, HotspotActive, HotspotUser, HotspotUserSpec, IpBinding,
    IpBindingSpec, MacSource, RouterOsClient, RouterOsPool, RowId, UpsertOutcome,
};

use crate::error::CoreError;

#[async_trait]
pub trait HotspotGateway: Send + Sync + Debug {
    /// Stable name of the router, used in lock keys.
    fn router_key(&self) -> String;

    async fn system_identity(&self) -> Result<String, CoreError>;

    async fn find_hotspot_user(&self, name: &str) -> Result<Option<HotspotUser>, CoreError>;
    async fn ensure_hotspot_user(
        &self,
        spec: &HotspotUserSpec,
    ) -> Result<(HotspotUser, bool), CoreError>;
    async fn set_hotspot_user_profile(&self, id: &RowId, profile: &str) -> Result<(), CoreError>;

    async fn ip_bindings_for_mac(&self, mac: &str) -> Result<Vec<IpBinding>, CoreError>;
    async fn upsert_ip_binding(&self, spec: &IpBindingSpec) -> Result<UpsertOutcome, CoreError>;
    async fn remove_ip_bindings_for_mac(&self, mac: &str) -> Result<usize, CoreError>;

    async fn upsert_dhcp_static_lease(
        &self,
        spec: &DhcpLeaseSpec,
    ) -> Result<UpsertOutcome, CoreError>;
    async fn remove_dhcp_leases_for_mac(&self, mac: &str) -> Result<usize, CoreError>;

    /// Every address-list row holding `address`, across all lists.
    async fn address_list_entries(&self, address: &str)
    -> Result<Vec<AddressListEntry>, CoreError>;
    async fn upsert_address_list_entry(
        &self,
        spec: &AddressListSpec,
    ) -> Result<UpsertOutcome, CoreError>;
    async fn remove_address_list_entries(
        &self,
        address: &str,
        lists: &[String],
    ) -> Result<usize, CoreError>;

    async fn remove_hotspot_hosts_for_mac(&self, mac: &str) -> Result<usize, CoreError>;
    async fn remove_arp_for_mac(&self, mac: &str) -> Result<usize, CoreError>;
    async fn hotspot_active_for_user(&self, user: &str) -> Result<Vec<HotspotActive>, CoreError>;
    async fn remove_hotspot_active_for_user(&self, user: &str) -> Result<usize, CoreError>;
    async fn remove_connections_for_ip(&self, ip: &str) -> Result<usize, CoreError>;

    async fn find_mac_by_ip(&self, ip: &str) -> Result<Option<(String, MacSource)>, CoreError>;
}

/// Gateway backed by a live RouterOS session pool.
#[derive(Debug, Clone)]
pub struct RouterOsGateway {
    client: RouterOsClient,
}

impl RouterOsGateway {
    pub fn new(pool: Arc<RouterOsPool>, managed_prefix: impl Into<String>) -> Self {
        Self {
            client: RouterOsClient::new(pool, managed_prefix),
        }
    }

    pub fn client(&self) -> &RouterOsClient {
        &self.client
    }
}

#[async_trait]
impl HotspotGateway for RouterOsGateway {
    fn router_key(&self) -> String {
        self.client.pool().endpoint()
    }

    async fn system_identity(&self) -> Result<String, CoreError> {
        Ok(self.client.system_identity().await?)
    }

    async fn find_hotspot_user(&self, name: &str) -> Result<Option<HotspotUser>, CoreError> {
        Ok(self.client.find_hotspot_user(name).await?)
    }

    async fn ensure_hotspot_user(
        &self,
        spec: &HotspotUserSpec,
    ) -> Result<(HotspotUser, bool), CoreError> {
        Ok(self.client.ensure_hotspot_user(spec).await?)
    }

    async fn set_hotspot_user_profile(&self, id: &RowId, profile: &str) -> Result<(), CoreError> {
        Ok(self.client.set_hotspot_user_profile(id, profile).await?)
    }

    async fn ip_bindings_for_mac(&self, mac: &str) -> Result<Vec<IpBinding>, CoreError> {
        Ok(self.client.ip_bindings_for_mac(mac).await?)
    }

    async fn upsert_ip_binding(&self, spec: &IpBindingSpec) -> Result<UpsertOutcome, CoreError> {
        Ok(self.client.upsert_ip_binding(spec).await?)
    }

    async fn remove_ip_bindings_for_mac(&self, mac: &str) -> Result<usize, CoreError> {
        Ok(self.client.remove_ip_bindings_for_mac(mac).await?)
    }

    async fn upsert_dhcp_static_lease(
        &self,
        spec: &DhcpLeaseSpec,
    ) -> Result<UpsertOutcome, CoreError> {
        Ok(self.client.upsert_dhcp_static_lease(spec).await?)
    }

    async fn remove_dhcp_leases_for_mac(&self, mac: &str) -> Result<usize, CoreError> {
        Ok(self.client.remove_dhcp_leases_for_mac(mac).await?)
    }

    async fn address_list_entries(
        &self,
        address: &str,
    ) -> Result<Vec<AddressListEntry>, CoreError> {
        Ok(self.client.address_list_entries(None, Some(address)).await?)
    }

    async fn upsert_address_list_entry(
        &self,
        spec: &AddressListSpec,
    ) -> Result<UpsertOutcome, CoreError> {
        Ok(self.client.upsert_address_list_entry(spec).await?)
    }

    async fn remove_address_list_entries(
        &self,
        address: &str,
        lists: &[String],
    ) -> Result<usize, CoreError> {
        Ok(self.client.remove_address_list_entries(address, lists).await?)
    }

    async fn remove_hotspot_hosts_for_mac(&self, mac: &str) -> Result<usize, CoreError> {
        Ok(self.client.remove_hotspot_hosts_for_mac(mac).await?)
    }

    async fn remove_arp_for_mac(&self, mac: &str) -> Result<usize, CoreError> {
        let entries = self.client.arp_for_mac(mac).await?;
        Ok(self.client.remove_arp_entries(&entries).await?)
    }

    async fn hotspot_active_for_user(&self, user: &str) -> Result<Vec<HotspotActive>, CoreError> {
        Ok(self.client.hotspot_active_for_user(user).await?)
    }

    async fn remove_hotspot_active_for_user(&self, user: &str) -> Result<usize, CoreError> {
        Ok(self.client.remove_hotspot_active_for_user(user).await?)
    }

    async fn remove_connections_for_ip(&self, ip: &str) -> Result<usize, CoreError> {
        Ok(self.client.remove_connections_for_ip(ip).await?)
    }

    async fn find_mac_by_ip(&self, ip: &str) -> Result<Option<(String, MacSource)>, CoreError> {
        Ok(self.client.find_mac_by_ip_comprehensive(ip).await?)
    }
}
