// Typed RouterOS rows
//
// The API speaks in string attributes. These structs pick the attributes
// the hotspot backend reads; everything else stays available on `Row`.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::duration::parse_routeros_duration;
use crate::error::Error;

// ── Raw rows ────────────────────────────────────────────────────────

/// Attribute map of one `!re` sentence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Row(BTreeMap<String, String>);

impl From<BTreeMap<String, String>> for Row {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl Row {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Non-empty attribute value.
    pub fn non_empty(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true" | "yes"))
    }

    pub fn id(&self) -> Option<RowId> {
        self.get(".id").and_then(RowId::parse)
    }

    pub fn require_id(&self, path: &str) -> Result<RowId, Error> {
        self.id().ok_or_else(|| Error::MissingAttribute {
            path: path.to_owned(),
            attribute: ".id".into(),
        })
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// Internal row id (`*1A`). Ids given without the leading `*` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RowId(String);

impl RowId {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let bare = trimmed.strip_prefix('*').unwrap_or(trimmed);
        if bare.is_empty() || !bare.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(format!("*{}", bare.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Hotspot ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotspotUser {
    pub id: RowId,
    pub name: String,
    pub profile: Option<String>,
    pub server: Option<String>,
    pub comment: Option<String>,
    pub disabled: bool,
}

impl HotspotUser {
    pub const MENU: &'static str = "/ip/hotspot/user";

    pub fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(Self {
            id: row.require_id(Self::MENU)?,
            name: row.non_empty("name").unwrap_or_default(),
            profile: row.non_empty("profile"),
            server: row.non_empty("server"),
            comment: row.non_empty("comment"),
            disabled: row.flag("disabled"),
        })
    }
}

/// `/ip/hotspot/ip-binding` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingType {
    Regular,
    Bypassed,
    Blocked,
}

impl BindingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Bypassed => "bypassed",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "bypassed" => Self::Bypassed,
            "blocked" => Self::Blocked,
            _ => Self::Regular,
        }
    }
}

impl fmt::Display for BindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpBinding {
    pub id: RowId,
    pub mac: Option<String>,
    pub address: Option<String>,
    pub server: Option<String>,
    pub binding_type: BindingType,
    pub comment: Option<String>,
    pub disabled: bool,
}

impl IpBinding {
    pub const MENU: &'static str = "/ip/hotspot/ip-binding";

    pub fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(Self {
            id: row.require_id(Self::MENU)?,
            mac: row.non_empty("mac-address"),
            address: row.non_empty("address"),
            server: row.non_empty("server"),
            binding_type: BindingType::parse(row.get("type").unwrap_or_default()),
            comment: row.non_empty("comment"),
            disabled: row.flag("disabled"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotspotHost {
    pub id: RowId,
    pub mac: Option<String>,
    pub address: Option<String>,
    pub to_address: Option<String>,
    pub server: Option<String>,
    pub authorized: bool,
    pub bypassed: bool,
}

impl HotspotHost {
    pub const MENU: &'static str = "/ip/hotspot/host";

    pub fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(Self {
            id: row.require_id(Self::MENU)?,
            mac: row.non_empty("mac-address"),
            address: row.non_empty("address"),
            to_address: row.non_empty("to-address"),
            server: row.non_empty("server"),
            authorized: row.flag("authorized"),
            bypassed: row.flag("bypassed"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotspotActive {
    pub id: RowId,
    pub user: Option<String>,
    pub address: Option<String>,
    pub mac: Option<String>,
    pub uptime_secs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl HotspotActive {
    pub const MENU: &'static str = "/ip/hotspot/active";

    pub fn from_row(row: &Row) -> Result<Self, Error> {
        let counter = |key: &str| row.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok(Self {
            id: row.require_id(Self::MENU)?,
            user: row.non_empty("user"),
            address: row.non_empty("address"),
            mac: row.non_empty("mac-address"),
            uptime_secs: parse_routeros_duration(row.get("uptime").unwrap_or_default()),
            bytes_in: counter("bytes-in"),
            bytes_out: counter("bytes-out"),
        })
    }
}

// ── DHCP / ARP / bridge ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DhcpLease {
    pub id: RowId,
    pub address: Option<String>,
    pub mac: Option<String>,
    pub server: Option<String>,
    pub host_name: Option<String>,
    pub comment: Option<String>,
    pub dynamic: bool,
    pub status: Option<String>,
}

impl DhcpLease {
    pub const MENU: &'static str = "/ip/dhcp-server/lease";

    pub fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(Self {
            id: row.require_id(Self::MENU)?,
            address: row.non_empty("address"),
            mac: row.non_empty("mac-address"),
            server: row.non_empty("server"),
            host_name: row.non_empty("host-name"),
            comment: row.non_empty("comment"),
            dynamic: row.flag("dynamic"),
            status: row.non_empty("status"),
        })
    }

    pub fn is_bound(&self) -> bool {
        self.status.as_deref() == Some("bound")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArpEntry {
    pub id: RowId,
    pub address: Option<String>,
    pub mac: Option<String>,
    pub interface: Option<String>,
    pub dynamic: bool,
    pub complete: bool,
}

impl ArpEntry {
    pub const MENU: &'static str = "/ip/arp";

    pub fn from_row(row: &Row) -> Result<Self, Error> {
        let mac = row.non_empty("mac-address");
        // `complete` is absent on older firmware; a MAC implies resolution.
        let complete = row.get("complete").map_or(mac.is_some(), |v| v == "true");
        Ok(Self {
            id: row.require_id(Self::MENU)?,
            address: row.non_empty("address"),
            mac,
            interface: row.non_empty("interface"),
            dynamic: row.flag("dynamic"),
            complete,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeHost {
    pub mac: String,
    pub interface: Option<String>,
    pub bridge: Option<String>,
    pub local: bool,
}

impl BridgeHost {
    pub const MENU: &'static str = "/interface/bridge/host";

    pub fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(Self {
            mac: row
                .non_empty("mac-address")
                .ok_or_else(|| Error::MissingAttribute {
                    path: Self::MENU.into(),
                    attribute: "mac-address".into(),
                })?,
            interface: row.non_empty("on-interface").or_else(|| row.non_empty("interface")),
            bridge: row.non_empty("bridge"),
            local: row.flag("local"),
        })
    }
}

// ── Firewall ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressListEntry {
    pub id: RowId,
    pub list: String,
    pub address: String,
    pub comment: Option<String>,
    pub dynamic: bool,
}

impl AddressListEntry {
    pub const MENU: &'static str = "/ip/firewall/address-list";

    pub fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(Self {
            id: row.require_id(Self::MENU)?,
            list: row.non_empty("list").unwrap_or_default(),
            address: row.non_empty("address").unwrap_or_default(),
            comment: row.non_empty("comment"),
            dynamic: row.flag("dynamic"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallConnection {
    pub id: RowId,
    pub src_address: Option<String>,
    pub dst_address: Option<String>,
    pub protocol: Option<String>,
}

impl FirewallConnection {
    pub const MENU: &'static str = "/ip/firewall/connection";

    pub fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(Self {
            id: row.require_id(Self::MENU)?,
            src_address: row.non_empty("src-address"),
            dst_address: row.non_empty("dst-address"),
            protocol: row.non_empty("protocol"),
        })
    }

    /// Source IP without the `:port` suffix.
    pub fn src_ip(&self) -> Option<&str> {
        self.src_address
            .as_deref()
            .map(|a| a.rsplit_once(':').map_or(a, |(ip, _)| ip))
    }
}
