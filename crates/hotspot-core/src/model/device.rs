// ── User devices ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{UserDeviceId, UserId};
use super::mac::MacAddress;

/// A MAC seen for a user. At most one authorized device per MAC globally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDevice {
    pub id: UserDeviceId,
    pub user_id: UserId,
    pub mac: MacAddress,
    pub last_ip: Option<String>,
    pub authorized: bool,
    pub label: Option<String>,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub authorized_at: Option<DateTime<Utc>>,
}

impl UserDevice {
    pub fn new(user_id: UserId, mac: MacAddress, ip: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: UserDeviceId::new(),
            user_id,
            mac,
            last_ip: ip,
            authorized: false,
            label: None,
            bytes_in: 0,
            bytes_out: 0,
            first_seen_at: now,
            last_seen_at: now,
            authorized_at: None,
        }
    }
}
