// hotspot-routeros: Async client for the MikroTik RouterOS API
//
// Layers, bottom-up: `protocol` (length-prefixed word codec), `session`
// (login + one command at a time), `pool` (bounded set of sessions with
// health checks and a connect circuit breaker), `client` (typed hotspot,
// DHCP, firewall and bridge operations that respect the managed-comment
// contract).

pub mod breaker;
pub mod client;
pub mod command;
pub mod duration;
pub mod error;
pub mod models;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod transport;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use client::{
    AddressListSpec, DhcpLeaseSpec, HotspotUserSpec, IpBindingSpec, MacSource, RouterOsClient,
    UpsertOutcome,
};
pub use command::Command;
pub use duration::parse_routeros_duration;
pub use error::Error;
pub use models::{
    AddressListEntry, ArpEntry, BindingType, BridgeHost, DhcpLease, FirewallConnection,
    HotspotActive, HotspotHost, HotspotUser, IpBinding, Row, RowId,
};
pub use pool::{PoolConfig, RouterOsPool};
pub use transport::{RouterCredentials, TlsMode, TransportConfig};
