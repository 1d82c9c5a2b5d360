// ── Client IP resolution ──
//
// The one place that decides which address a request came from. Forwarding
// headers are honoured only when the direct peer is a trusted proxy, and
// `X-Forwarded-For` is read right to left so a client cannot prepend a
// spoofed hop.

use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use crate::settings::Settings;

/// Raw forwarding header values of one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedHeaders<'a> {
    pub x_forwarded_for: Option<&'a str>,
    pub x_real_ip: Option<&'a str>,
}

fn is_trusted(settings: &Settings, ip: IpAddr) -> bool {
    settings.trusted_proxy_cidrs.iter().any(|net| net.contains(&ip))
}

/// Accepts `1.2.3.4`, `1.2.3.4:5678`, `[::1]:80` and bare IPv6.
fn parse_hop(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim().trim_matches('"');
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))
}

pub fn resolve_client_ip(peer: IpAddr, headers: ForwardedHeaders<'_>, settings: &Settings) -> IpAddr {
    if !is_trusted(settings, peer) {
        return peer;
    }

    if let Some(chain) = headers.x_forwarded_for {
        let hops: Vec<IpAddr> = chain.split(',').filter_map(parse_hop).collect();
        if let Some(client) = hops.iter().rev().find(|ip| !is_trusted(settings, **ip)) {
            debug!(%peer, client = %client, "client IP from X-Forwarded-For");
            return *client;
        }
        // every hop is a proxy: the leftmost is as close to the client as we get
        if let Some(first) = hops.first() {
            return *first;
        }
    }

    headers
        .x_real_ip
        .and_then(parse_hop)
        .unwrap_or(peer)
}
