//! Classification helpers for applications and remote addresses
//!
//! Informational only: nothing here feeds into arbitration verdicts.

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Bundle identifiers of well-known VPN, proxy and traffic-inspection apps
const PROXY_APP_IDENTIFIERS: &[&str] = &[
    "com.expressvpn.ExpressVPN",
    "com.nordvpn.osx",
    "com.surfshark.vpnclient.macos",
    "com.cyberghostvpn.mac",
    "com.privateinternetaccess.vpn",
    "com.tunnelbear.mac.TunnelBear",
    "com.protonvpn.mac",
    "com.windscribe.desktop",
    "com.hotspotshield.vpn.mac",
    "com.qiuyuzhou.ShadowsocksX-NG",
    "com.shadowsocks.ShadowsocksX-NG",
    "clowwindy.ShadowsocksX",
    "com.github.shadowsocks.ShadowsocksX-NG",
    "com.v2ray.V2RayU",
    "com.yanue.V2rayU",
    "com.v2rayx.V2RayX",
    "net.qiuyuzhou.V2RayX",
    "com.west2online.ClashX",
    "com.dreamacro.clash.for.windows",
    "com.clash.for.windows",
    "com.github.yichengchen.clashX",
    "com.nssurge.surge-mac",
    "com.nssurge.surge.mac",
    "com.proxyman.NSProxy",
    "com.xk72.Charles",
    "org.wireshark.Wireshark",
    "com.proxifier.macos",
    "org.torproject.torbrowser",
    "org.getlantern.lantern",
    "ca.psiphon.Psiphon",
    "net.tunnelblick.tunnelblick",
    "net.openvpn.connect.app",
    "com.viscosityvpn.Viscosity",
];

/// Lowercase substrings that mark an identifier or display name as a proxy
const PROXY_KEYWORDS: &[&str] = &[
    "vpn",
    "proxy",
    "shadowsocks",
    "v2ray",
    "clash",
    "surge",
    "trojan",
    "ssr",
    "vmess",
    "vless",
    "wireguard",
    "openvpn",
    "tunnel",
    "tor",
];

/// Returns true if the app looks like a VPN/proxy client.
///
/// Exact matches against the known identifier table win; otherwise the
/// identifier and the optional display name are searched for keywords.
/// Keyword matching is deliberately loose ("tor" also matches "editor").
pub fn is_proxy_app(app_id: &str, name: Option<&str>) -> bool {
    if PROXY_APP_IDENTIFIERS.contains(&app_id) {
        return true;
    }

    let app_id = app_id.to_lowercase();
    let name = name.unwrap_or_default().to_lowercase();

    PROXY_KEYWORDS
        .iter()
        .any(|keyword| app_id.contains(keyword) || name.contains(keyword))
}

/// Traffic category - Internet vs Local network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficCategory {
    /// Internet/WAN traffic (public IPs)
    Internet,
    /// Local/LAN traffic (private IPs, loopback, link-local)
    Local,
}

pub fn is_local_traffic(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_local_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_local_ipv6(ipv6),
    }
}

fn is_local_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
}

fn is_local_ipv6(ip: &Ipv6Addr) -> bool {
    ip.is_loopback()
        || ip.is_unicast_link_local()
        || ip.is_unspecified()
        || (ip.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7 unique local
}

/// Categorize a remote host as reported by the filter.
///
/// Hosts arrive as strings and may be hostnames; those have no category.
/// Bracketed IPv6 literals (`[::1]`) are accepted.
pub fn categorize_host(host: &str) -> Option<TrafficCategory> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = host.parse().ok()?;

    Some(if is_local_traffic(&ip) {
        TrafficCategory::Local
    } else {
        TrafficCategory::Internet
    })
}
