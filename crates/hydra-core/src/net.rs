//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! Host identity helpers: advertised IP address and host name.

use std::net::{IpAddr, Ipv4Addr};

use hydra_store::store::glob_match;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Public address used only to select the outbound interface; nothing is sent.
const OUTBOUND_PROBE: &str = "8.8.8.8:53";

/// Resolve the address this instance advertises.
///
/// A literal address is used verbatim. A pattern such as `10.0.*.*` selects
/// the first local interface matching it. Otherwise the address of the
/// interface carrying outbound traffic is used, then the first non-loopback
/// interface, then loopback.
pub async fn resolve_service_ip(setting: Option<&str>) -> IpAddr {
    let setting = setting.map(str::trim).unwrap_or_default();
    if let Ok(ip) = setting.parse::<IpAddr>() {
        return ip;
    }
    if setting.contains('*') || setting.contains('?') {
        match match_interface(setting) {
            Some(ip) => return ip,
            None => warn!(pattern = setting, "no local interface matches serviceIP pattern"),
        }
    } else if !setting.is_empty() {
        warn!(value = setting, "serviceIP is neither an address nor a pattern");
    }

    if let Some(ip) = outbound_ip().await {
        return ip;
    }
    local_addresses()
        .into_iter()
        .find(|ip| !ip.is_loopback())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn match_interface(pattern: &str) -> Option<IpAddr> {
    local_addresses()
        .into_iter()
        .find(|ip| ip_matches(pattern, ip))
}

/// Whether `ip` matches a wildcard pattern like `192.168.*.*`.
pub fn ip_matches(pattern: &str, ip: &IpAddr) -> bool {
    glob_match(pattern, &ip.to_string())
}

fn local_addresses() -> Vec<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.into_iter().map(|iface| iface.ip()).collect(),
        Err(err) => {
            warn!(error = %err, "unable to enumerate network interfaces");
            Vec::new()
        }
    }
}

async fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    if let Err(err) = socket.connect(OUTBOUND_PROBE).await {
        debug!(error = %err, "outbound address probe failed");
        return None;
    }
    socket
        .local_addr()
        .ok()
        .map(|addr| addr.ip())
        .filter(|ip| !ip.is_unspecified())
}

/// Host name from the environment, the kernel, or `localhost`.
pub fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_patterns_match_octets() {
        let ip: IpAddr = "10.0.3.17".parse().unwrap();
        assert!(ip_matches("10.0.*.*", &ip));
        assert!(ip_matches("10.0.3.1?", &ip));
        assert!(!ip_matches("192.168.*.*", &ip));
    }

    #[tokio::test]
    async fn literal_addresses_win() {
        let ip = resolve_service_ip(Some(" 172.16.0.9 ")).await;
        assert_eq!(ip, "172.16.0.9".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn unmatched_pattern_still_resolves() {
        // falls through to auto-detection, which always yields something
        let ip = resolve_service_ip(Some("203.0.113.*")).await;
        assert!(!ip.to_string().is_empty());
    }

    #[test]
    fn host_name_is_never_empty() {
        assert!(!host_name().is_empty());
    }
}
