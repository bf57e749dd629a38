//! Destination resolution with a hosts override table.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

/// Resolves destination hosts, preferring configured overrides.
#[derive(Debug, Default)]
pub struct DnsResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl DnsResolver {
    /// `hosts` maps a name to one or more space-separated addresses.
    pub fn new(hosts: &HashMap<String, String>) -> Self {
        let hosts = hosts
            .iter()
            .filter_map(|(name, addrs)| {
                let parsed: Vec<IpAddr> = addrs
                    .split_whitespace()
                    .filter_map(|a| a.parse().ok())
                    .collect();
                if parsed.is_empty() {
                    None
                } else {
                    Some((name.to_ascii_lowercase(), parsed))
                }
            })
            .collect();
        Self { hosts }
    }

    /// Override addresses for a host, tried in order by the direct connector.
    pub fn iplist(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.hosts.get(&host.to_ascii_lowercase()).cloned()
    }

    /// Resolve a host to a single address. IP literals short-circuit; the
    /// override table wins over DNS. `None` when resolution fails.
    pub async fn get_ip_address(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        if let Some(list) = self.iplist(host) {
            return list.first().copied();
        }
        match tokio::net::lookup_host((host, 0)).await {
            Ok(mut addrs) => addrs.next().map(|a| a.ip()),
            Err(e) => {
                debug!(target: "fwlite::policy", %host, error = ?e, "resolution failed");
                None
            }
        }
    }
}
