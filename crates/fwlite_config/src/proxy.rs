use serde::Deserialize;
use std::collections::HashMap;

// =======================================================
// FWLITE CONFIG — main config
// =======================================================
#[derive(Debug, Deserialize)]
pub struct FwliteConfig {
    #[serde(default)]
    pub fwlite: ProxySection,

    /// Parent proxies: `name = scheme://[user:pass@]host:port[ priority]`.
    #[serde(default)]
    pub parents: HashMap<String, String>,

    /// Resolver overrides: `host = ip[ ip...]`.
    #[serde(default)]
    pub hosts: HashMap<String, String>,

    /// Redirect rules: `prefix = action`.
    #[serde(default)]
    pub redirect: HashMap<String, String>,

    #[serde(default)]
    pub rules: RulesSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    /// First listener address; profile digits extend the port range upward.
    pub listen: String,
    /// One listener per digit; the digit is that listener's policy level.
    pub profile: String,

    // Timeouts (seconds)
    pub timeout_secs: u64,
    pub keepalive_timeout_secs: u64,

    // Limits
    pub max_connections: usize,
    pub pool_depth: usize,

    pub x_forwarded_for: bool,
    pub remote_api: bool,

    /// Optional PAC file served at `/pac` on the local listener.
    pub pac_file: String,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8118".into(),
            profile: "13".into(),
            timeout_secs: 5,
            keepalive_timeout_secs: 60,
            max_connections: 512,
            pool_depth: 4,
            x_forwarded_for: false,
            remote_api: false,
            pac_file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesSection {
    pub gfwlist: bool,
    pub autoupdate: bool,
    /// Space-separated force-proxy patterns.
    pub local: String,
    /// Space-separated Location prefixes treated as poisoned redirects.
    pub bad302: String,
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            gfwlist: true,
            autoupdate: true,
            local: String::new(),
            bad302: String::new(),
        }
    }
}

impl Default for FwliteConfig {
    fn default() -> Self {
        Self {
            fwlite: ProxySection::default(),
            parents: HashMap::new(),
            hosts: HashMap::new(),
            redirect: HashMap::new(),
            rules: RulesSection::default(),
        }
    }
}

impl FwliteConfig {
    pub fn from_file(file_name: &str) -> Result<Self, config::ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::new(file_name, config::FileFormat::Ini).required(false))
            .build()?;

        let mut cfg: FwliteConfig = built.try_deserialize()?;
        cfg.apply_defaults();
        Ok(cfg)
    }

    pub fn from_file_or_default(file_name: &str) -> Self {
        match Self::from_file(file_name) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("error reading config '{file_name}': {e}");
                eprintln!("using default config (in-memory)...");
                FwliteConfig::default()
            }
        }
    }

    fn apply_defaults(&mut self) {
        let def = ProxySection::default();
        if self.fwlite.listen.is_empty() {
            self.fwlite.listen = def.listen;
        }
        if self.fwlite.profile.is_empty()
            || !self.fwlite.profile.bytes().all(|b| b.is_ascii_digit())
        {
            self.fwlite.profile = def.profile;
        }
        if self.fwlite.timeout_secs == 0 {
            self.fwlite.timeout_secs = def.timeout_secs;
        }
        if self.fwlite.keepalive_timeout_secs == 0 {
            self.fwlite.keepalive_timeout_secs = def.keepalive_timeout_secs;
        }
        if self.fwlite.max_connections == 0 {
            self.fwlite.max_connections = def.max_connections;
        }
        if self.fwlite.pool_depth == 0 {
            self.fwlite.pool_depth = def.pool_depth;
        }
    }

    /// Listen host without the port.
    pub fn listen_host(&self) -> &str {
        self.fwlite
            .listen
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.fwlite.listen.as_str())
    }

    /// First listener port; each profile digit adds one.
    pub fn base_port(&self) -> u16 {
        self.fwlite
            .listen
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(8118)
    }

    /// Policy level per listener, one per profile digit.
    pub fn profile_levels(&self) -> Vec<u8> {
        self.fwlite
            .profile
            .bytes()
            .filter(u8::is_ascii_digit)
            .map(|b| b - b'0')
            .collect()
    }

    /// Port range owned by this instance, for the self-address check.
    pub fn listen_ports(&self) -> std::ops::Range<u16> {
        let base = self.base_port();
        base..base.saturating_add(self.profile_levels().len() as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::FwliteConfig;

    #[test]
    fn profile_levels_map_digits() {
        let cfg = FwliteConfig::default();
        assert_eq!(cfg.profile_levels(), vec![1, 3]);
        assert_eq!(cfg.base_port(), 8118);
        assert_eq!(cfg.listen_ports(), 8118..8120);
    }

    #[test]
    fn listen_host_splits_port() {
        let mut cfg = FwliteConfig::default();
        cfg.fwlite.listen = "0.0.0.0:9000".into();
        assert_eq!(cfg.listen_host(), "0.0.0.0");
        assert_eq!(cfg.base_port(), 9000);
    }
}
