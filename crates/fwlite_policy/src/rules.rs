//! Rule-based implementation of [`ProxyResolver`].

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fwlite_config::FwliteConfig;
use tracing::{debug, info};

use crate::parent::{ParentList, ParentProxy};
use crate::{ProxyResolver, RedirectAction, RequestSummary};

#[derive(Debug, Clone)]
struct LocalRule {
    pattern: String,
    /// Unix seconds; `None` is permanent.
    expire: Option<u64>,
}

/// Policy engine driven by configured rules: redirect prefixes, force-proxy
/// local rules with expiry, a bad-302 prefix list, and level-based candidate
/// ordering over the parent list.
pub struct RuleResolver {
    parents: Arc<ParentList>,
    local_rules: RwLock<Vec<LocalRule>>,
    redirect_rules: RwLock<Vec<(String, String)>>,
    bad302_prefixes: RwLock<Vec<String>>,
    gfwlist: AtomicBool,
    autoupdate: AtomicBool,
    /// Per-host (success, failure) counters fed by `notify`.
    outcomes: DashMap<String, (u64, u64)>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RuleResolver {
    pub fn from_config(cfg: &FwliteConfig) -> Self {
        let parents = Arc::new(ParentList::new());
        for (name, uri) in &cfg.parents {
            match ParentProxy::parse(name, uri) {
                Ok(parent) => parents.add(Arc::new(parent)),
                Err(e) => info!(target: "fwlite::policy", error = %e, "skipping parent"),
            }
        }

        let local_rules = cfg
            .rules
            .local
            .split_whitespace()
            .map(|pattern| LocalRule {
                pattern: pattern.to_string(),
                expire: None,
            })
            .collect();

        let mut redirect_rules: Vec<(String, String)> = cfg
            .redirect
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        redirect_rules.sort();

        let bad302_prefixes = cfg
            .rules
            .bad302
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Self {
            parents,
            local_rules: RwLock::new(local_rules),
            redirect_rules: RwLock::new(redirect_rules),
            bad302_prefixes: RwLock::new(bad302_prefixes),
            gfwlist: AtomicBool::new(cfg.rules.gfwlist),
            autoupdate: AtomicBool::new(cfg.rules.autoupdate),
            outcomes: DashMap::new(),
        }
    }

    pub fn parents(&self) -> &Arc<ParentList> {
        &self.parents
    }

    // ----- admin API surface -------------------------------------------

    pub fn local_rules(&self) -> Vec<(String, Option<u64>)> {
        self.purge_expired();
        self.local_rules
            .read()
            .unwrap()
            .iter()
            .map(|r| (r.pattern.clone(), r.expire))
            .collect()
    }

    /// Add a force-proxy rule; `exp_secs` is a lifetime from now.
    /// Returns an error message when the rule already exists.
    pub fn add_temp(&self, pattern: &str, exp_secs: Option<u64>) -> Result<(), String> {
        let mut rules = self.local_rules.write().unwrap();
        if rules.iter().any(|r| r.pattern == pattern) {
            return Err(format!("rule {pattern} already exists"));
        }
        rules.push(LocalRule {
            pattern: pattern.to_string(),
            expire: exp_secs.map(|s| now_secs() + s),
        });
        info!(target: "fwlite::policy", %pattern, "local rule added");
        Ok(())
    }

    /// Remove a rule; returns its expiry slot when it existed.
    pub fn remove_local(&self, pattern: &str) -> Option<Option<u64>> {
        let mut rules = self.local_rules.write().unwrap();
        let idx = rules.iter().position(|r| r.pattern == pattern)?;
        Some(rules.remove(idx).expire)
    }

    pub fn redirect_rules(&self) -> Vec<(String, String)> {
        self.redirect_rules.read().unwrap().clone()
    }

    pub fn add_redirect(&self, prefix: &str, dest: &str) {
        self.redirect_rules
            .write()
            .unwrap()
            .push((prefix.to_string(), dest.to_string()));
    }

    pub fn remove_redirect(&self, index: usize) -> Option<(String, String)> {
        let mut rules = self.redirect_rules.write().unwrap();
        if index < rules.len() {
            Some(rules.remove(index))
        } else {
            None
        }
    }

    pub fn gfwlist_enabled(&self) -> bool {
        self.gfwlist.load(Ordering::Relaxed)
    }

    pub fn set_gfwlist(&self, enabled: bool) {
        self.gfwlist.store(enabled, Ordering::Relaxed);
    }

    pub fn autoupdate_enabled(&self) -> bool {
        self.autoupdate.load(Ordering::Relaxed)
    }

    pub fn set_autoupdate(&self, enabled: bool) {
        self.autoupdate.store(enabled, Ordering::Relaxed);
    }

    // ----- internals ---------------------------------------------------

    fn purge_expired(&self) {
        let now = now_secs();
        self.local_rules
            .write()
            .unwrap()
            .retain(|r| r.expire.is_none_or(|e| e > now));
    }

    fn force_proxy(&self, url: &str, host: &str) -> bool {
        if !self.gfwlist_enabled() {
            return false;
        }
        self.purge_expired();
        self.local_rules
            .read()
            .unwrap()
            .iter()
            .any(|r| url.contains(&r.pattern) || host.contains(&r.pattern))
    }
}

impl ProxyResolver for RuleResolver {
    fn redirect(&self, req: &RequestSummary) -> Option<RedirectAction> {
        let rules = self.redirect_rules.read().unwrap();
        let (_, dest) = rules.iter().find(|(prefix, _)| req.url.starts_with(prefix))?;

        if let Ok(status) = dest.parse::<u16>() {
            if (400..600).contains(&status) {
                return Some(RedirectAction::Status(status));
            }
        }
        match dest.to_ascii_lowercase().as_str() {
            "return" => return Some(RedirectAction::Return),
            "reset" => return Some(RedirectAction::Reset),
            "adblock" => return Some(RedirectAction::Adblock),
            _ => {}
        }
        let names: Vec<&str> = dest.split_whitespace().collect();
        if !names.is_empty() && names.iter().all(|n| self.parents.contains(n)) {
            return Some(RedirectAction::Parents(
                names.iter().filter_map(|n| self.parents.get(n)).collect(),
            ));
        }
        Some(RedirectAction::Url(dest.clone()))
    }

    fn get_proxy(
        &self,
        url: &str,
        host: &str,
        _port: u16,
        _method: &str,
        ip: Option<IpAddr>,
        level: u8,
    ) -> Vec<Arc<ParentProxy>> {
        let all = self.parents.sorted();
        let direct = all.iter().find(|p| p.is_direct()).cloned();
        let mut proxies: Vec<_> = all.into_iter().filter(|p| !p.is_direct()).collect();
        proxies.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.avg_latency(host).total_cmp(&b.avg_latency(host)))
        });

        if level == 0 {
            return direct.into_iter().collect();
        }
        if self.force_proxy(url, host) {
            return proxies;
        }

        let mut list = Vec::new();
        // Level 3+ listeners distrust direct; unresolvable hosts also go
        // through a parent first.
        if level >= 3 || ip.is_none() {
            list.extend(proxies);
            list.extend(direct);
        } else {
            list.extend(direct);
            list.extend(proxies);
        }
        list
    }

    fn notify(
        &self,
        method: &str,
        url: &str,
        host: &str,
        success: bool,
        failed_parents: &[String],
        current_parent: &str,
        rtime: Option<Duration>,
    ) {
        let mut entry = self.outcomes.entry(host.to_string()).or_insert((0, 0));
        if success {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
        debug!(
            target: "fwlite::policy",
            %method,
            %url,
            %success,
            failed = failed_parents.len(),
            parent = %current_parent,
            rtime = ?rtime,
            "request outcome"
        );
    }

    fn bad302(&self, location: &str) -> bool {
        self.bad302_prefixes
            .read()
            .unwrap()
            .iter()
            .any(|prefix| location.starts_with(prefix))
    }
}
