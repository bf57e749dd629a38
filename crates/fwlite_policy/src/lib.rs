//! Upstream-selection policy.
//!
//! The engines consume this crate through the [`ProxyResolver`] trait:
//! rewrite/block decisions before any upstream is contacted, an ordered
//! upstream candidate list per request, and success/failure feedback after
//! each attempt.

mod parent;
mod resolver;
mod rules;

pub use parent::{ParentList, ParentProxy, Scheme};
pub use resolver::DnsResolver;
pub use rules::RuleResolver;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// The request fields rule matching looks at.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: String,
    /// Absolute URL for plain requests, `host:port` for CONNECT.
    pub url: String,
    pub host: String,
    pub port: u16,
}

/// Outcome of the pre-forward rewrite consultation.
#[derive(Debug, Clone, PartialEq)]
pub enum RedirectAction {
    /// Return this status to the client without contacting any upstream.
    Status(u16),
    /// The request was consumed elsewhere; write nothing.
    Return,
    /// Drop the connection silently.
    Reset,
    /// Reply with the 1x1 GIF.
    Adblock,
    /// 302 to this URL.
    Url(String),
    /// Force this upstream candidate list, in order.
    Parents(Vec<Arc<ParentProxy>>),
}

pub trait ProxyResolver: Send + Sync {
    /// Rewrite/block decision for a request; `None` means proceed.
    fn redirect(&self, req: &RequestSummary) -> Option<RedirectAction>;

    /// Ordered upstream candidates for a request. Already-failed parents are
    /// excluded by the caller popping from the front; the list is computed
    /// once per request.
    fn get_proxy(
        &self,
        url: &str,
        host: &str,
        port: u16,
        method: &str,
        ip: Option<IpAddr>,
        level: u8,
    ) -> Vec<Arc<ParentProxy>>;

    /// Per-request outcome feedback.
    fn notify(
        &self,
        method: &str,
        url: &str,
        host: &str,
        success: bool,
        failed_parents: &[String],
        current_parent: &str,
        rtime: Option<Duration>,
    );

    /// Whether a 301/302 Location is a poisoned redirect.
    fn bad302(&self, location: &str) -> bool;
}
