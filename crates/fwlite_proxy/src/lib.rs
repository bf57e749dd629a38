//! Per-connection proxy engines.
//!
//! The request engine parses nothing itself; it receives one parsed request
//! from the worker, consults the policy engine, then forwards through the
//! selected upstream with transparent retry. The CONNECT engine peeks the
//! first client bytes to refine the destination (plain HTTP on :80 is
//! re-dispatched; TLS ClientHellos yield an SNI) and then tunnels.

pub mod connector;
pub mod pool;
pub mod request;
pub mod session;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fwlite_http::Headers;
use fwlite_policy::{DnsResolver, ProxyResolver};

pub use pool::ConnPool;
pub use session::ProxySession;

/// Everything the engines share across connections.
pub struct ProxyEnv {
    pub resolver: Arc<dyn ProxyResolver>,
    pub dns: Arc<DnsResolver>,
    pub pool: ConnPool,
    /// Base connect/read timeout; per-attempt back-off grows from here.
    pub base_timeout: Duration,
    pub x_forwarded_for: bool,
    pub remote_api: bool,
    /// Ports owned by this instance, for the self-address check.
    pub listen_ports: std::ops::Range<u16>,
    /// PAC body served at `/pac` when configured.
    pub pac_body: Option<String>,
}

/// One parsed inbound request, handed over by the worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

/// What the worker should do after an engine ran.
#[derive(Debug)]
pub enum Verdict {
    /// Response handled; close the connection if `close`.
    Done { close: bool },
    /// Self-addressed request: dispatch to the local admin API.
    Api { req: Request, client_addr: SocketAddr },
}

/// Bytes of a single request's replay or staging buffer before the request
/// becomes non-retryable.
pub const RETRY_CEILING: usize = 100 * 1024;

/// Safety stop for the forward loop.
pub const MAX_ATTEMPTS: u32 = 10;
