//! Per-client keep-alive pool for upstream connections.
//!
//! Keyed by `(client, destination)` on purpose: a client's consecutive
//! requests to one destination ride the same upstream, which matters for
//! identity-sensitive services behind differing parents.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use tracing::debug;

use crate::connector::{RemoteConn, RemoteStream};

/// `(client address, destination host:port)`.
pub type PoolKey = (SocketAddr, String);

pub struct PooledConn {
    pub stream: RemoteStream,
    /// Bytes read past the previous response, carried across requests.
    pub read_buf: BytesMut,
    /// Parent name, tagged `(pooled)`.
    pub parent_name: String,
}

/// Shared across all connection tasks; `take`/`put` are lock-free per key.
#[derive(Clone)]
pub struct ConnPool {
    pools: Arc<DashMap<PoolKey, Vec<PooledConn>>>,
    depth: usize,
}

impl ConnPool {
    pub fn new(depth: usize) -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
            depth: depth.max(1),
        }
    }

    /// Pop the most recent healthy entry for `key`.
    pub fn take(&self, key: &PoolKey) -> Option<PooledConn> {
        let mut entry = self.pools.get_mut(key)?;
        while let Some(conn) = entry.pop() {
            if conn.stream.is_connection_dropped() {
                debug!(
                    target: "fwlite::pool",
                    dest = %key.1,
                    parent = %conn.parent_name,
                    "dropping dead pooled connection"
                );
                continue;
            }
            debug!(
                target: "fwlite::pool",
                dest = %key.1,
                parent = %conn.parent_name,
                "reusing pooled connection"
            );
            return Some(conn);
        }
        None
    }

    /// Return a connection after a clean round-trip. Past the depth cap the
    /// oldest entry is closed.
    pub fn put(&self, key: PoolKey, conn: RemoteConn, parent_name: &str) {
        let parent_name = if parent_name.ends_with("(pooled)") {
            parent_name.to_string()
        } else {
            format!("{parent_name}(pooled)")
        };
        let mut entry = self.pools.entry(key).or_default();
        entry.push(PooledConn {
            stream: conn.stream,
            read_buf: conn.read_buf,
            parent_name,
        });
        if entry.len() > self.depth {
            entry.remove(0);
        }
    }
}
