//! Per-request engine state.
//!
//! Holds the replay buffer (client bytes that can be re-sent to a different
//! upstream), the response staging buffer (upstream bytes that can still be
//! un-sent), the `retryable` latch, and the per-attempt timeouts. One value
//! per request; the worker builds a fresh one each time.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use fwlite_http::wire::{self, WireError};
use fwlite_policy::ParentProxy;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::debug;

use crate::{ProxyEnv, RETRY_CEILING};

/// Failure site of one forward attempt. Client failures end the connection;
/// upstream failures feed the retry loop.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("client i/o: {0}")]
    Client(std::io::Error),
    #[error("upstream: {0}")]
    Upstream(anyhow::Error),
}

impl AttemptError {
    pub fn upstream(e: impl Into<anyhow::Error>) -> Self {
        Self::Upstream(e.into())
    }
}

fn client_wire_error(e: WireError) -> AttemptError {
    match e {
        WireError::Io(io) => AttemptError::Client(io),
        WireError::Timeout => AttemptError::Client(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "client read timed out",
        )),
        other => AttemptError::Client(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            other.to_string(),
        )),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TrafficCount {
    /// Bytes read from the client (upload direction).
    pub up: u64,
    /// Bytes written to the client (download direction).
    pub down: u64,
}

pub struct ProxySession {
    pub client_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub level: u8,

    pub retryable: bool,
    rbuffer: Vec<Bytes>,
    rbuffer_size: usize,
    wbuffer: Vec<Bytes>,
    wbuffer_size: usize,
    /// Whether any response byte reached the client.
    pub committed: bool,

    /// Whether the request body has been uploaded in full; a retry then
    /// replays the buffer without reading the client again.
    pub body_done: bool,

    pub failed_parents: Vec<String>,
    pub proxylist: Option<Vec<Arc<ParentProxy>>>,
    pub pproxy: Option<Arc<ParentProxy>>,
    pub ppname: String,
    pub attempts: u32,

    pub traffic: TrafficCount,
    pub ctimeout: Duration,
    pub rtimeout: Duration,
}

impl ProxySession {
    pub fn new(client_addr: SocketAddr, local_addr: SocketAddr, level: u8, base: Duration) -> Self {
        Self {
            client_addr,
            local_addr,
            level,
            retryable: true,
            rbuffer: Vec::new(),
            rbuffer_size: 0,
            wbuffer: Vec::new(),
            wbuffer_size: 0,
            committed: false,
            body_done: false,
            failed_parents: Vec::new(),
            proxylist: None,
            pproxy: None,
            ppname: String::new(),
            attempts: 0,
            traffic: TrafficCount::default(),
            ctimeout: base,
            rtimeout: base,
        }
    }

    /// Pop the next upstream candidate, consulting the policy engine on the
    /// first call. `None` means the list is exhausted.
    pub fn getparent(
        &mut self,
        env: &ProxyEnv,
        url: &str,
        host: &str,
        port: u16,
        method: &str,
        ip: Option<IpAddr>,
    ) -> Option<Arc<ParentProxy>> {
        let list = self.proxylist.get_or_insert_with(|| {
            let list = env.resolver.get_proxy(url, host, port, method, ip, self.level);
            debug!(
                target: "fwlite::proxy",
                candidates = ?list.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
                "upstream candidates"
            );
            list
        });
        if list.is_empty() {
            self.ppname.clear();
            self.pproxy = None;
            return None;
        }
        let parent = list.remove(0);
        self.ppname = parent.name.clone();
        self.pproxy = Some(parent.clone());
        Some(parent)
    }

    /// Per-attempt timeouts: base for `direct`, exponential otherwise,
    /// pinned at 10 s when this is the last candidate.
    pub fn set_timeout(&mut self, base: Duration) {
        let remaining = self.proxylist.as_ref().is_some_and(|l| !l.is_empty());
        let secs = if remaining {
            if self.ppname == "direct" {
                base.as_secs()
            } else {
                (2u64.saturating_pow(self.failed_parents.len() as u32) + base.as_secs() - 1).min(10)
            }
        } else {
            10
        };
        self.ctimeout = Duration::from_secs(secs);
        self.rtimeout = Duration::from_secs(secs);
    }

    // ----- replay buffer -----------------------------------------------

    /// Record client bytes for replay. Crossing the ceiling releases the
    /// buffer and latches the request non-retryable.
    pub fn record_replay(&mut self, data: &Bytes) {
        if !self.retryable {
            return;
        }
        self.rbuffer_size += data.len();
        self.rbuffer.push(data.clone());
        if self.rbuffer_size > RETRY_CEILING {
            debug!(target: "fwlite::proxy", size = self.rbuffer_size, "replay ceiling crossed");
            self.retryable = false;
            self.rbuffer.clear();
            self.rbuffer_size = 0;
        }
    }

    pub fn replay_bytes(&self) -> Vec<u8> {
        self.rbuffer.concat()
    }

    pub fn replay_len(&self) -> usize {
        self.rbuffer_size
    }

    pub fn clear_replay(&mut self) {
        self.rbuffer.clear();
        self.rbuffer_size = 0;
    }

    // ----- staging buffer ----------------------------------------------

    /// Stage response bytes while retry is still possible; write through
    /// once it is not. Crossing the ceiling flushes, latches non-retryable,
    /// and pins the upstream read timeout to 10 s.
    pub async fn stage_response(
        &mut self,
        client: &mut TcpStream,
        data: Bytes,
    ) -> Result<(), AttemptError> {
        if self.retryable {
            self.wbuffer_size += data.len();
            self.wbuffer.push(data);
            if self.wbuffer_size > RETRY_CEILING {
                self.retryable = false;
                self.rtimeout = Duration::from_secs(10);
                self.flush_staged(client).await?;
            }
            Ok(())
        } else {
            self.flush_staged(client).await?;
            self.write_client(client, &data).await
        }
    }

    /// Close the retry window and flush everything staged.
    pub async fn commit_response(&mut self, client: &mut TcpStream) -> Result<(), AttemptError> {
        self.retryable = false;
        self.flush_staged(client).await
    }

    /// Discard staged bytes at the start of a retry attempt.
    pub fn reset_staging(&mut self) {
        self.wbuffer.clear();
        self.wbuffer_size = 0;
    }

    async fn flush_staged(&mut self, client: &mut TcpStream) -> Result<(), AttemptError> {
        if self.wbuffer.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.wbuffer).concat();
        self.wbuffer_size = 0;
        self.write_client(client, &staged).await
    }

    /// Direct client write; permanently closes the retry window.
    pub async fn write_client(
        &mut self,
        client: &mut TcpStream,
        data: &[u8],
    ) -> Result<(), AttemptError> {
        self.retryable = false;
        if data.is_empty() {
            return Ok(());
        }
        self.committed = true;
        self.traffic.down += data.len() as u64;
        client.write_all(data).await.map_err(AttemptError::Client)
    }

    // ----- client reads ------------------------------------------------

    pub async fn client_read_some(
        &mut self,
        client: &mut TcpStream,
        buf: &mut BytesMut,
        max: usize,
    ) -> Result<Bytes, AttemptError> {
        let data = wire::read_some(client, buf, max, self.rtimeout)
            .await
            .map_err(client_wire_error)?;
        self.traffic.up += data.len() as u64;
        Ok(data)
    }

    pub async fn client_read_line(
        &mut self,
        client: &mut TcpStream,
        buf: &mut BytesMut,
    ) -> Result<Bytes, AttemptError> {
        let line = wire::read_line(client, buf, self.rtimeout)
            .await
            .map_err(client_wire_error)?;
        self.traffic.up += line.len() as u64;
        Ok(Bytes::from(line))
    }

    pub async fn client_read_exact(
        &mut self,
        client: &mut TcpStream,
        buf: &mut BytesMut,
        n: usize,
    ) -> Result<Bytes, AttemptError> {
        let data = wire::read_exact(client, buf, n, self.rtimeout)
            .await
            .map_err(client_wire_error)?;
        self.traffic.up += data.len() as u64;
        Ok(data)
    }
}
