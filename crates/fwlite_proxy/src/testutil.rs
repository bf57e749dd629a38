//! Shared fixtures for the engine tests: a scriptable policy resolver and a
//! connected client/worker socket pair.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fwlite_policy::{
    DnsResolver, ParentProxy, ProxyResolver, RedirectAction, RequestSummary,
};
use tokio::net::{TcpListener, TcpStream};

use crate::{ConnPool, ProxyEnv, ProxySession};

#[derive(Default)]
pub(crate) struct StubResolver {
    pub candidates: Mutex<Vec<Arc<ParentProxy>>>,
    pub redirect_action: Option<RedirectAction>,
    pub bad302_prefix: Option<String>,
    /// `(current parent, success, failed parent count)` per notify call.
    pub notifications: Mutex<Vec<(String, bool, usize)>>,
}

impl StubResolver {
    pub fn with_candidates(candidates: Vec<Arc<ParentProxy>>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            ..Self::default()
        }
    }
}

impl ProxyResolver for StubResolver {
    fn redirect(&self, _req: &RequestSummary) -> Option<RedirectAction> {
        self.redirect_action.clone()
    }

    fn get_proxy(
        &self,
        _url: &str,
        _host: &str,
        _port: u16,
        _method: &str,
        _ip: Option<IpAddr>,
        _level: u8,
    ) -> Vec<Arc<ParentProxy>> {
        self.candidates.lock().unwrap().clone()
    }

    fn notify(
        &self,
        _method: &str,
        _url: &str,
        _host: &str,
        success: bool,
        failed_parents: &[String],
        current_parent: &str,
        _rtime: Option<Duration>,
    ) {
        self.notifications.lock().unwrap().push((
            current_parent.to_string(),
            success,
            failed_parents.len(),
        ));
    }

    fn bad302(&self, location: &str) -> bool {
        self.bad302_prefix
            .as_deref()
            .is_some_and(|prefix| location.starts_with(prefix))
    }
}

pub(crate) fn test_env(resolver: Arc<StubResolver>) -> ProxyEnv {
    ProxyEnv {
        resolver,
        dns: Arc::new(DnsResolver::new(&HashMap::new())),
        pool: ConnPool::new(4),
        base_timeout: Duration::from_secs(1),
        x_forwarded_for: false,
        remote_api: false,
        // A range no ephemeral destination port lands in.
        listen_ports: 1..2,
        pac_body: None,
    }
}

/// A connected (browser, worker) socket pair plus a session for the worker
/// side.
pub(crate) async fn client_pair() -> (TcpStream, TcpStream, ProxySession) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let browser = TcpStream::connect(listener.local_addr().unwrap())
        .await
        .unwrap();
    let (worker_side, peer) = listener.accept().await.unwrap();
    let session = ProxySession::new(
        peer,
        worker_side.local_addr().unwrap(),
        1,
        Duration::from_secs(1),
    );
    (browser, worker_side, session)
}

/// An origin that answers each accepted connection with a canned response
/// after the request head (and `body_bytes` body bytes) arrive, then holds
/// the socket open so it can be pooled.
pub(crate) async fn canned_origin(
    response: &'static [u8],
    body_bytes: usize,
) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut tmp = [0u8; 4096];
        // Request head.
        while !received.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = sock.read(&mut tmp).await.unwrap();
            assert!(n > 0, "client closed before the request head was done");
            received.extend_from_slice(&tmp[..n]);
        }
        let head_end = received
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        while received.len() < head_end + body_bytes {
            let n = sock.read(&mut tmp).await.unwrap();
            assert!(n > 0, "client closed before the body was done");
            received.extend_from_slice(&tmp[..n]);
        }
        sock.write_all(response).await.unwrap();
        // Hold the socket open until the peer lets go.
        let _ = sock.read(&mut tmp).await;
        received
    });
    (addr, handle)
}
