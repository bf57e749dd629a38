//! The CONNECT engine.
//!
//! Replies 200 before any upstream work so the client starts talking, then
//! peeks the first bytes: plain HTTP on :80 is re-dispatched to the request
//! engine, a TLS ClientHello refines the destination host from its SNI.
//! Everything else is opaque. The tunnel itself runs in two stages: a
//! retryable window that ends with the first upstream byte, then a plain
//! bidirectional pump with half-close semantics.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use fwlite_http::url::parse_hostport;
use fwlite_http::wire::{self, WireError};
use fwlite_http::{BUFSIZE, responses, tls};
use fwlite_policy::{RedirectAction, RequestSummary};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connector::{RemoteConn, create_connection};
use crate::request::handle_request;
use crate::session::{AttemptError, ProxySession};
use crate::{ProxyEnv, Request, Verdict};

/// Established-tunnel idle limit.
const FORWARD_IDLE: Duration = Duration::from_secs(60);
/// Timeout for the peek reads before the tunnel exists.
const PEEK_TIMEOUT: Duration = Duration::from_secs(60);

enum Stage0End {
    Timeout,
    ClientClosed,
    RemoteClosed,
    Error,
}

impl Stage0End {
    fn reason(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ClientClosed => "client closed",
            Self::RemoteClosed => "remote closed",
            Self::Error => "i/o error",
        }
    }
}

pub async fn handle_connect(
    client: &mut TcpStream,
    client_buf: &mut BytesMut,
    session: &mut ProxySession,
    env: &ProxyEnv,
    req: Request,
) -> anyhow::Result<Verdict> {
    let mut target = req.target.clone();

    // Let the client start its handshake before any upstream exists.
    client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;

    let peeked = match wire::read_some(client, client_buf, 4, PEEK_TIMEOUT).await {
        Ok(data) => data,
        Err(WireError::Timeout) => Bytes::new(),
        Err(e) => return Err(e.into()),
    };
    session.traffic.up += peeked.len() as u64;

    if target.ends_with(":80") && (peeked.as_ref() == b"GET " || peeked.as_ref() == b"POST") {
        // Plain HTTP inside CONNECT: reassemble the request and hand it to
        // the request engine.
        let rest = wire::read_line(client, client_buf, PEEK_TIMEOUT).await?;
        session.traffic.up += rest.len() as u64;
        let mut request_line = peeked.to_vec();
        request_line.extend_from_slice(&rest);
        let Ok(line) = wire::parse_request_line(&request_line) else {
            return Ok(Verdict::Done { close: true });
        };
        let (_, headers) = match wire::read_header_block(client, client_buf, PEEK_TIMEOUT).await {
            Ok(parsed) => parsed,
            Err(_) => return Ok(Verdict::Done { close: true }),
        };
        if headers.content_length().is_err() {
            warn!(target: "fwlite::proxy", "ambiguous content length inside connect");
            responses::send_error(client, 400, None).await?;
            return Ok(Verdict::Done { close: true });
        }
        let inner = Request {
            method: line.method,
            target: line.target,
            version: line.version,
            headers,
        };
        return handle_request(client, client_buf, session, env, inner).await;
    }

    let mut early = peeked.to_vec();
    if peeked.starts_with(&[0x16, 0x03]) {
        // TLS handshake: pull the rest of the ClientHello and look for an
        // SNI that disagrees with the CONNECT target.
        if let Ok(more) = wire::read_some(client, client_buf, BUFSIZE, PEEK_TIMEOUT).await {
            session.traffic.up += more.len() as u64;
            early.extend_from_slice(&more);
        }
        if let Some(name) = tls::extract_server_name(&early) {
            debug!(target: "fwlite::proxy", sni = %name, %target, "client hello parsed");
            if !target.contains(&name) {
                let (_, port) = parse_hostport(&target, 443);
                target = format!("{name}:{port}");
            }
        }
    }

    if !early.is_empty() {
        session.record_replay(&Bytes::from(early));
    }

    let (host, port) = parse_hostport(&target, 443);

    match env.resolver.redirect(&RequestSummary {
        method: req.method.clone(),
        url: target.clone(),
        host: host.clone(),
        port,
    }) {
        None | Some(RedirectAction::Url(_)) => {}
        Some(action) => {
            // Every control outcome means the tunnel is silently dropped.
            info!(
                target: "fwlite::proxy",
                %target,
                action = ?action,
                client = session.client_addr.port(),
                "connect blocked"
            );
            return Ok(Verdict::Done { close: true });
        }
    }

    let rip = env.dns.get_ip_address(&host).await;
    if let Some(ip) = rip {
        if ip.is_loopback() {
            if session.client_addr.ip().is_loopback() {
                // A tunnel back into our own listeners would loop; drop it.
                // Other local services are fair destinations.
                if env.listen_ports.contains(&port) {
                    return Ok(Verdict::Done { close: true });
                }
            } else {
                return Ok(Verdict::Done { close: true });
            }
        }
    }

    connect_loop(client, client_buf, session, env, &target, &host, port, rip).await
}

#[allow(clippy::too_many_arguments)]
async fn connect_loop(
    client: &mut TcpStream,
    client_buf: &mut BytesMut,
    session: &mut ProxySession,
    env: &ProxyEnv,
    target: &str,
    host: &str,
    port: u16,
    rip: Option<std::net::IpAddr>,
) -> anyhow::Result<Verdict> {
    let mut retrying = false;
    loop {
        if retrying {
            session.failed_parents.push(session.ppname.clone());
            if let Some(parent) = &session.pproxy {
                parent.log_latency(host, 10.0);
            }
        }
        retrying = true;

        if !session.retryable {
            env.resolver.notify(
                "CONNECT",
                target,
                host,
                false,
                &session.failed_parents,
                &session.ppname,
                None,
            );
            return Ok(Verdict::Done { close: true });
        }
        let Some(parent) = session.getparent(env, target, host, port, "CONNECT", rip) else {
            env.resolver.notify(
                "CONNECT",
                target,
                host,
                false,
                &session.failed_parents,
                &session.ppname,
                None,
            );
            return Ok(Verdict::Done { close: true });
        };

        let mut iplist = None;
        if session.ppname == "direct" && session.failed_parents.is_empty() {
            if let Some(list) = env.dns.iplist(host) {
                if let Some(pl) = session.proxylist.as_mut() {
                    pl.insert(0, parent.clone());
                }
                iplist = Some(list);
            }
        }
        session.set_timeout(env.base_timeout);

        info!(
            target: "fwlite::worker",
            %target,
            parent = %session.ppname,
            client = session.client_addr.port(),
            "connect"
        );
        let mut remote =
            match create_connection(host, port, &parent, session.ctimeout, iplist, true).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(
                        target: "fwlite::proxy",
                        %target,
                        parent = %session.ppname,
                        error = %e,
                        "connect failed"
                    );
                    continue;
                }
            };

        let mut timelog = Instant::now();
        let replay = session.replay_bytes();
        if !replay.is_empty() {
            debug!(target: "fwlite::proxy", bytes = replay.len(), "replaying early bytes");
            if remote.stream.write_all(&replay).await.is_err() {
                continue;
            }
        }

        // Stage 0: keep the retry window open until the upstream answers.
        let mut rtime = Duration::ZERO;
        let mut end = Stage0End::Error;
        let stage0_timeout = env.base_timeout * 2;
        let mut cbuf = [0u8; BUFSIZE];
        let mut rbuf = [0u8; BUFSIZE];
        while session.retryable {
            // Handshake over-reads and pipelined client bytes come first.
            if !remote.read_buf.is_empty() {
                let data = remote.read_buf.split().freeze();
                rtime = timelog.elapsed();
                session.write_client(client, &data).await?;
                continue;
            }
            if !client_buf.is_empty() {
                let data = client_buf.split().freeze();
                session.traffic.up += data.len() as u64;
                if remote.stream.write_all(&data).await.is_err() {
                    break;
                }
                session.record_replay(&data);
                timelog = Instant::now();
                continue;
            }

            enum Evt {
                Client(std::io::Result<usize>),
                Remote(std::io::Result<usize>),
            }
            let evt = timeout(stage0_timeout, async {
                tokio::select! {
                    r = client.read(&mut cbuf) => Evt::Client(r),
                    r = remote.stream.read(&mut rbuf) => Evt::Remote(r),
                }
            })
            .await;
            match evt {
                Err(_) => {
                    end = Stage0End::Timeout;
                    break;
                }
                Ok(Evt::Client(Ok(0))) => {
                    end = Stage0End::ClientClosed;
                    let _ = remote.stream.shutdown_write().await;
                    break;
                }
                Ok(Evt::Client(Ok(n))) => {
                    session.traffic.up += n as u64;
                    let data = Bytes::copy_from_slice(&cbuf[..n]);
                    if remote.stream.write_all(&data).await.is_err() {
                        break;
                    }
                    session.record_replay(&data);
                    timelog = Instant::now();
                }
                Ok(Evt::Client(Err(e))) => {
                    warn!(target: "fwlite::proxy", %target, error = %e, "client error in stage 0");
                    break;
                }
                Ok(Evt::Remote(Ok(0))) => {
                    end = Stage0End::RemoteClosed;
                    break;
                }
                Ok(Evt::Remote(Ok(n))) => {
                    rtime = timelog.elapsed();
                    let data = Bytes::copy_from_slice(&rbuf[..n]);
                    // Closes the retry window and ends stage 0.
                    session.write_client(client, &data).await?;
                }
                Ok(Evt::Remote(Err(_))) => {
                    end = Stage0End::Error;
                    break;
                }
            }
        }

        if session.retryable {
            // Stage 0 ended without a single upstream byte.
            if matches!(end, Stage0End::ClientClosed) {
                warn!(
                    target: "fwlite::proxy",
                    %target,
                    parent = %session.ppname,
                    "tunnel ended in stage 0: client closed"
                );
                env.resolver.notify(
                    "CONNECT",
                    target,
                    host,
                    true,
                    &session.failed_parents,
                    &session.ppname,
                    Some(rtime),
                );
                return Ok(Verdict::Done { close: true });
            }
            warn!(
                target: "fwlite::proxy",
                %target,
                parent = %session.ppname,
                reason = end.reason(),
                "tunnel failed in stage 0; retrying"
            );
            continue;
        }

        // Forwarding: the upstream answered, replay is no longer possible.
        session.clear_replay();
        env.resolver.notify(
            "CONNECT",
            target,
            host,
            true,
            &session.failed_parents,
            &session.ppname,
            Some(rtime),
        );
        if let Some(parent) = &session.pproxy {
            parent.log_latency(host, rtime.as_secs_f64());
        }
        debug!(
            target: "fwlite::proxy",
            %target,
            rtime = ?rtime,
            "tunnel established; forwarding"
        );
        let _ = forward_pump(client, client_buf, session, &mut remote, FORWARD_IDLE).await;
        debug!(
            target: "fwlite::worker",
            %target,
            up = session.traffic.up,
            down = session.traffic.down,
            "tunnel finished"
        );
        return Ok(Verdict::Done { close: true });
    }
}

/// Bidirectional byte pump with half-close semantics: EOF on one side shuts
/// the other side's write half exactly once; the pump ends when both sides
/// hit EOF or nothing moves for `idle`.
pub(crate) async fn forward_pump(
    client: &mut TcpStream,
    client_buf: &mut BytesMut,
    session: &mut ProxySession,
    remote: &mut RemoteConn,
    idle: Duration,
) -> Result<(), AttemptError> {
    if !client_buf.is_empty() {
        let data = client_buf.split();
        session.traffic.up += data.len() as u64;
        remote
            .stream
            .write_all(&data)
            .await
            .map_err(AttemptError::upstream)?;
    }
    if !remote.read_buf.is_empty() {
        let data = remote.read_buf.split().freeze();
        session.write_client(client, &data).await?;
    }

    let mut cbuf = [0u8; BUFSIZE];
    let mut rbuf = [0u8; BUFSIZE];
    let mut client_eof = false;
    let mut remote_eof = false;
    while !(client_eof && remote_eof) {
        enum Evt {
            Client(std::io::Result<usize>),
            Remote(std::io::Result<usize>),
        }
        let evt = timeout(idle, async {
            tokio::select! {
                r = client.read(&mut cbuf), if !client_eof => Evt::Client(r),
                r = remote.stream.read(&mut rbuf), if !remote_eof => Evt::Remote(r),
            }
        })
        .await;
        match evt {
            Err(_) => {
                debug!(target: "fwlite::proxy", "tcp forwarding timed out");
                break;
            }
            Ok(Evt::Client(Ok(0))) => {
                client_eof = true;
                let _ = remote.stream.shutdown_write().await;
            }
            Ok(Evt::Client(Ok(n))) => {
                session.traffic.up += n as u64;
                if remote.stream.write_all(&cbuf[..n]).await.is_err() {
                    break;
                }
            }
            Ok(Evt::Client(Err(e))) => return Err(AttemptError::Client(e)),
            Ok(Evt::Remote(Ok(0))) => {
                remote_eof = true;
                let _ = client.shutdown().await;
            }
            Ok(Evt::Remote(Ok(n))) => {
                session.write_client(client, &rbuf[..n]).await?;
            }
            Ok(Evt::Remote(Err(_))) => {
                remote_eof = true;
                let _ = client.shutdown().await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
