//! The request engine.
//!
//! Normalizes one parsed inbound request, consults the policy engine, then
//! runs the forward loop: pick an upstream, stream the request (teeing
//! client bytes into the replay buffer), stream the response back through
//! the staging buffer, and retry through alternative upstreams while the
//! retry window is still open.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use fwlite_http::url::{SplitUrl, parse_hostport};
use fwlite_http::wire::{self, StatusLine};
use fwlite_http::{BUFSIZE, responses};
use fwlite_policy::{RedirectAction, RequestSummary, Scheme};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::connector::{RemoteConn, create_connection, proxy_authorization};
use crate::session::{AttemptError, ProxySession};
use crate::tunnel::forward_pump;
use crate::{MAX_ATTEMPTS, ProxyEnv, RETRY_CEILING, Request, Verdict};

/// Default keep-alive decision from the request line and headers.
/// HTTP/1.0 keep-alive uses the standard hyphenated token here; the legacy
/// underscore comparison only applies once forwarding starts.
pub fn default_close(req: &Request) -> bool {
    let tokens = req.headers.connection_tokens();
    if req.version.as_str() >= "HTTP/1.1" {
        tokens.iter().any(|t| t == "close")
    } else {
        !tokens.iter().any(|t| t == "keep-alive")
    }
}

/// Handle one non-CONNECT request end to end.
pub async fn handle_request(
    client: &mut TcpStream,
    client_buf: &mut BytesMut,
    session: &mut ProxySession,
    env: &ProxyEnv,
    mut req: Request,
) -> anyhow::Result<Verdict> {
    let mut close = default_close(&req);

    if req.target.to_ascii_lowercase().starts_with("ftp://") {
        responses::send_error(client, 400, None).await?;
        return Ok(Verdict::Done { close });
    }

    // PAC for clients addressing us directly in origin-form.
    if req.target == "/pac" {
        if let Some(pac) = &env.pac_body {
            let local_ip = session.local_addr.ip().to_string();
            if req
                .headers
                .get("host")
                .is_some_and(|h| h.starts_with(&local_ip))
            {
                responses::write_simple(
                    client,
                    200,
                    pac.as_bytes(),
                    Some("application/x-ns-proxy-autoconfig"),
                    req.method == "HEAD",
                )
                .await?;
                return Ok(Verdict::Done { close });
            }
        }
    }

    // Transparent-proxy mode: rebuild an absolute URL from Host.
    if req.target.starts_with('/') {
        let Some(host) = req.headers.get("host") else {
            responses::send_error(client, 403, None).await?;
            return Ok(Verdict::Done { close });
        };
        req.target = format!("http://{}{}", host, req.target);
    }

    // Observed client bug: doubled-up scheme.
    if let Some(fixed) = req.target.strip_prefix("http://http://") {
        req.target = format!("http://{fixed}");
    }

    let Some(url) = SplitUrl::parse(&req.target) else {
        responses::send_error(client, 400, None).await?;
        return Ok(Verdict::Done { close });
    };
    let shortpath = url.short();

    let (netloc_host, netloc_port) = url.hostport(80);
    let (host, port) = match req.headers.get("host") {
        Some(value) => {
            if !value.starts_with(&netloc_host) {
                warn!(
                    target: "fwlite::proxy",
                    url = %shortpath,
                    host = %value,
                    "host header and request target disagree"
                );
            }
            parse_hostport(value, 80)
        }
        None => {
            warn!(target: "fwlite::proxy", url = %shortpath, "no host header");
            (netloc_host, netloc_port)
        }
    };

    match env.resolver.redirect(&RequestSummary {
        method: req.method.clone(),
        url: req.target.clone(),
        host: host.clone(),
        port,
    }) {
        None => {}
        Some(RedirectAction::Status(code)) => {
            responses::send_error(client, code, None).await?;
            return Ok(Verdict::Done { close });
        }
        Some(RedirectAction::Return) => {
            info!(target: "fwlite::proxy", method = %req.method, url = %shortpath, "return");
            return Ok(Verdict::Done { close });
        }
        Some(RedirectAction::Reset) => {
            info!(target: "fwlite::proxy", method = %req.method, url = %shortpath, "reset");
            return Ok(Verdict::Done { close: true });
        }
        Some(RedirectAction::Adblock) => {
            info!(target: "fwlite::proxy", method = %req.method, url = %shortpath, "adblock");
            responses::write_simple(
                client,
                200,
                responses::FAKE_GIF,
                Some("image/gif"),
                req.method == "HEAD",
            )
            .await?;
            return Ok(Verdict::Done { close });
        }
        Some(RedirectAction::Url(new_url)) => {
            info!(target: "fwlite::proxy", url = %shortpath, to = %new_url, "redirect");
            responses::send_redirect(client, &new_url).await?;
            return Ok(Verdict::Done { close });
        }
        Some(RedirectAction::Parents(list)) => {
            session.proxylist = Some(list);
        }
    }

    let rip = env.dns.get_ip_address(&host).await;

    // Requests addressed to ourselves are served locally or refused; they
    // are never forwarded.
    if let Some(ip) = rip {
        if ip.is_loopback() {
            if session.client_addr.ip().is_loopback() {
                if env.listen_ports.contains(&port) {
                    return Ok(Verdict::Api {
                        req,
                        client_addr: session.client_addr,
                    });
                }
            } else {
                responses::send_error(client, 403, None).await?;
                return Ok(Verdict::Done { close });
            }
        } else if ip == session.local_addr.ip() && env.listen_ports.contains(&port) {
            if env.remote_api {
                return Ok(Verdict::Api {
                    req,
                    client_addr: session.client_addr,
                });
            }
            responses::send_error(client, 403, None).await?;
            return Ok(Verdict::Done { close });
        }
    }

    if env.x_forwarded_for {
        let mut ips: Vec<String> = req
            .headers
            .get_all("x-forwarded-for")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if !session.client_addr.ip().is_loopback() {
            ips.push(session.client_addr.ip().to_string());
        }
        req.headers.set("X-Forwarded-For", &ips.join(", "));
    }

    req.headers.remove("proxy-connection");
    req.headers.remove("proxy-authenticate");

    // Keep-alive renegotiation before forwarding. The underscore token is
    // the deployed behavior for HTTP/1.0 peers; kept as observed.
    let conntype = req
        .headers
        .get("connection")
        .unwrap_or("")
        .to_ascii_lowercase();
    close = if req.version.as_str() >= "HTTP/1.1" {
        conntype.contains("close")
    } else {
        conntype.contains("keep_alive")
    };
    if let Some(upgrade) = req.headers.get("upgrade") {
        warn!(target: "fwlite::proxy", upgrade = %upgrade, url = %shortpath, "upgrade requested");
        close = true;
        session.retryable = false;
    } else {
        req.headers.set("Connection", "keep_alive");
    }

    forward_loop(client, client_buf, session, env, &req, &url, &shortpath, host, port, rip, close)
        .await
}

struct AttemptOutcome {
    status: u16,
    rtime: Duration,
    remote_close: bool,
    close: bool,
    /// The attempt ended in a raw byte pump; the upstream is spent.
    pumped: bool,
}

#[allow(clippy::too_many_arguments)]
async fn forward_loop(
    client: &mut TcpStream,
    client_buf: &mut BytesMut,
    session: &mut ProxySession,
    env: &ProxyEnv,
    req: &Request,
    url: &SplitUrl,
    shortpath: &str,
    host: String,
    port: u16,
    rip: Option<std::net::IpAddr>,
    close: bool,
) -> anyhow::Result<Verdict> {
    let pool_key = (session.client_addr, format!("{host}:{port}"));
    let mut retrying = false;

    loop {
        if retrying {
            session.failed_parents.push(session.ppname.clone());
            session.attempts += 1;
            if session.attempts > MAX_ATTEMPTS {
                error!(
                    target: "fwlite::proxy",
                    url = %shortpath,
                    attempts = session.attempts,
                    "retry count exceeded the safety stop"
                );
                return Ok(Verdict::Done { close: true });
            }
            if !session.retryable {
                env.resolver.notify(
                    &req.method,
                    shortpath,
                    &host,
                    false,
                    &session.failed_parents,
                    &session.ppname,
                    None,
                );
                if !session.committed {
                    responses::send_error(client, 504, None).await?;
                }
                return Ok(Verdict::Done { close: true });
            }
        }
        retrying = true;

        let Some(parent) = session.getparent(env, &req.target, &host, port, &req.method, rip)
        else {
            env.resolver.notify(
                &req.method,
                shortpath,
                &host,
                false,
                &session.failed_parents,
                &session.ppname,
                None,
            );
            responses::send_error(client, 504, None).await?;
            return Ok(Verdict::Done { close: true });
        };

        // Resolver override addresses apply to the first direct attempt; the
        // candidate is requeued so a later attempt can resolve normally.
        let mut iplist = None;
        if session.ppname == "direct" && session.failed_parents.is_empty() {
            if let Some(list) = env.dns.iplist(&host) {
                if let Some(pl) = session.proxylist.as_mut() {
                    pl.insert(0, parent.clone());
                }
                iplist = Some(list);
            }
        }
        session.set_timeout(env.base_timeout);

        // A clean request may ride a pooled upstream; any failure this
        // request means a fresh socket.
        let mut pooled = None;
        if session.failed_parents.is_empty() {
            if let Some(conn) = env.pool.take(&pool_key) {
                if let Some(pl) = session.proxylist.as_mut() {
                    pl.insert(0, parent.clone());
                }
                session.ppname = conn.parent_name.clone();
                pooled = Some(RemoteConn {
                    stream: conn.stream,
                    read_buf: conn.read_buf,
                });
            }
        }
        info!(
            target: "fwlite::worker",
            method = %req.method,
            url = %shortpath,
            parent = %session.ppname,
            client = session.client_addr.port(),
            "forwarding"
        );
        let mut remote = match pooled {
            Some(conn) => conn,
            None => {
                match create_connection(&host, port, &parent, session.ctimeout, iplist, false).await
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(
                            target: "fwlite::proxy",
                            method = %req.method,
                            url = %shortpath,
                            parent = %session.ppname,
                            error = %e,
                            "connect failed"
                        );
                        parent.log_latency(&host, 10.0);
                        continue;
                    }
                }
            }
        };

        match forward_attempt(client, client_buf, session, env, req, url, &mut remote).await {
            Ok(outcome) => {
                env.resolver.notify(
                    &req.method,
                    shortpath,
                    &host,
                    outcome.status < 400,
                    &session.failed_parents,
                    &session.ppname,
                    Some(outcome.rtime),
                );
                if let Some(parent) = &session.pproxy {
                    parent.log_latency(&host, outcome.rtime.as_secs_f64());
                }
                if !outcome.pumped
                    && !outcome.remote_close
                    && !remote.stream.is_connection_dropped()
                {
                    env.pool.put(pool_key, remote, &session.ppname);
                }
                debug!(
                    target: "fwlite::worker",
                    up = session.traffic.up,
                    down = session.traffic.down,
                    "request finished"
                );
                return Ok(Verdict::Done {
                    close: close || outcome.close,
                });
            }
            Err(AttemptError::Client(e)) => {
                debug!(
                    target: "fwlite::proxy",
                    url = %shortpath,
                    error = %e,
                    "client side failed; closing connection"
                );
                return Err(e.into());
            }
            Err(AttemptError::Upstream(e)) => {
                warn!(
                    target: "fwlite::proxy",
                    method = %req.method,
                    url = %shortpath,
                    parent = %session.ppname,
                    error = %e,
                    "upstream attempt failed"
                );
                if let Some(parent) = &session.pproxy {
                    parent.log_latency(&host, 10.0);
                }
                continue;
            }
        }
    }
}

async fn forward_attempt(
    client: &mut TcpStream,
    client_buf: &mut BytesMut,
    session: &mut ProxySession,
    env: &ProxyEnv,
    req: &Request,
    url: &SplitUrl,
    remote: &mut RemoteConn,
) -> Result<AttemptOutcome, AttemptError> {
    session.reset_staging();

    // Absolute-form through http(s) parents, origin-form everywhere else.
    let via_http_parent = session
        .pproxy
        .as_ref()
        .is_some_and(|p| matches!(p.scheme, Scheme::Http | Scheme::Https));
    let mut head = String::new();
    if via_http_parent {
        head.push_str(&format!("{} {} {}\r\n", req.method, req.target, req.version));
        if let Some(auth) = session.pproxy.as_ref().and_then(|p| proxy_authorization(p)) {
            head.push_str(&format!("Proxy-Authorization: Basic {auth}\r\n"));
        }
    } else {
        head.push_str(&format!("{} {} {}\r\n", req.method, url.path, req.version));
    }
    head.push_str(&req.headers.serialize());
    head.push_str("\r\n");
    remote
        .stream
        .write_all(head.as_bytes())
        .await
        .map_err(AttemptError::upstream)?;
    session.traffic.up += head.len() as u64;

    // An Expect header gets a preliminary answer before the body goes up.
    // Any status other than 100 skips the upload entirely.
    let mut pending_status: Option<StatusLine> = None;
    if req.headers.contains("expect") {
        match wire::read_status_line(&mut remote.stream, &mut remote.read_buf, session.rtimeout)
            .await
        {
            Err(e) => {
                warn!(target: "fwlite::proxy", error = %e, "no usable answer to Expect");
            }
            Ok(status) if status.status == 100 => {
                let (raw, _) = wire::read_header_block(
                    &mut remote.stream,
                    &mut remote.read_buf,
                    session.rtimeout,
                )
                .await
                .map_err(AttemptError::upstream)?;
                let mut relay = status.raw.clone();
                relay.extend_from_slice(&raw);
                session.write_client(client, &relay).await?;
            }
            Ok(status) => {
                pending_status = Some(status);
            }
        }
    }

    let mut started = Instant::now();
    let mut status = match pending_status {
        Some(status) => status,
        None => {
            if req.headers.is_chunked() {
                send_chunked_body(client, client_buf, session, remote).await?;
            } else if let Some(len) = req.headers.content_length().unwrap_or(None) {
                if len > 0 {
                    send_sized_body(client, client_buf, session, remote, len).await?;
                }
            }
            started = Instant::now();
            wire::read_status_line(&mut remote.stream, &mut remote.read_buf, session.rtimeout)
                .await
                .map_err(AttemptError::upstream)?
        }
    };
    let rtime = started.elapsed();

    // Relay and skip any further interim responses.
    while status.status == 100 {
        let (raw, _) =
            wire::read_header_block(&mut remote.stream, &mut remote.read_buf, session.rtimeout)
                .await
                .map_err(AttemptError::upstream)?;
        let mut relay = status.raw.clone();
        relay.extend_from_slice(&raw);
        session.write_client(client, &relay).await?;
        status = wire::read_status_line(&mut remote.stream, &mut remote.read_buf, session.rtimeout)
            .await
            .map_err(AttemptError::upstream)?;
    }

    let (raw_headers, resp_headers) =
        wire::read_header_block(&mut remote.stream, &mut remote.read_buf, session.rtimeout)
            .await
            .map_err(AttemptError::upstream)?;

    let conntype = resp_headers
        .get("connection")
        .unwrap_or("")
        .to_ascii_lowercase();
    let mut remote_close = if status.version.as_str() >= "HTTP/1.1" {
        conntype.contains("close")
    } else {
        conntype.contains("keep_alive")
    };
    let mut close = false;
    if resp_headers.contains("upgrade") {
        close = true;
        remote_close = true;
    }
    let content_length = resp_headers
        .content_length()
        .map_err(AttemptError::upstream)?;

    if matches!(status.status, 301 | 302) {
        if let Some(location) = resp_headers.get("location") {
            if env.resolver.bad302(location) {
                return Err(AttemptError::upstream(anyhow::anyhow!(
                    "poisoned redirect to {location}"
                )));
            }
        }
    }

    session
        .stage_response(client, Bytes::from(status.raw.clone()))
        .await?;
    session
        .stage_response(client, Bytes::from(raw_headers))
        .await?;

    let mut pumped = false;
    let no_body = req.method.eq_ignore_ascii_case("HEAD")
        || matches!(status.status, 204 | 205 | 304);
    if no_body {
        // headers only
    } else if resp_headers.is_chunked() {
        relay_chunked_response(client, session, remote).await?;
    } else if let Some(len) = content_length {
        let mut remaining = len;
        while remaining > 0 {
            let data = wire::read_some(
                &mut remote.stream,
                &mut remote.read_buf,
                BUFSIZE.min(remaining),
                session.rtimeout,
            )
            .await
            .map_err(AttemptError::upstream)?;
            if data.is_empty() {
                return Err(AttemptError::upstream(anyhow::anyhow!(
                    "remote closed with {remaining} body bytes outstanding"
                )));
            }
            remaining -= data.len();
            session.stage_response(client, data).await?;
        }
    } else {
        // No framing at all: a protocol upgrade. Pump raw bytes until EOF.
        close = true;
        remote_close = true;
        pumped = true;
        session.commit_response(client).await?;
        forward_pump(client, client_buf, session, remote, Duration::from_secs(60)).await?;
    }

    session.commit_response(client).await?;
    Ok(AttemptOutcome {
        status: status.status,
        rtime,
        remote_close,
        close,
        pumped,
    })
}

/// Forward a chunked upload chunk-for-chunk, teeing into the replay buffer.
/// The engine never re-chunks; framing bytes go upstream verbatim.
async fn send_chunked_body(
    client: &mut TcpStream,
    client_buf: &mut BytesMut,
    session: &mut ProxySession,
    remote: &mut RemoteConn,
) -> Result<(), AttemptError> {
    let replay = session.replay_bytes();
    if !replay.is_empty() {
        remote
            .stream
            .write_all(&replay)
            .await
            .map_err(AttemptError::upstream)?;
        if session.body_done {
            return Ok(());
        }
    }
    loop {
        let line = session.client_read_line(client, client_buf).await?;
        session.record_replay(&line);
        remote
            .stream
            .write_all(&line)
            .await
            .map_err(AttemptError::upstream)?;
        let size = wire::parse_chunk_size(&line).map_err(|e| {
            AttemptError::Client(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;
        if size == 0 {
            // Trailers, then the terminating empty line.
            loop {
                let trailer = session.client_read_line(client, client_buf).await?;
                session.record_replay(&trailer);
                remote
                    .stream
                    .write_all(&trailer)
                    .await
                    .map_err(AttemptError::upstream)?;
                if trailer.as_ref() == b"\r\n" || trailer.as_ref() == b"\n" {
                    session.body_done = true;
                    return Ok(());
                }
            }
        }
        // Chunk payload plus its trailing CRLF.
        let mut remaining = size + 2;
        while remaining > 0 {
            let data = session
                .client_read_some(client, client_buf, BUFSIZE.min(remaining))
                .await?;
            if data.is_empty() {
                return Err(AttemptError::Client(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client closed mid-chunk",
                )));
            }
            remaining -= data.len();
            session.record_replay(&data);
            remote
                .stream
                .write_all(&data)
                .await
                .map_err(AttemptError::upstream)?;
        }
    }
}

async fn send_sized_body(
    client: &mut TcpStream,
    client_buf: &mut BytesMut,
    session: &mut ProxySession,
    remote: &mut RemoteConn,
    len: usize,
) -> Result<(), AttemptError> {
    if len > RETRY_CEILING {
        session.retryable = false;
        session.clear_replay();
    }
    let replay = session.replay_bytes();
    let mut remaining = len;
    if !replay.is_empty() {
        remaining = remaining.saturating_sub(replay.len());
        remote
            .stream
            .write_all(&replay)
            .await
            .map_err(AttemptError::upstream)?;
    }
    while remaining > 0 {
        let data = session
            .client_read_some(client, client_buf, BUFSIZE.min(remaining))
            .await?;
        if data.is_empty() {
            break;
        }
        remaining -= data.len();
        session.record_replay(&data);
        remote
            .stream
            .write_all(&data)
            .await
            .map_err(AttemptError::upstream)?;
    }
    session.body_done = true;
    Ok(())
}

async fn relay_chunked_response(
    client: &mut TcpStream,
    session: &mut ProxySession,
    remote: &mut RemoteConn,
) -> Result<(), AttemptError> {
    loop {
        let line = wire::read_line(&mut remote.stream, &mut remote.read_buf, session.rtimeout)
            .await
            .map_err(AttemptError::upstream)?;
        session
            .stage_response(client, Bytes::from(line.clone()))
            .await?;
        let size = wire::parse_chunk_size(&line).map_err(AttemptError::upstream)?;
        if size == 0 {
            // Trailers, then the terminating empty line.
            loop {
                let trailer =
                    wire::read_line(&mut remote.stream, &mut remote.read_buf, session.rtimeout)
                        .await
                        .map_err(AttemptError::upstream)?;
                session
                    .stage_response(client, Bytes::from(trailer.clone()))
                    .await?;
                if trailer == b"\r\n" || trailer == b"\n" {
                    return Ok(());
                }
            }
        }
        let mut remaining = size + 2;
        while remaining > 0 {
            let data = wire::read_some(
                &mut remote.stream,
                &mut remote.read_buf,
                BUFSIZE.min(remaining),
                session.rtimeout,
            )
            .await
            .map_err(AttemptError::upstream)?;
            if data.is_empty() {
                return Err(AttemptError::upstream(anyhow::anyhow!(
                    "remote closed mid-chunk"
                )));
            }
            remaining -= data.len();
            session.stage_response(client, data).await?;
        }
    }
}
