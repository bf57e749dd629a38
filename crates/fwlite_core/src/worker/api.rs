//! Local admin API, served when a request addresses the proxy itself.
//!
//! JSON over the same HTTP engine. Path-embedded identifiers are URL-safe
//! base64; bodies cap at 100 KiB.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE as B64;
use bytes::BytesMut;
use fwlite_http::responses::{send_error, write_simple};
use fwlite_http::url::{SplitUrl, parse_hostport};
use fwlite_http::wire;
use fwlite_policy::ParentProxy;
use fwlite_proxy::{Request, request::default_close};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::WorkerCtx;

const MAX_BODY: usize = 100 * 1024;

/// Serve one admin request. Returns whether the connection should close.
pub(super) async fn handle_api(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    ctx: &WorkerCtx,
    req: Request,
) -> anyhow::Result<bool> {
    let close = default_close(&req);

    // The engine hands us the absolute form it normalized.
    let (path, query) = match SplitUrl::parse(&req.target) {
        Some(url) => split_query(&url.path),
        None => split_query(&req.target),
    };

    let content_length = req.headers.content_length().unwrap_or(None).unwrap_or(0);
    if content_length > MAX_BODY {
        return Ok(true);
    }
    let body = if content_length > 0 {
        wire::read_exact(stream, buf, content_length, ctx.keepalive_timeout)
            .await?
            .to_vec()
    } else {
        Vec::new()
    };

    let resolver = &ctx.resolver;
    let method = req.method.as_str();
    match (path.as_str(), method) {
        ("/", "GET") => {
            write_simple(stream, 200, b"Hello World !", Some("text/html"), false).await?;
        }
        ("/api/localrule", "GET") => {
            let rules = resolver.local_rules();
            write_json(stream, 200, &json!(rules)).await?;
        }
        ("/api/localrule", "POST") => {
            // a json encoded tuple: (rule, expire-seconds or null)
            let Ok((rule, exp)) = serde_json::from_slice::<(String, Option<u64>)>(&body) else {
                return send_404(stream, close).await;
            };
            match resolver.add_temp(&rule, exp) {
                Ok(()) => write_json(stream, 201, &json!(null)).await?,
                Err(msg) => write_json(stream, 400, &json!(msg)).await?,
            }
        }
        (_, "DELETE") if path.starts_with("/api/localrule/") => {
            let encoded = &path["/api/localrule/".len()..];
            let rule = match B64.decode(encoded).map(String::from_utf8) {
                Ok(Ok(rule)) => rule,
                _ => return send_404(stream, close).await,
            };
            match resolver.remove_local(&rule) {
                Some(expire) => write_json(stream, 200, &json!([rule, expire])).await?,
                None => return send_404(stream, close).await,
            }
        }
        ("/api/redirector", "GET") => {
            let rules: Vec<_> = resolver
                .redirect_rules()
                .into_iter()
                .enumerate()
                .map(|(i, (rule, dest))| json!([i, rule, dest]))
                .collect();
            write_json(stream, 200, &json!(rules)).await?;
        }
        ("/api/redirector", "POST") => {
            let Ok((rule, dest)) = serde_json::from_slice::<(String, String)>(&body) else {
                return send_404(stream, close).await;
            };
            resolver.add_redirect(&rule, &dest);
            write_json(stream, 200, &json!(null)).await?;
        }
        (_, "DELETE") if path.starts_with("/api/redirector/") => {
            let Ok(index) = path["/api/redirector/".len()..].parse::<usize>() else {
                return send_404(stream, close).await;
            };
            // The caller may pin the rule it expects at that index.
            if let Some(expected) = query_param(&query, "rule") {
                let matches = B64
                    .decode(expected.as_bytes())
                    .ok()
                    .and_then(|raw| String::from_utf8(raw).ok())
                    .zip(resolver.redirect_rules().get(index).cloned())
                    .is_some_and(|(expected, (rule, _))| expected == rule);
                if !matches {
                    return send_404(stream, close).await;
                }
            }
            match resolver.remove_redirect(index) {
                Some((rule, dest)) => write_json(stream, 200, &json!([index, rule, dest])).await?,
                None => return send_404(stream, close).await,
            }
        }
        ("/api/parent", "GET") => {
            let mut parents: Vec<_> = resolver
                .parents()
                .sorted()
                .iter()
                .map(|p| (p.name.clone(), p.address(), p.priority))
                .collect();
            parents.sort_by_key(|(_, _, priority)| *priority);
            write_json(stream, 200, &json!(parents)).await?;
        }
        ("/api/parent", "POST") => {
            let Ok((name, proxy)) = serde_json::from_slice::<(String, String)>(&body) else {
                return send_404(stream, close).await;
            };
            match ParentProxy::parse(&name, &proxy) {
                Ok(parent) => {
                    resolver.parents().add(Arc::new(parent));
                    write_json(stream, 200, &json!(null)).await?;
                }
                Err(e) => write_json(stream, 400, &json!(e.to_string())).await?,
            }
        }
        (_, "DELETE") if path.starts_with("/api/parent/") => {
            let name = &path["/api/parent/".len()..];
            match resolver.parents().remove(name) {
                Some(_) => write_json(stream, 200, &json!(name)).await?,
                None => return send_404(stream, close).await,
            }
        }
        ("/api/gfwlist", "GET") => {
            write_json(stream, 200, &json!(resolver.gfwlist_enabled())).await?;
        }
        ("/api/gfwlist", "POST") => {
            let Ok(enabled) = serde_json::from_slice::<bool>(&body) else {
                return send_404(stream, close).await;
            };
            resolver.set_gfwlist(enabled);
            write_json(stream, 200, &json!(null)).await?;
        }
        ("/api/autoupdate", "GET") => {
            write_json(stream, 200, &json!(resolver.autoupdate_enabled())).await?;
        }
        ("/api/autoupdate", "POST") => {
            let Ok(enabled) = serde_json::from_slice::<bool>(&body) else {
                return send_404(stream, close).await;
            };
            resolver.set_autoupdate(enabled);
            write_json(stream, 200, &json!(null)).await?;
        }
        ("/api/remotedns", "POST") => {
            // a json encoded tuple: (host, dns server)
            let Ok((host, server)) = serde_json::from_slice::<(String, String)>(&body) else {
                return send_404(stream, close).await;
            };
            match resolve_remote(&host, &server, ctx.env.base_timeout).await {
                Ok(ips) => write_json(stream, 200, &json!(ips)).await?,
                Err(e) => write_json(stream, 200, &json!(e.to_string())).await?,
            }
        }
        _ => return send_404(stream, close).await,
    }

    Ok(close)
}

async fn send_404(stream: &mut TcpStream, close: bool) -> anyhow::Result<bool> {
    send_error(stream, 404, None).await?;
    Ok(close)
}

async fn write_json(
    stream: &mut TcpStream,
    code: u16,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(value)?;
    write_simple(stream, code, &body, Some("application/json"), false).await
}

fn split_query(path: &str) -> (String, String) {
    match path.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (path.to_string(), String::new()),
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Resolve `host` by asking `server` directly, DNS over TCP (A records).
async fn resolve_remote(host: &str, server: &str, timeout: Duration) -> anyhow::Result<Vec<String>> {
    let (server_host, server_port) = parse_hostport(server, 53);

    let mut query = Vec::new();
    query.extend_from_slice(&0x1420u16.to_be_bytes()); // id
    query.extend_from_slice(&0x0100u16.to_be_bytes()); // recursion desired
    query.extend_from_slice(&1u16.to_be_bytes()); // one question
    query.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            anyhow::bail!("invalid host name '{host}'");
        }
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&1u16.to_be_bytes()); // A
    query.extend_from_slice(&1u16.to_be_bytes()); // IN

    let mut stream = tokio::time::timeout(
        timeout,
        TcpStream::connect((server_host.as_str(), server_port)),
    )
    .await
    .map_err(|_| anyhow::anyhow!("dns connect timeout"))??;

    let mut framed = (query.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(&query);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    tokio::time::timeout(timeout, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| anyhow::anyhow!("dns read timeout"))??;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut response = vec![0u8; len];
    tokio::time::timeout(timeout, stream.read_exact(&mut response))
        .await
        .map_err(|_| anyhow::anyhow!("dns read timeout"))??;

    parse_a_records(&response)
}

fn parse_a_records(msg: &[u8]) -> anyhow::Result<Vec<String>> {
    fn be16(msg: &[u8], at: usize) -> anyhow::Result<usize> {
        let hi = *msg.get(at).ok_or_else(|| anyhow::anyhow!("short dns reply"))?;
        let lo = *msg
            .get(at + 1)
            .ok_or_else(|| anyhow::anyhow!("short dns reply"))?;
        Ok(((hi as usize) << 8) | lo as usize)
    }
    // Walk over a (possibly compressed) name.
    fn skip_name(msg: &[u8], mut pos: usize) -> anyhow::Result<usize> {
        loop {
            let len = *msg
                .get(pos)
                .ok_or_else(|| anyhow::anyhow!("short dns reply"))? as usize;
            if len == 0 {
                return Ok(pos + 1);
            }
            if len & 0xc0 == 0xc0 {
                return Ok(pos + 2);
            }
            pos += 1 + len;
        }
    }

    let qdcount = be16(msg, 4)?;
    let ancount = be16(msg, 6)?;
    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(msg, pos)? + 4;
    }

    let mut ips = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(msg, pos)?;
        let rtype = be16(msg, pos)?;
        let rdlength = be16(msg, pos + 8)?;
        let rdata_start = pos + 10;
        if rtype == 1 && rdlength == 4 {
            let octets = msg
                .get(rdata_start..rdata_start + 4)
                .ok_or_else(|| anyhow::anyhow!("short dns reply"))?;
            ips.push(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]).to_string());
        }
        pos = rdata_start + rdlength;
    }
    debug!(target: "fwlite::api", count = ips.len(), "remote dns answered");
    Ok(ips)
}
