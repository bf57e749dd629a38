//! Per-connection HTTP/1.1 handler.
//!
//! Reads one request at a time, dispatches CONNECT to the tunnel engine and
//! everything else to the request engine, and keeps the connection alive
//! until either side negotiates a close or an error surfaces.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fwlite_http::responses;
use fwlite_http::wire::{self, WireError};
use fwlite_policy::RuleResolver;
use fwlite_proxy::{ProxyEnv, ProxySession, Request, Verdict, request, tunnel};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

mod api;

pub struct WorkerCtx {
    pub env: Arc<ProxyEnv>,
    pub resolver: Arc<RuleResolver>,
    /// Idle limit between requests on a keep-alive connection.
    pub keepalive_timeout: Duration,
}

/// Entry point for one accepted connection; requests run strictly in order.
pub async fn handle_connection(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    level: u8,
    ctx: Arc<WorkerCtx>,
) -> anyhow::Result<()> {
    let local_addr = stream.local_addr()?;
    let mut buf = BytesMut::new();

    loop {
        let line = match wire::read_request_line(&mut stream, &mut buf, ctx.keepalive_timeout).await
        {
            Ok(line) => line,
            Err(WireError::PeerClosed | WireError::Timeout | WireError::Io(_)) => break,
            Err(e) => {
                debug!(target: "fwlite::worker", error = %e, "unreadable request line");
                responses::send_error(&mut stream, 400, None).await.ok();
                break;
            }
        };
        let headers = match wire::read_header_block(&mut stream, &mut buf, ctx.keepalive_timeout)
            .await
        {
            Ok((_, headers)) => headers,
            Err(WireError::PeerClosed | WireError::Timeout | WireError::Io(_)) => break,
            Err(e) => {
                warn!(target: "fwlite::worker", error = %e, "bad header block");
                responses::send_error(&mut stream, 400, None).await.ok();
                break;
            }
        };
        if headers.content_length().is_err() {
            warn!(target: "fwlite::worker", "ambiguous content length");
            responses::send_error(&mut stream, 400, None).await.ok();
            break;
        }

        debug!(
            target: "fwlite::worker",
            method = %line.method,
            target = %line.target,
            "request parsed"
        );

        let req = Request {
            method: line.method,
            target: line.target,
            version: line.version,
            headers,
        };
        let mut session =
            ProxySession::new(client_addr, local_addr, level, ctx.env.base_timeout);

        let verdict = if req.method.eq_ignore_ascii_case("CONNECT") {
            tunnel::handle_connect(&mut stream, &mut buf, &mut session, &ctx.env, req).await
        } else {
            request::handle_request(&mut stream, &mut buf, &mut session, &ctx.env, req).await
        };

        match verdict {
            Ok(Verdict::Done { close }) => {
                if close {
                    break;
                }
            }
            Ok(Verdict::Api { req, client_addr }) => {
                info!(
                    target: "fwlite::api",
                    method = %req.method,
                    target = %req.target,
                    client = %client_addr,
                    "admin api request"
                );
                match api::handle_api(&mut stream, &mut buf, &ctx, req).await {
                    Ok(false) => {}
                    Ok(true) => break,
                    Err(e) => {
                        debug!(target: "fwlite::api", error = ?e, "api request failed");
                        break;
                    }
                }
            }
            Err(e) => {
                debug!(
                    target: "fwlite::worker",
                    error = ?e,
                    "request ended the connection"
                );
                break;
            }
        }
    }

    debug!(target: "fwlite::worker", client = %client_addr, "connection finished");
    Ok(())
}
