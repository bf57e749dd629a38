use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use fwlite_http::Headers;
use fwlite_policy::{DnsResolver, ParentProxy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::testutil::{StubResolver, canned_origin, client_pair, test_env};
use crate::tunnel::handle_connect;
use crate::{Request, Verdict};

fn connect_request(target: &str) -> Request {
    Request {
        method: "CONNECT".into(),
        target: target.into(),
        version: "HTTP/1.1".into(),
        headers: Headers::new(),
    }
}

/// Minimal ClientHello record carrying one SNI host name.
fn client_hello_with_sni(name: &str) -> Vec<u8> {
    let name = name.as_bytes();
    let sni_list_len = 3 + name.len();
    let ext_len = 2 + sni_list_len;

    let mut ext = Vec::new();
    ext.extend_from_slice(&[0x00, 0x00]);
    ext.extend_from_slice(&(ext_len as u16).to_be_bytes());
    ext.extend_from_slice(&(sni_list_len as u16).to_be_bytes());
    ext.push(0x00);
    ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext.extend_from_slice(name);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

async fn read_established(browser: &mut TcpStream) {
    let mut seen = Vec::new();
    let mut tmp = [0u8; 256];
    while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = browser.read(&mut tmp).await.unwrap();
        assert!(n > 0, "no 200 established before close");
        seen.extend_from_slice(&tmp[..n]);
    }
    assert!(seen.starts_with(b"HTTP/1.1 200 Connection established\r\n"));
}

#[tokio::test]
async fn sni_refines_the_connect_destination() {
    let hello = client_hello_with_sni("real.example.test");
    let hello_len = hello.len();

    // An http parent that expects the rewritten CONNECT target, then the
    // replayed ClientHello, then answers.
    let parent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let parent_addr = parent_listener.local_addr().unwrap();
    let parent_task = tokio::spawn(async move {
        let (mut sock, _) = parent_listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut tmp = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = sock.read(&mut tmp).await.unwrap();
            assert!(n > 0);
            head.extend_from_slice(&tmp[..n]);
        }
        assert!(
            head.starts_with(b"CONNECT real.example.test:443 HTTP/1.1\r\n"),
            "unexpected connect head: {}",
            String::from_utf8_lossy(&head)
        );
        sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();

        let mut replayed = vec![0u8; hello_len];
        sock.read_exact(&mut replayed).await.unwrap();
        sock.write_all(b"SERVERHELLO").await.unwrap();
        let _ = sock.read(&mut tmp).await;
        replayed
    });

    let parent =
        Arc::new(ParentProxy::parse("work", &format!("http://{parent_addr}")).unwrap());
    let resolver = Arc::new(StubResolver::with_candidates(vec![parent]));
    let mut env = test_env(resolver);
    let mut hosts = HashMap::new();
    hosts.insert("real.example.test".to_string(), "203.0.113.5".to_string());
    env.dns = Arc::new(DnsResolver::new(&hosts));

    let (mut browser, mut worker, mut session) = client_pair().await;
    let hello_for_browser = hello.clone();
    let browser_task = tokio::spawn(async move {
        read_established(&mut browser).await;
        browser.write_all(&hello_for_browser).await.unwrap();
        let mut reply = vec![0u8; 11];
        browser.read_exact(&mut reply).await.unwrap();
        reply
    });

    let verdict = handle_connect(
        &mut worker,
        &mut BytesMut::new(),
        &mut session,
        &env,
        connect_request("example.test:443"),
    )
    .await
    .unwrap();
    assert!(matches!(verdict, Verdict::Done { close: true }));

    assert_eq!(browser_task.await.unwrap(), b"SERVERHELLO");
    assert_eq!(parent_task.await.unwrap(), hello);
}

#[tokio::test]
async fn plain_http_on_port_80_is_redispatched() {
    let response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nHI";
    let (origin, origin_task) = canned_origin(response, 0).await;
    let resolver = Arc::new(StubResolver::with_candidates(vec![Arc::new(
        ParentProxy::direct(),
    )]));
    let env = test_env(resolver);
    let (mut browser, mut worker, mut session) = client_pair().await;

    let request_text = format!("GET / HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    let browser_task = tokio::spawn(async move {
        read_established(&mut browser).await;
        browser.write_all(request_text.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        let mut tmp = [0u8; 1024];
        while out.len() < response.len() {
            let n = browser.read(&mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&tmp[..n]);
        }
        out
    });

    let verdict = handle_connect(
        &mut worker,
        &mut BytesMut::new(),
        &mut session,
        &env,
        connect_request("example.test:80"),
    )
    .await
    .unwrap();
    assert!(matches!(verdict, Verdict::Done { close: false }));
    assert_eq!(browser_task.await.unwrap(), response);

    drop(worker);
    let seen = origin_task.await.unwrap();
    assert!(seen.starts_with(b"GET / HTTP/1.1\r\n"));
}

#[tokio::test]
async fn loopback_client_may_tunnel_to_other_local_services() {
    // A local service that is not one of our listeners.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let service = listener.local_addr().unwrap();
    let service_task = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut early = [0u8; 4];
        sock.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"PING");
        sock.write_all(b"PONG").await.unwrap();
        let mut tmp = [0u8; 64];
        let _ = sock.read(&mut tmp).await;
    });

    let resolver = Arc::new(StubResolver::with_candidates(vec![Arc::new(
        ParentProxy::direct(),
    )]));
    let env = test_env(resolver);
    let (mut browser, mut worker, mut session) = client_pair().await;

    let browser_task = tokio::spawn(async move {
        read_established(&mut browser).await;
        browser.write_all(b"PING").await.unwrap();
        let mut reply = vec![0u8; 4];
        browser.read_exact(&mut reply).await.unwrap();
        reply
    });

    let verdict = handle_connect(
        &mut worker,
        &mut BytesMut::new(),
        &mut session,
        &env,
        connect_request(&format!("127.0.0.1:{}", service.port())),
    )
    .await
    .unwrap();
    assert!(matches!(verdict, Verdict::Done { close: true }));
    assert_eq!(browser_task.await.unwrap(), b"PONG");
    service_task.await.unwrap();
}

#[tokio::test]
async fn connect_into_our_own_listener_is_dropped() {
    let resolver = Arc::new(StubResolver::with_candidates(vec![Arc::new(
        ParentProxy::direct(),
    )]));
    let mut env = test_env(resolver.clone());
    let (mut browser, mut worker, mut session) = client_pair().await;

    // The destination port is one of ours.
    let port = session.local_addr.port();
    env.listen_ports = port..port + 1;

    let browser_task = tokio::spawn(async move {
        read_established(&mut browser).await;
        browser.write_all(b"XXXX").await.unwrap();
        let mut tmp = [0u8; 64];
        browser.read(&mut tmp).await.unwrap()
    });

    let verdict = handle_connect(
        &mut worker,
        &mut BytesMut::new(),
        &mut session,
        &env,
        connect_request(&format!("127.0.0.1:{port}")),
    )
    .await
    .unwrap();
    assert!(matches!(verdict, Verdict::Done { close: true }));

    // Silently dropped: no candidates consulted, no bytes tunneled.
    drop(worker);
    assert_eq!(browser_task.await.unwrap(), 0);
    assert!(resolver.notifications.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ambiguous_length_inside_connect_gets_a_400() {
    let resolver = Arc::new(StubResolver::with_candidates(vec![Arc::new(
        ParentProxy::direct(),
    )]));
    let env = test_env(resolver);
    let (mut browser, mut worker, mut session) = client_pair().await;

    let browser_task = tokio::spawn(async move {
        read_established(&mut browser).await;
        browser
            .write_all(
                b"POST /x HTTP/1.1\r\nHost: h.test\r\n\
                  Content-Length: 5\r\nContent-Length: 6\r\n\r\nhello",
            )
            .await
            .unwrap();
        let mut out = Vec::new();
        browser.read_to_end(&mut out).await.unwrap();
        out
    });

    let verdict = handle_connect(
        &mut worker,
        &mut BytesMut::new(),
        &mut session,
        &env,
        connect_request("example.test:80"),
    )
    .await
    .unwrap();
    assert!(matches!(verdict, Verdict::Done { close: true }));

    drop(worker);
    let got = browser_task.await.unwrap();
    assert!(String::from_utf8_lossy(&got).starts_with("HTTP/1.1 400 Bad Request"));
}

#[tokio::test]
async fn stage_zero_failure_retries_the_next_candidate() {
    // First parent accepts the tunnel then closes without a byte.
    let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = dead_listener.accept().await.unwrap();
        let mut tmp = [0u8; 1024];
        let mut head = Vec::new();
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = sock.read(&mut tmp).await.unwrap();
            if n == 0 {
                return;
            }
            head.extend_from_slice(&tmp[..n]);
        }
        sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        // No payload ever; drop once the early bytes land.
        let _ = sock.read(&mut tmp).await;
    });

    // Second parent serves for real.
    let good_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let good_addr = good_listener.local_addr().unwrap();
    let good_task = tokio::spawn(async move {
        let (mut sock, _) = good_listener.accept().await.unwrap();
        let mut tmp = [0u8; 1024];
        let mut head = Vec::new();
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = sock.read(&mut tmp).await.unwrap();
            assert!(n > 0);
            head.extend_from_slice(&tmp[..n]);
        }
        sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        let mut early = vec![0u8; 4];
        sock.read_exact(&mut early).await.unwrap();
        sock.write_all(b"PONG").await.unwrap();
        let _ = sock.read(&mut tmp).await;
        early
    });

    let first = Arc::new(ParentProxy::parse("flaky", &format!("http://{dead_addr}")).unwrap());
    let second = Arc::new(ParentProxy::parse("steady", &format!("http://{good_addr}")).unwrap());
    let resolver = Arc::new(StubResolver::with_candidates(vec![first.clone(), second]));
    let mut env = test_env(resolver.clone());
    let mut hosts = HashMap::new();
    hosts.insert("opaque.test".to_string(), "203.0.113.9".to_string());
    env.dns = Arc::new(DnsResolver::new(&hosts));

    let (mut browser, mut worker, mut session) = client_pair().await;
    let browser_task = tokio::spawn(async move {
        read_established(&mut browser).await;
        browser.write_all(b"PING").await.unwrap();
        let mut reply = vec![0u8; 4];
        browser.read_exact(&mut reply).await.unwrap();
        reply
    });

    let verdict = handle_connect(
        &mut worker,
        &mut BytesMut::new(),
        &mut session,
        &env,
        connect_request("opaque.test:4433"),
    )
    .await
    .unwrap();
    assert!(matches!(verdict, Verdict::Done { close: true }));

    assert_eq!(browser_task.await.unwrap(), b"PONG");
    // The replay buffer delivered the early bytes to the second parent.
    assert_eq!(good_task.await.unwrap(), b"PING");
    assert_eq!(session.failed_parents, vec!["flaky".to_string()]);
    assert_eq!(first.avg_latency("opaque.test"), 10.0);
}
