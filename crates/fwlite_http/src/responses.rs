//! Canned responses written directly to the client.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::SERVER_TOKEN;

/// 1x1 transparent GIF returned for ad-blocked requests.
pub const FAKE_GIF: &[u8] = b"GIF89a\x01\x00\x01\x00\x80\x00\x00\x00\x00\x00\xff\xff\xff!\xf9\x04\x01\x00\x00\x00\x00,\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x01D\x00;";

pub fn status_reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "???",
    }
}

/// Write a small response with an optional content type.
/// The body is skipped for HEAD requests and bodyless status codes.
pub async fn write_simple<W>(
    stream: &mut W,
    code: u16,
    body: &[u8],
    ctype: Option<&str>,
    head_only: bool,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut response = format!(
        "HTTP/1.1 {} {}\r\nServer: {}\r\n",
        code,
        status_reason(code),
        SERVER_TOKEN
    );
    if let Some(ctype) = ctype {
        response.push_str(&format!("Content-Type: {ctype}\r\n"));
    }
    // The legacy keep_alive token, kept for client compatibility.
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: keep_alive\r\n\r\n",
        body.len()
    ));
    stream.write_all(response.as_bytes()).await?;
    if !head_only && code >= 200 && !matches!(code, 204 | 304) {
        stream.write_all(body).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Send an error reply with the stock HTML explanation page.
pub async fn send_error<W>(stream: &mut W, code: u16, message: Option<&str>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let reason = status_reason(code);
    let message = message.unwrap_or(reason);
    let content = format!(
        "<head>\n<title>Error response</title>\n</head>\n<body>\n<h1>Error response</h1>\n\
         <p>Error code {code}.\n<p>Message: {}.\n</body>\n",
        quote_html(message)
    );
    write_simple(stream, code, content.as_bytes(), Some("text/html"), false).await
}

/// Send a 302 redirect.
pub async fn send_redirect<W>(stream: &mut W, location: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let response = format!(
        "HTTP/1.1 302 Found\r\n\
         Server: {SERVER_TOKEN}\r\n\
         Location: {location}\r\n\
         Content-Length: 0\r\n\
         Connection: keep_alive\r\n\
         \r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn quote_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::{FAKE_GIF, send_error, write_simple};

    #[test]
    fn fake_gif_is_the_expected_payload() {
        assert_eq!(FAKE_GIF.len(), 43);
        assert!(FAKE_GIF.starts_with(b"GIF89a"));
    }

    #[tokio::test]
    async fn write_simple_sets_length_and_gif_type() {
        let mut out = Vec::new();
        write_simple(&mut out, 200, FAKE_GIF, Some("image/gif"), false)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: image/gif\r\n"));
        assert!(text.contains("Content-Length: 43\r\n"));
        assert!(out.ends_with(FAKE_GIF));
    }

    #[tokio::test]
    async fn send_error_escapes_message() {
        let mut out = Vec::new();
        send_error(&mut out, 400, Some("<bad>")).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("&lt;bad&gt;"));
        assert!(text.contains("HTTP/1.1 400 Bad Request"));
    }
}
