//! Minimal URL splitting for proxy request targets.
//!
//! Proxy targets are either absolute-form (`http://host:port/path`) or
//! authority-form (`host:port` for CONNECT). Only the pieces the engines
//! need are parsed; the path and query are kept verbatim for relay.

/// Split `host[:port]`, defaulting the port. IPv6 literals may be bracketed.
pub fn parse_hostport(s: &str, default_port: u16) -> (String, u16) {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match s.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) && !port.is_empty() => {
            match port.parse() {
                Ok(port) if !host.contains(':') => (host.to_string(), port),
                _ => (s.to_string(), default_port),
            }
        }
        _ => (s.to_string(), default_port),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitUrl {
    pub scheme: String,
    /// Authority as written, possibly with port and userinfo.
    pub netloc: String,
    /// Path plus query, starting with `/` (defaulted when absent).
    pub path: String,
}

impl SplitUrl {
    pub fn parse(url: &str) -> Option<Self> {
        let (scheme, rest) = url.split_once("://")?;
        if scheme.is_empty() || rest.is_empty() {
            return None;
        }
        let (netloc, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if netloc.is_empty() {
            return None;
        }
        Some(Self {
            scheme: scheme.to_ascii_lowercase(),
            netloc: netloc.to_string(),
            path: path.to_string(),
        })
    }

    pub fn hostport(&self, default_port: u16) -> (String, u16) {
        parse_hostport(&self.netloc, default_port)
    }

    /// Loggable form: scheme://netloc/path without the query string.
    pub fn short(&self) -> String {
        let path = self.path.split('?').next().unwrap_or("/");
        let query_mark = if self.path.contains('?') { "?" } else { "" };
        format!("{}://{}{}{}", self.scheme, self.netloc, path, query_mark)
    }
}

#[cfg(test)]
mod tests {
    use super::{SplitUrl, parse_hostport};

    #[test]
    fn parse_hostport_defaults_port() {
        assert_eq!(parse_hostport("example.test", 80), ("example.test".into(), 80));
        assert_eq!(
            parse_hostport("example.test:8080", 80),
            ("example.test".into(), 8080)
        );
        assert_eq!(parse_hostport("[::1]:443", 80), ("::1".into(), 443));
        assert_eq!(parse_hostport("[::1]", 443), ("::1".into(), 443));
    }

    #[test]
    fn split_url_keeps_query() {
        let url = SplitUrl::parse("http://example.test:8080/a/b?q=1").unwrap();
        assert_eq!(url.scheme, "http");
        assert_eq!(url.netloc, "example.test:8080");
        assert_eq!(url.path, "/a/b?q=1");
        assert_eq!(url.hostport(80), ("example.test".into(), 8080));
        assert_eq!(url.short(), "http://example.test:8080/a/b?");
    }

    #[test]
    fn split_url_defaults_path() {
        let url = SplitUrl::parse("http://example.test").unwrap();
        assert_eq!(url.path, "/");
        assert!(SplitUrl::parse("not a url").is_none());
    }
}
