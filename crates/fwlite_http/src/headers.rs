//! Case-insensitive, order-preserving, multi-valued header map.

use crate::wire::WireError;

#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

fn is_token_char(c: u8) -> bool {
    matches!(c,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
            | b'^' | b'_' | b'`' | b'|' | b'~'
            | b'0'..=b'9'
            | b'a'..=b'z'
            | b'A'..=b'Z')
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw header block (terminating empty line optional).
    /// Folded continuation lines append to the previous value.
    pub fn parse(block: &[u8]) -> Result<Self, WireError> {
        let mut entries: Vec<(String, String)> = Vec::new();
        for raw_line in block.split(|&b| b == b'\n') {
            let line = match raw_line.last() {
                Some(b'\r') => &raw_line[..raw_line.len() - 1],
                _ => raw_line,
            };
            if line.is_empty() {
                continue;
            }
            if line[0] == b' ' || line[0] == b'\t' {
                let cont = std::str::from_utf8(line)
                    .map_err(|_| WireError::MalformedHeader)?
                    .trim();
                match entries.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(cont);
                    }
                    None => return Err(WireError::MalformedHeader),
                }
                continue;
            }
            let sep = line
                .iter()
                .position(|&b| b == b':')
                .ok_or(WireError::MalformedHeader)?;
            let (name, rest) = line.split_at(sep);
            if name.is_empty() || !name.iter().all(|&b| is_token_char(b)) {
                return Err(WireError::MalformedHeader);
            }
            let value = &rest[1..];
            if value.iter().any(|&b| b < 0x20 && b != b'\t') {
                return Err(WireError::MalformedHeader);
            }
            let name = std::str::from_utf8(name).map_err(|_| WireError::MalformedHeader)?;
            let value = String::from_utf8_lossy(value).trim().to_string();
            entries.push((name.to_string(), value));
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace the first occurrence (keeping its position) and drop the rest.
    pub fn set(&mut self, name: &str, value: &str) {
        let mut replaced = false;
        self.entries.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if replaced {
                    return false;
                }
                replaced = true;
                *v = value.to_string();
            }
            true
        });
        if !replaced {
            self.entries.push((name.to_string(), value.to_string()));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn append(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Coalesced Content-Length. Duplicate and comma-joined values are
    /// accepted only when they all agree.
    pub fn content_length(&self) -> Result<Option<usize>, WireError> {
        let mut value: Option<usize> = None;
        for raw in self.get_all("content-length") {
            for part in raw.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let len = part
                    .parse::<usize>()
                    .map_err(|_| WireError::AmbiguousLength)?;
                match value {
                    Some(prev) if prev != len => return Err(WireError::AmbiguousLength),
                    _ => value = Some(len),
                }
            }
        }
        Ok(value)
    }

    /// A transfer coding other than `identity` means chunked framing.
    pub fn is_chunked(&self) -> bool {
        match self.get("transfer-encoding") {
            Some(te) => !te.eq_ignore_ascii_case("identity"),
            None => false,
        }
    }

    pub fn connection_tokens(&self) -> Vec<String> {
        self.get_all("connection")
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Serialize in `Capitalized-Words` form, one `Name: value\r\n` per entry.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.entries {
            out.push_str(&capitalize_name(name));
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out
    }
}

fn capitalize_name(name: &str) -> String {
    name.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::Headers;
    use crate::wire::WireError;

    #[test]
    fn parse_preserves_order_and_multi_values() {
        let block = b"Host: a\r\nX-One: 1\r\nx-one: 2\r\n\r\n";
        let headers = Headers::parse(block).unwrap();
        assert_eq!(headers.get("host"), Some("a"));
        let all: Vec<_> = headers.get_all("x-one").collect();
        assert_eq!(all, vec!["1", "2"]);
    }

    #[test]
    fn parse_rejects_bad_name_chars() {
        let err = Headers::parse(b"Bad Header: x\r\n\r\n").unwrap_err();
        assert!(matches!(err, WireError::MalformedHeader));
    }

    #[test]
    fn content_length_coalesces_equal_duplicates() {
        let headers = Headers::parse(b"Content-Length: 5\r\nContent-Length: 5\r\n").unwrap();
        assert_eq!(headers.content_length().unwrap(), Some(5));
    }

    #[test]
    fn content_length_rejects_conflicts() {
        let headers = Headers::parse(b"Content-Length: 5, 6\r\n").unwrap();
        assert!(matches!(
            headers.content_length().unwrap_err(),
            WireError::AmbiguousLength
        ));
    }

    #[test]
    fn set_replaces_in_place() {
        let mut headers = Headers::parse(b"A: 1\r\nConnection: close\r\nB: 2\r\n").unwrap();
        headers.set("connection", "keep_alive");
        let serialized = headers.serialize();
        assert_eq!(serialized, "A: 1\r\nConnection: keep_alive\r\nB: 2\r\n");
    }

    #[test]
    fn serialize_capitalizes_names() {
        let mut headers = Headers::new();
        headers.append("x-forwarded-for", "10.0.0.1");
        assert_eq!(headers.serialize(), "X-Forwarded-For: 10.0.0.1\r\n");
    }

    #[test]
    fn identity_transfer_encoding_is_not_chunked() {
        let headers = Headers::parse(b"Transfer-Encoding: identity\r\n").unwrap();
        assert!(!headers.is_chunked());
        let headers = Headers::parse(b"Transfer-Encoding: chunked\r\n").unwrap();
        assert!(headers.is_chunked());
    }

    #[test]
    fn folded_continuation_lines_join() {
        let headers = Headers::parse(b"X-Long: part1\r\n  part2\r\n").unwrap();
        assert_eq!(headers.get("x-long"), Some("part1 part2"));
    }
}
