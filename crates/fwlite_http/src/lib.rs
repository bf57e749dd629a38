//! Low-level HTTP/1.1 wire layer.
//!
//! Framed readers over `(stream, BytesMut)` pairs, a case-insensitive
//! multi-value header map, TLS ClientHello SNI extraction, and canned
//! responses. Pure parsing and formatting; no routing or upstream policy.

pub mod headers;
pub mod responses;
pub mod tls;
pub mod url;
pub mod wire;

pub use headers::Headers;
pub use wire::{RequestLine, StatusLine, WireError};

/// Product token sent in the `Server` header of locally generated responses.
pub const SERVER_TOKEN: &str = concat!("FW-Lite/", env!("CARGO_PKG_VERSION"));

/// Socket read/write granularity used by the engines.
pub const BUFSIZE: usize = 8192;

/// Ceiling for a request or response header block.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
