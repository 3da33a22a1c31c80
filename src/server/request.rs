//! Request snapshot and response value.
//!
//! The dispatch layer works on plain data: a [`RequestCx`] built by the
//! HTTP adapter (or a test), and a [`Reply`] the adapter writes back to the
//! wire. Keeping tiny_http types out of dispatch makes every handler
//! testable without a socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An incoming request, decoded once.
#[derive(Debug, Default)]
pub struct RequestCx {
    pub method: String,
    /// Path component, percent-decoded, always starting with `/`.
    pub path: String,
    /// Raw query string without the `?`.
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub remote_addr: Option<SocketAddr>,
    /// Request body for methods that carry one; never read for GET/HEAD.
    pub body: Option<Vec<u8>>,
    /// `{name}` captures, filled in after route lookup.
    pub path_values: Vec<(String, String)>,
}

impl RequestCx {
    pub fn new(method: &str, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, q),
            None => (path_and_query, ""),
        };
        RequestCx {
            method: method.to_string(),
            path: decode_percent(path),
            query: query.to_string(),
            ..Default::default()
        }
    }

    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, for multi-valued headers like
    /// `Accept-Encoding`.
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First query parameter with the given name.
    pub fn query_value(&self, name: &str) -> Option<String> {
        self.query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            if k == name {
                Some(decode_percent(&v.replace('+', " ")))
            } else {
                None
            }
        })
    }

    /// A cookie value from the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.header("cookie")?.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            if k == name {
                Some(v.to_string())
            } else {
                None
            }
        })
    }

    /// Captured path value from the matched route pattern.
    pub fn path_value(&self, name: &str) -> Option<&str> {
        self.path_values
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> &str {
        self.header("host").unwrap_or("")
    }
}

/// Percent-decode a path or query component. Invalid escapes pass through.
pub fn decode_percent(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Response body forms the adapter knows how to write.
#[derive(Debug)]
pub enum ReplyBody {
    Empty,
    Bytes(Vec<u8>),
    /// An open file streamed from an offset, for static and range serving.
    File {
        file: std::fs::File,
        length: u64,
    },
}

/// A complete buffered response.
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ReplyBody,
}

impl Reply {
    pub fn status(status: u16) -> Reply {
        Reply {
            status,
            headers: Vec::new(),
            body: ReplyBody::Empty,
        }
    }

    pub fn text(status: u16, text: &str) -> Reply {
        Reply {
            status,
            headers: vec![(
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: ReplyBody::Bytes(text.as_bytes().to_vec()),
        }
    }

    pub fn internal_error() -> Reply {
        Reply::text(500, "internal server error")
    }

    pub fn not_found() -> Reply {
        Reply::text(404, "404 not found")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Reply {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Joined cancellation signal: the instance lifecycle plus the client
/// connection. Streaming templates poll this between events.
#[derive(Debug, Clone, Default)]
pub struct CancelPair {
    pub instance: Arc<AtomicBool>,
    pub client: Arc<AtomicBool>,
}

impl CancelPair {
    pub fn cancelled(&self) -> bool {
        self.instance.load(Ordering::Relaxed) || self.client.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path_query() {
        let req = RequestCx::new("GET", "/a/b?x=1&y=two");
        assert_eq!(req.path, "/a/b");
        assert_eq!(req.query_value("x").as_deref(), Some("1"));
        assert_eq!(req.query_value("y").as_deref(), Some("two"));
        assert_eq!(req.query_value("z"), None);
    }

    #[test]
    fn test_percent_decoding() {
        let req = RequestCx::new("GET", "/files/a%20b?q=hello%21");
        assert_eq!(req.path, "/files/a b");
        assert_eq!(req.query_value("q").as_deref(), Some("hello!"));
    }

    #[test]
    fn test_headers_case_insensitive() {
        let mut req = RequestCx::new("GET", "/");
        req.headers
            .push(("Accept-Encoding".to_string(), "gzip".to_string()));
        assert_eq!(req.header("accept-encoding"), Some("gzip"));
        assert_eq!(req.header_all("ACCEPT-ENCODING"), vec!["gzip"]);
    }

    #[test]
    fn test_cookie() {
        let mut req = RequestCx::new("GET", "/");
        req.headers
            .push(("Cookie".to_string(), "a=1; session=xyz".to_string()));
        assert_eq!(req.cookie("session").as_deref(), Some("xyz"));
        assert_eq!(req.cookie("missing"), None);
    }

    #[test]
    fn test_cancel_pair() {
        let c = CancelPair::default();
        assert!(!c.cancelled());
        c.client.store(true, Ordering::Relaxed);
        assert!(c.cancelled());
    }
}
