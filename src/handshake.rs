use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use http::header::ORIGIN;
use http::HeaderMap;

use crate::transport::Connection;

/// Immutable snapshot of the request that opened a socket.
///
/// Captured once at socket construction and read-only afterwards. The query
/// merges the connection URL's query string with the query carried on the
/// namespace connection request, the latter winning on conflicts.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub headers: HeaderMap,
    pub issued: SystemTime,
    pub address: Option<SocketAddr>,
    /// Request carried an `Origin` header (cross-origin client).
    pub xdomain: bool,
    pub secure: bool,
    pub url: String,
    pub query: HashMap<String, String>,
}

impl Handshake {
    pub(crate) fn new(conn: &dyn Connection, ns_query: HashMap<String, String>) -> Self {
        let parts = conn.req_parts();
        let uri = &parts.uri;

        let mut query = parse_query(uri.query().unwrap_or(""));
        query.extend(ns_query);

        Self {
            headers: parts.headers.clone(),
            issued: SystemTime::now(),
            address: conn.remote_addr(),
            xdomain: parts.headers.contains_key(ORIGIN),
            secure: matches!(uri.scheme_str(), Some("https" | "wss")),
            url: uri
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| uri.path().to_string()),
            query,
        }
    }
}

/// Split a raw query string into its key/value pairs. Keys without a value
/// map to the empty string.
pub(crate) fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
