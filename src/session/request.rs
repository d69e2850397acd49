//! Backend request construction from inbound HTTP requests.

use std::net::SocketAddr;

use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method};
use bytes::Bytes;

use crate::config::schema::FastCgiConfig;
use crate::fastcgi::Params;

/// Connection-level facts the HTTP request itself does not carry.
#[derive(Debug, Clone, Copy)]
pub struct RequestEnv<'a> {
    pub remote_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub fastcgi: &'a FastCgiConfig,
    pub request_id: Option<&'a str>,
}

/// One request as the application will see it.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    method: Method,
    path: String,
    query: String,
    headers: HeaderMap,
    body: Bytes,
    params: Params,
}

impl BackendRequest {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
        params: Params,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            query: query.into(),
            headers,
            body,
            params,
        }
    }

    /// Build the request and its CGI meta-variables.
    pub fn from_parts(parts: &Parts, body: Bytes, env: &RequestEnv<'_>) -> Self {
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().unwrap_or_default().to_string();
        let params = cgi_params(parts, &path, &query, &body, env);
        Self::new(
            parts.method.clone(),
            path,
            query,
            parts.headers.clone(),
            body,
            params,
        )
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn params(&self) -> &Params {
        &self.params
    }
}

/// Split the request path into the script the backend should run and the
/// trailing path info.
fn resolve_script(path: &str, fastcgi: &FastCgiConfig) -> (String, String) {
    if let Some(script) = &fastcgi.script_name {
        return (script.clone(), path.to_string());
    }

    // "/app.php/extra" → script "/app.php", path info "/extra"
    if let Some(idx) = path.find(".php/") {
        let (script, info) = path.split_at(idx + 4);
        return (script.to_string(), info.to_string());
    }

    if path.ends_with('/') {
        return (format!("{}{}", path, fastcgi.index), String::new());
    }
    (path.to_string(), String::new())
}

fn cgi_params(
    parts: &Parts,
    path: &str,
    query: &str,
    body: &Bytes,
    env: &RequestEnv<'_>,
) -> Params {
    let fastcgi = env.fastcgi;
    let (script_name, path_info) = resolve_script(path, fastcgi);
    let document_root = fastcgi.document_root.trim_end_matches('/');

    let request_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.to_string());

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(split_host);
    let (server_name, server_port) = match host {
        Some((name, Some(port))) => (name, port.to_string()),
        Some((name, None)) => (name, env.server_addr.port().to_string()),
        None => (env.server_addr.ip().to_string(), env.server_addr.port().to_string()),
    };

    let mut params = Params::new();
    params.insert("GATEWAY_INTERFACE", "CGI/1.1");
    params.insert("SERVER_SOFTWARE", fastcgi.server_software.clone());
    params.insert("SERVER_PROTOCOL", format!("{:?}", parts.version));
    params.insert("REQUEST_METHOD", parts.method.as_str().to_string());
    params.insert("REQUEST_URI", request_uri);
    params.insert("QUERY_STRING", query.to_string());
    params.insert("SCRIPT_FILENAME", format!("{}{}", document_root, script_name));
    params.insert("SCRIPT_NAME", script_name);
    params.insert("PATH_INFO", path_info);
    params.insert("DOCUMENT_ROOT", document_root.to_string());
    params.insert("SERVER_NAME", server_name);
    params.insert("SERVER_PORT", server_port);
    params.insert("REMOTE_ADDR", env.remote_addr.ip().to_string());
    params.insert("REMOTE_PORT", env.remote_addr.port().to_string());

    if !body.is_empty() || parts.headers.contains_key(header::CONTENT_LENGTH) {
        params.insert("CONTENT_LENGTH", body.len().to_string());
    }
    if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
        params.insert("CONTENT_TYPE", Bytes::copy_from_slice(content_type.as_bytes()));
    }
    if let Some(id) = env.request_id {
        params.insert("REQUEST_ID", id.to_string());
    }

    for name in parts.headers.keys() {
        // Carried as CONTENT_* above; "Proxy" would become HTTP_PROXY (httpoxy).
        if *name == header::CONTENT_LENGTH || *name == header::CONTENT_TYPE || name.as_str() == "proxy" {
            continue;
        }
        let values: Vec<&[u8]> = parts
            .headers
            .get_all(name)
            .iter()
            .map(|v| v.as_bytes())
            .collect();
        let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
        params.insert(key, Bytes::from(values.join(&b", "[..])));
    }

    params
}

fn split_host(host: &str) -> (String, Option<&str>) {
    // Bracketed IPv6 literals keep their colons.
    if let Some(end) = host.find(']') {
        let port = host[end + 1..].strip_prefix(':');
        return (host[..=end].to_string(), port);
    }
    match host.rsplit_once(':') {
        Some((name, port)) => (name.to_string(), Some(port)),
        None => (host.to_string(), None),
    }
}
