//! Response handling and transformation.
//!
//! # Responsibilities
//! - Turn application stdout (CGI header block + body) into an HTTP response
//! - Map `Status:` and `Location:` to the response status
//! - Produce the gateway's own error responses
//!
//! # Design Decisions
//! - Hop-by-hop headers and Content-Length from the application are dropped
//! - Output whose header block cannot be parsed is sent verbatim with 200

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;

const MAX_HEADERS: usize = 128;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Build the client response from the application's stdout.
pub fn cgi_response(stdout: Bytes) -> Response<Body> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let (consumed, parsed) = match httparse::parse_headers(&stdout, &mut headers) {
        Ok(httparse::Status::Complete((consumed, parsed))) => (consumed, parsed),
        Ok(httparse::Status::Partial) => {
            tracing::warn!(bytes = stdout.len(), "Backend output has no complete header block, passing through");
            return passthrough(stdout);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Malformed backend header block, passing through");
            return passthrough(stdout);
        }
    };

    let mut response = Response::new(Body::empty());
    let mut status = None;
    let mut has_location = false;

    for h in parsed.iter() {
        if h.name.eq_ignore_ascii_case("status") {
            match parse_status(h.value) {
                Some(code) => status = Some(code),
                None => tracing::warn!(
                    value = %String::from_utf8_lossy(h.value),
                    "Ignoring invalid Status header from backend"
                ),
            }
            continue;
        }
        if HOP_BY_HOP.iter().any(|n| h.name.eq_ignore_ascii_case(n)) {
            continue;
        }

        let name = match HeaderName::from_bytes(h.name.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                tracing::warn!(name = %h.name, "Dropping invalid header name from backend");
                continue;
            }
        };
        let value = match HeaderValue::from_bytes(h.value) {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(name = %h.name, "Dropping invalid header value from backend");
                continue;
            }
        };
        if name == header::LOCATION {
            has_location = true;
        }
        response.headers_mut().append(name, value);
    }

    *response.status_mut() = match status {
        Some(code) => code,
        None if has_location => StatusCode::FOUND,
        None => StatusCode::OK,
    };
    *response.body_mut() = Body::from(stdout.slice(consumed..));
    response
}

/// "404 Not Found" or just "404".
fn parse_status(value: &[u8]) -> Option<StatusCode> {
    let text = std::str::from_utf8(value).ok()?.trim();
    let code = text.split_whitespace().next()?;
    StatusCode::from_bytes(code.as_bytes()).ok()
}

fn passthrough(stdout: Bytes) -> Response<Body> {
    Response::new(Body::from(stdout))
}

/// Gateway-generated error response.
pub fn error_response(status: StatusCode, message: &'static str) -> Response<Body> {
    (status, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response<Body>) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
    }

    #[tokio::test]
    async fn test_headers_and_body() {
        let response = cgi_response(Bytes::from_static(
            b"Content-Type: text/html\r\nX-Powered-By: PHP\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\nhello index",
        ));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/html");
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert_eq!(body_of(response).await.as_ref(), b"hello index");
    }

    #[tokio::test]
    async fn test_status_header() {
        let response = cgi_response(Bytes::from_static(
            b"Status: 404 Not Found\nContent-Type: text/plain\n\nmissing",
        ));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("status").is_none());
        assert_eq!(body_of(response).await.as_ref(), b"missing");
    }

    #[test]
    fn test_location_without_status_redirects() {
        let response = cgi_response(Bytes::from_static(b"Location: /login\r\n\r\n"));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "/login");

        let response = cgi_response(Bytes::from_static(
            b"Status: 301 Moved Permanently\r\nLocation: /new\r\n\r\n",
        ));
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[tokio::test]
    async fn test_hop_by_hop_stripped() {
        let response = cgi_response(Bytes::from_static(
            b"Connection: close\r\nTransfer-Encoding: chunked\r\nContent-Length: 999\r\nX-Kept: yes\r\n\r\nok",
        ));
        assert!(response.headers().get("connection").is_none());
        assert!(response.headers().get("transfer-encoding").is_none());
        assert_eq!(response.headers()["x-kept"], "yes");
        assert_eq!(body_of(response).await.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn test_malformed_output_passes_through() {
        let raw = b"no header block here";
        let response = cgi_response(Bytes::from_static(raw));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await.as_ref(), raw);

        let raw = b"Bad Header Line\r\n\r\nbody";
        let response = cgi_response(Bytes::from_static(raw));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await.as_ref(), raw);
    }

    #[test]
    fn test_invalid_status_ignored() {
        let response = cgi_response(Bytes::from_static(b"Status: banana\r\n\r\n"));
        assert_eq!(response.status(), StatusCode::OK);
    }
}
