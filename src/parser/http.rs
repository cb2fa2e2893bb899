//! Minimal HTTP/1.x request/response recognizer over a byte buffer.
//!
//! Parses exactly as much as is needed to produce a `HttpRequest`/
//! `HttpResponse`: a request/status line, headers up to the blank line,
//! then a body sized by `Content-Length` (chunked transfer-encoding is
//! treated as "read to end of buffer", which is sufficient for the
//! metadata this agent reports on).

use crate::util::truncate_utf8_safe;
use crate::witness::{Headers, HttpRequest, HttpResponse};

pub enum HttpParseOutcome<T> {
    /// A complete message was parsed; `consumed` bytes should be removed
    /// from the front of the buffer.
    Complete { message: T, consumed: usize },
    /// Not enough bytes yet to know whether this is even HTTP.
    Incomplete,
    /// The buffer is not a well-formed HTTP message at all.
    NotHttp,
}

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

pub fn try_parse_request(buf: &[u8], max_len: usize) -> HttpParseOutcome<HttpRequest> {
    let Some(header_end) = find_header_end(buf) else {
        if buf.len() > max_len {
            return HttpParseOutcome::NotHttp;
        }
        return HttpParseOutcome::Incomplete;
    };

    let head = String::from_utf8_lossy(&buf[..header_end]);
    let mut lines = head.split("\r\n");
    let Some(request_line) = lines.next() else {
        return HttpParseOutcome::NotHttp;
    };
    let mut parts = request_line.splitn(3, ' ');
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return HttpParseOutcome::NotHttp;
    };
    if !METHODS.contains(&method) {
        return HttpParseOutcome::NotHttp;
    }

    let headers = parse_headers(lines);
    let content_length = content_length_of(&headers);
    let body_start = header_end + 4;
    let (truncated, body_end) = body_bounds(buf.len(), body_start, content_length, max_len);

    match body_end {
        Some(end) => {
            let body_limit = (body_start + max_len).min(end);
            let body = buf[body_start..body_limit].to_vec();
            HttpParseOutcome::Complete {
                message: HttpRequest {
                    method: method.to_string(),
                    path: path.to_string(),
                    version: version.to_string(),
                    headers,
                    body,
                    truncated,
                },
                consumed: end,
            }
        }
        None => HttpParseOutcome::Incomplete,
    }
}

pub fn try_parse_response(buf: &[u8], max_len: usize) -> HttpParseOutcome<HttpResponse> {
    let Some(header_end) = find_header_end(buf) else {
        if buf.len() > max_len {
            return HttpParseOutcome::NotHttp;
        }
        return HttpParseOutcome::Incomplete;
    };

    let head = String::from_utf8_lossy(&buf[..header_end]);
    let mut lines = head.split("\r\n");
    let Some(status_line) = lines.next() else {
        return HttpParseOutcome::NotHttp;
    };
    let mut parts = status_line.splitn(3, ' ');
    let (Some(version), Some(status_str), _reason) = (parts.next(), parts.next(), parts.next()) else {
        return HttpParseOutcome::NotHttp;
    };
    if !version.starts_with("HTTP/") {
        return HttpParseOutcome::NotHttp;
    }
    let Ok(status) = status_str.parse::<u16>() else {
        return HttpParseOutcome::NotHttp;
    };

    let headers = parse_headers(lines);
    let content_length = content_length_of(&headers);
    let body_start = header_end + 4;
    let (truncated, body_end) = body_bounds(buf.len(), body_start, content_length, max_len);

    match body_end {
        Some(end) => {
            let body_limit = (body_start + max_len).min(end);
            let body = buf[body_start..body_limit].to_vec();
            HttpParseOutcome::Complete {
                message: HttpResponse {
                    status,
                    version: version.to_string(),
                    headers,
                    body,
                    truncated,
                },
                consumed: end,
            }
        }
        None => HttpParseOutcome::Incomplete,
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Headers {
    let mut headers = Headers::default();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push(name.trim(), value.trim());
        }
    }
    headers
}

fn content_length_of(headers: &Headers) -> Option<usize> {
    headers.get("content-length").and_then(|v| v.trim().parse().ok())
}

/// Returns `(truncated, end_offset)`. `end_offset` is `None` while more
/// bytes are still needed to complete the declared body.
fn body_bounds(
    available: usize,
    body_start: usize,
    content_length: Option<usize>,
    max_len: usize,
) -> (bool, Option<usize>) {
    match content_length {
        Some(len) => {
            let declared_end = body_start + len;
            if available < declared_end {
                return (false, None);
            }
            let truncated = len > max_len;
            (truncated, Some(declared_end))
        }
        // No Content-Length: treat the message as complete once the header
        // was found (a GET request, or a response relying on connection
        // close / chunked transfer we don't decode here).
        None => (false, Some(body_start)),
    }
}

#[allow(dead_code)]
pub fn truncate_body_preview(body: &str, max_bytes: usize) -> &str {
    truncate_utf8_safe(body, max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get_request() {
        let buf = b"GET /v1/items HTTP/1.1\r\nHost: example.com\r\n\r\n";
        match try_parse_request(buf, 4096) {
            HttpParseOutcome::Complete { message, consumed } => {
                assert_eq!(message.method, "GET");
                assert_eq!(message.path, "/v1/items");
                assert_eq!(consumed, buf.len());
            }
            _ => panic!("expected complete parse"),
        }
    }

    #[test]
    fn waits_for_full_body_before_completing() {
        let buf = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert!(matches!(
            try_parse_request(buf, 4096),
            HttpParseOutcome::Incomplete
        ));
    }

    #[test]
    fn parses_response_with_body() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        match try_parse_response(buf, 4096) {
            HttpParseOutcome::Complete { message, .. } => {
                assert_eq!(message.status, 200);
                assert_eq!(message.body, b"ok");
            }
            _ => panic!("expected complete parse"),
        }
    }

    #[test]
    fn oversize_body_is_truncated_to_max_len() {
        let mut buf = b"HTTP/1.1 200 OK\r\nContent-Length: 10000\r\n\r\n".to_vec();
        buf.extend(std::iter::repeat(b'x').take(10000));
        match try_parse_response(&buf, 100) {
            HttpParseOutcome::Complete { message, .. } => {
                assert!(message.truncated);
                assert_eq!(message.body.len(), 100);
            }
            _ => panic!("expected complete parse"),
        }
    }

    #[test]
    fn body_exactly_at_max_len_is_not_truncated() {
        let mut buf = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n".to_vec();
        buf.extend(std::iter::repeat(b'x').take(100));
        match try_parse_response(&buf, 100) {
            HttpParseOutcome::Complete { message, .. } => {
                assert!(!message.truncated);
                assert_eq!(message.body.len(), 100);
            }
            _ => panic!("expected complete parse"),
        }
    }

    #[test]
    fn non_http_bytes_are_rejected_once_buffer_grows() {
        let buf = vec![0u8; 5000];
        assert!(matches!(
            try_parse_request(&buf, 4096),
            HttpParseOutcome::NotHttp
        ));
    }
}
