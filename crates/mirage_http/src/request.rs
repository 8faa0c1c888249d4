//! Client request reading.
//!
//! Heads are parsed with `httparse`; bodies are only accepted with a
//! Content-Length. Whatever follows the body stays in the connection buffer
//! for the next request on the same connection.

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::time::Duration;
use tracing::{debug, instrument, warn};

use crate::ClientStream;
use crate::responses::{send_400, send_408, send_413, send_431, send_501};
use crate::timeouts::{ReadOutcome, read_more};

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub http_version: String,
    /// Lowercased names, in arrival order.
    pub headers: Vec<(String, String)>,
    pub content_length: usize,
    pub is_chunked: bool,
    pub close_after: bool,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub head: RequestHead,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    /// Wait for the first byte of a request.
    pub idle_timeout: Duration,
    /// Wait between bytes once a request has started.
    pub read_timeout: Duration,
    pub max_headers: usize,
    pub max_body: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HeadError {
    Malformed,
    UnsupportedVersion,
    InvalidMethod,
    InvalidContentLength,
    ConflictingContentLength,
}

/// Reads one full request off `stream`.
///
/// Returns `Ok(None)` when the connection should be closed: the peer went
/// away, sat idle, or sent something that already got an error response.
#[instrument(skip(stream, buf, limits), fields())]
pub async fn read_request(
    stream: &mut dyn ClientStream,
    buf: &mut BytesMut,
    limits: &RequestLimits,
) -> anyhow::Result<Option<Request>> {
    let (head, head_len) = loop {
        match parse_request_head(buf) {
            Ok(Some(parsed)) => break parsed,
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target: "mirage::http",
                    error = ?err,
                    "Invalid request headers"
                );
                send_400(stream).await?;
                return Ok(None);
            }
        }

        if limits.max_headers > 0 && buf.len() > limits.max_headers {
            send_431(stream).await?;
            return Ok(None);
        }

        let timeout_dur = if buf.is_empty() {
            limits.idle_timeout
        } else {
            limits.read_timeout
        };
        match read_more(stream, buf, timeout_dur).await? {
            ReadOutcome::Timeout => {
                if buf.is_empty() {
                    return Ok(None);
                }
                send_408(stream).await?;
                return Ok(None);
            }
            ReadOutcome::Read(0) => return Ok(None),
            ReadOutcome::Read(_) => {}
        }
    };

    debug!(
        target: "mirage::http",
        method = %head.method,
        path = %head.path,
        header_len = head_len,
        "Parsed HTTP request head"
    );

    if head.is_chunked {
        send_501(stream).await?;
        return Ok(None);
    }
    if limits.max_body > 0 && head.content_length > limits.max_body {
        send_413(stream).await?;
        return Ok(None);
    }

    let _ = buf.split_to(head_len);
    while buf.len() < head.content_length {
        match read_more(stream, buf, limits.read_timeout).await? {
            ReadOutcome::Timeout => {
                send_408(stream).await?;
                return Ok(None);
            }
            ReadOutcome::Read(0) => return Ok(None),
            ReadOutcome::Read(_) => {}
        }
    }
    let body = buf.split_to(head.content_length).freeze();

    Ok(Some(Request { head, body }))
}

/// Parses a request head from the front of `buf`.
///
/// `Ok(None)` means more bytes are needed. On success the head's length in
/// bytes is returned with it.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf).map_err(|_| HeadError::Malformed)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let http_version = match req.version {
        Some(0) => "HTTP/1.0",
        Some(1) => "HTTP/1.1",
        _ => return Err(HeadError::UnsupportedVersion),
    };
    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(HeadError::InvalidMethod)?;
    let path = req.path.unwrap_or("/").to_string();

    let mut content_length = ContentLengthState::default();
    let mut connection_close = false;
    let mut connection_keep_alive = false;
    let mut is_chunked = false;
    let mut parsed = Vec::with_capacity(req.headers.len());

    for header in req.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = String::from_utf8_lossy(header.value).trim().to_string();

        match name.as_str() {
            "content-length" => content_length.add(&value),
            "connection" | "proxy-connection" => {
                for token in split_header_tokens(&value) {
                    match token.as_str() {
                        "close" => connection_close = true,
                        "keep-alive" => connection_keep_alive = true,
                        _ => {}
                    }
                }
            }
            "transfer-encoding" => {
                if split_header_tokens(&value).any(|t| t == "chunked") {
                    is_chunked = true;
                }
            }
            _ => {}
        }
        parsed.push((name, value));
    }

    if content_length.invalid {
        return Err(if content_length.conflict {
            HeadError::ConflictingContentLength
        } else {
            HeadError::InvalidContentLength
        });
    }

    let close_after = if http_version == "HTTP/1.0" {
        !connection_keep_alive || connection_close
    } else {
        connection_close
    };

    Ok(Some((
        RequestHead {
            method,
            path,
            http_version: http_version.to_string(),
            headers: parsed,
            content_length: content_length.value.unwrap_or(0),
            is_chunked,
            close_after,
        },
        head_len,
    )))
}

#[derive(Default)]
struct ContentLengthState {
    value: Option<usize>,
    invalid: bool,
    conflict: bool,
}

impl ContentLengthState {
    fn add(&mut self, raw: &str) {
        let mut any = false;
        for part in raw.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            any = true;
            match trimmed.parse::<usize>() {
                Ok(len) => match self.value {
                    Some(prev) if prev != len => {
                        self.conflict = true;
                        self.invalid = true;
                    }
                    Some(_) => {}
                    None => self.value = Some(len),
                },
                Err(_) => self.invalid = true,
            }
        }
        if !any {
            self.invalid = true;
        }
    }
}

pub(crate) fn split_header_tokens(value: &str) -> impl Iterator<Item = String> + '_ {
    value.split(',').filter_map(|token| {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(
                trimmed
                    .trim_matches(|c| c == '"' || c == '\'')
                    .to_ascii_lowercase(),
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<RequestHead, HeadError> {
        parse_request_head(raw.as_bytes()).map(|parsed| parsed.expect("complete head").0)
    }

    #[test]
    fn partial_head_needs_more_bytes() {
        assert!(matches!(parse_request_head(b"GET /api HTTP/1.1\r\nHost: x\r\n"), Ok(None)));
    }

    #[test]
    fn head_length_excludes_body() {
        let raw = b"POST /api HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}";
        let (head, len) = parse_request_head(raw).expect("ok").expect("complete");
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.path, "/api");
        assert_eq!(len, raw.len() - 2);
        assert_eq!(head.content_length, 2);
    }

    #[test]
    fn header_names_are_lowercased() {
        let head = parse("GET / HTTP/1.1\r\nX-Trace-Id: abc\r\n\r\n").expect("ok");
        assert_eq!(head.headers, vec![("x-trace-id".to_string(), "abc".to_string())]);
        assert_eq!(head.header("X-TRACE-ID"), Some("abc"));
    }

    #[test]
    fn accepts_duplicate_content_length() {
        let head = parse("POST /upload HTTP/1.1\r\nHost: example\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n")
            .expect("expected ok");
        assert_eq!(head.content_length, 5);
    }

    #[test]
    fn rejects_conflicting_content_length() {
        let err = parse("POST /upload HTTP/1.1\r\nHost: example\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, HeadError::ConflictingContentLength);
    }

    #[test]
    fn rejects_invalid_content_length() {
        let err = parse("POST /upload HTTP/1.1\r\nHost: example\r\nContent-Length: nope\r\n\r\n").unwrap_err();
        assert_eq!(err, HeadError::InvalidContentLength);
    }

    #[test]
    fn connection_tokens_decide_close() {
        let head = parse("GET / HTTP/1.1\r\nConnection: \"keep-alive\", close\r\n\r\n").expect("ok");
        assert!(head.close_after);

        let head = parse("GET / HTTP/1.0\r\n\r\n").expect("ok");
        assert!(head.close_after);

        let head = parse("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").expect("ok");
        assert!(!head.close_after);
    }

    #[test]
    fn detects_chunked_with_tokens() {
        let head = parse("POST / HTTP/1.1\r\nTransfer-Encoding: gzip, \"chunked\"\r\nContent-Length: 10\r\n\r\n")
            .expect("ok");
        assert!(head.is_chunked);
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(parse_request_head(b"\x01\x02 nonsense\r\n\r\n").unwrap_err(), HeadError::Malformed);
    }

    fn limits() -> RequestLimits {
        RequestLimits {
            idle_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            max_headers: 1024,
            max_body: 16,
        }
    }

    #[tokio::test]
    async fn reads_body_and_keeps_pipelined_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(
            &mut client,
            b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n",
        )
        .await
        .expect("write");

        let mut buf = BytesMut::new();
        let req = read_request(&mut server, &mut buf, &limits())
            .await
            .expect("read")
            .expect("request");
        assert_eq!(req.head.path, "/a");
        assert_eq!(req.body, Bytes::from_static(b"abc"));

        let next = read_request(&mut server, &mut buf, &limits())
            .await
            .expect("read")
            .expect("pipelined request");
        assert_eq!(next.head.path, "/b");
        assert!(next.body.is_empty());
    }

    #[tokio::test]
    async fn oversized_body_gets_413() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(
            &mut client,
            b"POST /a HTTP/1.1\r\nContent-Length: 100\r\n\r\n",
        )
        .await
        .expect("write");

        let mut buf = BytesMut::new();
        let req = read_request(&mut server, &mut buf, &limits()).await.expect("read");
        assert!(req.is_none());
        drop(server);

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut out).await.expect("read");
        assert!(out.starts_with(b"HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test]
    async fn closed_connection_yields_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let mut buf = BytesMut::new();
        let req = read_request(&mut server, &mut buf, &limits()).await.expect("read");
        assert!(req.is_none());
    }
}
