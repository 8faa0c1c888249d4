//! Upstream replies: reading, decoding and writing them back to clients.
//!
//! Upstream requests are sent with `Connection: close`, so a reply ends at
//! its Content-Length, at the terminal chunk, or at EOF, whichever the
//! framing says.

use std::{collections::BTreeMap, io};

use anyhow::{Context, bail};
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Duration;
use tracing::{debug, instrument};

use crate::request::split_header_tokens;
use crate::timeouts::{ReadOutcome, read_more};

const MAX_HEADERS: usize = 96;

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    /// Lowercased names, in arrival order.
    pub headers: Vec<(String, String)>,
    /// De-chunked body.
    pub body: Bytes,
}

impl Reply {
    /// End-to-end headers, ready to be cached or written back.
    ///
    /// Hop-by-hop headers and framing headers are dropped; the writer
    /// recomputes the framing.
    pub fn headers_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for (name, value) in &self.headers {
            if is_hop_by_hop(name) || name == "content-length" {
                continue;
            }
            map.entry(name.clone())
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }
        map
    }
}

/// Headers a proxy must not forward.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Reads a reply off an upstream connection.
///
/// A stalled read fails with an `io::Error` of kind `TimedOut`.
#[instrument(skip(stream))]
pub async fn read_reply<S: AsyncRead + Unpin + ?Sized>(
    stream: &mut S,
    max_bytes: usize,
    read_timeout: Duration,
    head_only: bool,
) -> anyhow::Result<Reply> {
    let mut buf = BytesMut::new();
    loop {
        if let Some(reply) = parse_reply_within(&buf, false, head_only, max_bytes)? {
            return Ok(reply);
        }
        if max_bytes > 0 && buf.len() > max_bytes {
            bail!("Upstream response too large");
        }
        match read_more(stream, &mut buf, read_timeout).await? {
            ReadOutcome::Timeout => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out reading upstream response",
                )
                .into());
            }
            ReadOutcome::Read(0) => {
                return parse_reply_within(&buf, true, head_only, max_bytes)?
                    .context("Upstream closed connection before a full response");
            }
            ReadOutcome::Read(_) => {}
        }
    }
}

/// Parses a complete reply from `buf`.
///
/// `Ok(None)` means the framing needs more bytes. With `eof` set a reply
/// without framing runs to the end of `buf`.
pub fn parse_reply(buf: &[u8], eof: bool, head_only: bool) -> anyhow::Result<Option<Reply>> {
    parse_reply_within(buf, eof, head_only, 0)
}

/// [`parse_reply`] with a cap on the decoded body. 0 means no cap.
pub fn parse_reply_within(
    buf: &[u8],
    eof: bool,
    head_only: bool,
    max_body: usize,
) -> anyhow::Result<Option<Reply>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let head_len = match res.parse(buf).context("Malformed upstream response")? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial if eof && buf.is_empty() => {
            bail!("Upstream closed connection without sending a response")
        }
        httparse::Status::Partial if eof => bail!("Upstream closed connection while reading headers"),
        httparse::Status::Partial => return Ok(None),
    };

    let status = StatusCode::from_u16(res.code.unwrap_or(502)).context("Invalid upstream status")?;
    let mut content_length: Option<usize> = None;
    let mut is_chunked = false;
    let mut parsed = Vec::with_capacity(res.headers.len());
    for header in res.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = String::from_utf8_lossy(header.value).trim().to_string();
        match name.as_str() {
            "content-length" => {
                content_length = Some(value.parse().context("Invalid upstream Content-Length")?);
            }
            "transfer-encoding" => {
                is_chunked |= split_header_tokens(&value).any(|t| t == "chunked");
            }
            _ => {}
        }
        parsed.push((name, value));
    }

    let rest = &buf[head_len..];
    let no_body = head_only
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    let body = if no_body {
        Bytes::new()
    } else if is_chunked {
        match decode_chunked(rest, max_body)? {
            Some(body) => body,
            None if eof => bail!("Upstream closed connection inside a chunked body"),
            None => return Ok(None),
        }
    } else if let Some(len) = content_length {
        if max_body > 0 && len > max_body {
            bail!("Upstream response body too large");
        }
        if rest.len() < len {
            if eof {
                bail!("Upstream closed before full body was read");
            }
            return Ok(None);
        }
        Bytes::copy_from_slice(&rest[..len])
    } else if eof {
        Bytes::copy_from_slice(rest)
    } else {
        return Ok(None);
    };

    debug!(
        target: "mirage::upstream",
        status = status.as_u16(),
        body_len = body.len(),
        chunked = is_chunked,
        "Finished reading upstream response"
    );

    Ok(Some(Reply {
        status,
        headers: parsed,
        body,
    }))
}

/// Decodes a chunked body. `Ok(None)` until the terminal chunk and its
/// trailers have arrived.
fn decode_chunked(mut rest: &[u8], max_body: usize) -> anyhow::Result<Option<Bytes>> {
    let mut body = BytesMut::new();
    loop {
        let Some(line_end) = find_crlf(rest) else {
            return Ok(None);
        };
        let size_line = std::str::from_utf8(&rest[..line_end]).context("Invalid chunk size")?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).context("Invalid chunk size")?;
        rest = &rest[line_end + 2..];

        if size == 0 {
            loop {
                let Some(end) = find_crlf(rest) else {
                    return Ok(None);
                };
                if end == 0 {
                    return Ok(Some(body.freeze()));
                }
                rest = &rest[end + 2..];
            }
        }

        let framed = size.checked_add(2).context("Invalid chunk size")?;
        if max_body > 0 && body.len().saturating_add(size) > max_body {
            bail!("Upstream response body too large");
        }
        if rest.len() < framed {
            return Ok(None);
        }
        if &rest[size..framed] != b"\r\n" {
            bail!("Chunk is missing its trailing CRLF");
        }
        body.extend_from_slice(&rest[..size]);
        rest = &rest[framed..];
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Writes a response to the client with Content-Length framing.
///
/// `head_only` writes the head of a HEAD response: the Content-Length still
/// describes `body`, but no body bytes follow.
pub async fn write_reply<W: AsyncWrite + Unpin + ?Sized>(
    stream: &mut W,
    status: StatusCode,
    headers: &BTreeMap<String, String>,
    body: &[u8],
    head_only: bool,
    keep_alive: bool,
) -> anyhow::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    let connection = if keep_alive { "keep-alive" } else { "close" };
    head.push_str(&format!("Connection: {connection}\r\n\r\n"));

    stream.write_all(head.as_bytes()).await?;
    if !head_only {
        stream.write_all(body).await?;
    }
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_reply_waits_for_full_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhel";
        assert!(parse_reply(raw, false, false).expect("ok").is_none());
        assert!(parse_reply(raw, true, false).is_err());

        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        let reply = parse_reply(raw, false, false).expect("ok").expect("complete");
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, Bytes::from_static(b"hello"));
    }

    #[test]
    fn chunked_reply_is_decoded() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let reply = parse_reply(raw, false, false).expect("ok").expect("complete");
        assert_eq!(reply.body, Bytes::from_static(b"Wikipedia"));
        assert!(!reply.headers_map().contains_key("transfer-encoding"));

        let cut = &raw[..raw.len() - 2];
        assert!(parse_reply(cut, false, false).expect("ok").is_none());
    }

    #[test]
    fn huge_chunk_size_is_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nab";
        assert!(parse_reply(raw, false, false).is_err());
    }

    #[test]
    fn chunks_past_the_body_cap_are_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n400\r\n";
        assert!(parse_reply_within(raw, false, false, 16).is_err());
        assert!(parse_reply_within(raw, false, false, 0).expect("ok").is_none());

        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        assert!(parse_reply_within(raw, false, false, 16).is_err());
    }

    #[test]
    fn unframed_reply_runs_to_eof() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nall of it";
        assert!(parse_reply(raw, false, false).expect("ok").is_none());
        let reply = parse_reply(raw, true, false).expect("ok").expect("complete");
        assert_eq!(reply.body, Bytes::from_static(b"all of it"));
    }

    #[test]
    fn bodyless_statuses_and_head_replies() {
        let raw = b"HTTP/1.1 304 Not Modified\r\nETag: \"x\"\r\n\r\n";
        let reply = parse_reply(raw, false, false).expect("ok").expect("complete");
        assert!(reply.body.is_empty());

        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let reply = parse_reply(raw, false, true).expect("ok").expect("complete");
        assert!(reply.body.is_empty());
    }

    #[test]
    fn headers_map_drops_hop_by_hop_and_joins_repeats() {
        let raw = b"HTTP/1.1 200 OK\r\nConnection: close\r\nKeep-Alive: timeout=5\r\nVary: accept\r\nVary: origin\r\nContent-Length: 0\r\n\r\n";
        let reply = parse_reply(raw, false, false).expect("ok").expect("complete");
        let map = reply.headers_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("vary").map(String::as_str), Some("accept, origin"));
    }

    #[test]
    fn empty_stream_is_an_error() {
        assert!(parse_reply(b"", true, false).is_err());
    }

    #[tokio::test]
    async fn read_reply_stops_at_content_length() {
        let (mut upstream, mut proxy) = tokio::io::duplex(1024);
        upstream
            .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\n{}")
            .await
            .expect("write");

        // Upstream stays open: framing alone has to end the read.
        let reply = read_reply(&mut proxy, 0, Duration::from_secs(1), false)
            .await
            .expect("reply");
        assert_eq!(reply.status, StatusCode::CREATED);
        assert_eq!(reply.body, Bytes::from_static(b"{}"));
        drop(upstream);
    }

    #[tokio::test]
    async fn write_reply_frames_with_content_length() {
        let mut out: Vec<u8> = Vec::new();
        let headers = BTreeMap::from([
            ("content-type".to_string(), "application/json".to_string()),
            ("transfer-encoding".to_string(), "chunked".to_string()),
        ]);
        write_reply(&mut out, StatusCode::OK, &headers, b"{}", false, true)
            .await
            .expect("write");
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(
            text,
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\n{}"
        );
    }
}
