//! Forwarding cache misses to the origin.
//!
//! One connection per request: the request goes out as HTTP/1.0 with
//! `Connection: close`, so the reply's framing or EOF ends it.

use std::time::Duration;

use http::Method;
use mirage_config::ServerConfig;
use mirage_http::{Reply, RequestHead, is_hop_by_hop, read_reply};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("timed out talking to upstream {0}")]
    Timeout(String),
    #[error("upstream {addr} unavailable: {reason}")]
    Unavailable { addr: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Upstream {
    addr: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_response: usize,
}

impl Upstream {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            addr: cfg.upstream().to_string(),
            connect_timeout: cfg.upstream_connect_timeout(),
            read_timeout: cfg.upstream_read_timeout(),
            max_response: cfg.max_upstream_response_bytes as usize,
        }
    }

    /// Address a request for `path` is bound to. Doubles as the target the
    /// URL digest fingerprints.
    pub fn target(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    #[instrument(skip(self, head, body), fields(upstream = %self.addr, path = %head.path))]
    pub async fn forward(
        &self,
        head: &RequestHead,
        body: &[u8],
        client_ip: &str,
    ) -> Result<Reply, UpstreamError> {
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(self.unavailable(err.into())),
            Err(_) => return Err(UpstreamError::Timeout(self.addr.clone())),
        };
        debug!(target: "mirage::upstream", "Connected to upstream");

        let request = rewrite_request(head, body.len(), &self.addr, client_ip);
        let sent = async {
            stream.write_all(request.as_bytes()).await?;
            stream.write_all(body).await?;
            stream.flush().await
        };
        match timeout(self.read_timeout, sent).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(self.unavailable(err.into())),
            Err(_) => return Err(UpstreamError::Timeout(self.addr.clone())),
        }

        let head_only = head.method == Method::HEAD;
        read_reply(&mut stream, self.max_response, self.read_timeout, head_only)
            .await
            .map_err(|err| {
                let timed_out = err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::TimedOut);
                if timed_out {
                    UpstreamError::Timeout(self.addr.clone())
                } else {
                    self.unavailable(err)
                }
            })
    }

    fn unavailable(&self, err: anyhow::Error) -> UpstreamError {
        UpstreamError::Unavailable {
            addr: self.addr.clone(),
            reason: format!("{err:#}"),
        }
    }
}

/// Request head sent upstream: hop-by-hop and forwarding headers are
/// replaced, framing is recomputed.
fn rewrite_request(head: &RequestHead, body_len: usize, upstream: &str, client_ip: &str) -> String {
    let mut out = format!("{} {} HTTP/1.0\r\n", head.method, head.path);
    let mut host = None;
    for (name, value) in &head.headers {
        match name.as_str() {
            "host" => {
                host = Some(value.as_str());
                continue;
            }
            "content-length" | "x-forwarded-for" | "x-forwarded-host" | "x-real-ip" => continue,
            n if is_hop_by_hop(n) => continue,
            _ => {}
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Host: {upstream}\r\n"));
    out.push_str(&format!("X-Forwarded-For: {client_ip}\r\n"));
    out.push_str(&format!("X-Real-IP: {client_ip}\r\n"));
    if let Some(host) = host {
        out.push_str(&format!("X-Forwarded-Host: {host}\r\n"));
    }
    if body_len > 0 || head.method == Method::POST || head.method == Method::PUT {
        out.push_str(&format!("Content-Length: {body_len}\r\n"));
    }
    out.push_str("Connection: close\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use mirage_http::parse_request_head;

    use super::*;

    #[test]
    fn rewrite_replaces_hop_by_hop_and_forwarding_headers() {
        let raw = b"GET /api?id=1 HTTP/1.1\r\nHost: front.local\r\nConnection: keep-alive\r\nX-Forwarded-For: 6.6.6.6\r\nAccept: */*\r\n\r\n";
        let (head, _) = parse_request_head(raw).expect("ok").expect("complete");

        let out = rewrite_request(&head, 0, "127.0.0.1:9000", "10.0.0.7");
        assert!(out.starts_with("GET /api?id=1 HTTP/1.0\r\n"));
        assert!(out.contains("accept: */*\r\n"));
        assert!(out.contains("Host: 127.0.0.1:9000\r\n"));
        assert!(out.contains("X-Forwarded-For: 10.0.0.7\r\n"));
        assert!(out.contains("X-Forwarded-Host: front.local\r\n"));
        assert!(!out.contains("6.6.6.6"));
        assert!(!out.contains("keep-alive"));
        assert!(!out.contains("Content-Length"));
        assert!(out.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn rewrite_frames_request_bodies() {
        let raw = b"POST /api HTTP/1.1\r\nContent-Length: 2\r\n\r\n";
        let (head, _) = parse_request_head(raw).expect("ok").expect("complete");
        let out = rewrite_request(&head, 2, "127.0.0.1:9000", "10.0.0.7");
        assert!(out.contains("Content-Length: 2\r\n"));
    }
}
