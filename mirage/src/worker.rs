//! Per-connection HTTP/1 handler.
//!
//! Each request runs through the requester; a miss is forwarded upstream
//! and the reply runs through the collector on its way back.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use http::StatusCode;
use mirage_http::{
    CachePolicy, ClientStream, Request, RequestLimits, is_hop_by_hop, read_request,
    responses::{send_500, send_502, send_504, send_response},
    write_reply,
};
use mirage_mediator::{CacheMediator, Flow, MessageContext};
use tracing::{debug, info, instrument, warn};

use crate::upstream::{Upstream, UpstreamError};

/// Internal path answering with the mediators' counters.
pub const STATS_PATH: &str = "/_mirage/stats";

/// Everything a connection needs to serve requests.
pub struct Front {
    pub requester: CacheMediator,
    pub collector: CacheMediator,
    pub upstream: Upstream,
    pub limits: RequestLimits,
    pub keepalive_timeout: Duration,
}

enum Outcome {
    KeepOpen,
    Close,
}

#[instrument(skip(stream, front), fields(client = %client_addr))]
pub async fn handle_connection(
    mut stream: Box<dyn ClientStream>,
    client_addr: SocketAddr,
    front: Arc<Front>,
) -> anyhow::Result<()> {
    info!(target: "mirage::worker", "Handling new client connection");

    let mut buf = BytesMut::new();
    let mut limits = front.limits;
    let client_ip = client_addr.ip().to_string();

    loop {
        let Some(req) = read_request(&mut *stream, &mut buf, &limits).await? else {
            break;
        };
        let close_after = req.head.close_after;

        match serve(&mut *stream, req, &front, &client_ip, !close_after).await? {
            Outcome::KeepOpen if !close_after => {}
            _ => break,
        }
        limits.idle_timeout = front.keepalive_timeout;
    }

    debug!(target: "mirage::worker", "Connection closed");
    Ok(())
}

async fn serve(
    stream: &mut dyn ClientStream,
    req: Request,
    front: &Front,
    client_ip: &str,
    keep_alive: bool,
) -> anyhow::Result<Outcome> {
    let is_read = req.head.method == http::Method::GET || req.head.method == http::Method::HEAD;
    if is_read && req.head.path == STATS_PATH {
        return serve_stats(stream, &req, front).await;
    }

    if !CachePolicy::is_cacheable(&req.head.method) {
        debug!(
            target: "mirage::worker",
            method = %req.head.method,
            path = %req.head.path,
            "Bypassing the cache"
        );
        return pass_through(stream, &req, front, client_ip, keep_alive).await;
    }

    let mut ctx = request_context(&req, &front.upstream);
    match front.requester.mediate(&mut ctx) {
        Ok(Flow::Respond) => {
            let status = ctx
                .status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::OK);
            write_reply(stream, status, &ctx.transport_headers, &ctx.payload, false, keep_alive).await?;
            Ok(Outcome::KeepOpen)
        }
        Ok(Flow::Handled) => {
            debug!(
                target: "mirage::worker",
                message_id = %ctx.message_id(),
                "On-cache-hit sequence took the message over; closing"
            );
            Ok(Outcome::Close)
        }
        Ok(Flow::Continue) => {
            let reply = match front.upstream.forward(&req.head, &req.body, client_ip).await {
                Ok(reply) => reply,
                Err(err) => return upstream_failed(stream, err).await,
            };

            let status = reply.status;
            let mut response = ctx.into_response(status.as_u16(), reply.headers_map(), reply.body);
            if CachePolicy::is_storable(status) {
                if let Err(err) = front.collector.mediate(&mut response) {
                    warn!(
                        target: "mirage::worker",
                        message_id = %response.message_id(),
                        error = %err,
                        "Collector failed; replying uncached"
                    );
                }
            }
            write_reply(
                stream,
                status,
                &response.transport_headers,
                &response.payload,
                false,
                keep_alive,
            )
            .await?;
            Ok(Outcome::KeepOpen)
        }
        Err(err) => {
            warn!(
                target: "mirage::worker",
                message_id = %ctx.message_id(),
                error = %err,
                invalid_state = err.is_invalid_state(),
                "Cache mediation failed"
            );
            send_500(stream).await?;
            Ok(Outcome::Close)
        }
    }
}

async fn serve_stats(stream: &mut dyn ClientStream, req: &Request, front: &Front) -> anyhow::Result<Outcome> {
    let body = if req.head.method == http::Method::HEAD {
        String::new()
    } else {
        format!(
            "{{\"{}\":{},\"{}\":{}}}",
            front.requester.name(),
            front.requester.stats().to_json(),
            front.collector.name(),
            front.collector.stats().to_json()
        )
    };

    send_response(
        stream,
        "200 OK",
        "application/json; charset=utf-8",
        body.as_bytes(),
    )
    .await?;
    Ok(Outcome::Close)
}

async fn pass_through(
    stream: &mut dyn ClientStream,
    req: &Request,
    front: &Front,
    client_ip: &str,
    keep_alive: bool,
) -> anyhow::Result<Outcome> {
    let reply = match front.upstream.forward(&req.head, &req.body, client_ip).await {
        Ok(reply) => reply,
        Err(err) => return upstream_failed(stream, err).await,
    };
    let head_only = req.head.method == http::Method::HEAD;
    write_reply(stream, reply.status, &reply.headers_map(), &reply.body, head_only, keep_alive).await?;
    Ok(Outcome::KeepOpen)
}

async fn upstream_failed(stream: &mut dyn ClientStream, err: UpstreamError) -> anyhow::Result<Outcome> {
    warn!(target: "mirage::upstream", error = %err, "Upstream request failed");
    match err {
        UpstreamError::Timeout(_) => send_504(stream).await?,
        UpstreamError::Unavailable { .. } => send_502(stream).await?,
    }
    Ok(Outcome::Close)
}

/// The request leg of an exchange: REST mode, end-to-end headers only.
fn request_context(req: &Request, upstream: &Upstream) -> MessageContext {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in &req.head.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        headers
            .entry(name.clone())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }

    let mut ctx = MessageContext::request(upstream.target(&req.head.path), req.body.clone()).with_rest(true);
    ctx.content_type = headers.get("content-type").cloned();
    ctx.message_type = ctx.content_type.clone();
    ctx.no_entity_body = req.body.is_empty();
    ctx.transport_headers = headers;
    ctx
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mirage_cache::{BackstopPolicy, CacheManager, SystemClock};
    use mirage_config::{MediatorConfig, ServerConfig};
    use mirage_mediator::SequenceRegistry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Origin answering every request with a numbered JSON body.
    async fn spawn_origin(hits: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
        let addr = listener.local_addr().expect("origin addr");
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let _ = sock.read(&mut buf).await;
                    let body = format!("{{\"n\":{n}}}");
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nX-Origin: yes\r\nContent-Length: {}\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(reply.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn front(origin: SocketAddr) -> Arc<Front> {
        let manager = CacheManager::new(BackstopPolicy::default(), Arc::new(SystemClock));
        let sequences = Arc::new(SequenceRegistry::default());
        let server = ServerConfig {
            upstream: origin.to_string(),
            ..ServerConfig::default()
        };
        Arc::new(Front {
            requester: CacheMediator::from_config("request", &MediatorConfig::requester(), &manager, Arc::clone(&sequences))
                .expect("requester"),
            collector: CacheMediator::from_config("response", &MediatorConfig::collector(), &manager, sequences)
                .expect("collector"),
            upstream: Upstream::from_config(&server),
            limits: RequestLimits {
                idle_timeout: Duration::from_secs(2),
                read_timeout: Duration::from_secs(2),
                max_headers: 16 * 1024,
                max_body: 1024,
            },
            keepalive_timeout: Duration::from_secs(2),
        })
    }

    async fn exchange(front: Arc<Front>, request: &str) -> String {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "10.0.0.7:5555".parse().expect("addr");
        let task = tokio::spawn(handle_connection(Box::new(server), peer, front));
        client.write_all(request.as_bytes()).await.expect("write");
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.expect("read");
        task.await.expect("join").expect("connection");
        String::from_utf8(out).expect("utf8")
    }

    #[tokio::test]
    async fn second_get_is_served_from_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let front = front(spawn_origin(Arc::clone(&hits)).await);

        let first = exchange(Arc::clone(&front), "GET /orders HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(first.ends_with("{\"n\":1}"));

        let second = exchange(Arc::clone(&front), "GET /orders HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(second.contains("content-type: application/json\r\n"));
        assert!(second.contains("x-origin: yes\r\n"));
        assert!(second.ends_with("{\"n\":1}"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stats = front.requester.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn keep_alive_connection_serves_several_requests() {
        let hits = Arc::new(AtomicUsize::new(0));
        let front = front(spawn_origin(Arc::clone(&hits)).await);

        let out = exchange(
            front,
            "GET /a HTTP/1.1\r\n\r\nGET /a HTTP/1.1\r\n\r\nGET /a HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 3);
        assert_eq!(out.matches("{\"n\":1}").count(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_bypasses_the_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let front = front(spawn_origin(Arc::clone(&hits)).await);

        let req = "POST /orders HTTP/1.1\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}";
        let first = exchange(Arc::clone(&front), req).await;
        let second = exchange(Arc::clone(&front), req).await;
        assert!(first.ends_with("{\"n\":1}"));
        assert!(second.ends_with("{\"n\":2}"));
        assert_eq!(front.requester.stats().misses, 0);
    }

    #[tokio::test]
    async fn stats_endpoint_reports_mediator_counters() {
        let hits = Arc::new(AtomicUsize::new(0));
        let front = front(spawn_origin(Arc::clone(&hits)).await);

        exchange(
            Arc::clone(&front),
            "GET /a HTTP/1.1\r\n\r\nGET /a HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        let out = exchange(Arc::clone(&front), "GET /_mirage/stats HTTP/1.1\r\n\r\n").await;

        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Type: application/json; charset=utf-8\r\n"));
        assert!(out.contains("\"request\":{\"hits\":1,\"misses\":1,"));
        assert!(out.contains("\"hit_ratio\":0.5000"));
        assert!(out.contains("\"response\":{\"hits\":0,\"misses\":0,\"reincarnations\":0,\"stored\":1,"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_upstream_gets_502() {
        let closed = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = closed.local_addr().expect("addr");
        drop(closed);

        let out = exchange(front(addr), "GET /x HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }
}
