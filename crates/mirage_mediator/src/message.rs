//! The per-exchange message the mediators operate on.

use std::{collections::BTreeMap, fmt, sync::Arc};

use bytes::Bytes;
use mirage_cache::{CacheEntry, Fingerprint, HeaderSnapshot, ReplicatedCacheStore, RequestView};
use uuid::Uuid;

/// Snapshot key holding the message type. Transport header names never start with ':'.
pub const MESSAGE_TYPE_KEY: &str = ":message-type";
/// Snapshot key holding the response status code.
pub const STATUS_KEY: &str = ":status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Response => f.write_str("response"),
        }
    }
}

/// Cache state carried from the request leg to the response leg of one exchange.
#[derive(Debug, Default, Clone)]
pub struct CacheContext {
    /// Set by the requester whatever the lookup outcome.
    pub fingerprint: Option<Fingerprint>,
    /// The entry the collector populates, or the one a hit was served from.
    pub cached: Option<CacheEntry>,
    /// Store the entry belongs to.
    pub store: Option<Arc<ReplicatedCacheStore>>,
    /// Largest response body the collector may cache. 0 means no limit.
    pub max_message_size: usize,
}

#[derive(Debug, Clone)]
pub struct MessageContext {
    message_id: String,
    direction: Direction,
    /// Target address. Cleared when a cached response is sent back.
    pub to: Option<String>,
    pub payload: Bytes,
    /// Lowercased header names.
    pub transport_headers: BTreeMap<String, String>,
    pub message_type: Option<String>,
    pub content_type: Option<String>,
    pub status: Option<u16>,
    /// Header-preserving mode: response metadata is captured with the payload.
    pub doing_rest: bool,
    pub no_entity_body: bool,
    pub cache: CacheContext,
}

impl MessageContext {
    pub fn request(to: impl Into<String>, payload: Bytes) -> Self {
        Self {
            message_id: format!("urn:uuid:{}", Uuid::new_v4()),
            direction: Direction::Request,
            to: Some(to.into()),
            payload,
            transport_headers: BTreeMap::new(),
            message_type: None,
            content_type: None,
            status: None,
            doing_rest: false,
            no_entity_body: false,
            cache: CacheContext::default(),
        }
    }

    /// The response leg of this exchange. Keeps the message id and the cache context.
    pub fn into_response(
        self,
        status: u16,
        transport_headers: BTreeMap<String, String>,
        payload: Bytes,
    ) -> Self {
        let content_type = transport_headers.get("content-type").cloned();
        Self {
            message_id: self.message_id,
            direction: Direction::Response,
            to: None,
            no_entity_body: payload.is_empty(),
            payload,
            message_type: content_type.clone(),
            content_type,
            transport_headers,
            status: Some(status),
            doing_rest: self.doing_rest,
            cache: self.cache,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_rest(mut self, doing_rest: bool) -> Self {
        self.doing_rest = doing_rest;
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_response(&self) -> bool {
        self.direction == Direction::Response
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.transport_headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.transport_headers
            .insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.transport_headers.remove(&name.to_ascii_lowercase())
    }

    pub fn request_view(&self) -> RequestView<'_> {
        RequestView {
            to: self.to.as_deref(),
            body: &self.payload,
        }
    }

    /// Flat copy of the transport headers plus message type and status.
    pub fn header_snapshot(&self) -> HeaderSnapshot {
        let mut snapshot = self.transport_headers.clone();
        if let Some(message_type) = &self.message_type {
            snapshot.insert(MESSAGE_TYPE_KEY.into(), message_type.clone());
        }
        if let Some(status) = self.status {
            snapshot.insert(STATUS_KEY.into(), status.to_string());
        }
        snapshot
    }

    /// Turns this request into the cached response held by `entry`.
    ///
    /// With a header snapshot the transport headers, message type and status
    /// are replaced wholesale; without one only the payload changes.
    pub(crate) fn replay(&mut self, entry: &CacheEntry) {
        if let Some(payload) = entry.payload() {
            self.payload = payload.clone();
        }
        if let Some(snapshot) = entry.headers() {
            self.no_entity_body = false;
            self.content_type = None;
            self.transport_headers = snapshot
                .iter()
                .filter(|(name, _)| !name.starts_with(':'))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            self.message_type = snapshot.get(MESSAGE_TYPE_KEY).cloned();
            self.status = snapshot.get(STATUS_KEY).and_then(|s| s.parse().ok());
        }
        self.direction = Direction::Response;
        self.to = None;
    }
}
