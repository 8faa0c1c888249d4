use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{clock::millis, error::CacheError, key::Fingerprint};

/// Flat copy of response metadata (transport headers plus message-type and
/// status under reserved keys). Kept flat so each entry serializes on its own.
pub type HeaderSnapshot = BTreeMap<String, String>;

/// A cached response and the bookkeeping needed to decide whether it may be replayed.
///
/// An entry starts out *pending* (no payload) when a request misses, is populated
/// by the collector once the paired response arrives, and is reincarnated back to
/// pending when a later request finds it expired.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    fingerprint: Fingerprint,
    payload: Option<Bytes>,
    headers: Option<HeaderSnapshot>,
    /// Absolute expiry, UNIX milliseconds. 0 until first populated.
    expire_at: u64,
    timeout_ms: u64,
    /// Local "being served" marker. Never replicated and never used as a lock.
    #[serde(skip)]
    in_use: AtomicBool,
}

impl CacheEntry {
    /// Pending placeholder for `fingerprint`, to be populated with `timeout` as TTL.
    pub fn new(fingerprint: Fingerprint, timeout: Duration) -> Self {
        Self {
            fingerprint,
            payload: None,
            headers: None,
            expire_at: 0,
            timeout_ms: millis(timeout),
            in_use: AtomicBool::new(false),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn headers(&self) -> Option<&HeaderSnapshot> {
        self.headers.as_ref()
    }

    pub fn expire_at(&self) -> u64 {
        self.expire_at
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reserved but not yet populated.
    pub fn is_pending(&self) -> bool {
        self.payload.is_none()
    }

    /// `timeout <= 0` or `now > expire_at`. `now == expire_at` is still fresh.
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        self.timeout_ms == 0 || now_millis > self.expire_at
    }

    /// Resets an expired entry to pending with a new expiry window.
    ///
    /// Fails with [`CacheError::InvalidState`] if the entry has not expired.
    pub fn reincarnate(&mut self, timeout: Duration, now_millis: u64) -> Result<(), CacheError> {
        if !self.is_expired_at(now_millis) {
            return Err(CacheError::InvalidState(
                "unexpired cached responses cannot be reincarnated",
            ));
        }
        let timeout_ms = millis(timeout);
        self.payload = None;
        self.headers = None;
        self.expire_at = now_millis.saturating_add(timeout_ms);
        self.timeout_ms = timeout_ms;
        Ok(())
    }

    /// Stores the captured response. The expiry only moves when the entry has a
    /// positive timeout; otherwise it stays permanently expired.
    pub fn populate(&mut self, payload: Bytes, headers: Option<HeaderSnapshot>, now_millis: u64) {
        self.payload = Some(payload);
        self.headers = headers;
        if self.timeout_ms > 0 {
            self.expire_at = now_millis.saturating_add(self.timeout_ms);
        }
    }

    pub fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::SeqCst);
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        Self {
            fingerprint: self.fingerprint.clone(),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            expire_at: self.expire_at,
            timeout_ms: self.timeout_ms,
            in_use: AtomicBool::new(self.is_in_use()),
        }
    }
}
