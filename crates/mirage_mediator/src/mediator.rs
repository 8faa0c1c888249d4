//! The two-phase cache mediator.
//!
//! A requester sits on the request leg: it fingerprints the request, serves a
//! fresh cached response when there is one, and otherwise reserves an entry
//! and lets the request through. A collector sits on the response leg and
//! fills in the entry the requester handed over through the message's
//! [`CacheContext`](crate::CacheContext).
//!
//! Per fingerprint: `UNKNOWN → PENDING → FRESH → EXPIRED → PENDING …`

use std::{fmt, sync::Arc, time::Duration};

use mirage_cache::{
    CacheEntry, CacheManager, DigestGenerator, Fingerprint, ReplicatedCacheStore,
    resolve_generator,
};
use mirage_config::{CacheScope, MediatorConfig};
use tracing::{debug, trace, warn};

use crate::{
    error::MediatorError,
    message::{Direction, MessageContext},
    sequence::{InlineSequence, Sequence, SequenceRegistry},
    stats::{MediatorStats, StatsSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Requester,
    Collector,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requester => f.write_str("requester"),
            Self::Collector => f.write_str("collector"),
        }
    }
}

/// What a requester does after rebuilding a cached response.
#[derive(Debug, Clone)]
pub enum OnCacheHit {
    /// Send the rebuilt response straight back.
    Respond,
    /// Run a sequence from the registry by name.
    Sequence(String),
    Inline(Arc<InlineSequence>),
}

/// Verdict of one mediation, acted upon by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep processing: forward the request downstream, or the response to the caller.
    Continue,
    /// The message now holds a cached response; send it back to the caller.
    Respond,
    /// An on-hit sequence took the message over; nothing more to send.
    Handled,
}

#[derive(Debug, Clone)]
pub struct MediatorSettings {
    pub name: String,
    pub role: Role,
    /// TTL given to entries this mediator reserves.
    pub timeout: Duration,
    /// Handed to the collector with the entry. 0 caches responses of any size.
    pub max_message_size: usize,
    pub generator: Arc<dyn DigestGenerator>,
    pub on_cache_hit: OnCacheHit,
}

#[derive(Debug)]
pub struct CacheMediator {
    settings: MediatorSettings,
    store: Arc<ReplicatedCacheStore>,
    sequences: Arc<SequenceRegistry>,
    stats: MediatorStats,
}

impl CacheMediator {
    pub fn new(
        settings: MediatorSettings,
        store: Arc<ReplicatedCacheStore>,
        sequences: Arc<SequenceRegistry>,
    ) -> Self {
        Self {
            settings,
            store,
            sequences,
            stats: MediatorStats::default(),
        }
    }

    /// Builds a mediator from its `[mediator.<name>]` section, resolving its
    /// store through `manager` and its digest strategy by name.
    pub fn from_config(
        name: &str,
        cfg: &MediatorConfig,
        manager: &CacheManager,
        sequences: Arc<SequenceRegistry>,
    ) -> Result<Self, MediatorError> {
        if cfg.scope() == CacheScope::PerMediator && cfg.id().is_none() {
            return Err(MediatorError::Config(format!(
                "mediator '{name}': id is required for a cache with scope 'per-mediator'"
            )));
        }

        let role = if cfg.is_collector() {
            Role::Collector
        } else {
            Role::Requester
        };

        let on_cache_hit = match (role, cfg.on_cache_hit()) {
            (Role::Requester, Some(hit)) => match &hit.sequence {
                Some(seq) if !sequences.contains(seq) => {
                    return Err(MediatorError::UnknownSequence(seq.clone()));
                }
                Some(seq) => OnCacheHit::Sequence(seq.clone()),
                None if !hit.steps.is_empty() => OnCacheHit::Inline(Arc::new(
                    InlineSequence::from_config(format!("{name}.on_cache_hit"), &hit.steps)?,
                )),
                None => OnCacheHit::Respond,
            },
            _ => OnCacheHit::Respond,
        };

        if role == Role::Requester && cfg.disk_size().is_some() {
            warn!(
                target: "mirage::mediator",
                mediator = %name,
                "Disk based and hierarchical caching is not implemented yet"
            );
        }

        let store = manager.store(
            &cfg.store_name(),
            cfg.scope() == CacheScope::Distributed,
            cfg.in_memory_size(),
        );

        let settings = MediatorSettings {
            name: name.to_string(),
            role,
            timeout: cfg.timeout(),
            max_message_size: cfg.max_message_size(),
            generator: resolve_generator(cfg.hash_generator(), cfg.digest_algorithm())?,
            on_cache_hit,
        };
        Ok(Self::new(settings, store, sequences))
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn role(&self) -> Role {
        self.settings.role
    }

    pub fn store(&self) -> &Arc<ReplicatedCacheStore> {
        &self.store
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs the phase matching this mediator's role.
    ///
    /// A message travelling the wrong way for the role is rejected outright.
    pub fn mediate(&self, ctx: &mut MessageContext) -> Result<Flow, MediatorError> {
        trace!(
            target: "mirage::mediator",
            mediator = %self.settings.name,
            message_id = %ctx.message_id(),
            scope = %self.store.scope(),
            "Start: cache mediator"
        );
        let flow = match (self.settings.role, ctx.direction()) {
            (Role::Requester, Direction::Request) => self.process_request(ctx),
            (Role::Collector, Direction::Response) => {
                self.process_response(ctx);
                Ok(Flow::Continue)
            }
            (role, direction) => Err(MediatorError::RoleMismatch { role, direction }),
        };
        trace!(target: "mirage::mediator", mediator = %self.settings.name, "End: cache mediator");
        flow
    }

    fn process_request(&self, ctx: &mut MessageContext) -> Result<Flow, MediatorError> {
        let fingerprint = self
            .settings
            .generator
            .digest(&ctx.request_view())?
            .ok_or_else(|| MediatorError::NoFingerprint {
                message_id: ctx.message_id().to_string(),
            })?;
        debug!(
            target: "mirage::mediator",
            message_id = %ctx.message_id(),
            fingerprint = %fingerprint,
            "Generated request hash"
        );

        let cached = self.store.get(&fingerprint);
        ctx.cache.fingerprint = Some(fingerprint.clone());
        ctx.cache.store = Some(Arc::clone(&self.store));
        ctx.cache.max_message_size = self.settings.max_message_size;

        let now = self.store.now_millis();
        match cached {
            Some(entry) if !entry.is_pending() && !entry.is_expired_at(now) => {
                self.serve_hit(ctx, entry)
            }
            Some(mut entry) if !entry.is_pending() => {
                entry.reincarnate(self.settings.timeout, now)?;
                self.stats.reincarnation();
                debug!(
                    target: "mirage::mediator",
                    fingerprint = %fingerprint,
                    "Existing cached response has expired. Resetting cache element"
                );
                self.store.put(entry.clone());
                ctx.cache.cached = Some(entry);
                self.replicate();
                Ok(Flow::Continue)
            }
            _ => {
                self.cache_new_response(ctx, fingerprint);
                Ok(Flow::Continue)
            }
        }
    }

    fn serve_hit(&self, ctx: &mut MessageContext, entry: CacheEntry) -> Result<Flow, MediatorError> {
        self.stats.hit();
        debug!(
            target: "mirage::mediator",
            message_id = %ctx.message_id(),
            fingerprint = %entry.fingerprint(),
            "Cache-hit"
        );

        let fingerprint = entry.fingerprint().clone();
        entry.set_in_use(true);
        self.store.set_in_use(&fingerprint, true);

        ctx.replay(&entry);
        ctx.cache.cached = Some(entry);

        let flow = self.run_on_cache_hit(ctx);

        self.store.set_in_use(&fingerprint, false);
        if let Some(entry) = &ctx.cache.cached {
            entry.set_in_use(false);
        }
        flow
    }

    fn run_on_cache_hit(&self, ctx: &mut MessageContext) -> Result<Flow, MediatorError> {
        let sequence: Arc<dyn Sequence> = match &self.settings.on_cache_hit {
            OnCacheHit::Respond => {
                debug!(
                    target: "mirage::mediator",
                    message_id = %ctx.message_id(),
                    scope = %self.store.scope(),
                    "Request message was served from the cache"
                );
                return Ok(Flow::Respond);
            }
            OnCacheHit::Sequence(name) => self
                .sequences
                .get(name)
                .ok_or_else(|| MediatorError::UnknownSequence(name.clone()))?,
            OnCacheHit::Inline(seq) => Arc::clone(seq) as Arc<dyn Sequence>,
        };

        debug!(
            target: "mirage::mediator",
            sequence = %sequence.name(),
            "Delegating message to the on-cache-hit sequence"
        );
        match sequence.mediate(ctx) {
            Ok(true) => Ok(Flow::Respond),
            Ok(false) => Ok(Flow::Handled),
            Err(err) => Err(MediatorError::Sequence {
                name: sequence.name().to_string(),
                reason: format!("{err:#}"),
            }),
        }
    }

    /// Reserves a pending entry for a request that missed.
    fn cache_new_response(&self, ctx: &mut MessageContext, fingerprint: Fingerprint) {
        self.stats.miss();
        let entry = CacheEntry::new(fingerprint, self.settings.timeout);
        self.store.put(entry.clone());
        ctx.cache.cached = Some(entry);
        self.replicate();
    }

    fn process_response(&self, ctx: &mut MessageContext) {
        let Some(mut entry) = ctx.cache.cached.take() else {
            trace!(
                target: "mirage::mediator",
                message_id = %ctx.message_id(),
                "No cached object on the exchange; nothing to collect"
            );
            return;
        };
        let store = ctx
            .cache
            .store
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.store));

        let max = ctx.cache.max_message_size;
        if max > 0 && ctx.payload.len() > max {
            self.stats.oversized();
            debug!(
                target: "mirage::mediator",
                fingerprint = %entry.fingerprint(),
                size = ctx.payload.len(),
                max,
                "Response message size exceeds the upper bound for caching, response will not be cached"
            );
            ctx.cache.cached = Some(entry);
            return;
        }

        debug!(
            target: "mirage::mediator",
            message_id = %ctx.message_id(),
            fingerprint = %entry.fingerprint(),
            scope = %store.scope(),
            "Storing the response message into the cache"
        );
        let headers = ctx.doing_rest.then(|| ctx.header_snapshot());
        entry.populate(ctx.payload.clone(), headers, store.now_millis());
        store.put(entry.clone());
        ctx.cache.cached = Some(entry);
        self.stats.stored();

        if let Err(err) = store.replicate() {
            self.replication_failed(&err);
        }
    }

    fn replicate(&self) {
        if let Err(err) = self.store.replicate() {
            self.replication_failed(&err);
        }
    }

    fn replication_failed(&self, err: &mirage_cache::CacheError) {
        self.stats.replication_failure();
        warn!(
            target: "mirage::replication",
            mediator = %self.settings.name,
            error = %err,
            "Unable to replicate cache mediator state among the cluster"
        );
    }
}
