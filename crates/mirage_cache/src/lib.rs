pub mod clock;
pub mod digest;
pub mod entry;
pub mod error;
pub mod key;
pub mod manager;
pub mod replication;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use digest::{
    DigestAlgorithm, DigestError, DigestGenerator, DigestStrategy, PayloadDigest, RequestView,
    UrlDigest, resolve_generator,
};
pub use entry::{CacheEntry, HeaderSnapshot};
pub use error::CacheError;
pub use key::Fingerprint;
pub use manager::CacheManager;
pub use replication::{NoopReplicator, ReplicationBatch, Replicator, UdpReplicator};
pub use store::{BackstopPolicy, ReplicatedCacheStore};
