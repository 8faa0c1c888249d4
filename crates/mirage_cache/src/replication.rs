//! Cluster propagation of store mutations.
//!
//! Stores collect the keys they mutate and, when the caller triggers
//! [`ReplicatedCacheStore::replicate`](crate::ReplicatedCacheStore::replicate),
//! hand a [`ReplicationBatch`] of flat entries to a [`Replicator`]. Delivery is
//! fire-and-forget: a failure is reported to the caller, who logs it and moves on.

use std::{net::SocketAddr, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{entry::CacheEntry, error::CacheError, manager::CacheManager};

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Entries of one scope mutated since the previous replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationBatch {
    pub scope: String,
    pub entries: Vec<CacheEntry>,
}

impl ReplicationBatch {
    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub trait Replicator: Send + Sync + std::fmt::Debug {
    fn replicate(&self, batch: &ReplicationBatch) -> Result<(), CacheError>;
}

/// Single-node deployments: nothing to propagate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReplicator;

impl Replicator for NoopReplicator {
    fn replicate(&self, _batch: &ReplicationBatch) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Sends encoded batches to every peer over UDP from a background task.
#[derive(Debug)]
pub struct UdpReplicator {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    socket: Arc<UdpSocket>,
}

impl UdpReplicator {
    /// Binds the replication socket and starts the sender task.
    pub async fn bind(bind: &str, peers: Vec<SocketAddr>) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let sender = Arc::clone(&socket);

        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                for peer in &peers {
                    if let Err(err) = sender.send_to(&datagram, peer).await {
                        warn!(
                            target: "mirage::replication",
                            peer = %peer,
                            error = %err,
                            "Failed to send replication batch"
                        );
                    }
                }
            }
        });

        Ok(Self { tx, socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Applies batches received from peers to the stores of `manager`.
    pub fn spawn_listener(&self, manager: Arc<CacheManager>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(target: "mirage::replication", error = %err, "Replication socket receive failed");
                        continue;
                    }
                };
                match ReplicationBatch::decode(&buf[..len]) {
                    Ok(batch) => {
                        let applied = manager.apply_replica(batch);
                        debug!(target: "mirage::replication", peer = %from, applied, "Applied replication batch");
                    }
                    Err(err) => {
                        warn!(target: "mirage::replication", peer = %from, error = %err, "Discarding malformed replication batch");
                    }
                }
            }
        })
    }
}

impl Replicator for UdpReplicator {
    fn replicate(&self, batch: &ReplicationBatch) -> Result<(), CacheError> {
        let datagram = batch.encode()?;
        if datagram.len() > MAX_DATAGRAM_BYTES {
            return Err(CacheError::Replication {
                scope: batch.scope.clone(),
                reason: format!(
                    "batch of {} bytes exceeds the {MAX_DATAGRAM_BYTES} byte datagram limit",
                    datagram.len()
                ),
            });
        }
        self.tx.send(datagram).map_err(|_| CacheError::Replication {
            scope: batch.scope.clone(),
            reason: "replication sender task has stopped".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{clock::SystemClock, key::Fingerprint, store::BackstopPolicy};

    fn populated(fp: &str, body: Bytes) -> CacheEntry {
        let mut entry = CacheEntry::new(Fingerprint::from(fp), Duration::from_secs(60));
        entry.populate(body, None, 1_000);
        entry
    }

    #[test]
    fn batch_codec_keeps_entries_flat() {
        let batch = ReplicationBatch {
            scope: "mediation.cache_key".into(),
            entries: vec![populated("abc", Bytes::from_static(b"hello"))],
        };
        let bytes = batch.encode().expect("encode");
        let text = String::from_utf8(bytes.clone()).expect("json");
        assert!(text.contains("\"fingerprint\":\"abc\""));

        let back = ReplicationBatch::decode(&bytes).expect("decode");
        assert_eq!(back.scope, "mediation.cache_key");
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].payload(), Some(&Bytes::from_static(b"hello")));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            ReplicationBatch::decode(b"not json"),
            Err(CacheError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn udp_replication_reaches_peer_store() {
        let peer_manager = Arc::new(CacheManager::new(
            BackstopPolicy::default(),
            Arc::new(SystemClock),
        ));
        let peer = UdpReplicator::bind("127.0.0.1:0", Vec::new())
            .await
            .expect("bind peer");
        let peer_addr = peer.local_addr().expect("peer addr");
        let _listener = peer.spawn_listener(Arc::clone(&peer_manager));

        let origin = UdpReplicator::bind("127.0.0.1:0", vec![peer_addr])
            .await
            .expect("bind origin");
        origin
            .replicate(&ReplicationBatch {
                scope: "mediation.cache_key".into(),
                entries: vec![populated("abc", Bytes::from_static(b"hello"))],
            })
            .expect("queued");

        let store = peer_manager.store("mediation.cache_key", true, 16);
        let mut replicated = None;
        for _ in 0..50 {
            if let Some(entry) = store.get(&Fingerprint::from("abc")) {
                replicated = Some(entry);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let entry = replicated.expect("entry replicated to peer");
        assert_eq!(entry.payload(), Some(&Bytes::from_static(b"hello")));
    }

    #[test]
    fn oversized_batches_are_rejected() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let replicator = rt
            .block_on(UdpReplicator::bind("127.0.0.1:0", Vec::new()))
            .expect("bind");
        let big = Bytes::from(vec![b'x'; MAX_DATAGRAM_BYTES]);
        let err = replicator
            .replicate(&ReplicationBatch {
                scope: "s".into(),
                entries: vec![populated("abc", big)],
            })
            .unwrap_err();
        assert!(matches!(err, CacheError::Replication { .. }));
    }
}
