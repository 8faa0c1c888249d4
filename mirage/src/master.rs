use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, bail};
use mirage_cache::{BackstopPolicy, CacheManager, SystemClock, UdpReplicator};
use mirage_config::MirageConfig;
use mirage_http::RequestLimits;
use mirage_mediator::{CacheMediator, Role, SequenceRegistry};
use tokio::{net::TcpListener, sync::Semaphore};
use tracing::{debug, error, info, instrument};

use crate::{
    upstream::Upstream,
    worker::{Front, handle_connection},
};

pub struct Master {
    cfg: Arc<MirageConfig>,
    manager: Arc<CacheManager>,
    front: Arc<Front>,
}

impl Master {
    /// Builds the cache stores, cluster replication and the two mediators.
    pub async fn build(cfg: MirageConfig) -> anyhow::Result<Self> {
        let backstop = BackstopPolicy {
            since_write: cfg.store().backstop_write(),
            since_access: cfg.store().backstop_access(),
        };
        let mut manager = CacheManager::new(backstop, Arc::new(SystemClock));

        let mut replicator = None;
        if cfg.cluster().enabled() {
            let peers = cfg
                .cluster()
                .peers()
                .iter()
                .map(|peer| {
                    peer.parse::<SocketAddr>()
                        .with_context(|| format!("invalid cluster peer '{peer}'"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let udp = Arc::new(
                UdpReplicator::bind(cfg.cluster().bind(), peers)
                    .await
                    .with_context(|| format!("failed to bind cluster socket {}", cfg.cluster().bind()))?,
            );
            info!(
                target: "mirage::master",
                bind = %cfg.cluster().bind(),
                peers = cfg.cluster().peers().len(),
                "Cluster replication enabled"
            );
            manager = manager.with_cluster(udp.clone());
            replicator = Some(udp);
        }

        let manager = Arc::new(manager);
        if let Some(udp) = &replicator {
            udp.spawn_listener(Arc::clone(&manager));
        }
        manager.spawn_sweeper(cfg.store().sweep_interval());

        let sequences = Arc::new(SequenceRegistry::from_config(cfg.sequences())?);
        let requester = build_mediator(&cfg, cfg.server().request_mediator(), Role::Requester, &manager, &sequences)?;
        let collector = build_mediator(&cfg, cfg.server().response_mediator(), Role::Collector, &manager, &sequences)?;

        let server = cfg.server();
        let front = Front {
            requester,
            collector,
            upstream: Upstream::from_config(server),
            limits: RequestLimits {
                idle_timeout: server.client_read_timeout(),
                read_timeout: server.client_read_timeout(),
                max_headers: server.max_request_headers_bytes as usize,
                max_body: server.max_request_body_bytes as usize,
            },
            keepalive_timeout: server.keepalive_timeout(),
        };

        Ok(Self {
            cfg: Arc::new(cfg),
            manager,
            front: Arc::new(front),
        })
    }

    /// Binds the listener and serves connections until the accept loop fails.
    #[instrument(skip(self), fields(
        listen = %self.cfg.server().listen(),
        upstream = %self.cfg.server().upstream(),
        worker_connections = %self.cfg.global().worker_connections(),
    ))]
    pub async fn run(self) -> anyhow::Result<()> {
        info!(target: "mirage::master", "Starting MIRAGE MASTER");

        let listen_addr = self.cfg.server().listen().to_string();
        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(l) => {
                info!(target: "mirage::master", listen = %listen_addr, "Bind() successful");
                l
            }
            Err(e) => {
                error!(
                    target: "mirage::master",
                    listen = %listen_addr,
                    error = ?e,
                    "Failed to bind listener"
                );
                return Err(e.into());
            }
        };

        let max_conns = self.cfg.global().worker_connections() as usize;
        let semaphore = Arc::new(Semaphore::new(max_conns));
        info!(
            target: "mirage::master",
            max_conns,
            stores = self.manager.stores().len(),
            "Global connection semaphore initialized"
        );

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(
                        target: "mirage::master",
                        listen = %listen_addr,
                        error = ?e,
                        "Failed to accept connection"
                    );
                    return Err(e.into());
                }
            };

            let permit = Arc::clone(&semaphore).acquire_owned().await?;
            debug!(
                target: "mirage::master",
                client_addr = %addr,
                available = semaphore.available_permits(),
                "New connection accepted"
            );

            let front = Arc::clone(&self.front);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(Box::new(stream), addr, front).await {
                    error!(
                        target: "mirage::worker",
                        client_addr = %addr,
                        error = ?e,
                        "Error handling connection"
                    );
                }
                drop(permit);
            });
        }
    }
}

fn build_mediator(
    cfg: &MirageConfig,
    name: &str,
    role: Role,
    manager: &CacheManager,
    sequences: &Arc<SequenceRegistry>,
) -> anyhow::Result<CacheMediator> {
    let Some(mediator_cfg) = cfg.mediator(name) else {
        bail!("mediator '{name}' is not defined");
    };
    let mediator = CacheMediator::from_config(name, mediator_cfg, manager, Arc::clone(sequences))?;
    if mediator.role() != role {
        bail!("mediator '{name}' is a {} but is wired as the {role}", mediator.role());
    }
    info!(
        target: "mirage::master",
        mediator = %name,
        role = %role,
        scope = %mediator.store().scope(),
        "Cache mediator ready"
    );
    Ok(mediator)
}
