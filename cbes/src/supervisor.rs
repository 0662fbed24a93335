//! Owns the startup and shutdown sequence (`spec.md` §4.7, component C7):
//! composes C1-C6 into a running process and tears them down in the right
//! order when any of them fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig};
use cbes_types::{BucketUuid, Partition, SeqNo};
use checkpoint_service::{CheckpointService, InitError, LiveSeqnoProvider};
use checkpoint_store::{CheckpointStore, MemoryCollection};
use clock::{SystemProvider, TimeProvider};
use membership::ConfigError as MembershipError;
use metric::Registry;
use observability_deps::tracing::{error, info, warn};
use replication_pipeline::{DcpClient, DcpPipeline, DcpPipelineError};
use request_factory::{RequestFactory, TracingRejectSink};
use thiserror::Error;
use worker_group::{HttpIndexClient, IndexClient, WorkerGroup};

use crate::config::{Config, ConfigFile, ConfigFileError, GroupConfigError};
use crate::metrics_server::{self, MetricsServer};
use crate::replica_watcher::{NullReplicaWatcher, ReplicaWatcher};

/// A typical Couchbase bucket's vbucket count. The real source reports its
/// partition count itself over the wire; the mock must be told.
const DEFAULT_NUM_PARTITIONS: u32 = 1024;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("resolving group membership: {0}")]
    Group(#[from] GroupConfigError),
    #[error("loading config file: {0}")]
    ConfigFile(#[from] ConfigFileError),
    #[error("membership: {0}")]
    Membership(#[from] MembershipError),
    #[error("connecting to the source: {0}")]
    Source(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("connecting the replication pipeline: {0}")]
    Pipeline(#[from] DcpPipelineError),
    #[error("initializing checkpoints: {0}")]
    CheckpointInit(#[from] InitError),
    #[error("starting the worker group: {0}")]
    WorkerGroup(#[from] worker_group::StateError),
    #[error("binding the metrics server: {0}")]
    Metrics(#[from] hyper::Error),
    #[error("building the HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// `spec.md` §4.3 `init`'s `LiveSeqnoProvider` against the only source
/// backend this repository implements: since [`replication_pipeline::mock::MockDcpClient`]
/// retains no history, any partition with no stored checkpoint is treated
/// as brand new (`SeqNo::BEGINNING`), never a genuinely-live watermark.
#[derive(Debug)]
struct DcpLiveSeqnoProvider {
    client: Arc<dyn DcpClient>,
}

#[async_trait]
impl LiveSeqnoProvider for DcpLiveSeqnoProvider {
    async fn live_state(&self, _partition: Partition) -> Result<(BucketUuid, SeqNo), InitError> {
        Ok((self.client.bucket_uuid(), SeqNo::BEGINNING))
    }
}

/// Runs until a fatal error is latched or the process receives a
/// termination signal, at which point it shuts down gracefully and
/// returns.
pub async fn run(config: Config) -> Result<(), SupervisorError> {
    // Step 1: resolve this process's slice of the partition space without
    // yet knowing the source's real partition count (`spec.md` §4.1).
    let membership = config.group.resolve_membership()?;
    info!(
        member = membership.member_number,
        cluster_size = membership.cluster_size,
        "membership resolved"
    );

    let config_file = ConfigFile::load(&config.config_file)?;

    let registry = Arc::new(Registry::new());

    // Step 2: open the index client and wait for it to come up.
    let http = build_http_client(config.index.path_to_ca_certificate.as_deref())?;
    wait_for_index(&http, &config.index.base_url, &config.index.min_version).await?;
    let index_client: Arc<dyn IndexClient> =
        Arc::new(HttpIndexClient::new(http.clone(), &config.index.base_url));

    // Step 3: open the source client for the configured dataset. The real
    // wire protocol is a boundary component (`spec.md` §1); this
    // repository only ever runs against the mock.
    let dcp_client: Arc<dyn DcpClient> = Arc::new(replication_pipeline::mock::MockDcpClient::new(
        config.source.dataset.clone(),
        DEFAULT_NUM_PARTITIONS,
    ));
    dcp_client
        .connect(config.source.connect_timeout())
        .await
        .map_err(|err| SupervisorError::Source(err.to_string()))?;
    let num_partitions = dcp_client
        .num_partitions()
        .await
        .map_err(|err| SupervisorError::Source(err.to_string()))?;
    let partitions = membership.partitions_of(num_partitions)?;
    info!(count = partitions.len(), "owned partitions resolved");

    // Step 4: the checkpoint store, backed by the same boundary
    // substitution as the source client (`spec.md` §1).
    let collection = Arc::new(MemoryCollection::new());
    let store = CheckpointStore::new(config.group.name.clone(), collection);

    // Step 5: CheckpointService, RequestFactory, WorkerGroup.
    let live_seqno = DcpLiveSeqnoProvider {
        client: Arc::clone(&dcp_client),
    };
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
    let checkpoint_service = Arc::new(
        CheckpointService::init(store, &partitions, &live_seqno, time_provider, &registry).await?,
    );
    let checkpoint_handle = checkpoint_service.handle();

    let request_factory = Arc::new(RequestFactory::new(
        config_file.rules,
        &registry,
        Arc::new(TracingRejectSink),
    ));

    let worker_group_config = config.group.worker_group_config(&config.bulk);
    let worker_group = WorkerGroup::new(
        worker_group_config,
        Arc::clone(&index_client),
        checkpoint_handle.clone(),
        &registry,
    );
    worker_group.start()?;
    let worker_handle = worker_group.handle();
    let fatal_slot = worker_group.fatal_slot();

    // Step 6: DcpPipeline, seeded from the checkpoints just loaded.
    // `connect` redoes the (idempotent) connect-and-discover handshake;
    // the real transport is cheap to ask twice, and this keeps
    // `DcpPipeline`'s own invariant ("constructed, then seeded, then
    // started") intact even though partition ownership had to be known a
    // step earlier than `spec.md` §4.7 lists it, to seed the checkpoint
    // service.
    let mut pipeline =
        DcpPipeline::connect(Arc::clone(&dcp_client), membership, config.source.connect_timeout()).await?;

    let starts = pipeline.init_session_state(&checkpoint_handle);

    // Step 7 already happened above (`worker_group.start()`), ahead of
    // streaming so no submitted request is ever rejected as not-running.

    // Step 8: quiet period, letting peers with stale membership terminate.
    let quiet = config.group.startup_quiet_period();
    if !quiet.is_zero() {
        info!(?quiet, "observing startup quiet period");
        tokio::time::sleep(quiet).await;
    }

    pipeline
        .start_streaming(
            starts,
            Arc::clone(&request_factory),
            worker_handle,
            checkpoint_handle.clone(),
            Arc::clone(&fatal_slot),
        )
        .await?;

    // Step 13: the metrics endpoint's liveness doubles as the startup
    // complete probe.
    let metrics = metrics_server::serve(config.metrics.http_port, Arc::clone(&registry))?;

    let replica_watcher: Arc<dyn ReplicaWatcher> = Arc::new(NullReplicaWatcher);
    let checkpoint_flush_interval = config.group.checkpoint_flush_interval();

    let outcome = run_until_shutdown(
        &checkpoint_service,
        checkpoint_flush_interval,
        &fatal_slot,
        &*replica_watcher,
        membership.member_number,
        config.group.k8s_watch_replicas,
    )
    .await;

    shutdown(pipeline, worker_group, checkpoint_service, metrics, outcome.is_graceful()).await;

    match outcome {
        RunOutcome::Graceful => Ok(()),
        RunOutcome::Fatal(msg) => Err(SupervisorError::Fatal(msg)),
    }
}

enum RunOutcome {
    Graceful,
    Fatal(String),
}

impl RunOutcome {
    fn is_graceful(&self) -> bool {
        matches!(self, RunOutcome::Graceful)
    }
}

/// Step 14: block until a fatal error is latched, the replica watcher
/// reports an external rescale, the periodic checkpoint flush loop needs
/// to run, or the process is asked to terminate.
async fn run_until_shutdown(
    checkpoint_service: &CheckpointService,
    flush_interval: Duration,
    fatal_slot: &worker_group::FatalSlot,
    replica_watcher: &dyn ReplicaWatcher,
    started_with: u32,
    watch_replicas: bool,
) -> RunOutcome {
    let mut ticker = tokio::time::interval(flush_interval.min(Duration::from_secs(1)).max(Duration::from_millis(100)));

    loop {
        tokio::select! {
            fatal = fatal_slot.await_error() => {
                error!(%fatal, "fatal error latched, shutting down");
                return RunOutcome::Fatal(fatal.0);
            }
            _ = replica_watcher.watch_for_change(started_with), if watch_replicas => {
                error!("external replica count changed, shutting down");
                return RunOutcome::Fatal("cluster size changed while running".to_string());
            }
            _ = signal_terminate() => {
                info!("termination signal received, shutting down gracefully");
                return RunOutcome::Graceful;
            }
            _ = ticker.tick() => {
                if checkpoint_service.is_dirty() || checkpoint_service.save_due(flush_interval) {
                    if let Err(err) = checkpoint_service.save().await {
                        warn!(%err, "periodic checkpoint flush failed, will retry next tick");
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
async fn signal_terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn signal_terminate() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Shutdown (`spec.md` §4.7): disconnect the source before closing the
/// worker group (draining relies on every `WorkerGroupHandle` having been
/// dropped), then save checkpoints only on the graceful path.
async fn shutdown(
    mut pipeline: DcpPipeline,
    worker_group: WorkerGroup,
    checkpoint_service: Arc<CheckpointService>,
    metrics: MetricsServer,
    graceful: bool,
) {
    pipeline.disconnect().await;
    worker_group.close().await;
    metrics.shutdown().await;

    if graceful {
        if let Err(err) = checkpoint_service.save().await {
            error!(%err, "final checkpoint save failed during shutdown");
        }
    }
}

fn build_http_client(ca_certificate: Option<&std::path::Path>) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(path) = ca_certificate {
        if let Ok(pem) = std::fs::read(path) {
            if let Ok(cert) = reqwest::Certificate::from_pem(&pem) {
                builder = builder.add_root_certificate(cert);
            }
        }
    }
    builder.build()
}

/// `spec.md` §4.7 step 2: wait for the index to respond, warning (but not
/// failing) if its reported version falls outside the configured floor.
/// Retries indefinitely with full-jitter backoff, mirroring the worker
/// group's own "never give up" retry policy.
async fn wait_for_index(http: &reqwest::Client, base_url: &str, min_version: &str) -> Result<(), SupervisorError> {
    let mut backoff = Backoff::new(&BackoffConfig::default());
    let response = backoff
        .retry_all_errors("index connect", || async {
            http.get(base_url).send().await?.json::<serde_json::Value>().await
        })
        .await
        .expect("backoff retries indefinitely and never returns Err");

    let reported = response
        .get("version")
        .and_then(|v| v.get("number"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    if reported != "unknown" && reported.split('.').next() != min_version.split('.').next() {
        warn!(reported, min_version, "index reports a version outside the configured range");
    } else {
        info!(reported, "connected to index");
    }

    Ok(())
}
