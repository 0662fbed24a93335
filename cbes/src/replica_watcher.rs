//! External replica-count watching (`spec.md` §6 `CBES_K8S_WATCH_REPLICAS`,
//! §7 class 8).
//!
//! The real watcher talks to an orchestration API to learn when the peer
//! group is rescaled; that API is, like the source replication protocol, a
//! boundary component with no in-repo implementation (`spec.md` §1). Only
//! the trait and a no-op implementation live here; wiring a real watcher is
//! future work, not a gap this repository's tests paper over.

use async_trait::async_trait;

/// Resolves once the external cluster-size resource reports a value
/// different from the one this process started with — a fatal condition
/// (`spec.md` §7 class 8), handled identically to a `DcpPipeline` protocol
/// fault.
#[async_trait]
pub trait ReplicaWatcher: std::fmt::Debug + Send + Sync + 'static {
    async fn watch_for_change(&self, started_with: u32);
}

/// The only implementation available in this repository: never reports a
/// change. Selected whenever `--k8s-watch-replicas` is unset, and also when
/// it *is* set, since there is no real watcher backend to hand off to.
#[derive(Debug, Default)]
pub struct NullReplicaWatcher;

#[async_trait]
impl ReplicaWatcher for NullReplicaWatcher {
    async fn watch_for_change(&self, _started_with: u32) {
        std::future::pending().await
    }
}
