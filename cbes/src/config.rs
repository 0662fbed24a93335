//! Command-line, environment, and config-file configuration for the
//! Supervisor (`spec.md` §6, component C7).
//!
//! Precedence, highest first: command line flags, environment variables,
//! built-in defaults — standard `clap` `env` semantics. The one exception
//! is the set of per-type index rules, which has no sane CLI/env shape and
//! comes only from `--config-file`'s `rules` section.

use std::path::PathBuf;
use std::time::Duration;

use backoff::BackoffConfig;
use cbes_types::TypeRule;
use membership::{ConfigError, Membership, MAX_CLUSTER_SIZE};
use observability_deps::tracing::warn;
use serde::Deserialize;
use thiserror::Error;
use worker_group::{BatchThresholds, WorkerGroupConfig};

#[derive(Debug, clap::Parser)]
#[clap(
    name = "cbes",
    about = "Streams mutations from a partitioned source database into a search index cluster",
    long_about = "Configuration is loaded from the following sources (highest precedence first):\n\
        - command line flags\n\
        - environment variables\n\
        - the declarative --config-file, which additionally supplies per-type index rules"
)]
pub struct Config {
    #[clap(flatten)]
    pub group: GroupConfig,

    #[clap(flatten)]
    pub bulk: BulkConfig,

    #[clap(flatten)]
    pub source: SourceConfig,

    #[clap(flatten)]
    pub index: IndexConfig,

    #[clap(flatten)]
    pub metrics: MetricsConfig,

    #[clap(flatten)]
    pub logging: LoggingConfig,

    /// Declarative config file; see `ConfigFile` for its shape.
    #[clap(long = "config-file", env = "CBES_CONFIG_FILE")]
    pub config_file: PathBuf,
}

#[derive(Debug, clap::Parser)]
pub struct GroupConfig {
    #[clap(long = "group-name", env = "CBES_GROUP_NAME", default_value = "cbes")]
    pub name: String,

    /// Static 1-based member number. Ignored when `--k8s-stateful-set` is
    /// set.
    #[clap(long = "member-number", env = "CBES_MEMBER_NUMBER")]
    pub member_number: Option<u32>,

    /// `spec.md` §6 `CBES_TOTAL_MEMBERS`.
    #[clap(long = "total-members", env = "CBES_TOTAL_MEMBERS")]
    pub cluster_size: u32,

    /// `spec.md` §6 `CBES_K8S_STATEFUL_SET`: derive the member number from
    /// this pod's ordinal suffix in `$HOSTNAME`.
    #[clap(long = "k8s-stateful-set", env = "CBES_K8S_STATEFUL_SET")]
    pub k8s_stateful_set: bool,

    /// `spec.md` §6 `CBES_K8S_WATCH_REPLICAS`: watch an external resource
    /// for cluster-size changes; any change is fatal.
    #[clap(long = "k8s-watch-replicas", env = "CBES_K8S_WATCH_REPLICAS")]
    pub k8s_watch_replicas: bool,

    /// Worker contexts sized to handle bulk dispatch (`spec.md` §5
    /// `workerThreads`); also the docId hash-shard count in `worker_group`.
    #[clap(long = "worker-threads", env = "CBES_WORKER_THREADS", default_value = "4")]
    pub worker_threads: usize,

    /// `spec.md` §4.7 step 8: delay before streaming starts, to let peers
    /// with stale membership terminate first.
    #[clap(
        long = "startup-quiet-period-secs",
        env = "CBES_STARTUP_QUIET_PERIOD_SECS",
        default_value = "0"
    )]
    pub startup_quiet_period_secs: u64,

    #[clap(
        long = "checkpoint-flush-interval-secs",
        env = "CBES_CHECKPOINT_FLUSH_INTERVAL_SECS",
        default_value = "10"
    )]
    pub checkpoint_flush_interval_secs: u64,
}

#[derive(Debug, Error)]
pub enum GroupConfigError {
    #[error("--k8s-stateful-set is set but $HOSTNAME is not")]
    MissingHostname,
    #[error("$HOSTNAME {0:?} has no numeric ordinal suffix")]
    UnparsablePodOrdinal(String),
    #[error("--member-number is required unless --k8s-stateful-set is set")]
    MissingMemberNumber,
    #[error(transparent)]
    Membership(#[from] ConfigError),
}

impl GroupConfig {
    /// Resolve the member number: the pod-ordinal-derived value under
    /// `k8s_stateful_set`, otherwise the static override (`spec.md` §4.1,
    /// §6).
    pub fn member_number(&self) -> Result<u32, GroupConfigError> {
        if self.k8s_stateful_set {
            return pod_ordinal().map(|ordinal| ordinal + 1);
        }
        self.member_number.ok_or(GroupConfigError::MissingMemberNumber)
    }

    /// Validate `{memberNumber, clusterSize}` without yet knowing the
    /// source's real partition count, by temporarily treating it as
    /// [`MAX_CLUSTER_SIZE`] (`spec.md` §4.1: "the Supervisor temporarily
    /// treats N as 1024 during config validation, then replaces it before
    /// starting C6").
    pub fn resolve_membership(&self) -> Result<Membership, GroupConfigError> {
        let membership = Membership {
            member_number: self.member_number()?,
            cluster_size: self.cluster_size,
        };
        membership.partitions_of(MAX_CLUSTER_SIZE)?;
        Ok(membership)
    }

    pub fn startup_quiet_period(&self) -> Duration {
        Duration::from_secs(self.startup_quiet_period_secs)
    }

    pub fn checkpoint_flush_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_flush_interval_secs)
    }

    pub fn worker_group_config(&self, bulk: &BulkConfig) -> WorkerGroupConfig {
        WorkerGroupConfig {
            shard_count: self.worker_threads.max(1),
            queue_capacity_per_shard: bulk.queue_capacity_per_shard(self.worker_threads.max(1)),
            thresholds: bulk.thresholds(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn pod_ordinal() -> Result<u32, GroupConfigError> {
    let hostname = std::env::var("HOSTNAME").map_err(|_| GroupConfigError::MissingHostname)?;
    hostname
        .rsplit('-')
        .next()
        .and_then(|ordinal| ordinal.parse::<u32>().ok())
        .ok_or(GroupConfigError::UnparsablePodOrdinal(hostname))
}

#[derive(Debug, clap::Parser)]
pub struct BulkConfig {
    #[clap(long = "bulk-max-docs", env = "CBES_BULK_MAX_DOCS", default_value = "500")]
    pub max_docs: usize,

    #[clap(
        long = "bulk-max-bytes",
        env = "CBES_BULK_MAX_BYTES",
        default_value = "5242880"
    )]
    pub max_bytes: usize,

    /// Upper bound on bytes pending across a shard's queue before
    /// submission blocks; converted to a document-count queue capacity
    /// since `worker_group`'s channel is sized in documents, not bytes.
    #[clap(
        long = "bulk-max-pending-bytes",
        env = "CBES_BULK_MAX_PENDING_BYTES",
        default_value = "52428800"
    )]
    pub max_pending_bytes: usize,

    #[clap(
        long = "bulk-flush-deadline-millis",
        env = "CBES_BULK_FLUSH_DEADLINE_MILLIS",
        default_value = "200"
    )]
    pub flush_deadline_millis: u64,
}

impl BulkConfig {
    pub fn thresholds(&self) -> BatchThresholds {
        BatchThresholds {
            max_docs: self.max_docs,
            max_bytes: self.max_bytes,
            flush_deadline: Duration::from_millis(self.flush_deadline_millis),
        }
    }

    /// `maxPendingBytes` worth of batches, in documents, spread evenly over
    /// the shards.
    fn queue_capacity_per_shard(&self, shard_count: usize) -> usize {
        let pending_batches = (self.max_pending_bytes / self.max_bytes.max(1)).max(1);
        (pending_batches * self.max_docs / shard_count.max(1)).max(1)
    }
}

#[derive(Debug, clap::Parser)]
pub struct SourceConfig {
    /// Which dataset on the source to stream (`spec.md` §4.7 step 3).
    #[clap(long = "source-dataset", env = "CBES_SOURCE_DATASET")]
    pub dataset: String,

    #[clap(
        long = "source-connect-timeout-secs",
        env = "CBES_SOURCE_CONNECT_TIMEOUT_SECS",
        default_value = "30"
    )]
    pub connect_timeout_secs: u64,

    /// Replacement for the deprecated top-level `truststore` block
    /// (`spec.md` §6).
    #[clap(long = "source-ca-certificate", env = "CBES_SOURCE_CA_CERTIFICATE")]
    pub path_to_ca_certificate: Option<PathBuf>,
}

impl SourceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, clap::Parser)]
pub struct IndexConfig {
    #[clap(long = "index-base-url", env = "CBES_INDEX_BASE_URL")]
    pub base_url: String,

    #[clap(
        long = "index-min-version",
        env = "CBES_INDEX_MIN_VERSION",
        default_value = "7.0.0"
    )]
    pub min_version: String,

    #[clap(long = "index-ca-certificate", env = "CBES_INDEX_CA_CERTIFICATE")]
    pub path_to_ca_certificate: Option<PathBuf>,
}

#[derive(Debug, clap::Parser)]
pub struct MetricsConfig {
    #[clap(long = "metrics-http-port", env = "CBES_METRICS_HTTP_PORT", default_value = "9090")]
    pub http_port: u16,

    #[clap(
        long = "metrics-log-interval-secs",
        env = "CBES_METRICS_LOG_INTERVAL_SECS",
        default_value = "60"
    )]
    pub log_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
pub enum RedactionLevel {
    None,
    Partial,
    Full,
}

#[derive(Debug, clap::Parser)]
pub struct LoggingConfig {
    #[clap(
        long = "log-filter",
        env = "CBES_LOG_FILTER",
        default_value = "cbes=info,warn"
    )]
    pub filter: String,

    #[clap(long = "log-format-json", env = "CBES_LOG_FORMAT_JSON")]
    pub json: bool,

    #[clap(
        long = "log-redaction-level",
        env = "CBES_LOG_REDACTION_LEVEL",
        arg_enum,
        default_value = "partial"
    )]
    pub redaction_level: RedactionLevel,

    #[clap(long = "log-document-lifecycle", env = "CBES_LOG_DOCUMENT_LIFECYCLE")]
    pub log_document_lifecycle: bool,
}

/// The declarative config file (`spec.md` §6): per-type rules, plus a
/// deprecated top-level `truststore` block accepted with a warning.
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub rules: Vec<TypeRule>,
    #[serde(default)]
    truststore: Option<serde_yaml::Value>,
}

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

impl ConfigFile {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigFileError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigFileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if file.truststore.is_some() {
            warn!(
                "the top-level `truststore` block is deprecated; use per-section \
                 `pathToCaCertificate` instead"
            );
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_parses_rules_and_warns_on_truststore() {
        let yaml = r#"
truststore:
  path: /etc/ca.pem
rules:
  - keyPattern: "user::*"
    indexName: users
    typeName: user
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cbes.yaml");
        std::fs::write(&path, yaml).unwrap();

        let file = ConfigFile::load(&path).unwrap();
        assert_eq!(file.rules.len(), 1);
        assert_eq!(file.rules[0].index_name, "users");
    }

    #[test]
    fn member_number_derives_from_hostname_ordinal() {
        std::env::set_var("HOSTNAME", "cbes-3");
        let group = GroupConfig {
            name: "grp".to_string(),
            member_number: None,
            cluster_size: 4,
            k8s_stateful_set: true,
            k8s_watch_replicas: false,
            worker_threads: 4,
            startup_quiet_period_secs: 0,
            checkpoint_flush_interval_secs: 10,
        };
        assert_eq!(group.member_number().unwrap(), 4);
        std::env::remove_var("HOSTNAME");
    }

    #[test]
    fn resolve_membership_rejects_out_of_range_member() {
        let group = GroupConfig {
            name: "grp".to_string(),
            member_number: Some(9),
            cluster_size: 4,
            k8s_stateful_set: false,
            k8s_watch_replicas: false,
            worker_threads: 4,
            startup_quiet_period_secs: 0,
            checkpoint_flush_interval_secs: 10,
        };
        assert!(matches!(
            group.resolve_membership(),
            Err(GroupConfigError::Membership(ConfigError::MemberOutOfRange { .. }))
        ));
    }

    #[test]
    fn queue_capacity_per_shard_is_derived_from_pending_bytes() {
        let bulk = BulkConfig {
            max_docs: 500,
            max_bytes: 5_000_000,
            max_pending_bytes: 50_000_000,
            flush_deadline_millis: 200,
        };
        // 10 batches worth of pending bytes, 500 docs each, over 4 shards.
        assert_eq!(bulk.queue_capacity_per_shard(4), 1250);
    }
}
