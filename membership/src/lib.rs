//! Deterministic, coordination-free sharding of source partitions across a
//! fixed-size group of peers (`spec.md` §4.1).
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use cbes_types::Partition;
use thiserror::Error;

/// Upper bound on cluster size; `spec.md` §4.1 and the `CBES_TOTAL_MEMBERS`
/// validation error both reference this number.
pub const MAX_CLUSTER_SIZE: u32 = 1024;

/// `{memberNumber, clusterSize}` identifying this process within its peer
/// group (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub member_number: u32,
    pub cluster_size: u32,
}

/// Why a [`Membership`] could not be resolved against a partition count.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cluster size {size} exceeds the maximum of {max}")]
    ClusterTooLarge { size: u32, max: u32 },

    #[error("member number {member} is out of range [1, {cluster_size}]")]
    MemberOutOfRange { member: u32, cluster_size: u32 },

    #[error(
        "more workers than partitions: cluster size {cluster_size} > {num_partitions} partitions"
    )]
    MoreWorkersThanPartitions {
        cluster_size: u32,
        num_partitions: u32,
    },
}

impl Membership {
    /// Validate `{memberNumber, clusterSize}` against the source's
    /// partition count and, if valid, compute the set of partitions this
    /// member owns.
    ///
    /// `partitionsOf(m, N, P) = { p in [0,P) : p mod N == m-1 }`
    /// (`spec.md` §4.1). Fails when `N > 1024`, `m` is not in `[1,N]`, or
    /// `P < N` (an empty partition set is always fatal, never silently
    /// tolerated).
    pub fn partitions_of(
        &self,
        num_partitions: u32,
    ) -> Result<Vec<Partition>, ConfigError> {
        let Self {
            member_number,
            cluster_size,
        } = *self;

        if cluster_size > MAX_CLUSTER_SIZE {
            return Err(ConfigError::ClusterTooLarge {
                size: cluster_size,
                max: MAX_CLUSTER_SIZE,
            });
        }
        if member_number < 1 || member_number > cluster_size {
            return Err(ConfigError::MemberOutOfRange {
                member: member_number,
                cluster_size,
            });
        }
        if num_partitions < cluster_size {
            return Err(ConfigError::MoreWorkersThanPartitions {
                cluster_size,
                num_partitions,
            });
        }

        Ok((0..num_partitions)
            .filter(|p| p % cluster_size == member_number - 1)
            .map(Partition)
            .collect())
    }
}
