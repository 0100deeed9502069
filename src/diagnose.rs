//! Cluster diagnosis.
//!
//! Probes every member, analyses the partitions formed by the online ones
//! and reduces the result to one [`ClusterStatus`]. A pass whose remote calls
//! fail, or whose views disagree, is retried as a unit. Each member's probe
//! result is written back to the directory on the way.

use crate::crd::MemberStatusRecord;
use crate::db::AdminConnector;
use crate::directory::{update_member_status, MemberDirectory};
use crate::error::{OperatorError, Result};
use crate::partition::{find_group_partitions, ProbedMember};
use crate::probe::diagnose_instance;
use crate::resilience::{RetryConfig, RetryExecutor};
use crate::types::{
    ClusterDiagStatus, ClusterRef, ClusterStatus, InstanceDiagStatus, InstanceKind, MemberInstance,
};
use chrono::Utc;
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Produces [`ClusterStatus`] verdicts.
#[derive(Clone)]
pub struct Diagnoser {
    connector: Arc<dyn AdminConnector>,
    directory: Arc<dyn MemberDirectory>,
    retry: RetryExecutor,
}

impl Diagnoser {
    pub fn new(
        connector: Arc<dyn AdminConnector>,
        directory: Arc<dyn MemberDirectory>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            connector,
            directory,
            retry: RetryExecutor::new(retry),
        }
    }

    /// Diagnose `cluster`, retrying the whole pass on temporary errors.
    pub async fn diagnose_cluster(&self, cluster: &ClusterRef) -> Result<ClusterStatus> {
        let status = self
            .retry
            .execute("diagnose_cluster", || self.diagnose_once(cluster))
            .await?;
        info!(
            cluster = %cluster,
            status = %status.status,
            online = status.online_members.len(),
            primary = ?status.primary.as_ref().map(|p| p.name.as_str()),
            "Cluster diagnosed"
        );
        Ok(status)
    }

    /// One diagnosis pass, no retry.
    pub async fn diagnose_once(&self, cluster: &ClusterRef) -> Result<ClusterStatus> {
        if cluster.create_time.is_none() && !cluster.deleting {
            return Ok(ClusterStatus::new(ClusterDiagStatus::Initializing));
        }

        let members: Vec<MemberInstance> = self
            .directory
            .list_members(cluster)
            .await?
            .into_iter()
            .filter(|m| m.kind == InstanceKind::GroupMember)
            .collect();

        let probes = try_join_all(members.iter().map(|member| async move {
            let status = diagnose_instance(
                self.connector.as_ref(),
                self.directory.as_ref(),
                member,
                None,
            )
            .await?;
            Ok::<_, OperatorError>(ProbedMember {
                member: member.clone(),
                status,
            })
        }))
        .await?;

        let now = Utc::now();
        for probe in &probes {
            let update = |record: MemberStatusRecord| record.with_probe(&probe.status, now);
            let result = update_member_status(self.directory.as_ref(), &probe.member, update).await;
            if let Err(e) = result {
                warn!(pod = %probe.member, error = %e, "Failed to record probe result");
            }
        }

        let mut verdict = ClusterStatus::new(ClusterDiagStatus::Unknown);
        for probe in &probes {
            verdict
                .gtid_executed
                .insert(probe.member.index, probe.status.gtid_executed.clone());
        }

        let online: Vec<ProbedMember> = probes
            .iter()
            .filter(|p| {
                matches!(
                    p.status.status,
                    InstanceDiagStatus::Online | InstanceDiagStatus::Recovering
                )
            })
            .cloned()
            .collect();
        let offline: Vec<&ProbedMember> = probes
            .iter()
            .filter(|p| {
                matches!(
                    p.status.status,
                    InstanceDiagStatus::Offline
                        | InstanceDiagStatus::Error
                        | InstanceDiagStatus::NotManaged
                        | InstanceDiagStatus::Unmanaged
                )
            })
            .collect();
        let indeterminate: Vec<&ProbedMember> = probes
            .iter()
            .filter(|p| {
                matches!(
                    p.status.status,
                    InstanceDiagStatus::Unreachable | InstanceDiagStatus::Unknown
                )
            })
            .collect();

        let bucketed: BTreeSet<usize> = online
            .iter()
            .map(|p| p.member.index)
            .chain(offline.iter().map(|p| p.member.index))
            .chain(indeterminate.iter().map(|p| p.member.index))
            .collect();
        if online.len() + offline.len() + indeterminate.len() != members.len()
            || bucketed.len() != members.len()
        {
            return Err(OperatorError::InvariantViolation(format!(
                "member buckets do not partition {}: {} online, {} offline, {} indeterminate of {}",
                cluster,
                online.len(),
                offline.len(),
                indeterminate.len(),
                members.len()
            )));
        }

        let uncertain = !indeterminate.is_empty();

        if !online.is_empty() {
            let partitions = find_group_partitions(&online, &members)?;

            match partitions.active.len() {
                0 => {
                    verdict.status = if uncertain {
                        ClusterDiagStatus::NoQuorumUncertain
                    } else {
                        ClusterDiagStatus::NoQuorum
                    };
                    verdict.quorum_candidates = partitions.blocked.into_iter().next();
                }
                1 => {
                    let Some(partition) = partitions.active.into_iter().next() else {
                        return Err(OperatorError::Internal("active partition vanished".into()));
                    };
                    verdict.status = if uncertain {
                        ClusterDiagStatus::OnlineUncertain
                    } else if !offline.is_empty() || partition.members.len() < members.len() {
                        ClusterDiagStatus::OnlinePartial
                    } else {
                        ClusterDiagStatus::Online
                    };
                    verdict.primary = partition.primary;
                    verdict.online_members = partition.members;
                }
                _ => {
                    verdict.status = if uncertain {
                        ClusterDiagStatus::SplitBrainUncertain
                    } else {
                        ClusterDiagStatus::SplitBrain
                    };
                    let mut union: Vec<MemberInstance> = partitions
                        .active
                        .into_iter()
                        .flat_map(|p| p.members)
                        .collect();
                    union.sort_by_key(|m| m.index);
                    union.dedup_by_key(|m| m.index);
                    verdict.online_members = union;
                }
            }
        } else if cluster.deleting {
            verdict.status = ClusterDiagStatus::Finalizing;
        } else if !offline.is_empty() {
            verdict.status = if uncertain {
                ClusterDiagStatus::OfflineUncertain
            } else {
                ClusterDiagStatus::Offline
            };
        }

        debug!(
            cluster = %cluster,
            status = %verdict.status,
            online = online.len(),
            offline = offline.len(),
            indeterminate = indeterminate.len(),
            "Diagnosis pass complete"
        );
        Ok(verdict)
    }
}
