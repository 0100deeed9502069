//! Diagnosis dispatch and per-member reconciliation.

use super::ClusterController;
use crate::error::{OperatorError, Result};
use crate::events::{EventAction, EventRecord, Reason};
use crate::gtid::select_seed;
use crate::probe::diagnose_cluster_candidate;
use crate::types::{CandidateDiagStatus, ClusterDiagStatus, ClusterRef, ClusterStatus, MemberIndex, MemberInstance};
use tracing::{debug, error, info, warn};

/// What [`ClusterController::repair_cluster`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Healthy, self-healing, or nothing to repair.
    NoAction,
    /// Rebooted from a complete outage.
    Rebooted { seed: MemberIndex },
    /// Forced quorum from the given partition.
    QuorumForced { partition: Vec<MemberIndex> },
}

impl ClusterController {
    /// Map a diagnosis to a repair.
    ///
    /// Split-brain and invalid clusters are reported and fail permanently
    /// without touching the cluster. States whose repair depends on members
    /// that cannot be reached fail temporarily.
    pub async fn repair_cluster(
        &self,
        cluster: &ClusterRef,
        status: &ClusterStatus,
    ) -> Result<RepairOutcome> {
        match status.status {
            ClusterDiagStatus::Online
            | ClusterDiagStatus::OnlinePartial
            | ClusterDiagStatus::OnlineUncertain => {
                debug!(cluster = %cluster, status = %status.status, "No repair needed");
                Ok(RepairOutcome::NoAction)
            }

            ClusterDiagStatus::Offline => {
                let Some(seed) = select_seed(&status.gtid_executed)? else {
                    return Err(OperatorError::temporary(
                        "cannot reboot cluster: unreachable members exist",
                    ));
                };
                info!(cluster = %cluster, seed, "Cluster is offline, rebooting");
                self.guard_repair(cluster, self.reboot_cluster(cluster, seed))
                    .await?;
                Ok(RepairOutcome::Rebooted { seed })
            }

            ClusterDiagStatus::OfflineUncertain | ClusterDiagStatus::NoQuorumUncertain => {
                Err(OperatorError::temporary(format!(
                    "cluster is {}: waiting for unreachable members",
                    status.status
                )))
            }

            ClusterDiagStatus::NoQuorum => {
                let partition = status
                    .quorum_candidates
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| OperatorError::temporary("no quorum candidates found"))?;
                info!(cluster = %cluster, size = partition.len(), "Cluster lost quorum, forcing");
                self.guard_repair(cluster, self.force_quorum(cluster, partition))
                    .await?;
                Ok(RepairOutcome::QuorumForced {
                    partition: partition.iter().map(|m| m.index).collect(),
                })
            }

            ClusterDiagStatus::SplitBrain | ClusterDiagStatus::SplitBrainUncertain => {
                let members: Vec<&str> =
                    status.online_members.iter().map(|m| m.name.as_str()).collect();
                let message = format!(
                    "Cluster {} has more than one quorate partition ({:?}); manual intervention required",
                    cluster.name, members
                );
                error!(cluster = %cluster, status = %status.status, "Split brain detected");
                self.emit_cluster(
                    cluster,
                    EventRecord::warning(EventAction::RepairCluster, Reason::SplitBrain, &message),
                )
                .await;
                Err(OperatorError::permanent(Reason::SplitBrain.as_str(), message))
            }

            ClusterDiagStatus::Unknown => Err(OperatorError::temporary(
                "no cluster member is reachable",
            )),

            ClusterDiagStatus::Invalid => {
                let message = format!("Cluster {} is in an invalid state", cluster.name);
                self.emit_cluster(
                    cluster,
                    EventRecord::warning(EventAction::RepairCluster, Reason::InvalidCluster, &message),
                )
                .await;
                Err(OperatorError::permanent(Reason::InvalidCluster.as_str(), message))
            }

            ClusterDiagStatus::Finalizing
            | ClusterDiagStatus::Pending
            | ClusterDiagStatus::Initializing => Ok(RepairOutcome::NoAction),
        }
    }

    /// Report a failed repair before passing its error on.
    async fn guard_repair<F>(&self, cluster: &ClusterRef, repair: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        match repair.await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.emit_cluster(
                    cluster,
                    EventRecord::warning(
                        EventAction::RepairCluster,
                        Reason::ClusterRepairFailed,
                        format!("Cluster repair failed: {}", e),
                    ),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Bring one member in line with an online cluster.
    pub async fn reconcile_pod(
        &self,
        cluster: &ClusterRef,
        status: &ClusterStatus,
        member: &MemberInstance,
    ) -> Result<()> {
        if member.deleting || cluster.deleting {
            debug!(pod = %member, "Member or cluster is being deleted, not reconciling");
            return Ok(());
        }

        let primary = self.primary_session(status).await?;
        let primary_session = primary.session.as_ref();

        let candidate = diagnose_cluster_candidate(
            self.connector.as_ref(),
            self.directory.as_ref(),
            primary_session,
            member,
            None,
        )
        .await?;

        match candidate.status {
            CandidateDiagStatus::Member => {
                debug!(pod = %member, "Already a member");
                self.directory.set_membership_marker(member).await?;
                Ok(())
            }
            CandidateDiagStatus::Joinable => {
                self.join_instance(cluster, primary_session, member).await
            }
            CandidateDiagStatus::Rejoinable => {
                self.rejoin_instance(cluster, primary_session, member).await
            }
            CandidateDiagStatus::Broken | CandidateDiagStatus::Unsuitable => {
                let errant = candidate.bad_gtid_set.unwrap_or_default();
                error!(
                    pod = %member,
                    candidate = %candidate.status,
                    errant = %errant,
                    "Instance has errant transactions and cannot be admitted"
                );
                self.emit_member(
                    member,
                    EventRecord::warning(
                        EventAction::ReconcileInstance,
                        Reason::ErrantTransactions,
                        format!(
                            "{} has transactions unknown to the primary ({}); manual repair required",
                            member.name, errant
                        ),
                    ),
                )
                .await;
                Ok(())
            }
            CandidateDiagStatus::Unreachable | CandidateDiagStatus::Unknown => {
                warn!(pod = %member, "Instance is not reachable yet");
                Err(OperatorError::temporary_after(
                    format!("{} is not reachable", member.name),
                    self.config.requeue.default_delay,
                ))
            }
        }
    }
}
