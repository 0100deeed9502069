//! Event entry points.

use super::ClusterController;
use crate::crd::MemberStatusRecord;
use crate::db::GroupStatus;
use crate::directory::update_member_status;
use crate::error::{OperatorError, Result};
use crate::monitor::ViewChangeHandler;
use crate::types::{ClusterDiagStatus, ClusterRef, ClusterStatus, InstanceKind, MemberInstance, MemberState};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
enum MemberEvent {
    Created,
    Restarted,
}

impl MemberEvent {
    fn as_str(&self) -> &'static str {
        match self {
            MemberEvent::Created => "pod-created",
            MemberEvent::Restarted => "pod-restarted",
        }
    }
}

impl ClusterController {
    /// A member pod appeared.
    pub async fn on_pod_created(&self, namespace: &str, pod: &str) -> Result<()> {
        self.on_member_event(MemberEvent::Created, namespace, pod).await
    }

    /// A member pod's server came back after a restart.
    pub async fn on_pod_restarted(&self, namespace: &str, pod: &str) -> Result<()> {
        self.on_member_event(MemberEvent::Restarted, namespace, pod).await
    }

    async fn on_member_event(&self, event: MemberEvent, namespace: &str, pod: &str) -> Result<()> {
        let Some((member, cluster)) = self.lookup(namespace, pod).await? else {
            return Ok(());
        };

        let owner = format!("{}:{}", event.as_str(), pod);
        let _guard = self.registry.locks().try_acquire(&cluster.key(), &owner)?;

        // Re-read under the lock: another action may have changed things.
        let Some((member, cluster)) = self.relookup(&member, &cluster).await? else {
            return Ok(());
        };

        let status = self.diagnoser.diagnose_cluster(&cluster).await?;
        self.record_status(&cluster, &status).await;
        info!(pod = %member, cluster = %cluster, status = %status.status, event = event.as_str(), "Handling member event");

        match status.status {
            ClusterDiagStatus::Initializing => {
                if member.index == 0 && member.kind == InstanceKind::GroupMember {
                    self.create_cluster(&cluster, &member).await?;
                    self.watch_cluster(&cluster).await;
                    Ok(())
                } else {
                    debug!(pod = %member, "Waiting for the seed to create the cluster");
                    Err(OperatorError::temporary_after(
                        format!("waiting for cluster {} to be created", cluster.name),
                        self.config.requeue.default_delay,
                    ))
                }
            }
            s if s.is_online() => {
                self.watch_cluster(&cluster).await;
                self.reconcile_pod(&cluster, &status, &member).await
            }
            ClusterDiagStatus::Finalizing | ClusterDiagStatus::Pending => Ok(()),
            _ => self.repair_and_reevaluate(&cluster, &status).await,
        }
    }

    /// A member pod is being deleted: take it out of the group.
    pub async fn on_pod_deleted(&self, namespace: &str, pod: &str) -> Result<()> {
        let Some((member, cluster)) = self.lookup(namespace, pod).await? else {
            return Ok(());
        };

        let owner = format!("pod-deleted:{}", pod);
        let _guard = self.registry.locks().try_acquire(&cluster.key(), &owner)?;

        let cluster = match self.refresh_cluster(&cluster).await? {
            Some(cluster) => cluster,
            None => ClusterRef {
                deleting: true,
                ..cluster
            },
        };

        info!(pod = %member, cluster = %cluster, "Member is being deleted");
        self.remove_instance(&cluster, &member, false).await?;

        if cluster.deleting {
            let remaining = self.group_members(&cluster).await?;
            if remaining.iter().all(|m| m.deleting) {
                self.registry.monitor().unwatch(&cluster);
            }
        } else {
            self.watch_cluster(&cluster).await;
        }
        Ok(())
    }

    /// Periodic cluster check: diagnose, persist, and repair if needed.
    ///
    /// Returns `None` when the cluster no longer exists.
    pub async fn on_cluster_probe(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterStatus>> {
        let Some(cluster) = self.directory.get_cluster(namespace, name).await? else {
            return Ok(None);
        };

        let _guard = self
            .registry
            .locks()
            .try_acquire(&cluster.key(), &format!("cluster-probe:{}", name))?;
        let Some(cluster) = self.refresh_cluster(&cluster).await? else {
            return Ok(None);
        };

        let status = self.diagnoser.diagnose_cluster(&cluster).await?;
        self.record_status(&cluster, &status).await;

        match status.status {
            s if s.is_online() => {
                self.watch_cluster(&cluster).await;
                Ok(Some(status))
            }
            ClusterDiagStatus::Finalizing => {
                self.registry.monitor().unwatch(&cluster);
                Ok(Some(status))
            }
            ClusterDiagStatus::Initializing | ClusterDiagStatus::Pending => Ok(Some(status)),
            _ => {
                self.repair_and_reevaluate(&cluster, &status).await?;
                Ok(Some(status))
            }
        }
    }

    /// Repair, then report a temporary error so the caller diagnoses again.
    async fn repair_and_reevaluate(&self, cluster: &ClusterRef, status: &ClusterStatus) -> Result<()> {
        let outcome = self.repair_cluster(cluster, status).await?;
        info!(cluster = %cluster, ?outcome, "Repair attempted, re-evaluating");
        Err(OperatorError::temporary_after(
            format!("cluster {} was {}, re-evaluating after repair", cluster.name, status.status),
            self.config.requeue.default_delay,
        ))
    }

    async fn lookup(&self, namespace: &str, pod: &str) -> Result<Option<(MemberInstance, ClusterRef)>> {
        let Some(member) = self.directory.get_member(namespace, pod).await? else {
            debug!(namespace, pod, "Member no longer exists");
            return Ok(None);
        };
        let Some(cluster) = self.directory.get_cluster(namespace, &member.cluster).await? else {
            debug!(pod = %member, "Cluster no longer exists");
            return Ok(None);
        };
        Ok(Some((member, cluster)))
    }

    async fn relookup(
        &self,
        member: &MemberInstance,
        cluster: &ClusterRef,
    ) -> Result<Option<(MemberInstance, ClusterRef)>> {
        let Some(member) = self.directory.get_member(&member.namespace, &member.name).await? else {
            return Ok(None);
        };
        let Some(cluster) = self.refresh_cluster(cluster).await? else {
            return Ok(None);
        };
        Ok(Some((member, cluster)))
    }
}

#[async_trait]
impl ViewChangeHandler for ClusterController {
    async fn on_group_view_change(
        &self,
        cluster: &ClusterRef,
        group: &GroupStatus,
        view_changed: bool,
    ) -> Result<()> {
        let members = self.group_members(cluster).await?;
        self.registry.monitor().update_members(cluster, members.clone());

        let now = Utc::now();
        for member in &members {
            let (state, role) = match group.members.get(&member.address()) {
                Some(peer) => (peer.state, Some(peer.role)),
                None => (MemberState::Missing, None),
            };
            let update = |record: MemberStatusRecord| {
                record.with_view(state, role, group.view_id.clone(), now)
            };
            if let Err(e) = update_member_status(self.directory.as_ref(), member, update).await {
                warn!(pod = %member, error = %e, "Failed to record member state");
            }
        }

        if view_changed {
            info!(cluster = %cluster, view = ?group.view_id, "Group view changed, probing cluster");
            match self.on_cluster_probe(&cluster.namespace, &cluster.name).await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    debug!(cluster = %cluster, error = %e, "Probe after view change deferred")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
