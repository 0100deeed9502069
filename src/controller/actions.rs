//! Repair actions.

use super::ClusterController;
use crate::db::{AdminSession, CreateOptions, DbResult, RecoveryMethod};
use crate::error::{codes, ErrorKind, OperatorError, Result};
use crate::events::{EventAction, EventRecord, Reason};
use crate::probe::{connect_to_primary, is_attached_replica};
use crate::types::{ClusterRef, InstanceKind, MemberIndex, MemberInstance};
use chrono::Utc;
use tracing::{debug, error, info, warn};

/// Treat "already removed" as success.
fn removed_ok(result: DbResult<()>) -> Result<()> {
    match result {
        Err(e) if e.is_already_removed() => {
            debug!(code = e.code, "Instance already removed");
            Ok(())
        }
        other => other.map_err(OperatorError::from),
    }
}

impl ClusterController {
    /// Create the replication group with `seed` as its first member.
    ///
    /// Does nothing if the seed already belongs to a group. A seed still
    /// running group replication from an earlier attempt is stopped and the
    /// creation retried from scratch.
    pub async fn create_cluster(&self, cluster: &ClusterRef, seed: &MemberInstance) -> Result<()> {
        let session = self.connector.connect(&seed.endpoint).await?;

        let existing = match session.describe_group().await {
            Ok(_) => true,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(_) => false,
        };

        if existing {
            info!(cluster = %cluster, seed = %seed, "Group already exists at seed, skipping creation");
        } else {
            let options = CreateOptions {
                member_auth: cluster.member_auth,
                exit_state_action: self.config.group.exit_state_action,
                auto_rejoin_tries: self.config.group.auto_rejoin_tries,
                start_on_boot: self.config.group.start_on_boot,
            };

            info!(cluster = %cluster, seed = %seed, auth = ?options.member_auth, "Creating cluster");
            let session = session.as_ref();
            self.run_action("create_cluster", || async {
                match session.create_cluster(&cluster.name, &options).await {
                    Err(e) if e.code == codes::GROUP_REPLICATION_RUNNING => {
                        warn!(seed = %seed, "Stale group replication running on seed, stopping it");
                        session.stop_group_replication().await?;
                        Err(OperatorError::temporary(
                            "stopped stale group replication on seed, retrying creation",
                        ))
                    }
                    other => other.map_err(OperatorError::from),
                }
            })
            .await?;
        }

        self.directory.mark_cluster_created(cluster, Utc::now()).await?;
        self.directory.set_membership_marker(seed).await?;
        self.emit_cluster(
            cluster,
            EventRecord::normal(
                EventAction::CreateCluster,
                Reason::ClusterCreated,
                format!("Cluster created with seed {}", seed.name),
            ),
        )
        .await;
        Ok(())
    }

    /// Add `member` to the cluster through `primary`.
    ///
    /// Tries incremental recovery first and falls back to a full clone on
    /// any non-fatal failure.
    pub async fn join_instance(
        &self,
        cluster: &ClusterRef,
        primary: &dyn AdminSession,
        member: &MemberInstance,
    ) -> Result<()> {
        let result = match self.join_with(primary, member, RecoveryMethod::Incremental).await {
            Err(e) if e.kind() != ErrorKind::Fatal => {
                warn!(pod = %member, error = %e, "Incremental join failed, falling back to clone");
                self.join_with(primary, member, RecoveryMethod::Clone).await
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.directory.set_membership_marker(member).await?;
                info!(cluster = %cluster, pod = %member, kind = ?member.kind, "Instance joined");
                self.emit_member(
                    member,
                    EventRecord::normal(
                        EventAction::JoinInstance,
                        Reason::InstanceJoined,
                        format!("{} joined cluster {}", member.name, cluster.name),
                    ),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.emit_member(
                    member,
                    EventRecord::warning(
                        EventAction::JoinInstance,
                        Reason::JoinFailed,
                        format!("Failed to join {}: {}", member.name, e),
                    ),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn join_with(
        &self,
        primary: &dyn AdminSession,
        member: &MemberInstance,
        method: RecoveryMethod,
    ) -> Result<()> {
        let address = member.address();
        debug!(pod = %member, %method, "Joining instance");
        match member.kind {
            InstanceKind::GroupMember => {
                self.run_action("add_instance", || async {
                    Ok(primary.add_instance(&address, method).await?)
                })
                .await
            }
            InstanceKind::ReadReplica => {
                let result = self
                    .run_action("add_replica_instance", || async {
                        Ok(primary.add_replica_instance(&address, method).await?)
                    })
                    .await;
                match result {
                    Err(e) if e.kind() != ErrorKind::Fatal => {
                        if is_attached_replica(primary, &address).await.unwrap_or(false) {
                            debug!(pod = %member, error = %e, "Replica already attached");
                            Ok(())
                        } else {
                            Err(e)
                        }
                    }
                    other => other,
                }
            }
        }
    }

    /// Re-admit a member that dropped out of the group.
    pub async fn rejoin_instance(
        &self,
        cluster: &ClusterRef,
        primary: &dyn AdminSession,
        member: &MemberInstance,
    ) -> Result<()> {
        let address = member.address();
        self.run_action("rejoin_instance", || async {
            Ok(primary.rejoin_instance(&address).await?)
        })
        .await?;

        self.directory.set_membership_marker(member).await?;
        info!(cluster = %cluster, pod = %member, "Instance rejoined");
        self.emit_member(
            member,
            EventRecord::normal(
                EventAction::RejoinInstance,
                Reason::InstanceRejoined,
                format!("{} rejoined cluster {}", member.name, cluster.name),
            ),
        )
        .await;
        Ok(())
    }

    /// Remove `member` from the group and release its membership marker.
    ///
    /// The marker is cleared whatever the outcome. A failed removal is
    /// ignored when the cluster itself is being deleted.
    pub async fn remove_instance(
        &self,
        cluster: &ClusterRef,
        member: &MemberInstance,
        force: bool,
    ) -> Result<()> {
        let result = self.remove_from_group(cluster, member, force).await;

        if let Err(e) = self.directory.clear_membership_marker(member).await {
            warn!(pod = %member, error = %e, "Failed to clear membership marker");
        }

        let Err(e) = result else {
            return Ok(());
        };

        let cluster_deleting = match self.refresh_cluster(cluster).await {
            Ok(Some(c)) => c.deleting,
            Ok(None) => true,
            Err(_) => cluster.deleting,
        };
        if cluster_deleting {
            warn!(pod = %member, error = %e, "Ignoring removal failure, cluster is being deleted");
            return Ok(());
        }

        self.emit_member(
            member,
            EventRecord::warning(
                EventAction::RemoveInstance,
                Reason::RemoveFailed,
                format!("Failed to remove {}: {}", member.name, e),
            ),
        )
        .await;
        Err(e)
    }

    async fn remove_from_group(
        &self,
        cluster: &ClusterRef,
        member: &MemberInstance,
        force: bool,
    ) -> Result<()> {
        let members = self.group_members(cluster).await?;

        if member.kind == InstanceKind::GroupMember && !cluster.deleting {
            let others = members.iter().filter(|m| m.index != member.index).count();
            if others == 0 {
                info!(pod = %member, "Not removing the last member of the cluster");
                return Ok(());
            }
        }

        let primary = connect_to_primary(self.connector.as_ref(), &members)
            .await?
            .ok_or_else(|| {
                OperatorError::temporary(format!("no primary available to remove {}", member.name))
            })?;
        let session = primary.session.as_ref();
        let address = member.address();

        info!(pod = %member, force, via = %primary.member, "Removing instance");
        let graceful = self
            .run_action("remove_instance", || async {
                removed_ok(session.remove_instance(&address, force).await)
            })
            .await;

        let outcome = match graceful {
            Err(e) if !force && e.kind() != ErrorKind::Fatal => {
                warn!(pod = %member, error = %e, "Graceful removal failed, forcing");
                self.run_action("remove_instance", || async {
                    removed_ok(session.remove_instance(&address, true).await)
                })
                .await
            }
            other => other,
        };
        outcome?;

        self.emit_member(
            member,
            EventRecord::normal(
                EventAction::RemoveInstance,
                Reason::InstanceRemoved,
                format!("{} removed from cluster {}", member.name, cluster.name),
            ),
        )
        .await;
        Ok(())
    }

    /// Restart the group from `seed_index` after a complete outage, then
    /// rejoin every other member.
    pub async fn reboot_cluster(&self, cluster: &ClusterRef, seed_index: MemberIndex) -> Result<()> {
        let members = self.group_members(cluster).await?;
        let seed = members
            .iter()
            .find(|m| m.index == seed_index)
            .ok_or_else(|| {
                OperatorError::temporary(format!("reboot seed {} is no longer a member", seed_index))
            })?;

        self.emit_cluster(
            cluster,
            EventRecord::normal(
                EventAction::RebootCluster,
                Reason::RebootingCluster,
                format!("Rebooting cluster from {}", seed.name),
            ),
        )
        .await;

        let session = self.connector.connect(&seed.endpoint).await?;
        let session = session.as_ref();
        self.run_action("reboot_cluster_from_complete_outage", || async {
            Ok(session.reboot_cluster_from_complete_outage(&cluster.name).await?)
        })
        .await?;
        info!(cluster = %cluster, seed = %seed, "Cluster rebooted");

        for member in members.iter().filter(|m| m.index != seed_index) {
            let address = member.address();
            let rejoined = self
                .run_action("rejoin_instance", || async {
                    Ok(session.rejoin_instance(&address).await?)
                })
                .await;
            match rejoined {
                Ok(()) => info!(pod = %member, "Rejoined after reboot"),
                Err(e) => error!(pod = %member, error = %e, "Rejoin after reboot failed"),
            }
        }

        self.emit_cluster(
            cluster,
            EventRecord::normal(
                EventAction::RebootCluster,
                Reason::ClusterRebooted,
                format!("Cluster rebooted from {}", seed.name),
            ),
        )
        .await;
        Ok(())
    }

    /// Restore quorum from the partition formed by `partition`.
    pub async fn force_quorum(
        &self,
        cluster: &ClusterRef,
        partition: &[MemberInstance],
    ) -> Result<()> {
        let names: Vec<&str> = partition.iter().map(|m| m.name.as_str()).collect();
        self.emit_cluster(
            cluster,
            EventRecord::normal(
                EventAction::ForceQuorum,
                Reason::RestoringQuorum,
                format!("Restoring quorum from partition {:?}", names),
            ),
        )
        .await;

        let seed = match connect_to_primary(self.connector.as_ref(), partition).await? {
            Some(primary) => primary,
            None => self.any_session(partition).await?,
        };
        let session = seed.session.as_ref();
        let address = seed.member.address();

        info!(cluster = %cluster, seed = %seed.member, partition = ?names, "Forcing quorum");
        self.run_action("force_quorum_using_partition_of", || async {
            Ok(session.force_quorum_using_partition_of(&address).await?)
        })
        .await?;

        self.emit_cluster(
            cluster,
            EventRecord::normal(
                EventAction::ForceQuorum,
                Reason::QuorumRestored,
                format!("Quorum restored from {}", seed.member.name),
            ),
        )
        .await;
        Ok(())
    }
}
