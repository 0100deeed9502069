//! Member directory: where clusters and their members are looked up, and
//! where per-member and per-cluster status is written back.
//!
//! The controller re-reads through the directory before every decision and
//! never trusts a copy it holds from an earlier pass. [`KubeMemberDirectory`]
//! maps the directory onto pods and the [`GroupCluster`] resource.

use crate::config::{MemberAuth, MemberDefaults};
use crate::crd::{ClusterStatusRecord, GroupCluster, MemberStatusRecord, MEMBER_STATUS_ANNOTATION};
use crate::error::Result;
use crate::types::{ClusterRef, Endpoint, InstanceKind, MemberIndex, MemberInstance};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

/// Label selecting all pods of a cluster.
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// Label distinguishing group members from read replicas.
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
/// Component label value of read replica pods.
pub const READ_REPLICA_COMPONENT: &str = "read-replica";
/// Finalizer held on a pod while it is a group member.
pub const MEMBERSHIP_FINALIZER: &str = "groupkeeper.io/membership";

const FIELD_MANAGER: &str = "groupkeeper";

/// Lookup and status persistence for clusters and members.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    /// Fetch a cluster; `None` if it no longer exists.
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<ClusterRef>>;

    /// Every member of `cluster`, ordered by kind then index.
    async fn list_members(&self, cluster: &ClusterRef) -> Result<Vec<MemberInstance>>;

    /// Fetch a member; `None` if it no longer exists.
    async fn get_member(&self, namespace: &str, name: &str) -> Result<Option<MemberInstance>>;

    /// The member's stored status, if any.
    async fn get_member_status(&self, member: &MemberInstance) -> Result<Option<MemberStatusRecord>>;

    /// Store the member's latest status.
    async fn set_member_status(
        &self,
        member: &MemberInstance,
        status: &MemberStatusRecord,
    ) -> Result<()>;

    /// Mark the member as joined, so it cannot vanish without being removed.
    async fn set_membership_marker(&self, member: &MemberInstance) -> Result<()>;

    /// Release the member after it left the group.
    async fn clear_membership_marker(&self, member: &MemberInstance) -> Result<()>;

    /// The stored cluster diagnosis, if any.
    async fn get_cluster_status(&self, cluster: &ClusterRef) -> Result<Option<ClusterStatusRecord>>;

    /// Store the latest cluster diagnosis.
    async fn patch_cluster_status(
        &self,
        cluster: &ClusterRef,
        status: &ClusterStatusRecord,
    ) -> Result<()>;

    /// Record that the replication group now exists.
    async fn mark_cluster_created(&self, cluster: &ClusterRef, time: DateTime<Utc>) -> Result<()>;
}

/// Rewrite a member's status record through `update`.
///
/// The write is skipped when nothing but the probe time would change, so
/// that a steady cluster does not keep touching its pods. Returns whether a
/// write happened.
pub async fn update_member_status<F>(
    directory: &dyn MemberDirectory,
    member: &MemberInstance,
    update: F,
) -> Result<bool>
where
    F: FnOnce(MemberStatusRecord) -> MemberStatusRecord + Send,
{
    let previous = directory.get_member_status(member).await?;
    let record = update(previous.clone().unwrap_or_default());
    if previous.is_some_and(|p| p.same_state(&record)) {
        return Ok(false);
    }
    directory.set_member_status(member, &record).await?;
    Ok(true)
}

/// Store a cluster diagnosis unless the stored one only differs in its
/// probe time. Returns whether a write happened.
pub async fn update_cluster_status(
    directory: &dyn MemberDirectory,
    cluster: &ClusterRef,
    record: &ClusterStatusRecord,
) -> Result<bool> {
    let previous = directory.get_cluster_status(cluster).await?;
    if previous.is_some_and(|p| p.same_state(record)) {
        return Ok(false);
    }
    directory.patch_cluster_status(cluster, record).await?;
    Ok(true)
}

// ============================================================================
// Kubernetes implementation
// ============================================================================

/// Directory backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeMemberDirectory {
    client: Client,
    defaults: MemberDefaults,
    member_auth: MemberAuth,
}

impl KubeMemberDirectory {
    pub fn new(client: Client, defaults: MemberDefaults, member_auth: MemberAuth) -> Self {
        Self {
            client,
            defaults,
            member_auth,
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn clusters(&self, namespace: &str) -> Api<GroupCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Rewrite a pod's finalizer list, failing on a concurrent update.
    async fn update_finalizers(&self, member: &MemberInstance, add: bool) -> Result<()> {
        let api = self.pods(&member.namespace);
        let Some(pod) = api.get_opt(&member.name).await? else {
            return Ok(());
        };

        let mut finalizers = pod.finalizers().to_vec();
        let present = finalizers.iter().any(|f| f == MEMBERSHIP_FINALIZER);
        if present == add {
            return Ok(());
        }
        if add {
            finalizers.push(MEMBERSHIP_FINALIZER.to_string());
        } else {
            finalizers.retain(|f| f != MEMBERSHIP_FINALIZER);
        }

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": pod.resource_version(),
                "finalizers": finalizers,
            }
        });
        api.patch(&member.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        debug!(pod = %member, add, "Membership finalizer updated");
        Ok(())
    }
}

#[async_trait]
impl MemberDirectory for KubeMemberDirectory {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<ClusterRef>> {
        let cluster = self.clusters(namespace).get_opt(name).await?;
        Ok(cluster.map(|c| cluster_from_resource(&c, self.member_auth)))
    }

    async fn list_members(&self, cluster: &ClusterRef) -> Result<Vec<MemberInstance>> {
        let lp = ListParams::default().labels(&format!("{}={}", INSTANCE_LABEL, cluster.name));
        let pods = self.pods(&cluster.namespace).list(&lp).await?;

        let mut members: Vec<MemberInstance> = pods
            .items
            .iter()
            .filter_map(|pod| member_from_pod(pod, &self.defaults))
            .collect();
        members.sort_by_key(|m| (m.kind == InstanceKind::ReadReplica, m.index));
        Ok(members)
    }

    async fn get_member(&self, namespace: &str, name: &str) -> Result<Option<MemberInstance>> {
        let pod = self.pods(namespace).get_opt(name).await?;
        Ok(pod.and_then(|p| member_from_pod(&p, &self.defaults)))
    }

    async fn get_member_status(&self, member: &MemberInstance) -> Result<Option<MemberStatusRecord>> {
        let Some(pod) = self.pods(&member.namespace).get_opt(&member.name).await? else {
            return Ok(None);
        };
        let record = pod
            .annotations()
            .get(MEMBER_STATUS_ANNOTATION)
            .and_then(|raw| match serde_json::from_str(raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!(pod = %member, error = %e, "Ignoring unparseable member status");
                    None
                }
            });
        Ok(record)
    }

    async fn set_member_status(
        &self,
        member: &MemberInstance,
        status: &MemberStatusRecord,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    MEMBER_STATUS_ANNOTATION: serde_json::to_string(status)?,
                }
            }
        });
        self.pods(&member.namespace)
            .patch(&member.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_membership_marker(&self, member: &MemberInstance) -> Result<()> {
        self.update_finalizers(member, true).await
    }

    async fn clear_membership_marker(&self, member: &MemberInstance) -> Result<()> {
        self.update_finalizers(member, false).await
    }

    async fn get_cluster_status(&self, cluster: &ClusterRef) -> Result<Option<ClusterStatusRecord>> {
        let resource = self.clusters(&cluster.namespace).get_opt(&cluster.name).await?;
        Ok(resource.and_then(|c| c.status).and_then(|s| s.cluster))
    }

    async fn patch_cluster_status(
        &self,
        cluster: &ClusterRef,
        status: &ClusterStatusRecord,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": { "cluster": status } });
        let pp = PatchParams::apply(FIELD_MANAGER);
        self.clusters(&cluster.namespace)
            .patch_status(&cluster.name, &pp, &Patch::Merge(&patch))
            .await?;
        debug!(cluster = %cluster, status = %status.status, "Cluster status updated");
        Ok(())
    }

    async fn mark_cluster_created(&self, cluster: &ClusterRef, time: DateTime<Utc>) -> Result<()> {
        let patch = serde_json::json!({ "status": { "createTime": time.to_rfc3339() } });
        let pp = PatchParams::apply(FIELD_MANAGER);
        self.clusters(&cluster.namespace)
            .patch_status(&cluster.name, &pp, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Build a [`ClusterRef`] from the custom resource.
pub fn cluster_from_resource(cluster: &GroupCluster, default_auth: MemberAuth) -> ClusterRef {
    ClusterRef {
        name: cluster.name_any(),
        namespace: cluster.namespace().unwrap_or_default(),
        create_time: cluster.status.as_ref().and_then(|s| s.created_at()),
        deleting: cluster.metadata.deletion_timestamp.is_some(),
        member_auth: cluster.spec.member_auth.unwrap_or(default_auth),
    }
}

/// Build a [`MemberInstance`] from a cluster pod.
///
/// Returns `None` for pods that carry no cluster label or whose name does
/// not end in an ordinal.
pub fn member_from_pod(pod: &Pod, defaults: &MemberDefaults) -> Option<MemberInstance> {
    let name = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();
    let cluster = pod.labels().get(INSTANCE_LABEL)?.clone();
    let index = pod_ordinal(&name)?;

    let kind = match pod.labels().get(COMPONENT_LABEL).map(String::as_str) {
        Some(READ_REPLICA_COMPONENT) => InstanceKind::ReadReplica,
        _ => InstanceKind::GroupMember,
    };

    let ready = pod_ready(pod);

    let host = format!(
        "{}.{}-instances.{}.{}",
        name, cluster, namespace, defaults.cluster_domain
    );

    Some(MemberInstance {
        endpoint: Endpoint::new(host, defaults.port, defaults.admin_port)
            .with_user(defaults.admin_user.as_str()),
        deleting: pod.metadata.deletion_timestamp.is_some(),
        name,
        namespace,
        cluster,
        index,
        kind,
        ready,
    })
}

/// Whether the pod reports the `Ready` condition.
pub fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn pod_ordinal(name: &str) -> Option<MemberIndex> {
    name.rsplit_once('-')?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(name: &str, labels: &[(&str, &str)], ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("prod".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_member_from_pod() {
        let defaults = MemberDefaults::default();
        let member = member_from_pod(&pod("db-2", &[(INSTANCE_LABEL, "db")], true), &defaults)
            .unwrap();

        assert_eq!(member.index, 2);
        assert_eq!(member.cluster, "db");
        assert_eq!(member.kind, InstanceKind::GroupMember);
        assert!(member.ready);
        assert!(!member.deleting);
        assert_eq!(
            member.address(),
            "db-2.db-instances.prod.svc.cluster.local:3306"
        );
    }

    #[test]
    fn test_member_endpoint_carries_admin_user() {
        let defaults = MemberDefaults {
            admin_user: "cluster-admin".to_string(),
            cluster_domain: "example.internal".to_string(),
            ..Default::default()
        };
        let member = member_from_pod(&pod("db-0", &[(INSTANCE_LABEL, "db")], true), &defaults)
            .unwrap();

        assert_eq!(member.endpoint.user, "cluster-admin");
        assert_eq!(member.endpoint.host, "db-0.db-instances.prod.example.internal");
    }

    #[test]
    fn test_read_replica_pod() {
        let defaults = MemberDefaults::default();
        let labels = [(INSTANCE_LABEL, "db"), (COMPONENT_LABEL, READ_REPLICA_COMPONENT)];
        let member = member_from_pod(&pod("db-rr-0", &labels, false), &defaults).unwrap();
        assert_eq!(member.kind, InstanceKind::ReadReplica);
        assert!(!member.ready);
    }

    #[test]
    fn test_unlabelled_or_unnumbered_pods_are_ignored() {
        let defaults = MemberDefaults::default();
        assert!(member_from_pod(&pod("db-0", &[], true), &defaults).is_none());
        assert!(member_from_pod(&pod("db-router", &[(INSTANCE_LABEL, "db")], true), &defaults)
            .is_none());
    }
}
