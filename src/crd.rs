//! Custom resource for groupkeeper clusters, and the status records
//! persisted at the Kubernetes boundary.

use crate::config::MemberAuth;
use crate::types::{
    ClusterDiagStatus, ClusterStatus, InstanceDiagStatus, InstanceStatus, MemberRole, MemberState,
};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// GroupCluster CRD
// ============================================================================

/// GroupCluster is a group-replicated database cluster.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "groupkeeper.io",
    version = "v1",
    kind = "GroupCluster",
    plural = "groupclusters",
    shortname = "gc",
    status = "GroupClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.cluster.status"}"#,
    printcolumn = r#"{"name":"Online","type":"integer","jsonPath":".status.cluster.onlineInstances"}"#,
    printcolumn = r#"{"name":"Primary","type":"string","jsonPath":".status.cluster.primary"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GroupClusterSpec {
    /// Number of group members
    #[serde(default = "default_instances")]
    pub instances: i32,

    /// Number of read replicas
    #[serde(default)]
    pub read_replicas: i32,

    /// Member authentication; the operator default applies when unset
    #[serde(default)]
    pub member_auth: Option<MemberAuth>,
}

fn default_instances() -> i32 {
    3
}

/// Status of a GroupCluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupClusterStatus {
    /// Last diagnosis
    pub cluster: Option<ClusterStatusRecord>,

    /// When the replication group was created (RFC 3339)
    pub create_time: Option<String>,
}

impl GroupClusterStatus {
    /// Parsed creation time; an unparseable value counts as unset.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.create_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Persisted form of a [`ClusterStatus`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusRecord {
    /// Diagnosis verdict
    pub status: ClusterDiagStatus,

    /// Number of members in active partitions
    pub online_instances: i32,

    /// Pod name of the primary
    pub primary: Option<String>,

    /// When the diagnosis ran (RFC 3339)
    pub last_probe_time: String,
}

impl ClusterStatusRecord {
    /// Equal apart from the probe time.
    pub fn same_state(&self, other: &Self) -> bool {
        self.status == other.status
            && self.online_instances == other.online_instances
            && self.primary == other.primary
    }
}

impl ClusterStatus {
    /// The status block written to the cluster resource.
    pub fn to_status_record(&self, now: DateTime<Utc>) -> ClusterStatusRecord {
        ClusterStatusRecord {
            status: self.status,
            online_instances: self.online_members.len() as i32,
            primary: self.primary.as_ref().map(|p| p.name.clone()),
            last_probe_time: now.to_rfc3339(),
        }
    }
}

// ============================================================================
// Member status annotation
// ============================================================================

/// Annotation key holding a member's [`MemberStatusRecord`].
pub const MEMBER_STATUS_ANNOTATION: &str = "groupkeeper.io/member-status";

/// Per-member status, stored as JSON in a pod annotation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatusRecord {
    /// Last probe verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceDiagStatus>,

    /// State in the group as reported by the primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_state: Option<MemberState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MemberRole>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<String>,

    /// Executed transaction set at the last probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_executed: Option<String>,

    pub last_probe_time: String,
}

impl MemberStatusRecord {
    /// Record a probe result.
    pub fn from_probe(status: &InstanceStatus, now: DateTime<Utc>) -> Self {
        Self::default().with_probe(status, now)
    }

    /// Fold a probe result into the record, keeping the view fields.
    pub fn with_probe(mut self, status: &InstanceStatus, now: DateTime<Utc>) -> Self {
        self.status = Some(status.status);
        if let Some(primary) = status.is_primary {
            self.role = Some(if primary {
                MemberRole::Primary
            } else {
                MemberRole::Secondary
            });
        }
        if status.view_id.is_some() {
            self.view_id = status.view_id.clone();
        }
        self.gtid_executed = status.gtid_executed.clone();
        self.last_probe_time = now.to_rfc3339();
        self
    }

    /// Fold in the state the member has in the primary's view, keeping the
    /// probe fields.
    pub fn with_view(
        mut self,
        state: MemberState,
        role: Option<MemberRole>,
        view_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        self.member_state = Some(state);
        self.role = role;
        self.view_id = view_id;
        self.last_probe_time = now.to_rfc3339();
        self
    }

    /// Equal apart from the probe time.
    pub fn same_state(&self, other: &Self) -> bool {
        self.status == other.status
            && self.member_state == other.member_state
            && self.role == other.role
            && self.view_id == other.view_id
            && self.gtid_executed == other.gtid_executed
    }
}
