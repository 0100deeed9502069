//! Core type definitions for groupkeeper.
//!
//! These are the tagged records exchanged between the probe, the diagnoser
//! and the controller. They are created fresh on every diagnosis pass and
//! never mutated afterwards; persistence to the external store happens at the
//! boundary (see [`crate::crd`]).
//!
//! # Key Types
//!
//! - [`MemberInstance`]: identity of one cluster member, as seen by the directory
//! - [`InstanceStatus`]: result of probing one member
//! - [`CandidateStatus`]: whether a member may join or rejoin
//! - [`ClusterStatus`]: the aggregate verdict of one diagnosis pass

use crate::config::{MemberAuth, DEFAULT_ADMIN_USER};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable ordinal of a member within its cluster (0..N-1).
pub type MemberIndex = usize;

/// Network endpoint of a member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Resolvable host name.
    pub host: String,
    /// SQL protocol port.
    pub port: u16,
    /// Auxiliary admin protocol port.
    pub admin_port: u16,
    /// Account management connections log in as.
    pub user: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, admin_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            admin_port,
            user: DEFAULT_ADMIN_USER.to_string(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// `host:port`, the address members use for each other in the group.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Kind of replicating instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    /// Full group member with a vote.
    #[default]
    GroupMember,
    /// Read-only replica attached by asynchronous replication.
    ReadReplica,
}

/// Identity of one cluster member.
///
/// Owned by the orchestration layer. Any copy may be stale: the member can
/// be removed while a pass is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInstance {
    /// Pod name.
    pub name: String,
    /// Namespace of the pod and its cluster.
    pub namespace: String,
    /// Name of the owning cluster.
    pub cluster: String,
    pub index: MemberIndex,
    pub endpoint: Endpoint,
    pub kind: InstanceKind,
    /// The member is pending deletion.
    pub deleting: bool,
    /// Last known liveness: the server process is running and ready.
    pub ready: bool,
}

impl MemberInstance {
    /// Group address of this member.
    pub fn address(&self) -> String {
        self.endpoint.address()
    }
}

impl fmt::Display for MemberInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The cluster object a set of members belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    pub name: String,
    pub namespace: String,
    /// Set once the replication group has been created.
    pub create_time: Option<DateTime<Utc>>,
    /// The cluster object is being torn down.
    pub deleting: bool,
    /// Member authentication inside the group.
    pub member_auth: MemberAuth,
}

impl ClusterRef {
    /// Key used for the cluster lock and the monitor registry.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ============================================================================
// Group membership states
// ============================================================================

/// State of a peer as reported in a member's view of the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    Online,
    Recovering,
    Error,
    Offline,
    Unreachable,
    /// Listed in the metadata but absent from the group.
    Missing,
}

impl MemberState {
    /// Counts towards a partition's membership.
    pub fn is_active(&self) -> bool {
        matches!(self, MemberState::Online | MemberState::Recovering)
    }

    /// Reachable from the reporting member.
    pub fn is_reachable(&self) -> bool {
        !matches!(self, MemberState::Unreachable | MemberState::Missing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Online => "ONLINE",
            MemberState::Recovering => "RECOVERING",
            MemberState::Error => "ERROR",
            MemberState::Offline => "OFFLINE",
            MemberState::Unreachable => "UNREACHABLE",
            MemberState::Missing => "(MISSING)",
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a member in a single-primary group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Primary,
    Secondary,
}

// ============================================================================
// Instance diagnosis
// ============================================================================

/// Per-instance diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceDiagStatus {
    Online,
    Recovering,
    Error,
    Offline,
    /// Never joined any group.
    NotManaged,
    /// Member of a group unknown to the cluster metadata.
    Unmanaged,
    /// Network-level failure.
    Unreachable,
    /// Reachable but indeterminate.
    Unknown,
}

impl InstanceDiagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceDiagStatus::Online => "ONLINE",
            InstanceDiagStatus::Recovering => "RECOVERING",
            InstanceDiagStatus::Error => "ERROR",
            InstanceDiagStatus::Offline => "OFFLINE",
            InstanceDiagStatus::NotManaged => "NOT_MANAGED",
            InstanceDiagStatus::Unmanaged => "UNMANAGED",
            InstanceDiagStatus::Unreachable => "UNREACHABLE",
            InstanceDiagStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for InstanceDiagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of probing one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub status: InstanceDiagStatus,
    /// Error code of a failed connection attempt.
    pub connect_error: Option<u32>,
    /// Group view the member currently participates in.
    pub view_id: Option<String>,
    pub is_primary: Option<bool>,
    pub in_quorum: Option<bool>,
    /// Peer address to the state this member reports for it.
    pub peers: BTreeMap<String, MemberState>,
    /// Executed transaction set, as reported by the member.
    pub gtid_executed: Option<String>,
}

impl InstanceStatus {
    /// A status with nothing known beyond the diagnosis itself.
    pub fn new(status: InstanceDiagStatus) -> Self {
        Self {
            status,
            connect_error: None,
            view_id: None,
            is_primary: None,
            in_quorum: None,
            peers: BTreeMap::new(),
            gtid_executed: None,
        }
    }

    pub fn with_connect_error(mut self, code: u32) -> Self {
        self.connect_error = Some(code);
        self
    }

    pub fn with_gtid_executed(mut self, gtid: Option<String>) -> Self {
        self.gtid_executed = gtid;
        self
    }
}

// ============================================================================
// Candidate diagnosis
// ============================================================================

/// Whether an instance may join or rejoin the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandidateDiagStatus {
    Unknown,
    /// Already in the group.
    Member,
    Rejoinable,
    Joinable,
    /// Member, but cannot safely rejoin.
    Broken,
    /// Not a member and cannot safely join.
    Unsuitable,
    Unreachable,
}

impl CandidateDiagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateDiagStatus::Unknown => "UNKNOWN",
            CandidateDiagStatus::Member => "MEMBER",
            CandidateDiagStatus::Rejoinable => "REJOINABLE",
            CandidateDiagStatus::Joinable => "JOINABLE",
            CandidateDiagStatus::Broken => "BROKEN",
            CandidateDiagStatus::Unsuitable => "UNSUITABLE",
            CandidateDiagStatus::Unreachable => "UNREACHABLE",
        }
    }
}

impl fmt::Display for CandidateDiagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateStatus {
    pub status: CandidateDiagStatus,
    /// Transactions present on the candidate but not on the primary.
    pub bad_gtid_set: Option<String>,
}

impl CandidateStatus {
    pub fn new(status: CandidateDiagStatus) -> Self {
        Self {
            status,
            bad_gtid_set: None,
        }
    }
}

// ============================================================================
// Cluster diagnosis
// ============================================================================

/// Aggregate cluster health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterDiagStatus {
    /// Single quorate partition, every member reachable and healthy.
    Online,
    /// Quorate, some members offline.
    OnlinePartial,
    /// Quorate, some members unreachable: a hidden split-brain is possible.
    OnlineUncertain,
    /// All reachable, none online. Safe to reboot.
    Offline,
    OfflineUncertain,
    /// All reachable, none quorate. Safe to force quorum.
    NoQuorum,
    NoQuorumUncertain,
    /// Two or more disjoint quorate partitions.
    SplitBrain,
    SplitBrainUncertain,
    /// No member reachable.
    Unknown,
    /// The group has not been created yet.
    Initializing,
    /// The cluster object is being torn down.
    Finalizing,
    Invalid,
    Pending,
}

impl ClusterDiagStatus {
    /// Quorate with exactly one partition.
    pub fn is_online(&self) -> bool {
        matches!(
            self,
            ClusterDiagStatus::Online
                | ClusterDiagStatus::OnlinePartial
                | ClusterDiagStatus::OnlineUncertain
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterDiagStatus::Online => "ONLINE",
            ClusterDiagStatus::OnlinePartial => "ONLINE_PARTIAL",
            ClusterDiagStatus::OnlineUncertain => "ONLINE_UNCERTAIN",
            ClusterDiagStatus::Offline => "OFFLINE",
            ClusterDiagStatus::OfflineUncertain => "OFFLINE_UNCERTAIN",
            ClusterDiagStatus::NoQuorum => "NO_QUORUM",
            ClusterDiagStatus::NoQuorumUncertain => "NO_QUORUM_UNCERTAIN",
            ClusterDiagStatus::SplitBrain => "SPLIT_BRAIN",
            ClusterDiagStatus::SplitBrainUncertain => "SPLIT_BRAIN_UNCERTAIN",
            ClusterDiagStatus::Unknown => "UNKNOWN",
            ClusterDiagStatus::Initializing => "INITIALIZING",
            ClusterDiagStatus::Finalizing => "FINALIZING",
            ClusterDiagStatus::Invalid => "INVALID",
            ClusterDiagStatus::Pending => "PENDING",
        }
    }
}

impl fmt::Display for ClusterDiagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of one diagnosis pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatus {
    pub status: ClusterDiagStatus,
    pub primary: Option<MemberInstance>,
    /// Union of every active partition, in index order.
    pub online_members: Vec<MemberInstance>,
    /// Largest blocked partition; the seed for forcing quorum.
    pub quorum_candidates: Option<Vec<MemberInstance>>,
    /// Executed transaction set per member; `None` when it could not be read.
    pub gtid_executed: BTreeMap<MemberIndex, Option<String>>,
}

impl ClusterStatus {
    pub fn new(status: ClusterDiagStatus) -> Self {
        Self {
            status,
            primary: None,
            online_members: Vec::new(),
            quorum_candidates: None,
            gtid_executed: BTreeMap::new(),
        }
    }
}
