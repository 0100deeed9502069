//! Database admin client interface.
//!
//! The operator never speaks the database wire protocol itself. An
//! [`AdminConnector`] opens management sessions to members; an
//! [`AdminSession`] exposes the administrative verbs the controller needs
//! (create, add, rejoin, remove, reboot, force quorum) plus the group status
//! queries the probe reads. Every failure is a [`DbError`] with a stable
//! numeric code, which the probe and controller classify.
//!
//! Implementations are provided by the deployment (a shell-backed client in
//! production, the in-memory simulator in tests).

use crate::config::{ExitStateAction, MemberAuth};
use crate::error::DbError;
use crate::types::{Endpoint, MemberRole, MemberState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Result of an admin client call.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// One peer's entry in a member's view of the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub state: MemberState,
    pub role: MemberRole,
}

/// A member's view of its replication group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    /// The reporting member is part of a majority.
    pub has_quorum: bool,
    /// Identifier of the group view the member currently participates in.
    pub view_id: Option<String>,
    /// Address of the reporting member, as it appears in `members`.
    pub self_address: String,
    /// Peer address to peer entry, including the reporting member.
    pub members: BTreeMap<String, PeerInfo>,
}

impl GroupStatus {
    /// The reporting member's own entry.
    pub fn self_member(&self) -> Option<&PeerInfo> {
        self.members.get(&self.self_address)
    }

    /// Address of the member the reporter considers primary.
    pub fn primary(&self) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, peer)| peer.role == MemberRole::Primary && peer.state.is_active())
            .map(|(addr, _)| addr.as_str())
    }

    /// Peer table reduced to states.
    pub fn peer_states(&self) -> BTreeMap<String, MemberState> {
        self.members
            .iter()
            .map(|(addr, peer)| (addr.clone(), peer.state))
            .collect()
    }
}

/// How a joining member obtains the data it is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMethod {
    /// Replay the missing transactions from a donor's binary log.
    Incremental,
    /// Full state transfer from a donor.
    Clone,
}

impl std::fmt::Display for RecoveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryMethod::Incremental => f.write_str("incremental"),
            RecoveryMethod::Clone => f.write_str("clone"),
        }
    }
}

/// Group options applied when a cluster is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    pub member_auth: MemberAuth,
    pub exit_state_action: ExitStateAction,
    pub auto_rejoin_tries: u32,
    pub start_on_boot: bool,
}

/// Kind of asynchronous group notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Membership changed and a new view was installed.
    ViewChanged,
    /// A member changed state without a new view.
    StateChanged,
    /// The primary changed.
    RoleChanged,
    /// The reporting member lost quorum.
    QuorumLost,
}

/// Notification pushed by a member over the admin protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupNotification {
    pub kind: NotificationKind,
    /// View identifier carried by view change notifications.
    pub view_id: Option<String>,
}

/// Opens management sessions.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    /// Open a session to `endpoint` as the operator's admin account.
    async fn connect(&self, endpoint: &Endpoint) -> DbResult<Box<dyn AdminSession>>;
}

/// An open management session to one member.
#[async_trait]
pub trait AdminSession: Send + Sync {
    /// Address of the member this session is connected to.
    fn address(&self) -> &str;

    /// The member's executed transaction set.
    async fn gtid_executed(&self) -> DbResult<String>;

    /// Server-side transaction set subtraction: `set - subtrahend`.
    async fn gtid_subtract(&self, set: &str, subtrahend: &str) -> DbResult<String>;

    /// The member's own view of its group.
    ///
    /// Fails with `INSTANCE_NOT_ONLINE` when the member is not part of a
    /// group, `INSTANCE_NOT_MANAGED` when it never joined one and
    /// `UNMANAGED_GROUP` when its group is unknown to the cluster metadata.
    async fn describe_group(&self) -> DbResult<GroupStatus>;

    /// Member addresses registered in the cluster metadata.
    async fn cluster_topology(&self) -> DbResult<Vec<String>>;

    /// Read replica addresses attached to the cluster.
    async fn read_replicas(&self) -> DbResult<Vec<String>>;

    /// Create a new group with this member as its seed.
    async fn create_cluster(&self, name: &str, options: &CreateOptions) -> DbResult<()>;

    /// Add `address` as a group member.
    async fn add_instance(&self, address: &str, recovery: RecoveryMethod) -> DbResult<()>;

    /// Attach `address` as a read replica.
    async fn add_replica_instance(&self, address: &str, recovery: RecoveryMethod) -> DbResult<()>;

    /// Re-admit a member that dropped out of the group.
    async fn rejoin_instance(&self, address: &str) -> DbResult<()>;

    /// Remove `address` from the group and the metadata.
    async fn remove_instance(&self, address: &str, force: bool) -> DbResult<()>;

    /// Restart the group from this member after every member went offline.
    async fn reboot_cluster_from_complete_outage(&self, name: &str) -> DbResult<()>;

    /// Restore quorum from the partition `address` belongs to.
    async fn force_quorum_using_partition_of(&self, address: &str) -> DbResult<()>;

    /// Stop group replication on this member.
    async fn stop_group_replication(&self) -> DbResult<()>;

    /// Subscribe to group notifications. The channel closes when the
    /// session is lost.
    async fn subscribe_notifications(&self) -> DbResult<mpsc::UnboundedReceiver<GroupNotification>>;
}
