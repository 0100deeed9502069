//! Operator events.
//!
//! Every repair attempt and every unrecoverable state is reported as an
//! [`EventRecord`] with a stable `(action, reason)` pair, so alerts can match
//! on `SplitBrain` rather than on message text. Publishing is best effort:
//! [`emit`] logs a failed publish and carries on, a repair never fails
//! because an event could not be written.

use crate::error::Result;
use crate::types::{ClusterRef, MemberInstance};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Normal,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "Normal",
            Severity::Warning => "Warning",
        }
    }
}

/// What the operator was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventAction {
    CreateCluster,
    JoinInstance,
    RejoinInstance,
    RemoveInstance,
    RebootCluster,
    ForceQuorum,
    RepairCluster,
    ReconcileInstance,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::CreateCluster => "CreateCluster",
            EventAction::JoinInstance => "JoinInstance",
            EventAction::RejoinInstance => "RejoinInstance",
            EventAction::RemoveInstance => "RemoveInstance",
            EventAction::RebootCluster => "RebootCluster",
            EventAction::ForceQuorum => "ForceQuorum",
            EventAction::RepairCluster => "RepairCluster",
            EventAction::ReconcileInstance => "ReconcileInstance",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the event was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    ClusterCreated,
    InstanceJoined,
    InstanceRejoined,
    InstanceRemoved,
    RebootingCluster,
    ClusterRebooted,
    RestoringQuorum,
    QuorumRestored,
    SplitBrain,
    InvalidCluster,
    ErrantTransactions,
    JoinFailed,
    RemoveFailed,
    ClusterRepairFailed,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::ClusterCreated => "ClusterCreated",
            Reason::InstanceJoined => "InstanceJoined",
            Reason::InstanceRejoined => "InstanceRejoined",
            Reason::InstanceRemoved => "InstanceRemoved",
            Reason::RebootingCluster => "RebootingCluster",
            Reason::ClusterRebooted => "ClusterRebooted",
            Reason::RestoringQuorum => "RestoringQuorum",
            Reason::QuorumRestored => "QuorumRestored",
            Reason::SplitBrain => "SplitBrain",
            Reason::InvalidCluster => "InvalidCluster",
            Reason::ErrantTransactions => "ErrantTransactions",
            Reason::JoinFailed => "JoinFailed",
            Reason::RemoveFailed => "RemoveFailed",
            Reason::ClusterRepairFailed => "ClusterRepairFailed",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured operator event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub severity: Severity,
    pub action: EventAction,
    pub reason: Reason,
    pub message: String,
}

impl EventRecord {
    pub fn normal(action: EventAction, reason: Reason, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Normal,
            action,
            reason,
            message: message.into(),
        }
    }

    pub fn warning(action: EventAction, reason: Reason, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            action,
            reason,
            message: message.into(),
        }
    }
}

/// The object an event is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTarget {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

impl EventTarget {
    pub fn cluster(cluster: &ClusterRef) -> Self {
        Self {
            api_version: "groupkeeper.io/v1",
            kind: "GroupCluster",
            namespace: cluster.namespace.clone(),
            name: cluster.name.clone(),
        }
    }

    pub fn member(member: &MemberInstance) -> Self {
        Self {
            api_version: "v1",
            kind: "Pod",
            namespace: member.namespace.clone(),
            name: member.name.clone(),
        }
    }
}

impl fmt::Display for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Destination for operator events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, target: &EventTarget, event: &EventRecord) -> Result<()>;
}

/// Publish `event`, logging instead of failing.
pub async fn emit(sink: &dyn EventSink, target: &EventTarget, event: EventRecord) {
    if let Err(e) = sink.publish(target, &event).await {
        warn!(
            target_object = %target,
            reason = %event.reason,
            error = %e,
            "Failed to publish event"
        );
    }
}

/// Sink that only writes to the log.
#[derive(Debug, Clone, Default)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn publish(&self, target: &EventTarget, event: &EventRecord) -> Result<()> {
        match event.severity {
            Severity::Normal => info!(
                target_object = %target,
                action = %event.action,
                reason = %event.reason,
                "{}", event.message
            ),
            Severity::Warning => warn!(
                target_object = %target,
                action = %event.action,
                reason = %event.reason,
                "{}", event.message
            ),
        }
        Ok(())
    }
}

/// Sink writing core/v1 Events.
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    component: String,
}

impl KubeEventSink {
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, target: &EventTarget, event: &EventRecord) -> Result<()> {
        let now = Time(Utc::now());
        let api: Api<Event> = Api::namespaced(self.client.clone(), &target.namespace);

        let k8s_event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", target.name)),
                namespace: Some(target.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(target.api_version.to_string()),
                kind: Some(target.kind.to_string()),
                name: Some(target.name.clone()),
                namespace: Some(target.namespace.clone()),
                ..Default::default()
            },
            type_: Some(event.severity.as_str().to_string()),
            action: Some(event.action.as_str().to_string()),
            reason: Some(event.reason.as_str().to_string()),
            message: Some(event.message.clone()),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                ..Default::default()
            }),
            reporting_component: Some(self.component.clone()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        };

        api.create(&PostParams::default(), &k8s_event).await?;
        Ok(())
    }
}
