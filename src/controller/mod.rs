//! Cluster controller: the repair and reconciliation state machine.
//!
//! The controller reacts to member and cluster events. Each entry point takes
//! the cluster lock, re-reads the cluster, diagnoses it and then performs at
//! most one kind of action:
//!
//! - create the group when the cluster is still initializing
//! - reconcile the triggering member when the cluster is online
//! - repair the cluster otherwise, then ask to be called again
//!
//! A repair is never assumed to have worked: the entry point reports a
//! temporary error after it, so the next pass starts from a fresh diagnosis.
//!
//! # Components
//!
//! - `actions`: create, join, rejoin, remove, reboot, force quorum
//! - `repair`: the diagnosis dispatch table and per-member reconcile
//! - `handlers`: event entry points and the monitor callback

mod actions;
mod handlers;
mod repair;

pub use repair::RepairOutcome;

use crate::config::OperatorConfig;
use crate::crd::ClusterStatusRecord;
use crate::db::AdminConnector;
use crate::diagnose::Diagnoser;
use crate::directory::{update_cluster_status, MemberDirectory};
use crate::error::{OperatorError, Result};
use crate::events::{emit, EventRecord, EventSink, EventTarget};
use crate::probe::{connect_to_primary, PrimarySession};
use crate::registry::Registry;
use crate::resilience::RetryExecutor;
use crate::types::{ClusterRef, ClusterStatus, InstanceKind, MemberInstance};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// The repair and reconciliation state machine.
pub struct ClusterController {
    connector: Arc<dyn AdminConnector>,
    directory: Arc<dyn MemberDirectory>,
    events: Arc<dyn EventSink>,
    registry: Arc<Registry>,
    config: OperatorConfig,
    diagnoser: Diagnoser,
    action_retry: RetryExecutor,
}

impl ClusterController {
    pub fn new(
        connector: Arc<dyn AdminConnector>,
        directory: Arc<dyn MemberDirectory>,
        events: Arc<dyn EventSink>,
        registry: Arc<Registry>,
        config: OperatorConfig,
    ) -> Self {
        let diagnoser = Diagnoser::new(
            Arc::clone(&connector),
            Arc::clone(&directory),
            config.diagnose_retry.clone(),
        );
        let action_retry = RetryExecutor::new(config.action_retry.clone());
        Self {
            connector,
            directory,
            events,
            registry,
            config,
            diagnoser,
            action_retry,
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn diagnoser(&self) -> &Diagnoser {
        &self.diagnoser
    }

    /// Run one remote verb under the action retry policy.
    async fn run_action<F, Fut>(&self, what: &str, f: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.action_retry.execute(what, f).await
    }

    async fn emit_cluster(&self, cluster: &ClusterRef, event: EventRecord) {
        emit(self.events.as_ref(), &EventTarget::cluster(cluster), event).await;
    }

    async fn emit_member(&self, member: &MemberInstance, event: EventRecord) {
        emit(self.events.as_ref(), &EventTarget::member(member), event).await;
    }

    /// Group members of `cluster`, freshly listed.
    async fn group_members(&self, cluster: &ClusterRef) -> Result<Vec<MemberInstance>> {
        Ok(self
            .directory
            .list_members(cluster)
            .await?
            .into_iter()
            .filter(|m| m.kind == InstanceKind::GroupMember)
            .collect())
    }

    /// Re-read a cluster; a vanished cluster is reported as `None`.
    async fn refresh_cluster(&self, cluster: &ClusterRef) -> Result<Option<ClusterRef>> {
        self.directory
            .get_cluster(&cluster.namespace, &cluster.name)
            .await
    }

    /// Open a session to the primary the diagnosis found, falling back to a
    /// scan of the online members.
    async fn primary_session(&self, status: &ClusterStatus) -> Result<PrimarySession> {
        if let Some(primary) = &status.primary {
            match self.connector.connect(&primary.endpoint).await {
                Ok(session) => {
                    return Ok(PrimarySession {
                        member: primary.clone(),
                        session,
                    })
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => debug!(pod = %primary, error = %e, "Diagnosed primary unreachable"),
            }
        }

        connect_to_primary(self.connector.as_ref(), &status.online_members)
            .await?
            .ok_or_else(|| OperatorError::temporary("no primary reachable"))
    }

    /// Open a session to the first reachable member of `members`.
    async fn any_session(&self, members: &[MemberInstance]) -> Result<PrimarySession> {
        let mut last_error = None;
        for member in members {
            match self.connector.connect(&member.endpoint).await {
                Ok(session) => {
                    return Ok(PrimarySession {
                        member: member.clone(),
                        session,
                    })
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .map(OperatorError::from)
            .unwrap_or_else(|| OperatorError::temporary("no member reachable")))
    }

    /// Persist a diagnosis on the cluster resource. Failures are logged only.
    async fn record_status(&self, cluster: &ClusterRef, status: &ClusterStatus) {
        let record: ClusterStatusRecord = status.to_status_record(Utc::now());
        match update_cluster_status(self.directory.as_ref(), cluster, &record).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(cluster = %cluster, status = %record.status, "Cluster status unchanged")
            }
            Err(e) => warn!(cluster = %cluster, error = %e, "Failed to record cluster status"),
        }
    }

    /// Make sure the monitor follows an online cluster.
    async fn watch_cluster(&self, cluster: &ClusterRef) {
        match self.group_members(cluster).await {
            Ok(members) => self.registry.monitor().watch(cluster, members),
            Err(e) => warn!(cluster = %cluster, error = %e, "Could not list members to monitor"),
        }
    }
}
