// Test fixtures: in-memory member directory, recording event sink and a
// builder wiring them to a simulated database.

use super::cluster_sim::SimDb;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use groupkeeper::config::{MemberAuth, MonitorConfig, OperatorConfig};
use groupkeeper::controller::ClusterController;
use groupkeeper::crd::{ClusterStatusRecord, MemberStatusRecord};
use groupkeeper::directory::MemberDirectory;
use groupkeeper::error::Result;
use groupkeeper::events::{EventRecord, EventSink, EventTarget, Reason};
use groupkeeper::registry::Registry;
use groupkeeper::resilience::RetryConfig;
use groupkeeper::types::{
    ClusterRef, Endpoint, InstanceKind, MemberInstance, MemberRole, MemberState,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub const NAMESPACE: &str = "prod";
pub const CLUSTER: &str = "db";

// =============================================================================
// Directory
// =============================================================================

#[derive(Default)]
struct DirState {
    clusters: HashMap<String, ClusterRef>,
    members: Vec<MemberInstance>,
    markers: BTreeSet<String>,
    member_status: HashMap<String, MemberStatusRecord>,
    cluster_status: HashMap<String, ClusterStatusRecord>,
    status_writes: usize,
}

/// Member directory held in memory.
#[derive(Clone, Default)]
pub struct SimDirectory {
    state: Arc<Mutex<DirState>>,
}

impl SimDirectory {
    pub fn insert_cluster(&self, cluster: ClusterRef) {
        self.state.lock().clusters.insert(cluster.key(), cluster);
    }

    pub fn remove_cluster(&self, cluster: &ClusterRef) {
        self.state.lock().clusters.remove(&cluster.key());
    }

    pub fn cluster(&self, key: &str) -> Option<ClusterRef> {
        self.state.lock().clusters.get(key).cloned()
    }

    pub fn update_cluster<F>(&self, key: &str, f: F)
    where
        F: FnOnce(&mut ClusterRef),
    {
        if let Some(cluster) = self.state.lock().clusters.get_mut(key) {
            f(cluster);
        }
    }

    pub fn insert_member(&self, member: MemberInstance) {
        let mut state = self.state.lock();
        state.members.retain(|m| m.name != member.name);
        state.members.push(member);
    }

    pub fn remove_member(&self, name: &str) {
        self.state.lock().members.retain(|m| m.name != name);
    }

    pub fn update_member<F>(&self, name: &str, f: F)
    where
        F: FnOnce(&mut MemberInstance),
    {
        if let Some(member) = self.state.lock().members.iter_mut().find(|m| m.name == name) {
            f(member);
        }
    }

    pub fn has_marker(&self, name: &str) -> bool {
        self.state.lock().markers.contains(name)
    }

    pub fn set_marker(&self, name: &str) {
        self.state.lock().markers.insert(name.to_string());
    }

    pub fn clear_marker(&self, name: &str) {
        self.state.lock().markers.remove(name);
    }

    pub fn member_status(&self, name: &str) -> Option<MemberStatusRecord> {
        self.state.lock().member_status.get(name).cloned()
    }

    pub fn cluster_status(&self, key: &str) -> Option<ClusterStatusRecord> {
        self.state.lock().cluster_status.get(key).cloned()
    }

    /// Member and cluster status writes so far.
    pub fn status_writes(&self) -> usize {
        self.state.lock().status_writes
    }
}

#[async_trait]
impl MemberDirectory for SimDirectory {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<ClusterRef>> {
        Ok(self.cluster(&format!("{}/{}", namespace, name)))
    }

    async fn list_members(&self, cluster: &ClusterRef) -> Result<Vec<MemberInstance>> {
        let mut members: Vec<MemberInstance> = self
            .state
            .lock()
            .members
            .iter()
            .filter(|m| m.namespace == cluster.namespace && m.cluster == cluster.name)
            .cloned()
            .collect();
        members.sort_by_key(|m| (m.kind == InstanceKind::ReadReplica, m.index));
        Ok(members)
    }

    async fn get_member(&self, namespace: &str, name: &str) -> Result<Option<MemberInstance>> {
        Ok(self
            .state
            .lock()
            .members
            .iter()
            .find(|m| m.namespace == namespace && m.name == name)
            .cloned())
    }

    async fn get_member_status(&self, member: &MemberInstance) -> Result<Option<MemberStatusRecord>> {
        Ok(self.member_status(&member.name))
    }

    async fn set_member_status(
        &self,
        member: &MemberInstance,
        status: &MemberStatusRecord,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.status_writes += 1;
        state.member_status.insert(member.name.clone(), status.clone());
        Ok(())
    }

    async fn set_membership_marker(&self, member: &MemberInstance) -> Result<()> {
        self.set_marker(&member.name);
        Ok(())
    }

    async fn clear_membership_marker(&self, member: &MemberInstance) -> Result<()> {
        self.state.lock().markers.remove(&member.name);
        Ok(())
    }

    async fn get_cluster_status(&self, cluster: &ClusterRef) -> Result<Option<ClusterStatusRecord>> {
        Ok(self.cluster_status(&cluster.key()))
    }

    async fn patch_cluster_status(
        &self,
        cluster: &ClusterRef,
        status: &ClusterStatusRecord,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.status_writes += 1;
        state.cluster_status.insert(cluster.key(), status.clone());
        Ok(())
    }

    async fn mark_cluster_created(&self, cluster: &ClusterRef, time: DateTime<Utc>) -> Result<()> {
        self.update_cluster(&cluster.key(), |c| c.create_time = Some(time));
        Ok(())
    }
}

// =============================================================================
// Events
// =============================================================================

/// Event sink that keeps everything it is given.
#[derive(Clone, Default)]
pub struct RecordingEvents {
    events: Arc<Mutex<Vec<(EventTarget, EventRecord)>>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<Reason> {
        self.events.lock().iter().map(|(_, e)| e.reason).collect()
    }

    pub fn has(&self, reason: Reason) -> bool {
        self.reasons().contains(&reason)
    }

    pub fn for_object(&self, name: &str) -> Vec<EventRecord> {
        self.events
            .lock()
            .iter()
            .filter(|(t, _)| t.name == name)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, target: &EventTarget, event: &EventRecord) -> Result<()> {
        self.events.lock().push((target.clone(), event.clone()));
        Ok(())
    }
}

// =============================================================================
// Cluster fixture
// =============================================================================

/// Retry policy that retries quickly a few times.
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: false,
        timeout: None,
    }
}

/// Operator configuration with single-shot retries and short intervals.
pub fn test_config() -> OperatorConfig {
    let mut config = OperatorConfig::default();
    config.diagnose_retry = RetryConfig::once();
    config.action_retry = RetryConfig::once();
    config.monitor = MonitorConfig {
        poll_interval: Duration::from_millis(20),
        min_reconnect_interval: Duration::ZERO,
    };
    config
}

/// A simulated cluster `prod/db` with `n` group members.
pub struct TestCluster {
    pub db: SimDb,
    pub directory: SimDirectory,
    pub events: RecordingEvents,
    pub cluster: ClusterRef,
    pub members: Vec<MemberInstance>,
}

impl TestCluster {
    /// A created cluster whose members have never joined a group.
    pub fn new(n: usize) -> Self {
        let db = SimDb::new();
        let directory = SimDirectory::default();

        let cluster = ClusterRef {
            name: CLUSTER.to_string(),
            namespace: NAMESPACE.to_string(),
            create_time: Some(Utc::now()),
            deleting: false,
            member_auth: MemberAuth::Password,
        };
        directory.insert_cluster(cluster.clone());

        let members: Vec<MemberInstance> = (0..n).map(member).collect();
        for m in &members {
            db.add_member(&m.address());
            directory.insert_member(m.clone());
        }

        Self {
            db,
            directory,
            events: RecordingEvents::default(),
            cluster,
            members,
        }
    }

    /// A cluster whose group has not been created yet.
    pub fn uninitialized(n: usize) -> Self {
        let mut tc = Self::new(n);
        tc.cluster.create_time = None;
        tc.directory.insert_cluster(tc.cluster.clone());
        tc
    }

    /// A healthy cluster with member 0 as primary and every member joined.
    pub fn online(n: usize) -> Self {
        let tc = Self::new(n);
        let addresses = tc.addresses();
        tc.db.form_group(&addresses, &addresses[0]);
        for m in &tc.members {
            tc.directory.set_marker(&m.name);
        }
        tc
    }

    pub fn address(&self, index: usize) -> String {
        self.members[index].address()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.members.iter().map(|m| m.address()).collect()
    }

    /// Give each of `indexes` a view in which exactly those members are
    /// online, `primary` leads and every other member is unreachable.
    pub fn set_partition(&self, indexes: &[usize], primary: usize, has_quorum: bool, view_id: &str) {
        let peers: Vec<(String, MemberState, MemberRole)> = self
            .members
            .iter()
            .map(|m| {
                let state = if indexes.contains(&m.index) {
                    MemberState::Online
                } else {
                    MemberState::Unreachable
                };
                let role = if m.index == primary {
                    MemberRole::Primary
                } else {
                    MemberRole::Secondary
                };
                (m.address(), state, role)
            })
            .collect();
        let peers: Vec<(&str, MemberState, MemberRole)> = peers
            .iter()
            .map(|(addr, state, role)| (addr.as_str(), *state, *role))
            .collect();

        for &index in indexes {
            self.db
                .set_view(&self.address(index), has_quorum, Some(view_id), &peers);
        }
    }

    /// Current cluster record from the directory.
    pub fn current_cluster(&self) -> ClusterRef {
        self.directory
            .cluster(&self.cluster.key())
            .unwrap_or_else(|| self.cluster.clone())
    }

    /// Add a read replica pod to the directory and the database.
    pub fn add_replica(&mut self, index: usize) -> MemberInstance {
        let mut replica = member(index);
        replica.name = format!("{}-replica-{}", CLUSTER, index);
        replica.kind = InstanceKind::ReadReplica;
        replica.endpoint = Endpoint::new(
            format!("{}.{}-instances.{}.svc.cluster.local", replica.name, CLUSTER, NAMESPACE),
            3306,
            33060,
        );
        self.db.add_member(&replica.address());
        self.directory.insert_member(replica.clone());
        replica
    }

    pub fn controller(&self) -> ClusterController {
        self.controller_with(test_config())
    }

    pub fn controller_with(&self, config: OperatorConfig) -> ClusterController {
        let connector = Arc::new(self.db.clone());
        let registry = Arc::new(Registry::new(connector.clone(), &config));
        ClusterController::new(
            connector,
            Arc::new(self.directory.clone()),
            Arc::new(self.events.clone()),
            registry,
            config,
        )
    }
}

/// Member `index` of `prod/db`, ready and not deleting.
pub fn member(index: usize) -> MemberInstance {
    let name = format!("{}-{}", CLUSTER, index);
    MemberInstance {
        endpoint: Endpoint::new(
            format!("{}.{}-instances.{}.svc.cluster.local", name, CLUSTER, NAMESPACE),
            3306,
            33060,
        ),
        name,
        namespace: NAMESPACE.to_string(),
        cluster: CLUSTER.to_string(),
        index,
        kind: InstanceKind::GroupMember,
        deleting: false,
        ready: true,
    }
}
