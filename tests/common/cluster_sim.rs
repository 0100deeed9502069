// In-memory replication group simulation for integration tests.
// Implements the admin client seams over a shared table of member states.

use async_trait::async_trait;
use groupkeeper::db::{
    AdminConnector, AdminSession, CreateOptions, DbResult, GroupNotification, GroupStatus,
    NotificationKind, PeerInfo, RecoveryMethod,
};
use groupkeeper::error::{codes, DbError};
use groupkeeper::gtid::GtidSet;
use groupkeeper::types::{Endpoint, MemberRole, MemberState};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Administrative verbs, used for call recording and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Connect,
    CreateCluster,
    AddInstance,
    AddReplicaInstance,
    RejoinInstance,
    RemoveInstance,
    Reboot,
    ForceQuorum,
    StopGroupReplication,
}

/// One recorded administrative call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    /// Address of the member the session was connected to.
    pub via: String,
    /// Target address or cluster name.
    pub target: String,
    pub recovery: Option<RecoveryMethod>,
    pub force: bool,
}

/// Simulated state of one member server.
#[derive(Debug, Clone)]
pub struct SimMember {
    pub connect_error: Option<u32>,
    pub gtid_executed: String,
    pub gtid_error: Option<u32>,
    /// The member's own group view, or the error code `describe_group` fails with.
    pub group: std::result::Result<GroupStatus, u32>,
}

impl Default for SimMember {
    fn default() -> Self {
        Self {
            connect_error: None,
            gtid_executed: String::new(),
            gtid_error: None,
            group: Err(codes::INSTANCE_NOT_MANAGED),
        }
    }
}

#[derive(Default)]
struct SimState {
    members: HashMap<String, SimMember>,
    topology: Vec<String>,
    replicas: Vec<String>,
    admin_user: Option<String>,
    calls: Vec<Call>,
    failures: HashMap<Verb, VecDeque<u32>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<GroupNotification>>>,
    epoch: u64,
}

/// Shared simulated database, usable as an [`AdminConnector`].
#[derive(Clone, Default)]
pub struct SimDb {
    state: Arc<Mutex<SimState>>,
}

impl SimDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member server in its initial, never-joined state.
    pub fn add_member(&self, address: &str) {
        self.state
            .lock()
            .members
            .insert(address.to_string(), SimMember::default());
    }

    /// Modify one member's state.
    pub fn update<F>(&self, address: &str, f: F)
    where
        F: FnOnce(&mut SimMember),
    {
        let mut state = self.state.lock();
        let member = state.members.entry(address.to_string()).or_default();
        f(member);
    }

    pub fn member(&self, address: &str) -> Option<SimMember> {
        self.state.lock().members.get(address).cloned()
    }

    pub fn set_gtid(&self, address: &str, gtid: &str) {
        self.update(address, |m| m.gtid_executed = gtid.to_string());
    }

    /// Make `address` refuse connections with `code`.
    pub fn set_unreachable(&self, address: &str, code: u32) {
        self.update(address, |m| m.connect_error = Some(code));
    }

    /// Make `describe_group` on `address` fail with `code`.
    pub fn set_group_error(&self, address: &str, code: u32) {
        self.update(address, |m| m.group = Err(code));
    }

    /// Install an explicit view on `address`.
    pub fn set_view(
        &self,
        address: &str,
        has_quorum: bool,
        view_id: Option<&str>,
        peers: &[(&str, MemberState, MemberRole)],
    ) {
        let members = peers
            .iter()
            .map(|(addr, state, role)| {
                (
                    addr.to_string(),
                    PeerInfo {
                        state: *state,
                        role: *role,
                    },
                )
            })
            .collect();
        let group = GroupStatus {
            has_quorum,
            view_id: view_id.map(str::to_string),
            self_address: address.to_string(),
            members,
        };
        self.update(address, |m| m.group = Ok(group));
    }

    /// Give every listed member the same healthy view with `primary` in charge,
    /// and register them in the cluster metadata.
    pub fn form_group(&self, addresses: &[String], primary: &str) {
        let mut state = self.state.lock();
        form_group_locked(&mut state, addresses, primary);
        for address in addresses {
            if !state.topology.contains(address) {
                state.topology.push(address.clone());
            }
        }
    }

    pub fn set_topology(&self, addresses: &[String]) {
        self.state.lock().topology = addresses.to_vec();
    }

    pub fn topology(&self) -> Vec<String> {
        self.state.lock().topology.clone()
    }

    pub fn replicas(&self) -> Vec<String> {
        self.state.lock().replicas.clone()
    }

    /// Refuse connections that do not log in as `user`.
    pub fn require_user(&self, user: &str) {
        self.state.lock().admin_user = Some(user.to_string());
    }

    /// Make the next calls of `verb` fail with `code`, once per entry.
    pub fn fail_next(&self, verb: Verb, code: u32) {
        self.state
            .lock()
            .failures
            .entry(verb)
            .or_default()
            .push_back(code);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn calls_of(&self, verb: Verb) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.verb == verb).collect()
    }

    /// Verbs that change the group, excluding connections.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.verb != Verb::Connect)
            .collect()
    }

    /// Push a notification to every subscriber of `address`.
    pub fn notify(&self, address: &str, kind: NotificationKind, view_id: Option<&str>) {
        let mut state = self.state.lock();
        if let Some(subscribers) = state.subscribers.get_mut(address) {
            subscribers.retain(|tx| {
                tx.send(GroupNotification {
                    kind,
                    view_id: view_id.map(str::to_string),
                })
                .is_ok()
            });
        }
    }

    /// Close every notification stream of `address`.
    pub fn disconnect_subscribers(&self, address: &str) {
        self.state.lock().subscribers.remove(address);
    }

    pub fn subscriber_count(&self, address: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(address)
            .map_or(0, |s| s.iter().filter(|tx| !tx.is_closed()).count())
    }

    fn take_failure(&self, verb: Verb) -> Option<u32> {
        self.state
            .lock()
            .failures
            .get_mut(&verb)
            .and_then(|q| q.pop_front())
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    fn run_verb(
        &self,
        verb: Verb,
        via: &str,
        target: &str,
        recovery: Option<RecoveryMethod>,
        force: bool,
    ) -> DbResult<()> {
        self.record(Call {
            verb,
            via: via.to_string(),
            target: target.to_string(),
            recovery,
            force,
        });
        match self.take_failure(verb) {
            Some(code) => Err(DbError::new(code, format!("injected {:?} failure", verb))),
            None => Ok(()),
        }
    }
}

fn form_group_locked(state: &mut SimState, addresses: &[String], primary: &str) {
    state.epoch += 1;
    let view_id = format!("{}:{}", state.epoch, addresses.len());
    let peers: BTreeMap<String, PeerInfo> = addresses
        .iter()
        .map(|addr| {
            let role = if addr == primary {
                MemberRole::Primary
            } else {
                MemberRole::Secondary
            };
            (
                addr.clone(),
                PeerInfo {
                    state: MemberState::Online,
                    role,
                },
            )
        })
        .collect();

    for address in addresses {
        let member = state.members.entry(address.clone()).or_default();
        member.group = Ok(GroupStatus {
            has_quorum: true,
            view_id: Some(view_id.clone()),
            self_address: address.clone(),
            members: peers.clone(),
        });
    }
}

/// Online members of the group `via` currently sees, in address order.
fn online_peers(state: &SimState, via: &str) -> Vec<String> {
    match state.members.get(via).map(|m| &m.group) {
        Some(Ok(group)) => group
            .members
            .iter()
            .filter(|(_, peer)| peer.state == MemberState::Online)
            .map(|(addr, _)| addr.clone())
            .collect(),
        _ => Vec::new(),
    }
}

fn current_primary(state: &SimState, via: &str) -> String {
    match state.members.get(via).map(|m| &m.group) {
        Some(Ok(group)) => group.primary().unwrap_or(via).to_string(),
        _ => via.to_string(),
    }
}

#[async_trait]
impl AdminConnector for SimDb {
    async fn connect(&self, endpoint: &Endpoint) -> DbResult<Box<dyn AdminSession>> {
        let address = endpoint.address();
        self.record(Call {
            verb: Verb::Connect,
            via: address.clone(),
            target: address.clone(),
            recovery: None,
            force: false,
        });

        if let Some(code) = self.take_failure(Verb::Connect) {
            return Err(DbError::new(code, "injected connect failure"));
        }
        let required = self.state.lock().admin_user.clone();
        if let Some(user) = required.filter(|u| *u != endpoint.user) {
            return Err(DbError::new(
                codes::ACCESS_DENIED,
                format!("access denied for {}, expected {}", endpoint.user, user),
            ));
        }
        let member = self
            .member(&address)
            .ok_or_else(|| DbError::new(codes::CONN_HOST_ERROR, format!("unknown host {}", address)))?;
        if let Some(code) = member.connect_error {
            return Err(DbError::new(code, format!("cannot connect to {}", address)));
        }

        Ok(Box::new(SimSession {
            db: self.clone(),
            address,
        }))
    }
}

/// A session to one simulated member.
pub struct SimSession {
    db: SimDb,
    address: String,
}

impl SimSession {
    fn member(&self) -> DbResult<SimMember> {
        let member = self
            .db
            .member(&self.address)
            .ok_or_else(|| DbError::new(codes::SERVER_GONE, "server vanished"))?;
        match member.connect_error {
            Some(code) => Err(DbError::new(code, "connection lost")),
            None => Ok(member),
        }
    }
}

#[async_trait]
impl AdminSession for SimSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn gtid_executed(&self) -> DbResult<String> {
        let member = self.member()?;
        match member.gtid_error {
            Some(code) => Err(DbError::new(code, "cannot read gtid_executed")),
            None => Ok(member.gtid_executed),
        }
    }

    async fn gtid_subtract(&self, set: &str, subtrahend: &str) -> DbResult<String> {
        let parse = |s: &str| {
            s.parse::<GtidSet>()
                .map_err(|e| DbError::new(1772, e.to_string()))
        };
        Ok(parse(set)?.subtract(&parse(subtrahend)?).to_string())
    }

    async fn describe_group(&self) -> DbResult<GroupStatus> {
        self.member()?
            .group
            .map_err(|code| DbError::new(code, "no group view"))
    }

    async fn cluster_topology(&self) -> DbResult<Vec<String>> {
        self.member()?;
        Ok(self.db.topology())
    }

    async fn read_replicas(&self) -> DbResult<Vec<String>> {
        self.member()?;
        Ok(self.db.replicas())
    }

    async fn create_cluster(&self, name: &str, _options: &CreateOptions) -> DbResult<()> {
        self.db
            .run_verb(Verb::CreateCluster, &self.address, name, None, false)?;
        let mut state = self.db.state.lock();
        form_group_locked(&mut state, &[self.address.clone()], &self.address);
        state.topology = vec![self.address.clone()];
        Ok(())
    }

    async fn add_instance(&self, address: &str, recovery: RecoveryMethod) -> DbResult<()> {
        self.db
            .run_verb(Verb::AddInstance, &self.address, address, Some(recovery), false)?;
        let mut state = self.db.state.lock();
        let mut group = online_peers(&state, &self.address);
        if !group.iter().any(|a| a == address) {
            group.push(address.to_string());
        }
        let primary = current_primary(&state, &self.address);
        form_group_locked(&mut state, &group, &primary);
        if !state.topology.iter().any(|a| a == address) {
            state.topology.push(address.to_string());
        }
        Ok(())
    }

    async fn add_replica_instance(&self, address: &str, recovery: RecoveryMethod) -> DbResult<()> {
        self.db.run_verb(
            Verb::AddReplicaInstance,
            &self.address,
            address,
            Some(recovery),
            false,
        )?;
        let mut state = self.db.state.lock();
        if !state.replicas.iter().any(|a| a == address) {
            state.replicas.push(address.to_string());
        }
        Ok(())
    }

    async fn rejoin_instance(&self, address: &str) -> DbResult<()> {
        self.db
            .run_verb(Verb::RejoinInstance, &self.address, address, None, false)?;
        let mut state = self.db.state.lock();
        let mut group = online_peers(&state, &self.address);
        if !group.iter().any(|a| a == address) {
            group.push(address.to_string());
        }
        let primary = current_primary(&state, &self.address);
        form_group_locked(&mut state, &group, &primary);
        Ok(())
    }

    async fn remove_instance(&self, address: &str, force: bool) -> DbResult<()> {
        self.db
            .run_verb(Verb::RemoveInstance, &self.address, address, None, force)?;
        let mut state = self.db.state.lock();
        if state.replicas.iter().any(|a| a == address) {
            state.replicas.retain(|a| a != address);
            return Ok(());
        }
        if !state.topology.iter().any(|a| a == address) {
            return Err(DbError::new(
                codes::MEMBER_METADATA_MISSING,
                format!("{} is not registered in the cluster metadata", address),
            ));
        }
        state.topology.retain(|a| a != address);

        let group: Vec<String> = online_peers(&state, &self.address)
            .into_iter()
            .filter(|a| a != address)
            .collect();
        let primary = current_primary(&state, &self.address);
        form_group_locked(&mut state, &group, &primary);
        if let Some(member) = state.members.get_mut(address) {
            member.group = Err(codes::INSTANCE_NOT_MANAGED);
        }
        Ok(())
    }

    async fn reboot_cluster_from_complete_outage(&self, name: &str) -> DbResult<()> {
        self.db
            .run_verb(Verb::Reboot, &self.address, name, None, false)?;
        let mut state = self.db.state.lock();
        form_group_locked(&mut state, &[self.address.clone()], &self.address);
        Ok(())
    }

    async fn force_quorum_using_partition_of(&self, address: &str) -> DbResult<()> {
        self.db
            .run_verb(Verb::ForceQuorum, &self.address, address, None, false)?;
        let mut state = self.db.state.lock();
        let group = online_peers(&state, address);
        let primary = current_primary(&state, address);
        form_group_locked(&mut state, &group, &primary);
        Ok(())
    }

    async fn stop_group_replication(&self) -> DbResult<()> {
        self.db.run_verb(
            Verb::StopGroupReplication,
            &self.address,
            &self.address,
            None,
            false,
        )?;
        self.db.update(&self.address, |m| m.group = Err(codes::INSTANCE_NOT_ONLINE));
        Ok(())
    }

    async fn subscribe_notifications(&self) -> DbResult<mpsc::UnboundedReceiver<GroupNotification>> {
        self.member()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.db
            .state
            .lock()
            .subscribers
            .entry(self.address.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
