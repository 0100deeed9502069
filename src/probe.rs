//! Instance probe and candidate evaluation.
//!
//! [`diagnose_instance`] turns one member into an [`InstanceStatus`] by
//! combining the outcome of a management connection with the member's own
//! view of the group. [`diagnose_cluster_candidate`] builds on it to decide
//! whether a member may join or rejoin, using a session to the primary as the
//! reference for errant transactions.

use crate::db::{AdminConnector, AdminSession};
use crate::directory::MemberDirectory;
use crate::error::{codes, DbError, OperatorError, Result};
use crate::types::{
    CandidateDiagStatus, CandidateStatus, InstanceDiagStatus, InstanceKind, InstanceStatus,
    MemberInstance, MemberRole, MemberState,
};
use tracing::{debug, info, warn};

/// Probe one member.
///
/// Uses `session` when given, otherwise opens a new one. Transport failures
/// are classified using the member's refreshed liveness; authentication and
/// schema-integrity failures propagate as fatal errors.
pub async fn diagnose_instance(
    connector: &dyn AdminConnector,
    directory: &dyn MemberDirectory,
    member: &MemberInstance,
    session: Option<&dyn AdminSession>,
) -> Result<InstanceStatus> {
    let connected;
    let session = match session {
        Some(s) => s,
        None => match connector.connect(&member.endpoint).await {
            Ok(s) => {
                connected = s;
                connected.as_ref()
            }
            Err(e) => return classify_connect_error(directory, member, e).await,
        },
    };

    let gtid_executed = match session.gtid_executed().await {
        Ok(gtid) => Some(gtid),
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) if e.is_client_error() => {
            debug!(pod = %member, error = %e, "Connection lost while reading transaction set");
            return Ok(InstanceStatus::new(InstanceDiagStatus::Unreachable).with_connect_error(e.code));
        }
        Err(e) => {
            warn!(pod = %member, error = %e, "Could not read transaction set");
            None
        }
    };

    let group = match session.describe_group().await {
        Ok(group) => group,
        Err(e) => {
            let status = match e.code {
                codes::INSTANCE_NOT_ONLINE => InstanceDiagStatus::Offline,
                codes::INSTANCE_NOT_MANAGED => InstanceDiagStatus::NotManaged,
                codes::UNMANAGED_GROUP => InstanceDiagStatus::Unmanaged,
                _ if e.is_fatal() => return Err(e.into()),
                _ if e.is_client_error() => InstanceDiagStatus::Unreachable,
                _ => {
                    info!(pod = %member, error = %e, "Unclassified group status error");
                    InstanceDiagStatus::Unknown
                }
            };
            debug!(pod = %member, %status, code = e.code, "No group view");
            return Ok(InstanceStatus::new(status).with_gtid_executed(gtid_executed));
        }
    };

    let own = group.self_member().ok_or_else(|| {
        OperatorError::InvariantViolation(format!(
            "{} is missing from its own group view",
            group.self_address
        ))
    })?;

    let status = match own.state {
        MemberState::Online => InstanceDiagStatus::Online,
        MemberState::Recovering => InstanceDiagStatus::Recovering,
        MemberState::Error => InstanceDiagStatus::Error,
        MemberState::Offline => InstanceDiagStatus::Offline,
        MemberState::Unreachable => InstanceDiagStatus::Unreachable,
        MemberState::Missing => {
            return Err(OperatorError::InvariantViolation(format!(
                "{} reports itself as {}",
                group.self_address,
                own.state
            )))
        }
    };

    let probe = InstanceStatus {
        status,
        connect_error: None,
        view_id: group.view_id.clone(),
        is_primary: Some(own.role == MemberRole::Primary),
        in_quorum: Some(group.has_quorum),
        peers: group.peer_states(),
        gtid_executed,
    };
    debug!(
        pod = %member,
        status = %probe.status,
        primary = ?probe.is_primary,
        quorum = ?probe.in_quorum,
        view = ?probe.view_id,
        "Instance probed"
    );
    Ok(probe)
}

async fn classify_connect_error(
    directory: &dyn MemberDirectory,
    member: &MemberInstance,
    err: DbError,
) -> Result<InstanceStatus> {
    if !err.is_client_error() {
        if err.is_fatal() {
            return Err(err.into());
        }
        info!(pod = %member, error = %err, "Connection rejected");
        return Ok(InstanceStatus::new(InstanceDiagStatus::Unknown).with_connect_error(err.code));
    }

    let refreshed = directory.get_member(&member.namespace, &member.name).await?;
    let status = match refreshed {
        Some(m) if m.ready && !m.deleting => InstanceDiagStatus::Unreachable,
        _ => InstanceDiagStatus::Offline,
    };
    debug!(pod = %member, %status, code = err.code, "Could not connect");
    Ok(InstanceStatus::new(status).with_connect_error(err.code))
}

/// Decide whether `member` may join or rejoin the cluster `primary` leads.
pub async fn diagnose_cluster_candidate(
    connector: &dyn AdminConnector,
    directory: &dyn MemberDirectory,
    primary: &dyn AdminSession,
    member: &MemberInstance,
    session: Option<&dyn AdminSession>,
) -> Result<CandidateStatus> {
    let probe = diagnose_instance(connector, directory, member, session).await?;

    let attached_replica = member.kind == InstanceKind::ReadReplica
        && matches!(
            probe.status,
            InstanceDiagStatus::NotManaged | InstanceDiagStatus::Unmanaged
        )
        && is_attached_replica(primary, &member.address()).await?;

    let candidate = match probe.status {
        InstanceDiagStatus::Unknown | InstanceDiagStatus::Unreachable => {
            CandidateStatus::new(CandidateDiagStatus::Unreachable)
        }
        InstanceDiagStatus::Online | InstanceDiagStatus::Recovering => {
            CandidateStatus::new(CandidateDiagStatus::Member)
        }
        // The server is down; it has to come back before it can rejoin.
        InstanceDiagStatus::Offline if probe.connect_error.is_some() => {
            CandidateStatus::new(CandidateDiagStatus::Unreachable)
        }
        InstanceDiagStatus::NotManaged | InstanceDiagStatus::Unmanaged if attached_replica => {
            CandidateStatus::new(CandidateDiagStatus::Member)
        }
        InstanceDiagStatus::NotManaged | InstanceDiagStatus::Unmanaged => {
            let errant = check_errant_gtids(primary, probe.gtid_executed.as_deref()).await?;
            admission(errant, CandidateDiagStatus::Joinable, CandidateDiagStatus::Unsuitable)
        }
        InstanceDiagStatus::Offline | InstanceDiagStatus::Error => {
            let errant = check_errant_gtids(primary, probe.gtid_executed.as_deref()).await?;
            let address = member.address();
            let topology = primary.cluster_topology().await?;
            if topology.iter().any(|a| *a == address) {
                admission(errant, CandidateDiagStatus::Rejoinable, CandidateDiagStatus::Broken)
            } else {
                admission(errant, CandidateDiagStatus::Joinable, CandidateDiagStatus::Unsuitable)
            }
        }
    };

    debug!(
        pod = %member,
        instance = %probe.status,
        candidate = %candidate.status,
        errant = ?candidate.bad_gtid_set,
        "Candidate evaluated"
    );
    Ok(candidate)
}

/// Whether `address` is already attached to the cluster as a read replica.
///
/// A replica never joins the group, so its own view always reports it as
/// not managed; only the primary knows it is attached.
pub async fn is_attached_replica(primary: &dyn AdminSession, address: &str) -> Result<bool> {
    let replicas = primary.read_replicas().await?;
    Ok(replicas.iter().any(|a| a == address))
}

fn admission(
    errant: Option<String>,
    clean: CandidateDiagStatus,
    dirty: CandidateDiagStatus,
) -> CandidateStatus {
    match errant {
        None => CandidateStatus::new(clean),
        Some(set) => CandidateStatus {
            status: dirty,
            bad_gtid_set: Some(set),
        },
    }
}

/// Transactions executed on the candidate but unknown to the primary.
///
/// The subtraction runs on the primary. Returns `None` when there are none,
/// or when the candidate's set is unknown or empty.
pub async fn check_errant_gtids(
    primary: &dyn AdminSession,
    candidate_gtid: Option<&str>,
) -> Result<Option<String>> {
    let Some(candidate_gtid) = candidate_gtid.filter(|g| !g.trim().is_empty()) else {
        return Ok(None);
    };

    let primary_gtid = primary.gtid_executed().await?;
    let errant = primary.gtid_subtract(candidate_gtid, &primary_gtid).await?;
    let errant = errant.trim();

    if errant.is_empty() {
        Ok(None)
    } else {
        Ok(Some(errant.to_string()))
    }
}

/// An open session to the member currently acting as primary.
pub struct PrimarySession {
    pub member: MemberInstance,
    pub session: Box<dyn AdminSession>,
}

impl std::fmt::Debug for PrimarySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimarySession")
            .field("member", &self.member.name)
            .field("address", &self.session.address())
            .finish()
    }
}

/// Find and connect to the primary among `members`.
///
/// Members are contacted in order. When a member names a different primary
/// the scan jumps there first; if that fails it resumes with the remaining
/// members. Returns `None` when no member reports itself primary.
pub async fn connect_to_primary(
    connector: &dyn AdminConnector,
    members: &[MemberInstance],
) -> Result<Option<PrimarySession>> {
    let mut tried = std::collections::HashSet::new();

    for member in members {
        if !tried.insert(member.address()) {
            continue;
        }

        let reported = match open_if_primary(connector, member).await? {
            Probe::Primary(primary) => return Ok(Some(primary)),
            Probe::Points(address) => address,
            Probe::Nothing => continue,
        };

        let Some(target) = members.iter().find(|m| m.address() == reported) else {
            continue;
        };
        if !tried.insert(target.address()) {
            continue;
        }
        debug!(from = %member, to = %target, "Jumping to reported primary");
        if let Probe::Primary(primary) = open_if_primary(connector, target).await? {
            return Ok(Some(primary));
        }
    }

    Ok(None)
}

enum Probe {
    Primary(PrimarySession),
    /// Not the primary, but names this address as primary.
    Points(String),
    Nothing,
}

async fn open_if_primary(connector: &dyn AdminConnector, member: &MemberInstance) -> Result<Probe> {
    let session = match connector.connect(&member.endpoint).await {
        Ok(s) => s,
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => {
            debug!(pod = %member, error = %e, "Primary scan: connect failed");
            return Ok(Probe::Nothing);
        }
    };

    let group = match session.describe_group().await {
        Ok(g) => g,
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => {
            debug!(pod = %member, error = %e, "Primary scan: no group view");
            return Ok(Probe::Nothing);
        }
    };

    let is_primary = group
        .self_member()
        .map(|own| own.role == MemberRole::Primary && own.state == MemberState::Online)
        .unwrap_or(false);

    if is_primary && group.has_quorum {
        return Ok(Probe::Primary(PrimarySession {
            member: member.clone(),
            session,
        }));
    }

    Ok(match group.primary() {
        Some(address) if address != group.self_address => Probe::Points(address.to_string()),
        _ => Probe::Nothing,
    })
}
