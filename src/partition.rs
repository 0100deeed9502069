//! Partition analysis.
//!
//! Groups the probes of online members into partitions by mutual peer
//! agreement. A quorate partition with a self-declared primary is *active*;
//! the reachable peer sets of non-quorate members are *blocked* partitions,
//! the candidates for forcing quorum.
//!
//! Views are collected one member at a time and may disagree. When they do,
//! the analyzer refuses to guess and returns a temporary error so the whole
//! diagnosis is retried on a fresh snapshot.

use crate::error::{OperatorError, Result};
use crate::types::{InstanceStatus, MemberInstance};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A member together with its probe result.
#[derive(Debug, Clone)]
pub struct ProbedMember {
    pub member: MemberInstance,
    pub status: InstanceStatus,
}

/// One quorate partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Members of the partition, in index order.
    pub members: Vec<MemberInstance>,
    /// The member of the partition reporting itself primary.
    pub primary: Option<MemberInstance>,
}

/// Result of [`find_group_partitions`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPartitions {
    pub active: Vec<Partition>,
    /// Reachable peer sets of non-quorate members, largest first.
    pub blocked: Vec<Vec<MemberInstance>>,
}

/// Split the online members into active and blocked partitions.
///
/// `online` holds the probes of members diagnosed ONLINE or RECOVERING;
/// `all` is every known member and resolves peer addresses to members.
pub fn find_group_partitions(
    online: &[ProbedMember],
    all: &[MemberInstance],
) -> Result<GroupPartitions> {
    let by_address: BTreeMap<String, &MemberInstance> =
        all.iter().map(|m| (m.address(), m)).collect();
    let online_addresses: BTreeSet<String> = online.iter().map(|p| p.member.address()).collect();

    // peer set -> reporters claiming primary
    let mut quorate: BTreeMap<BTreeSet<String>, Vec<&MemberInstance>> = BTreeMap::new();
    let mut blocked: BTreeSet<BTreeSet<String>> = BTreeSet::new();

    for probe in online {
        if probe.status.in_quorum == Some(true) {
            let peers: BTreeSet<String> = probe
                .status
                .peers
                .iter()
                .filter(|(_, state)| state.is_active())
                .map(|(addr, _)| addr.clone())
                .collect();

            if let Some(stray) = peers.iter().find(|p| !online_addresses.contains(*p)) {
                return Err(OperatorError::temporary(format!(
                    "inconsistent group view: {} reports {} online but it was not probed online",
                    probe.member.name, stray
                )));
            }

            let primaries = quorate.entry(peers).or_default();
            if probe.status.is_primary == Some(true) {
                primaries.push(&probe.member);
            }
        } else {
            let peers: BTreeSet<String> = probe
                .status
                .peers
                .iter()
                .filter(|(_, state)| state.is_reachable())
                .map(|(addr, _)| addr.clone())
                .filter(|addr| by_address.contains_key(addr))
                .collect();
            if !peers.is_empty() {
                blocked.insert(peers);
            }
        }
    }

    let mut active: Vec<(BTreeSet<String>, Partition)> = Vec::new();
    let mut pending = 0;
    for (peers, primaries) in quorate {
        if primaries.is_empty() {
            pending += 1;
            continue;
        }
        let primary = primaries.iter().min_by_key(|m| m.index).map(|m| (*m).clone());
        let partition = Partition {
            members: resolve(&peers, &by_address),
            primary,
        };
        active.push((peers, partition));
    }

    if active.is_empty() && pending > 0 {
        return Err(OperatorError::temporary(
            "quorate partition without a primary: election in progress",
        ));
    }

    for (i, (a, _)) in active.iter().enumerate() {
        for (b, _) in active.iter().skip(i + 1) {
            if !a.is_disjoint(b) {
                return Err(OperatorError::temporary(
                    "inconsistent group view: overlapping quorate partitions",
                ));
            }
        }
    }

    let mut blocked: Vec<Vec<MemberInstance>> =
        blocked.iter().map(|peers| resolve(peers, &by_address)).collect();
    blocked.sort_by(|a, b| b.len().cmp(&a.len()));

    let partitions = GroupPartitions {
        active: active.into_iter().map(|(_, p)| p).collect(),
        blocked,
    };
    debug!(
        active = partitions.active.len(),
        pending,
        blocked = partitions.blocked.len(),
        "Group partitions found"
    );
    Ok(partitions)
}

fn resolve(
    addresses: &BTreeSet<String>,
    by_address: &BTreeMap<String, &MemberInstance>,
) -> Vec<MemberInstance> {
    let mut members: Vec<MemberInstance> = addresses
        .iter()
        .filter_map(|a| by_address.get(a).map(|m| (*m).clone()))
        .collect();
    members.sort_by_key(|m| m.index);
    members
}
