//! Kubernetes glue.
//!
//! Runs two kube-runtime controllers: one over member pods, dispatching to
//! the pod entry points, and one over [`GroupCluster`] resources, probing each
//! cluster periodically. Errors returned by the entry points are turned into
//! requeue decisions by [`requeue_action`].

use crate::config::{OperatorConfig, RequeueConfig};
use crate::controller::ClusterController;
use crate::crd::GroupCluster;
use crate::db::AdminConnector;
use crate::directory::{
    member_from_pod, pod_ready, KubeMemberDirectory, INSTANCE_LABEL, MEMBERSHIP_FINALIZER,
};
use crate::error::{ErrorKind, OperatorError, Result};
use crate::events::{EventSink, KubeEventSink};
use crate::registry::Registry;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::{watcher, Config};
use kube::runtime::{predicates, reflector, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared state handed to every reconcile call.
pub struct OperatorContext {
    pub controller: Arc<ClusterController>,
    pub config: OperatorConfig,
}

/// Run the operator until a termination signal arrives.
///
/// Watches `namespace`, or every namespace when `None`.
pub async fn run(
    client: Client,
    connector: Arc<dyn AdminConnector>,
    config: OperatorConfig,
    namespace: Option<String>,
) -> Result<()> {
    config.validate()?;
    info!(namespace = ?namespace, "Starting groupkeeper operator");

    let directory = Arc::new(KubeMemberDirectory::new(
        client.clone(),
        config.members.clone(),
        config.group.member_auth,
    ));
    let events: Arc<dyn EventSink> = Arc::new(KubeEventSink::new(client.clone(), "groupkeeper"));
    let registry = Arc::new(Registry::new(Arc::clone(&connector), &config));
    let controller = Arc::new(ClusterController::new(
        connector,
        directory,
        events,
        Arc::clone(&registry),
        config.clone(),
    ));
    registry.start(controller.clone());

    let (pods, clusters): (Api<Pod>, Api<GroupCluster>) = match &namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    // Verify CRD is installed
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!(error = %e, "Failed to list GroupClusters. Is the CRD installed?");
        registry.shutdown().await;
        return Err(e.into());
    }

    let ctx = Arc::new(OperatorContext { controller, config });

    // Status writes land on the watched objects themselves. Only changes the
    // entry points act on are let through.
    let (pod_store, pod_writer) = reflector::store();
    let pod_events = watcher(pods, Config::default().labels(INSTANCE_LABEL))
        .default_backoff()
        .reflect(pod_writer)
        .applied_objects()
        .predicate_filter(pod_lifecycle);

    let (cluster_store, cluster_writer) = reflector::store();
    let cluster_events = watcher(clusters, Config::default())
        .default_backoff()
        .reflect(cluster_writer)
        .applied_objects()
        .predicate_filter(predicates::generation);

    let pod_loop = Controller::for_stream(pod_events, pod_store)
        .shutdown_on_signal()
        .run(reconcile_pod, error_policy, Arc::clone(&ctx))
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(pod = %obj.name, ?action, "Pod reconciled"),
                Err(e) => debug!(error = %e, "Pod reconcile error"),
            }
        });

    let cluster_loop = Controller::for_stream(cluster_events, cluster_store)
        .shutdown_on_signal()
        .run(reconcile_cluster, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(cluster = %obj.name, ?action, "Cluster probed"),
                Err(e) => debug!(error = %e, "Cluster reconcile error"),
            }
        });

    futures::join!(pod_loop, cluster_loop);

    registry.shutdown().await;
    info!("Operator stopped");
    Ok(())
}

/// Fingerprint of the pod fields the pod entry points react to: readiness,
/// pending deletion and the membership finalizer.
fn pod_lifecycle(pod: &Pod) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    pod_ready(pod).hash(&mut hasher);
    pod.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    pod.finalizers()
        .iter()
        .any(|f| f == MEMBERSHIP_FINALIZER)
        .hash(&mut hasher);
    Some(hasher.finish())
}

async fn reconcile_pod(pod: Arc<Pod>, ctx: Arc<OperatorContext>) -> Result<Action> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let is_member = pod.finalizers().iter().any(|f| f == MEMBERSHIP_FINALIZER);
    let controller = &ctx.controller;

    if pod.metadata.deletion_timestamp.is_some() {
        if is_member {
            controller.on_pod_deleted(&namespace, &name).await?;
        }
        return Ok(Action::await_change());
    }

    let Some(member) = member_from_pod(&pod, &ctx.config.members) else {
        return Ok(Action::await_change());
    };
    if !member.ready {
        debug!(pod = %member, "Pod not ready yet");
        return Ok(Action::await_change());
    }

    if is_member {
        controller.on_pod_restarted(&namespace, &name).await?;
    } else {
        controller.on_pod_created(&namespace, &name).await?;
    }
    Ok(Action::await_change())
}

async fn reconcile_cluster(cluster: Arc<GroupCluster>, ctx: Arc<OperatorContext>) -> Result<Action> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    match ctx.controller.on_cluster_probe(&namespace, &name).await? {
        Some(status) => {
            debug!(cluster = %name, status = %status.status, "Cluster probe complete");
            Ok(Action::requeue(ctx.config.requeue.probe_interval))
        }
        None => Ok(Action::await_change()),
    }
}

fn error_policy<K>(_obj: Arc<K>, error: &OperatorError, ctx: Arc<OperatorContext>) -> Action {
    requeue_action(error, &ctx.config.requeue)
}

/// Decide when to come back after an entry point failed.
///
/// Temporary errors requeue after their suggested delay, permanent ones wait
/// for the object to change, fatal ones back off for a long time.
pub fn requeue_action(error: &OperatorError, requeue: &RequeueConfig) -> Action {
    match error.kind() {
        ErrorKind::Temporary => {
            let delay = error.retry_delay().unwrap_or(match error {
                OperatorError::Busy { .. } => requeue.busy_delay,
                _ => requeue.default_delay,
            });
            debug!(error = %error, delay_ms = delay.as_millis() as u64, "Requeueing");
            Action::requeue(delay)
        }
        ErrorKind::Permanent => {
            warn!(error = %error, "Manual intervention required, not retrying");
            Action::await_change()
        }
        ErrorKind::Fatal => {
            error!(error = %error, "Fatal error");
            Action::requeue(requeue.fatal_delay)
        }
    }
}
